// Container-level properties: append order, finalize counts, footer
// index integrity, interleaving across streams.

use streamrec::config::FlushPolicy;
use streamrec::source::{ChannelInfo, Payload, SampleBatch, SampleFormat, SourceDescriptor};
use streamrec::writer::ChunkWriter;
use streamrec::{scan, RecorderError};
use tempfile::TempDir;

fn descriptor(source_id: &str, channels: usize) -> SourceDescriptor {
    SourceDescriptor {
        name: format!("Stream-{}", source_id),
        content_type: "EEG".into(),
        source_id: source_id.into(),
        nominal_srate: 100.0,
        format: SampleFormat::Float32,
        channels: (0..channels)
            .map(|i| ChannelInfo {
                label: format!("Ch{}", i + 1),
                unit: "uV".into(),
            })
            .collect(),
        data_addr: "sim:test".into(),
        probe_addr: String::new(),
    }
}

fn batch(timestamps: Vec<f64>, channels: usize) -> SampleBatch {
    let rows = timestamps
        .iter()
        .map(|&t| (0..channels).map(|c| t as f32 + c as f32).collect())
        .collect();
    SampleBatch::new(timestamps, Payload::Float32(rows), 0.0)
}

#[test]
fn append_order_and_counts_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("two_streams.xdf");
    let mut writer = ChunkWriter::create(&path, FlushPolicy::default()).unwrap();

    let a = writer.register_stream(&descriptor("alpha", 2)).unwrap();
    let b = writer.register_stream(&descriptor("beta", 1)).unwrap();

    // Interleave appends; per-stream order must equal call order.
    let mut appended_a = 0u64;
    let mut appended_b = 0u64;
    for i in 0..10 {
        let base = i as f64 * 10.0;
        let mut batch_a = batch(vec![base, base + 1.0, base + 2.0], 2);
        writer.append_batch(a, &mut batch_a).unwrap();
        appended_a += 3;
        if i % 2 == 0 {
            let mut batch_b = batch(vec![base + 0.5], 1);
            writer.append_batch(b, &mut batch_b).unwrap();
            appended_b += 1;
        }
    }
    writer.finalize().unwrap();

    let result = scan(&path).unwrap();
    assert!(result.finalized);
    assert_eq!(result.streams.len(), 2);

    let stream_a = result.streams.iter().find(|s| s.stream_id == a).unwrap();
    let stream_b = result.streams.iter().find(|s| s.stream_id == b).unwrap();

    // Counts reported after reopen equal the appended totals.
    assert_eq!(stream_a.scanned_samples, appended_a);
    assert_eq!(stream_b.scanned_samples, appended_b);
    assert_eq!(stream_a.footer.as_ref().unwrap().sample_count, appended_a);
    assert_eq!(stream_b.footer.as_ref().unwrap().sample_count, appended_b);

    // Scanned chunk order equals call order and timestamps never decrease.
    assert!(stream_a.timestamps_monotonic);
    assert!(stream_b.timestamps_monotonic);
    let firsts: Vec<f64> = stream_a.chunks.iter().map(|c| c.first_timestamp).collect();
    let mut sorted = firsts.clone();
    sorted.sort_by(|x, y| x.partial_cmp(y).unwrap());
    assert_eq!(firsts, sorted);

    // The footer's byte-offset index points at exactly the scanned chunks.
    let scanned_offsets: Vec<u64> = stream_a.chunks.iter().map(|c| c.offset).collect();
    assert_eq!(
        stream_a.footer.as_ref().unwrap().chunk_offsets,
        scanned_offsets
    );
}

#[test]
fn double_finalize_writes_no_duplicate_footers() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("idempotent.xdf");
    let mut writer = ChunkWriter::create(&path, FlushPolicy::default()).unwrap();
    let id = writer.register_stream(&descriptor("gamma", 1)).unwrap();
    writer.append_batch(id, &mut batch(vec![1.0, 2.0], 1)).unwrap();

    writer.finalize().unwrap();
    let first_len = std::fs::metadata(&path).unwrap().len();
    writer.finalize().unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), first_len);

    // Exactly one footer in the scan.
    let result = scan(&path).unwrap();
    assert_eq!(result.streams.len(), 1);
    assert!(result.streams[0].footer.is_some());
    assert_eq!(result.streams[0].footer.as_ref().unwrap().sample_count, 2);
}

#[test]
fn writer_rejects_duplicate_open_source() {
    let dir = TempDir::new().unwrap();
    let mut writer =
        ChunkWriter::create(&dir.path().join("dup.xdf"), FlushPolicy::default()).unwrap();
    writer.register_stream(&descriptor("delta", 1)).unwrap();
    let result = writer.register_stream(&descriptor("delta", 1));
    assert!(matches!(result, Err(RecorderError::DuplicateStream(id)) if id == "delta"));
}

#[test]
fn crash_between_flushes_loses_at_most_one_interval() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.xdf");
    // Size-based policy: every appended batch triggers a durable flush.
    let mut writer = ChunkWriter::create(&path, FlushPolicy::Size { max_bytes: 1 }).unwrap();
    let id = writer.register_stream(&descriptor("epsilon", 1)).unwrap();

    for i in 0..5 {
        writer
            .append_batch(id, &mut batch(vec![i as f64], 1))
            .unwrap();
    }
    // Simulate a crash: unflushed tail cut mid-chunk, no finalize.
    drop(writer);
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    // Cut through the trailing boundary chunk and into the last samples
    // chunk, as an interrupted write would.
    file.set_len(len - 35).unwrap();
    drop(file);

    let result = scan(&path).unwrap();
    assert!(result.truncated);
    assert!(!result.finalized);
    // The last complete flush preserved four of the five batches.
    assert_eq!(result.streams[0].scanned_samples, 4);
    assert!(result.streams[0].timestamps_monotonic);
}
