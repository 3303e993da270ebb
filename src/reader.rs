// XDF container reader
//
// Linear scan over the chunk stream, tolerant of a truncated tail: the
// scan stops at the last complete chunk, so an unfinalized recording is
// recovered up to its last durable flush. Footer chunks, when present,
// yield the per-stream counts and byte-offset index that make a
// finalized file seekable; `open` demands them, `scan` does not.

use crate::source::SampleFormat;
use crate::types::{RecorderError, RecorderResult};
use crate::writer::{
    CHUNK_BOUNDARY, CHUNK_CLOCK_OFFSET, CHUNK_FILE_HEADER, CHUNK_SAMPLES, CHUNK_STREAM_FOOTER,
    CHUNK_STREAM_HEADER, XDF_MAGIC,
};
use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// One samples chunk as seen by the scan
#[derive(Debug, Clone, Serialize)]
pub struct ChunkSummary {
    pub offset: u64,
    pub sample_count: u32,
    pub first_timestamp: f64,
    pub last_timestamp: f64,
}

/// Footer contents of a finalized stream
#[derive(Debug, Clone, Default, Serialize)]
pub struct FooterSummary {
    pub sample_count: u64,
    pub first_timestamp: f64,
    pub last_timestamp: f64,
    pub chunk_offsets: Vec<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamSummary {
    pub stream_id: u32,
    pub name: String,
    pub content_type: String,
    pub source_id: String,
    pub channel_count: usize,
    pub channel_labels: Vec<String>,
    pub nominal_srate: f64,
    pub format: Option<SampleFormat>,
    /// Samples counted by the scan itself
    pub scanned_samples: u64,
    pub chunks: Vec<ChunkSummary>,
    /// Corrected timestamps never decrease within a stream
    pub timestamps_monotonic: bool,
    pub first_timestamp: Option<f64>,
    pub last_timestamp: Option<f64>,
    pub clock_offsets: u64,
    pub footer: Option<FooterSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerScan {
    pub path: String,
    pub streams: Vec<StreamSummary>,
    pub boundaries: u64,
    /// The file ended mid-chunk; everything before that point was read
    pub truncated: bool,
    /// Complete file with a footer for every stream
    pub finalized: bool,
}

enum ReadOutcome {
    Full,
    CleanEof,
    Truncated,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::CleanEof
            } else {
                ReadOutcome::Truncated
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

/// Linear scan. Never fails on a truncated tail; fails on a missing
/// magic or unreadable file.
pub fn scan(path: &Path) -> RecorderResult<ContainerScan> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != XDF_MAGIC {
        return Err(RecorderError::Format(format!(
            "{} is not an XDF container (bad magic)",
            path.display()
        )));
    }

    let mut streams: BTreeMap<u32, StreamSummary> = BTreeMap::new();
    let mut boundaries: u64 = 0;
    let mut truncated = false;
    // Byte position of the chunk being read, starting after the magic.
    let mut pos: u64 = XDF_MAGIC.len() as u64;

    loop {
        let chunk_offset = pos;

        let mut len_bytes = [0u8; 4];
        match read_exact_or_eof(&mut reader, &mut len_bytes)? {
            ReadOutcome::Full => {}
            ReadOutcome::CleanEof => break,
            ReadOutcome::Truncated => {
                truncated = true;
                break;
            }
        }
        let chunk_len = u32::from_le_bytes(len_bytes);
        if chunk_len < 2 {
            log::warn!("Corrupt chunk length at offset {}, stopping scan", chunk_offset);
            truncated = true;
            break;
        }

        let mut tag_bytes = [0u8; 2];
        if !matches!(
            read_exact_or_eof(&mut reader, &mut tag_bytes)?,
            ReadOutcome::Full
        ) {
            truncated = true;
            break;
        }
        let tag = u16::from_le_bytes(tag_bytes);

        let mut content = vec![0u8; chunk_len as usize - 2];
        if !matches!(
            read_exact_or_eof(&mut reader, &mut content)?,
            ReadOutcome::Full
        ) {
            truncated = true;
            break;
        }
        pos += 4 + chunk_len as u64;

        match tag {
            CHUNK_FILE_HEADER => {
                log::debug!("File header: {}", String::from_utf8_lossy(&content));
            }
            CHUNK_STREAM_HEADER => match parse_stream_header(&content) {
                Ok(summary) => {
                    log::debug!("Stream {} header ('{}')", summary.stream_id, summary.name);
                    streams.insert(summary.stream_id, summary);
                }
                Err(e) => log::warn!("Unparseable stream header at {}: {}", chunk_offset, e),
            },
            CHUNK_SAMPLES => {
                scan_samples_chunk(&content, chunk_offset, &mut streams);
            }
            CHUNK_CLOCK_OFFSET => {
                if content.len() >= 4 {
                    let stream_id = u32::from_le_bytes(content[0..4].try_into().unwrap());
                    if let Some(stream) = streams.get_mut(&stream_id) {
                        stream.clock_offsets += 1;
                    }
                }
            }
            CHUNK_BOUNDARY => boundaries += 1,
            CHUNK_STREAM_FOOTER => {
                if content.len() < 4 {
                    log::warn!("Short stream footer at {}", chunk_offset);
                    continue;
                }
                let stream_id = u32::from_le_bytes(content[0..4].try_into().unwrap());
                match parse_stream_footer(&content[4..]) {
                    Ok(footer) => {
                        if let Some(stream) = streams.get_mut(&stream_id) {
                            stream.footer = Some(footer);
                        } else {
                            log::warn!("Footer for unknown stream {}", stream_id);
                        }
                    }
                    Err(e) => log::warn!("Unparseable stream footer at {}: {}", chunk_offset, e),
                }
            }
            other => log::warn!("Unknown chunk tag {} at {}", other, chunk_offset),
        }
    }

    let streams: Vec<StreamSummary> = streams.into_values().collect();
    let finalized = !truncated && streams.iter().all(|s| s.footer.is_some());
    Ok(ContainerScan {
        path: path.display().to_string(),
        streams,
        boundaries,
        truncated,
        finalized,
    })
}

/// Footer-indexed open: like `scan`, but the container must be finalized
pub fn open(path: &Path) -> RecorderResult<ContainerScan> {
    let result = scan(path)?;
    if !result.finalized {
        return Err(RecorderError::Format(format!(
            "{} is not finalized; recover it with a linear scan",
            path.display()
        )));
    }
    Ok(result)
}

fn scan_samples_chunk(
    content: &[u8],
    chunk_offset: u64,
    streams: &mut BTreeMap<u32, StreamSummary>,
) {
    if content.len() < 8 {
        log::warn!("Short samples chunk at {}", chunk_offset);
        return;
    }
    let stream_id = u32::from_le_bytes(content[0..4].try_into().unwrap());
    let n = u32::from_le_bytes(content[4..8].try_into().unwrap());

    let Some(stream) = streams.get_mut(&stream_id) else {
        log::warn!(
            "Samples for unregistered stream {} at {}, skipping",
            stream_id,
            chunk_offset
        );
        return;
    };
    let Some(format) = stream.format else {
        log::warn!("Stream {} has no known format, skipping samples", stream_id);
        return;
    };

    let mut cursor = 8usize;
    let mut decoded: u32 = 0;
    let mut chunk_first = f64::NAN;
    let mut chunk_last = f64::NAN;

    for _ in 0..n {
        if cursor + 8 > content.len() {
            break;
        }
        let ts = f64::from_le_bytes(content[cursor..cursor + 8].try_into().unwrap());
        cursor += 8;

        let row_len = match format.byte_width() {
            Some(width) => stream.channel_count * width,
            None => {
                // Length-prefixed strings, one per channel.
                let mut len = 0usize;
                let mut ok = true;
                for _ in 0..stream.channel_count {
                    if cursor + len + 4 > content.len() {
                        ok = false;
                        break;
                    }
                    let value_len = u32::from_le_bytes(
                        content[cursor + len..cursor + len + 4].try_into().unwrap(),
                    ) as usize;
                    len += 4 + value_len;
                }
                if !ok {
                    break;
                }
                len
            }
        };
        if cursor + row_len > content.len() {
            break;
        }
        cursor += row_len;

        if stream
            .last_timestamp
            .map(|last| ts < last)
            .unwrap_or(false)
        {
            stream.timestamps_monotonic = false;
        }
        if stream.first_timestamp.is_none() {
            stream.first_timestamp = Some(ts);
        }
        stream.last_timestamp = Some(ts);
        if decoded == 0 {
            chunk_first = ts;
        }
        chunk_last = ts;
        decoded += 1;
    }

    if decoded != n {
        log::warn!(
            "Samples chunk at {} declared {} samples, decoded {}",
            chunk_offset,
            n,
            decoded
        );
    }
    stream.scanned_samples += decoded as u64;
    if decoded > 0 {
        stream.chunks.push(ChunkSummary {
            offset: chunk_offset,
            sample_count: decoded,
            first_timestamp: chunk_first,
            last_timestamp: chunk_last,
        });
    }
}

fn parse_stream_header(content: &[u8]) -> RecorderResult<StreamSummary> {
    if content.len() < 4 {
        return Err(RecorderError::Format("short stream header".into()));
    }
    let stream_id = u32::from_le_bytes(content[0..4].try_into().unwrap());
    let xml = String::from_utf8_lossy(&content[4..]).into_owned();

    let mut reader = XmlReader::from_str(&xml);
    reader.config_mut().trim_text(true);

    let mut summary = StreamSummary {
        stream_id,
        timestamps_monotonic: true,
        ..Default::default()
    };
    let mut field = String::new();
    let mut in_channels = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                field = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if field == "channels" {
                    in_channels = true;
                }
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"channels" {
                    in_channels = false;
                }
                field.clear();
            }
            Ok(Event::Text(e)) => {
                let value = e
                    .xml_content()
                    .map_err(|err| RecorderError::Format(err.to_string()))?
                    .into_owned();
                match field.as_str() {
                    "name" => summary.name = value,
                    "type" => summary.content_type = value,
                    "source_id" => summary.source_id = value,
                    "channel_count" => summary.channel_count = value.parse().unwrap_or(0),
                    "nominal_srate" => summary.nominal_srate = value.parse().unwrap_or(0.0),
                    "channel_format" => summary.format = SampleFormat::from_xdf_name(&value),
                    "label" if in_channels => summary.channel_labels.push(value),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(RecorderError::Format(e.to_string())),
        }
    }
    Ok(summary)
}

fn parse_stream_footer(xml_bytes: &[u8]) -> RecorderResult<FooterSummary> {
    let xml = String::from_utf8_lossy(xml_bytes).into_owned();
    let mut reader = XmlReader::from_str(&xml);
    reader.config_mut().trim_text(true);

    let mut footer = FooterSummary::default();
    let mut field = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                field = String::from_utf8_lossy(e.name().as_ref()).into_owned();
            }
            Ok(Event::End(_)) => field.clear(),
            Ok(Event::Text(e)) => {
                let value = e
                    .xml_content()
                    .map_err(|err| RecorderError::Format(err.to_string()))?
                    .into_owned();
                match field.as_str() {
                    "first_timestamp" => footer.first_timestamp = value.parse().unwrap_or(0.0),
                    "last_timestamp" => footer.last_timestamp = value.parse().unwrap_or(0.0),
                    "sample_count" => footer.sample_count = value.parse().unwrap_or(0),
                    "offset" => {
                        if let Ok(offset) = value.parse() {
                            footer.chunk_offsets.push(offset);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(RecorderError::Format(e.to_string())),
        }
    }
    Ok(footer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlushPolicy;
    use crate::source::{ChannelInfo, Payload, SampleBatch, SourceDescriptor};
    use crate::writer::ChunkWriter;
    use tempfile::TempDir;

    fn descriptor(source_id: &str, format: SampleFormat) -> SourceDescriptor {
        SourceDescriptor {
            name: "Scan".into(),
            content_type: "EEG".into(),
            source_id: source_id.into(),
            nominal_srate: 100.0,
            format,
            channels: vec![
                ChannelInfo {
                    label: "A".into(),
                    unit: "uV".into(),
                },
                ChannelInfo {
                    label: "B".into(),
                    unit: "uV".into(),
                },
            ],
            data_addr: "sim:scan".into(),
            probe_addr: String::new(),
        }
    }

    fn float_batch(timestamps: Vec<f64>) -> SampleBatch {
        let rows = timestamps.iter().map(|&t| vec![t as f32, 0.0]).collect();
        SampleBatch::new(timestamps, Payload::Float32(rows), 0.0)
    }

    #[test]
    fn test_scan_matches_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scan.xdf");
        let mut writer = ChunkWriter::create(&path, FlushPolicy::default()).unwrap();
        let id = writer
            .register_stream(&descriptor("eeg-1", SampleFormat::Float32))
            .unwrap();

        writer.append_batch(id, &mut float_batch(vec![1.0, 2.0])).unwrap();
        writer.append_batch(id, &mut float_batch(vec![3.0])).unwrap();
        writer.write_clock_offset(id, 3.5, 0.01).unwrap();
        writer.finalize().unwrap();

        let result = scan(&path).unwrap();
        assert!(!result.truncated);
        assert!(result.finalized);
        assert_eq!(result.streams.len(), 1);

        let stream = &result.streams[0];
        assert_eq!(stream.stream_id, id);
        assert_eq!(stream.source_id, "eeg-1");
        assert_eq!(stream.channel_count, 2);
        assert_eq!(stream.channel_labels, vec!["A", "B"]);
        assert_eq!(stream.format, Some(SampleFormat::Float32));
        assert_eq!(stream.scanned_samples, 3);
        assert_eq!(stream.chunks.len(), 2);
        assert!(stream.timestamps_monotonic);
        assert_eq!(stream.clock_offsets, 1);

        let footer = stream.footer.as_ref().unwrap();
        assert_eq!(footer.sample_count, 3);
        let scanned_offsets: Vec<u64> = stream.chunks.iter().map(|c| c.offset).collect();
        assert_eq!(footer.chunk_offsets, scanned_offsets);

        assert!(open(&path).is_ok());
    }

    #[test]
    fn test_string_stream_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("markers.xdf");
        let mut writer = ChunkWriter::create(&path, FlushPolicy::default()).unwrap();
        let mut descriptor = descriptor("marks-1", SampleFormat::String);
        descriptor.channels.truncate(1);
        let id = writer.register_stream(&descriptor).unwrap();

        let mut batch = SampleBatch::new(
            vec![1.0, 2.0],
            Payload::String(vec![vec!["go".into()], vec!["stop".into()]]),
            0.0,
        );
        writer.append_batch(id, &mut batch).unwrap();
        writer.finalize().unwrap();

        let result = scan(&path).unwrap();
        assert_eq!(result.streams[0].scanned_samples, 2);
        assert!(result.finalized);
    }

    #[test]
    fn test_truncated_tail_is_recovered_to_last_complete_chunk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cut.xdf");
        let mut writer = ChunkWriter::create(&path, FlushPolicy::default()).unwrap();
        let id = writer
            .register_stream(&descriptor("eeg-1", SampleFormat::Float32))
            .unwrap();
        writer.append_batch(id, &mut float_batch(vec![1.0, 2.0])).unwrap();
        writer.flush().unwrap();
        writer.append_batch(id, &mut float_batch(vec![3.0, 4.0])).unwrap();
        writer.flush().unwrap();
        drop(writer);

        // Chop off the middle of the last samples chunk, as a crash would.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 30).unwrap();

        let result = scan(&path).unwrap();
        assert!(result.truncated);
        assert!(!result.finalized);
        assert_eq!(result.streams[0].scanned_samples, 2);
        assert!(open(&path).is_err());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bogus.xdf");
        std::fs::write(&path, b"nope").unwrap();
        assert!(matches!(scan(&path), Err(RecorderError::Format(_))));
    }

    #[test]
    fn test_unfinalized_file_scans_clean() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("open.xdf");
        let mut writer = ChunkWriter::create(&path, FlushPolicy::default()).unwrap();
        let id = writer
            .register_stream(&descriptor("eeg-1", SampleFormat::Float32))
            .unwrap();
        writer.append_batch(id, &mut float_batch(vec![1.0])).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let result = scan(&path).unwrap();
        assert!(!result.truncated);
        assert!(!result.finalized);
        assert_eq!(result.streams[0].scanned_samples, 1);
    }
}
