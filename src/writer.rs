// XDF container writer
//
// Append-only serialization of registered streams into an XDF file:
// `XDF:` magic, then chunks framed as u32 length | u16 tag | content.
// Sample chunks are flushed to durable storage on a time- or size-based
// cadence, each flush preceded by a boundary chunk so an interrupted
// recording can be recovered by linear scan up to the last flush.
// Finalize writes one footer per stream carrying its sample count and
// chunk byte-offset index, which makes the file seekable.

use crate::config::FlushPolicy;
use crate::source::{Payload, SampleBatch, SourceDescriptor};
use crate::types::{RecorderError, RecorderResult};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer as XmlWriter;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const XDF_MAGIC: &[u8] = b"XDF:";

pub const CHUNK_FILE_HEADER: u16 = 1;
pub const CHUNK_STREAM_HEADER: u16 = 2;
pub const CHUNK_SAMPLES: u16 = 3;
pub const CHUNK_CLOCK_OFFSET: u16 = 4;
pub const CHUNK_BOUNDARY: u16 = 5;
pub const CHUNK_STREAM_FOOTER: u16 = 6;

/// Well-known boundary marker content
pub const BOUNDARY_BYTES: [u8; 16] = [
    0x43, 0xA5, 0x46, 0xDC, 0xCB, 0xF5, 0x41, 0x0F, 0xB3, 0x0E, 0xD5, 0x46, 0x73, 0x83, 0xCB,
    0xE4,
];

/// Book-keeping for one registered stream
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub descriptor: SourceDescriptor,
    pub sample_count: u64,
    pub batch_count: u64,
    pub first_timestamp: Option<f64>,
    pub last_timestamp: Option<f64>,
    pub chunk_offsets: Vec<u64>,
    /// Cleared when the source is lost; a closed record frees its
    /// source id for re-registration
    pub open: bool,
}

pub struct ChunkWriter {
    file: BufWriter<File>,
    path: PathBuf,
    policy: FlushPolicy,
    streams: BTreeMap<u32, StreamRecord>,
    next_stream_id: u32,
    /// Byte position of the next chunk, tracked without seeking
    pos: u64,
    bytes_since_flush: u64,
    last_flush: Instant,
    finalized: bool,
}

impl ChunkWriter {
    /// Create the container and write magic + file header
    pub fn create(path: &Path, policy: FlushPolicy) -> RecorderResult<Self> {
        let file = File::create(path)?;
        let mut writer = Self {
            file: BufWriter::new(file),
            path: path.to_path_buf(),
            policy,
            streams: BTreeMap::new(),
            next_stream_id: 1,
            pos: 0,
            bytes_since_flush: 0,
            last_flush: Instant::now(),
            finalized: false,
        };
        writer.file.write_all(XDF_MAGIC)?;
        writer.pos = XDF_MAGIC.len() as u64;

        let header = format!(
            "<?xml version=\"1.0\"?><info><version>1.0</version><datetime>{}</datetime></info>",
            chrono::Utc::now().to_rfc3339()
        );
        writer.write_chunk(CHUNK_FILE_HEADER, header.as_bytes())?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn stream_record(&self, stream_id: u32) -> Option<&StreamRecord> {
        self.streams.get(&stream_id)
    }

    pub fn records(&self) -> impl Iterator<Item = (u32, &StreamRecord)> {
        self.streams.iter().map(|(&id, r)| (id, r))
    }

    fn write_chunk(&mut self, tag: u16, content: &[u8]) -> RecorderResult<u64> {
        let offset = self.pos;
        let length = (content.len() + 2) as u32;
        self.file.write_all(&length.to_le_bytes())?;
        self.file.write_all(&tag.to_le_bytes())?;
        self.file.write_all(content)?;
        let total = 4 + 2 + content.len() as u64;
        self.pos += total;
        self.bytes_since_flush += total;
        Ok(offset)
    }

    /// Allocate a stream id and write the metadata block
    pub fn register_stream(&mut self, descriptor: &SourceDescriptor) -> RecorderResult<u32> {
        if self.finalized {
            return Err(RecorderError::Format(
                "container is already finalized".into(),
            ));
        }
        if self
            .streams
            .values()
            .any(|r| r.open && r.descriptor.source_id == descriptor.source_id)
        {
            return Err(RecorderError::DuplicateStream(descriptor.source_id.clone()));
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;

        let xml = stream_header_xml(descriptor)?;
        let mut content = Vec::with_capacity(4 + xml.len());
        content.extend_from_slice(&stream_id.to_le_bytes());
        content.extend_from_slice(&xml);
        self.write_chunk(CHUNK_STREAM_HEADER, &content)?;

        log::info!(
            "Registered stream {} for '{}' ({}, {} channels @ {} Hz, {})",
            stream_id,
            descriptor.source_id,
            descriptor.content_type,
            descriptor.channel_count(),
            descriptor.nominal_srate,
            descriptor.format.xdf_name()
        );

        self.streams.insert(
            stream_id,
            StreamRecord {
                descriptor: descriptor.clone(),
                sample_count: 0,
                batch_count: 0,
                first_timestamp: None,
                last_timestamp: None,
                chunk_offsets: Vec::new(),
                open: true,
            },
        );
        Ok(stream_id)
    }

    /// Serialize one batch as a samples chunk. Out-of-order samples are
    /// re-sorted within the batch only; ordering across batches is the
    /// caller's responsibility and preserved as call order.
    pub fn append_batch(
        &mut self,
        stream_id: u32,
        batch: &mut SampleBatch,
    ) -> RecorderResult<()> {
        if self.finalized {
            return Err(RecorderError::Format(
                "container is already finalized".into(),
            ));
        }
        let record = self
            .streams
            .get(&stream_id)
            .ok_or(RecorderError::UnknownStream(stream_id))?;
        if batch.is_empty() {
            return Ok(());
        }
        if batch.payload.format() != record.descriptor.format {
            return Err(RecorderError::Format(format!(
                "stream {} expects {}, batch is {}",
                stream_id,
                record.descriptor.format.xdf_name(),
                batch.payload.format().xdf_name()
            )));
        }

        if !batch.timestamps.windows(2).all(|w| w[0] <= w[1]) {
            let mut perm: Vec<usize> = (0..batch.len()).collect();
            perm.sort_by(|&a, &b| {
                batch.timestamps[a]
                    .partial_cmp(&batch.timestamps[b])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let sorted: Vec<f64> = perm.iter().map(|&i| batch.timestamps[i]).collect();
            batch.timestamps = sorted;
            batch.payload.reorder(&perm);
        }

        let content = encode_samples(stream_id, batch);
        let offset = self.write_chunk(CHUNK_SAMPLES, &content)?;

        let record = self.streams.get_mut(&stream_id).expect("checked above");
        record.chunk_offsets.push(offset);
        record.sample_count += batch.len() as u64;
        record.batch_count += 1;
        if record.first_timestamp.is_none() {
            record.first_timestamp = batch.timestamps.first().copied();
        }
        record.last_timestamp = batch.timestamps.last().copied();

        self.maybe_flush()
    }

    /// Record the offset applied to a stream's timestamps at `collected_at`
    pub fn write_clock_offset(
        &mut self,
        stream_id: u32,
        collected_at: f64,
        offset: f64,
    ) -> RecorderResult<()> {
        if !self.streams.contains_key(&stream_id) {
            return Err(RecorderError::UnknownStream(stream_id));
        }
        let mut content = Vec::with_capacity(20);
        content.extend_from_slice(&stream_id.to_le_bytes());
        content.extend_from_slice(&collected_at.to_le_bytes());
        content.extend_from_slice(&offset.to_le_bytes());
        self.write_chunk(CHUNK_CLOCK_OFFSET, &content)?;
        Ok(())
    }

    fn maybe_flush(&mut self) -> RecorderResult<()> {
        let due = match self.policy {
            FlushPolicy::Interval { interval_ms } => {
                self.last_flush.elapsed().as_millis() as u64 >= interval_ms
            }
            FlushPolicy::Size { max_bytes } => self.bytes_since_flush >= max_bytes,
        };
        if due {
            self.flush()?;
        }
        Ok(())
    }

    /// Durability point: boundary chunk, then flush and sync. A crash
    /// afterwards loses nothing written before this call.
    pub fn flush(&mut self) -> RecorderResult<()> {
        self.write_chunk(CHUNK_BOUNDARY, &BOUNDARY_BYTES)?;
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        self.bytes_since_flush = 0;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Write per-stream footers with counts and the chunk offset index,
    /// then sync. Idempotent: a finalized container is left untouched.
    pub fn finalize(&mut self) -> RecorderResult<()> {
        if self.finalized {
            return Ok(());
        }

        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for stream_id in ids {
            let record = &self.streams[&stream_id];
            let xml = stream_footer_xml(record)?;
            let mut content = Vec::with_capacity(4 + xml.len());
            content.extend_from_slice(&stream_id.to_le_bytes());
            content.extend_from_slice(&xml);
            self.write_chunk(CHUNK_STREAM_FOOTER, &content)?;
            let record = self.streams.get_mut(&stream_id).expect("checked above");
            record.open = false;
        }

        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        self.finalized = true;
        log::info!(
            "Finalized container {} ({} streams)",
            self.path.display(),
            self.streams.len()
        );
        Ok(())
    }

    /// Free the source id of a lost stream for later re-registration
    pub fn mark_lost(&mut self, stream_id: u32) {
        if let Some(record) = self.streams.get_mut(&stream_id) {
            record.open = false;
        }
    }
}

fn encode_samples(stream_id: u32, batch: &SampleBatch) -> Vec<u8> {
    let n = batch.len();
    let mut content = Vec::with_capacity(8 + n * 16);
    content.extend_from_slice(&stream_id.to_le_bytes());
    content.extend_from_slice(&(n as u32).to_le_bytes());

    match &batch.payload {
        Payload::Float32(rows) => {
            for (ts, row) in batch.timestamps.iter().zip(rows) {
                content.extend_from_slice(&ts.to_le_bytes());
                for v in row {
                    content.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
        Payload::Float64(rows) => {
            for (ts, row) in batch.timestamps.iter().zip(rows) {
                content.extend_from_slice(&ts.to_le_bytes());
                for v in row {
                    content.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
        Payload::Int16(rows) => {
            for (ts, row) in batch.timestamps.iter().zip(rows) {
                content.extend_from_slice(&ts.to_le_bytes());
                for v in row {
                    content.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
        Payload::Int32(rows) => {
            for (ts, row) in batch.timestamps.iter().zip(rows) {
                content.extend_from_slice(&ts.to_le_bytes());
                for v in row {
                    content.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
        Payload::String(rows) => {
            for (ts, row) in batch.timestamps.iter().zip(rows) {
                content.extend_from_slice(&ts.to_le_bytes());
                for v in row {
                    content.extend_from_slice(&(v.len() as u32).to_le_bytes());
                    content.extend_from_slice(v.as_bytes());
                }
            }
        }
    }
    content
}

fn text_element<W: Write>(
    writer: &mut XmlWriter<W>,
    name: &str,
    value: &str,
) -> std::io::Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(value)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn stream_header_xml(descriptor: &SourceDescriptor) -> RecorderResult<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut writer = XmlWriter::new(&mut buffer);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("info")))?;

    text_element(&mut writer, "name", &descriptor.name)?;
    text_element(&mut writer, "type", &descriptor.content_type)?;
    text_element(
        &mut writer,
        "channel_count",
        &descriptor.channel_count().to_string(),
    )?;
    text_element(
        &mut writer,
        "nominal_srate",
        &descriptor.nominal_srate.to_string(),
    )?;
    text_element(&mut writer, "channel_format", descriptor.format.xdf_name())?;
    text_element(&mut writer, "source_id", &descriptor.source_id)?;

    writer.write_event(Event::Start(BytesStart::new("desc")))?;
    writer.write_event(Event::Start(BytesStart::new("channels")))?;
    for channel in &descriptor.channels {
        writer.write_event(Event::Start(BytesStart::new("channel")))?;
        text_element(&mut writer, "label", &channel.label)?;
        text_element(&mut writer, "unit", &channel.unit)?;
        writer.write_event(Event::End(BytesEnd::new("channel")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("channels")))?;
    writer.write_event(Event::End(BytesEnd::new("desc")))?;

    writer.write_event(Event::End(BytesEnd::new("info")))?;
    Ok(buffer)
}

fn stream_footer_xml(record: &StreamRecord) -> RecorderResult<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut writer = XmlWriter::new(&mut buffer);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("info")))?;

    text_element(
        &mut writer,
        "first_timestamp",
        &record.first_timestamp.unwrap_or(0.0).to_string(),
    )?;
    text_element(
        &mut writer,
        "last_timestamp",
        &record.last_timestamp.unwrap_or(0.0).to_string(),
    )?;
    text_element(
        &mut writer,
        "sample_count",
        &record.sample_count.to_string(),
    )?;

    writer.write_event(Event::Start(BytesStart::new("chunk_offsets")))?;
    for offset in &record.chunk_offsets {
        text_element(&mut writer, "offset", &offset.to_string())?;
    }
    writer.write_event(Event::End(BytesEnd::new("chunk_offsets")))?;

    writer.write_event(Event::End(BytesEnd::new("info")))?;
    Ok(buffer)
}
