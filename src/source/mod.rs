// Pluggable sample sources
//
// A `SampleSource` owns the transport to one stream source and pushes
// decoded `SampleBatch`es through an async channel. New transports are
// added by implementing the trait and registering a scheme in
// `create_source`.
//
// Current implementations:
// - tcp: newline-delimited JSON over TCP (`tcp://host:port`)
// - sim: in-process synthetic generator (`sim:<id>`), for offline use
//   and tests

mod sim;
mod tcp;

pub use sim::SimSource;
pub use tcp::{TcpSampleSource, WireMessage};

use crate::types::{RecorderError, RecorderResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Payload element kind of a stream, resolved once at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    Float32,
    Float64,
    Int16,
    Int32,
    String,
}

impl SampleFormat {
    /// Container name of the format, matching XDF channel_format values
    pub fn xdf_name(&self) -> &'static str {
        match self {
            SampleFormat::Float32 => "float32",
            SampleFormat::Float64 => "float64",
            SampleFormat::Int16 => "int16",
            SampleFormat::Int32 => "int32",
            SampleFormat::String => "string",
        }
    }

    pub fn from_xdf_name(name: &str) -> Option<Self> {
        match name {
            "float32" => Some(SampleFormat::Float32),
            "float64" => Some(SampleFormat::Float64),
            "int16" => Some(SampleFormat::Int16),
            "int32" => Some(SampleFormat::Int32),
            "string" => Some(SampleFormat::String),
            _ => None,
        }
    }

    /// Encoded width of one value; None for variable-length strings
    pub fn byte_width(&self) -> Option<usize> {
        match self {
            SampleFormat::Float32 => Some(4),
            SampleFormat::Float64 => Some(8),
            SampleFormat::Int16 => Some(2),
            SampleFormat::Int32 => Some(4),
            SampleFormat::String => None,
        }
    }
}

/// Per-channel metadata carried in the stream header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub label: String,
    #[serde(default)]
    pub unit: String,
}

/// Identity and layout of one stream source. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    pub content_type: String,
    pub source_id: String,
    /// Samples per second; 0.0 marks an irregular-rate stream
    pub nominal_srate: f64,
    pub format: SampleFormat,
    pub channels: Vec<ChannelInfo>,
    /// Sample transport endpoint, e.g. "tcp://127.0.0.1:7001" or "sim:test"
    pub data_addr: String,
    /// UDP clock-probe endpoint; empty when the source offers none
    #[serde(default)]
    pub probe_addr: String,
}

impl SourceDescriptor {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Sample rows in the stream's registered format. One variant per
/// `SampleFormat`; decoded once at receipt, matched once per batch when
/// written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "rows", rename_all = "snake_case")]
pub enum Payload {
    Float32(Vec<Vec<f32>>),
    Float64(Vec<Vec<f64>>),
    Int16(Vec<Vec<i16>>),
    Int32(Vec<Vec<i32>>),
    String(Vec<Vec<std::string::String>>),
}

impl Payload {
    pub fn empty(format: SampleFormat) -> Self {
        match format {
            SampleFormat::Float32 => Payload::Float32(Vec::new()),
            SampleFormat::Float64 => Payload::Float64(Vec::new()),
            SampleFormat::Int16 => Payload::Int16(Vec::new()),
            SampleFormat::Int32 => Payload::Int32(Vec::new()),
            SampleFormat::String => Payload::String(Vec::new()),
        }
    }

    pub fn format(&self) -> SampleFormat {
        match self {
            Payload::Float32(_) => SampleFormat::Float32,
            Payload::Float64(_) => SampleFormat::Float64,
            Payload::Int16(_) => SampleFormat::Int16,
            Payload::Int32(_) => SampleFormat::Int32,
            Payload::String(_) => SampleFormat::String,
        }
    }

    /// Number of sample rows
    pub fn len(&self) -> usize {
        match self {
            Payload::Float32(rows) => rows.len(),
            Payload::Float64(rows) => rows.len(),
            Payload::Int16(rows) => rows.len(),
            Payload::Int32(rows) => rows.len(),
            Payload::String(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when every row has exactly `channels` values
    pub fn rows_match_width(&self, channels: usize) -> bool {
        match self {
            Payload::Float32(rows) => rows.iter().all(|r| r.len() == channels),
            Payload::Float64(rows) => rows.iter().all(|r| r.len() == channels),
            Payload::Int16(rows) => rows.iter().all(|r| r.len() == channels),
            Payload::Int32(rows) => rows.iter().all(|r| r.len() == channels),
            Payload::String(rows) => rows.iter().all(|r| r.len() == channels),
        }
    }

    /// Append another payload of the same format; mismatches are rejected
    pub fn extend(&mut self, other: Payload) -> RecorderResult<()> {
        match (self, other) {
            (Payload::Float32(a), Payload::Float32(b)) => a.extend(b),
            (Payload::Float64(a), Payload::Float64(b)) => a.extend(b),
            (Payload::Int16(a), Payload::Int16(b)) => a.extend(b),
            (Payload::Int32(a), Payload::Int32(b)) => a.extend(b),
            (Payload::String(a), Payload::String(b)) => a.extend(b),
            (a, b) => {
                return Err(RecorderError::Parse(format!(
                    "payload format changed mid-stream: {} then {}",
                    a.format().xdf_name(),
                    b.format().xdf_name()
                )))
            }
        }
        Ok(())
    }

    /// Reorder rows so that row i of the result is row perm[i] of the input
    pub fn reorder(&mut self, perm: &[usize]) {
        fn permute<T: Clone>(rows: &mut Vec<T>, perm: &[usize]) {
            *rows = perm.iter().map(|&i| rows[i].clone()).collect();
        }
        match self {
            Payload::Float32(rows) => permute(rows, perm),
            Payload::Float64(rows) => permute(rows, perm),
            Payload::Int16(rows) => permute(rows, perm),
            Payload::Int32(rows) => permute(rows, perm),
            Payload::String(rows) => permute(rows, perm),
        }
    }
}

/// An ordered run of timestamped samples from one inlet, produced by
/// `poll()` and consumed exactly once by the chunk writer.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    /// Source-reported timestamps until corrected, one per row
    pub timestamps: Vec<f64>,
    pub payload: Payload,
    /// Local clock when the transport handed the batch over
    pub received_at: f64,
    /// Set when no usable clock estimate existed at correction time
    pub uncorrected: bool,
}

impl SampleBatch {
    pub fn new(timestamps: Vec<f64>, payload: Payload, received_at: f64) -> Self {
        Self {
            timestamps,
            payload,
            received_at,
            uncorrected: false,
        }
    }

    /// Zero-sample batch used as a liveness marker
    pub fn heartbeat(format: SampleFormat, received_at: f64) -> Self {
        Self::new(Vec::new(), Payload::empty(format), received_at)
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Append `other`, keeping arrival order and the latest receipt time
    pub fn merge(&mut self, other: SampleBatch) -> RecorderResult<()> {
        self.timestamps.extend(other.timestamps);
        self.payload.extend(other.payload)?;
        self.received_at = self.received_at.max(other.received_at);
        Ok(())
    }
}

/// Transport reconnect behavior on recoverable errors
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> std::time::Duration {
        std::time::Duration::from_millis(self.base_delay_ms << attempt.min(6))
    }
}

/// Trait for all sample transports
///
/// `start` runs continuously, pushing batches and heartbeats until the
/// receiver closes or the transport fails past its reconnect budget.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Establish the connection and return the source's descriptor
    async fn connect(&mut self) -> RecorderResult<SourceDescriptor>;

    /// Stream batches to the channel until closed, stopped, or failed
    async fn start(&mut self, sender: mpsc::Sender<SampleBatch>) -> RecorderResult<()>;

    /// Close the transport
    async fn stop(&mut self) -> RecorderResult<()>;

    fn is_connected(&self) -> bool;
}

/// Construct the transport for a descriptor from its data_addr scheme
pub fn create_source(
    descriptor: &SourceDescriptor,
    reconnect: ReconnectPolicy,
) -> RecorderResult<Box<dyn SampleSource>> {
    if let Some(addr) = descriptor.data_addr.strip_prefix("tcp://") {
        Ok(Box::new(TcpSampleSource::new(
            addr.to_string(),
            descriptor.clone(),
            reconnect,
        )))
    } else if descriptor.data_addr.starts_with("sim:") {
        Ok(Box::new(SimSource::from_descriptor(descriptor.clone())))
    } else {
        Err(RecorderError::InvalidConfig(format!(
            "unsupported data_addr '{}'",
            descriptor.data_addr
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_payload(rows: Vec<Vec<f32>>) -> Payload {
        Payload::Float32(rows)
    }

    #[test]
    fn test_payload_wire_shape() {
        let payload = f32_payload(vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"format":"float32","rows":[[1.0,2.0],[3.0,4.0]]}"#);

        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_payload_extend_rejects_format_change() {
        let mut payload = f32_payload(vec![vec![1.0]]);
        assert!(payload.extend(Payload::Int16(vec![vec![1]])).is_err());
        assert!(payload.extend(f32_payload(vec![vec![2.0]])).is_ok());
        assert_eq!(payload.len(), 2);
    }

    #[test]
    fn test_payload_reorder() {
        let mut payload = f32_payload(vec![vec![3.0], vec![1.0], vec![2.0]]);
        payload.reorder(&[1, 2, 0]);
        assert_eq!(
            payload,
            f32_payload(vec![vec![1.0], vec![2.0], vec![3.0]])
        );
    }

    #[test]
    fn test_batch_merge_keeps_order() {
        let mut batch = SampleBatch::new(vec![1.0, 2.0], f32_payload(vec![vec![1.0], vec![2.0]]), 5.0);
        let other = SampleBatch::new(vec![3.0], f32_payload(vec![vec![3.0]]), 6.0);
        batch.merge(other).unwrap();
        assert_eq!(batch.timestamps, vec![1.0, 2.0, 3.0]);
        assert_eq!(batch.len(), 3);
        assert!((batch.received_at - 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rows_match_width() {
        let payload = f32_payload(vec![vec![1.0, 2.0], vec![3.0]]);
        assert!(!payload.rows_match_width(2));
        let payload = f32_payload(vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert!(payload.rows_match_width(2));
    }

    #[test]
    fn test_create_source_rejects_unknown_scheme() {
        let descriptor = SourceDescriptor {
            name: "x".into(),
            content_type: "EEG".into(),
            source_id: "x1".into(),
            nominal_srate: 100.0,
            format: SampleFormat::Float32,
            channels: vec![],
            data_addr: "carrier-pigeon://nest".into(),
            probe_addr: String::new(),
        };
        let policy = ReconnectPolicy {
            max_attempts: 1,
            base_delay_ms: 10,
        };
        assert!(create_source(&descriptor, policy).is_err());
    }
}
