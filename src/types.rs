// Common types for the recorder: error taxonomy, session lifecycle state,
// observable events and statistics.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for recorder operations
pub type RecorderResult<T> = Result<T, RecorderError>;

/// Errors that can occur while discovering, recording or finalizing
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("container format error: {0}")]
    Format(String),

    #[error("no sources found within {timeout_ms} ms")]
    NoSourcesFound { timeout_ms: u64 },

    #[error("stream with source id '{0}' is already registered and open")]
    DuplicateStream(String),

    #[error("unknown stream id {0}")]
    UnknownStream(u32),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("stop timed out; unflushed samples were dropped")]
    StopTimedOut,

    #[error("session faulted: {0}")]
    Fault(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

impl From<quick_xml::Error> for RecorderError {
    fn from(e: quick_xml::Error) -> Self {
        RecorderError::Format(e.to_string())
    }
}

/// Lifecycle state of a recording session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum SessionState {
    /// No session activity yet
    Idle,

    /// Resolving sources on the network
    Discovering,

    /// Actively pulling samples and appending to the container
    Recording { started_at: f64 },

    /// Draining inlets and finalizing the container
    Stopping,

    /// Container footer written, file is seekable
    Finalized,

    /// Unrecoverable failure; container is recoverable by linear scan only
    Faulted { message: String },
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Finalized | SessionState::Faulted { .. })
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Events emitted by a session, observable via `Session::subscribe`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionEvent {
    StateChanged {
        state: SessionState,
    },

    /// A source was registered and its metadata block written
    StreamAdded {
        stream_id: u32,
        source_id: String,
        name: String,
    },

    /// A source exceeded the liveness timeout and its inlet was destroyed
    StreamLost {
        stream_id: u32,
        source_id: String,
    },

    /// A ring buffer overflowed; oldest samples were discarded
    SamplesDropped {
        stream_id: u32,
        count: u64,
    },

    /// Writer-level failure; the session is no longer recording
    Faulted {
        message: String,
    },

    StatsUpdate {
        stats: SessionStats,
    },
}

/// Per-stream counters reported by `Session::status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStats {
    pub stream_id: u32,
    pub source_id: String,
    pub name: String,
    pub content_type: String,
    pub samples_received: u64,
    pub samples_written: u64,
    pub samples_dropped: u64,
    pub batches_written: u64,
    pub last_timestamp: Option<f64>,
    /// True once a usable clock estimate has been applied to this stream
    pub clock_corrected: bool,
    pub lost: bool,
}

/// Aggregate session status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,
    pub state: SessionState,
    pub output_path: String,
    pub uptime_seconds: f64,
    pub streams: Vec<StreamStats>,
}
