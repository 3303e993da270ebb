// Continuous multi-stream signal recorder
//
// Discovers sample sources on the network, synchronizes their clocks
// against the local time base and appends their samples to a
// crash-tolerant XDF container.
//
// Architecture:
// - `discovery`: UDP query/announce source resolution
// - `source`: trait-based pluggable sample transports (TCP, simulated)
// - `buffer`: lock-free rings between transports and the controller
// - `clock`: round-trip probes and per-inlet offset/drift estimation
// - `inlet`: per-source receive tasks, liveness, timestamp correction
// - `writer` / `reader`: incremental XDF serialization and recovery scan
// - `session`: the lifecycle state machine an operator drives
// - `publish`: the outlet side, for test streams and integration tests

pub mod buffer;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod inlet;
pub mod publish;
pub mod reader;
pub mod session;
pub mod source;
pub mod types;
pub mod writer;

pub use clock::{local_clock, ClockEstimate, OffsetEstimator};
pub use config::{FlushPolicy, RecorderConfig};
pub use discovery::{discover, DiscoveryQuery};
pub use publish::{Publisher, PublisherConfig};
pub use reader::{scan, ContainerScan, StreamSummary};
pub use session::Session;
pub use source::{ChannelInfo, Payload, SampleBatch, SampleFormat, SourceDescriptor};
pub use types::{RecorderError, RecorderResult, SessionEvent, SessionState, SessionStats};
pub use writer::ChunkWriter;
