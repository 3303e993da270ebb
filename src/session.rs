// Session controller
//
// One `Session` per recording. The controller runs discovery, owns the
// inlet set and the chunk writer, and drives everything from a single
// periodic tick: polling inlets in registration order, applying clock
// correction, appending to the writer, checking liveness and hot-adding
// newly announced sources. The tick task is the only writer consumer,
// which keeps the container single-writer without locks.
//
// State machine: Idle -> Discovering -> Recording -> Stopping ->
// Finalized, with Faulted reachable from any non-terminal state on
// writer I/O failure (or loss of all sources when rediscovery is off).

use crate::clock::local_clock;
use crate::config::RecorderConfig;
use crate::discovery::{discover, DiscoveryQuery};
use crate::inlet::Inlet;
use crate::source::SourceDescriptor;
use crate::types::{
    RecorderError, RecorderResult, SessionEvent, SessionState, SessionStats, StreamStats,
};
use crate::writer::ChunkWriter;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const REDISCOVER_QUERY_TIMEOUT: Duration = Duration::from_millis(250);
const CLOCK_OFFSET_PERIOD_MS: u64 = 5000;

/// Per-stream counters shared between the worker and `status()`
struct StreamTracker {
    stream_id: u32,
    descriptor: SourceDescriptor,
    received: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
    batches: AtomicU64,
    last_timestamp: RwLock<Option<f64>>,
    corrected: AtomicBool,
    lost: AtomicBool,
}

impl StreamTracker {
    fn new(stream_id: u32, descriptor: SourceDescriptor) -> Self {
        Self {
            stream_id,
            descriptor,
            received: AtomicU64::new(0),
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            last_timestamp: RwLock::new(None),
            corrected: AtomicBool::new(false),
            lost: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> StreamStats {
        StreamStats {
            stream_id: self.stream_id,
            source_id: self.descriptor.source_id.clone(),
            name: self.descriptor.name.clone(),
            content_type: self.descriptor.content_type.clone(),
            samples_received: self.received.load(Ordering::Relaxed),
            samples_written: self.written.load(Ordering::Relaxed),
            samples_dropped: self.dropped.load(Ordering::Relaxed),
            batches_written: self.batches.load(Ordering::Relaxed),
            last_timestamp: *self.last_timestamp.read(),
            clock_corrected: self.corrected.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    id: Uuid,
    output_path: PathBuf,
    config: RecorderConfig,
    state: RwLock<SessionState>,
    started: RwLock<Option<Instant>>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    terminal_tx: watch::Sender<bool>,
    terminal_rx: watch::Receiver<bool>,
    trackers: RwLock<Vec<Arc<StreamTracker>>>,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: SessionState) {
        log::info!("Session {} -> {:?}", self.id, state);
        *self.state.write() = state.clone();
        let terminal = state.is_terminal();
        self.emit(SessionEvent::StateChanged { state });
        if terminal {
            let _ = self.terminal_tx.send(true);
        }
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.id.to_string(),
            state: self.state.read().clone(),
            output_path: self.output_path.display().to_string(),
            uptime_seconds: self
                .started
                .read()
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0),
            streams: self.trackers.read().iter().map(|t| t.snapshot()).collect(),
        }
    }
}

/// Handle to one recording. No process-wide singleton: every operation
/// goes through an explicit `Session` value.
pub struct Session {
    shared: Arc<Shared>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Discover sources matching `query`, create the container and start
    /// recording. With zero matches and `allow_empty_start` unset this
    /// fails with `NoSourcesFound` and creates no output file.
    pub async fn start(
        query: DiscoveryQuery,
        output_path: impl AsRef<Path>,
        config: RecorderConfig,
    ) -> RecorderResult<Self> {
        config.validate()?;
        let output_path = output_path.as_ref().to_path_buf();

        let (terminal_tx, terminal_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            output_path: output_path.clone(),
            config: config.clone(),
            state: RwLock::new(SessionState::Idle),
            started: RwLock::new(None),
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            cancel: CancellationToken::new(),
            terminal_tx,
            terminal_rx,
            trackers: RwLock::new(Vec::new()),
        });

        shared.set_state(SessionState::Discovering);
        let found = discover(
            &query,
            Duration::from_millis(config.discovery_timeout_ms),
            config.discovery_port,
        )
        .await?;

        if found.is_empty() && !config.allow_empty_start {
            return Err(RecorderError::NoSourcesFound {
                timeout_ms: config.discovery_timeout_ms,
            });
        }

        let mut writer = ChunkWriter::create(&output_path, config.flush_policy)?;
        let mut worker = SessionWorker {
            shared: Arc::clone(&shared),
            writer: None,
            inlets: Vec::new(),
            trackers: HashMap::new(),
            query,
            config: config.clone(),
            tick_count: 0,
            had_inlets: false,
        };
        for descriptor in found {
            worker.add_source(&mut writer, descriptor).await;
        }
        worker.writer = Some(writer);

        *shared.started.write() = Some(Instant::now());
        shared.set_state(SessionState::Recording {
            started_at: chrono::Utc::now().timestamp() as f64,
        });

        let handle = tokio::spawn(worker.run());
        Ok(Self {
            shared,
            worker_handle: Mutex::new(Some(handle)),
        })
    }

    /// Cooperative stop: drain inlets, flush, finalize. Idempotent — a
    /// second call on a terminal session returns success without touching
    /// the container. Escalates to forced closure after `stop_timeout_ms`.
    pub async fn stop(&self) -> RecorderResult<()> {
        if self.shared.state.read().is_terminal() {
            return Ok(());
        }
        self.shared.cancel.cancel();

        let mut terminal = self.shared.terminal_rx.clone();
        let waited = tokio::time::timeout(
            Duration::from_millis(self.shared.config.stop_timeout_ms),
            terminal.wait_for(|done| *done),
        )
        .await;

        match waited {
            Ok(_) => match self.shared.state.read().clone() {
                SessionState::Faulted { message } => Err(RecorderError::Fault(message)),
                _ => Ok(()),
            },
            Err(_) => {
                log::error!(
                    "Session {} did not drain within {} ms, forcing closure",
                    self.shared.id,
                    self.shared.config.stop_timeout_ms
                );
                if let Some(handle) = self.worker_handle.lock().take() {
                    handle.abort();
                }
                self.shared.set_state(SessionState::Faulted {
                    message: "forced stop after timeout".into(),
                });
                Err(RecorderError::StopTimedOut)
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.read().clone()
    }

    pub fn status(&self) -> SessionStats {
        self.shared.stats()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn output_path(&self) -> &Path {
        &self.shared.output_path
    }

    /// Resolve once the session reaches a terminal state
    pub async fn wait(&self) -> SessionState {
        let mut terminal = self.shared.terminal_rx.clone();
        let _ = terminal.wait_for(|done| *done).await;
        self.state()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

struct SessionWorker {
    shared: Arc<Shared>,
    // None only while `start` and `rediscover` lend the writer out for
    // stream registration
    writer: Option<ChunkWriter>,
    inlets: Vec<Inlet>,
    trackers: HashMap<u32, Arc<StreamTracker>>,
    query: DiscoveryQuery,
    config: RecorderConfig,
    tick_count: u64,
    had_inlets: bool,
}

impl SessionWorker {
    /// Register a descriptor and open its inlet; failures are absorbed
    /// and the stream marked lost so recording continues without it.
    async fn add_source(&mut self, writer: &mut ChunkWriter, descriptor: SourceDescriptor) {
        let stream_id = match writer.register_stream(&descriptor) {
            Ok(id) => id,
            Err(RecorderError::DuplicateStream(source_id)) => {
                log::warn!("Source '{}' already registered, skipping", source_id);
                return;
            }
            Err(e) => {
                log::error!("Failed to register '{}': {}", descriptor.source_id, e);
                return;
            }
        };

        let tracker = Arc::new(StreamTracker::new(stream_id, descriptor.clone()));
        self.trackers.insert(stream_id, Arc::clone(&tracker));
        self.shared.trackers.write().push(Arc::clone(&tracker));

        match Inlet::open(stream_id, descriptor, &self.config, &self.shared.cancel).await {
            Ok(inlet) => {
                self.shared.emit(SessionEvent::StreamAdded {
                    stream_id,
                    source_id: inlet.descriptor.source_id.clone(),
                    name: inlet.descriptor.name.clone(),
                });
                self.inlets.push(inlet);
                self.had_inlets = true;
            }
            Err(e) => {
                log::warn!("Could not open inlet for stream {}: {}", stream_id, e);
                writer.mark_lost(stream_id);
                tracker.lost.store(true, Ordering::Relaxed);
            }
        }
    }

    async fn run(mut self) {
        let mut tick = interval(Duration::from_millis(self.config.tick_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = self.shared.cancel.cancelled() => {
                    self.drain().await;
                    return;
                }

                _ = tick.tick() => {
                    if let Err(e) = self.tick().await {
                        self.fault(e);
                        return;
                    }
                }
            }
        }
    }

    fn writer(&mut self) -> &mut ChunkWriter {
        self.writer.as_mut().expect("writer present until worker exit")
    }

    /// One controller tick. An `Err` is writer-fatal and faults the
    /// session; everything inlet-side is absorbed as events.
    async fn tick(&mut self) -> RecorderResult<()> {
        self.tick_count += 1;

        // Poll and append in registration order; only this task touches
        // the writer.
        for idx in 0..self.inlets.len() {
            let (batch, dropped) = self.inlets[idx].poll();
            let stream_id = self.inlets[idx].stream_id;
            let tracker = self.trackers[&stream_id].clone();

            if dropped > 0 {
                tracker.dropped.fetch_add(dropped, Ordering::Relaxed);
                self.shared.emit(SessionEvent::SamplesDropped {
                    stream_id,
                    count: dropped,
                });
                log::warn!("Stream {} dropped {} samples on overflow", stream_id, dropped);
            }

            if let Some(mut batch) = batch {
                self.inlets[idx].correct(&mut batch);
                tracker
                    .corrected
                    .store(!batch.uncorrected, Ordering::Relaxed);
                tracker
                    .received
                    .store(self.inlets[idx].samples_received(), Ordering::Relaxed);

                let written = batch.len() as u64;
                self.writer().append_batch(stream_id, &mut batch)?;
                tracker.written.fetch_add(written, Ordering::Relaxed);
                tracker.batches.fetch_add(1, Ordering::Relaxed);
                *tracker.last_timestamp.write() = batch.timestamps.last().copied();
            }
        }

        // Periodic clock-offset chunks for the converter side.
        let offset_every = (CLOCK_OFFSET_PERIOD_MS / self.config.tick_interval_ms).max(1);
        if self.tick_count % offset_every == 0 {
            for idx in 0..self.inlets.len() {
                if let Some(estimate) = self.inlets[idx].clock_estimate() {
                    let stream_id = self.inlets[idx].stream_id;
                    self.writer()
                        .write_clock_offset(stream_id, local_clock(), estimate.offset)?;
                }
            }
        }

        self.check_liveness().await?;

        if self.config.rediscover_interval_ms > 0 {
            let every = (self.config.rediscover_interval_ms / self.config.tick_interval_ms).max(1);
            if self.tick_count % every == 0 {
                self.rediscover().await;
            }
        } else if self.inlets.is_empty() && self.had_inlets {
            return Err(RecorderError::Connection(
                "all sources lost and rediscovery is disabled".into(),
            ));
        }

        self.shared.emit(SessionEvent::StatsUpdate {
            stats: self.shared.stats(),
        });
        Ok(())
    }

    /// Destroy inlets that went silent past the liveness timeout. Their
    /// remaining buffered samples are written first.
    async fn check_liveness(&mut self) -> RecorderResult<()> {
        let timeout = Duration::from_millis(self.config.liveness_timeout_ms);
        let stale: Vec<usize> = self
            .inlets
            .iter()
            .enumerate()
            .filter(|(_, inlet)| inlet.is_stale(timeout))
            .map(|(idx, _)| idx)
            .collect();

        for idx in stale.into_iter().rev() {
            let mut inlet = self.inlets.remove(idx);
            let stream_id = inlet.stream_id;
            let source_id = inlet.descriptor.source_id.clone();
            log::warn!(
                "Stream {} ('{}') exceeded liveness timeout, declaring lost",
                stream_id,
                source_id
            );

            inlet.close().await;
            if let (Some(mut batch), _) = inlet.poll() {
                inlet.correct(&mut batch);
                let written = batch.len() as u64;
                self.writer().append_batch(stream_id, &mut batch)?;
                if let Some(tracker) = self.trackers.get(&stream_id) {
                    tracker.written.fetch_add(written, Ordering::Relaxed);
                    tracker.batches.fetch_add(1, Ordering::Relaxed);
                }
            }

            self.writer().mark_lost(stream_id);
            if let Some(tracker) = self.trackers.get(&stream_id) {
                tracker.lost.store(true, Ordering::Relaxed);
            }
            self.shared.emit(SessionEvent::StreamLost {
                stream_id,
                source_id,
            });
        }
        Ok(())
    }

    /// Hot-add: short discovery round, register any matching source that
    /// is not already live.
    async fn rediscover(&mut self) {
        let found = match discover(
            &self.query,
            REDISCOVER_QUERY_TIMEOUT,
            self.config.discovery_port,
        )
        .await
        {
            Ok(found) => found,
            Err(e) => {
                log::debug!("Rediscovery round failed: {}", e);
                return;
            }
        };

        let mut writer = self.writer.take().expect("writer present until worker exit");
        for descriptor in found {
            let live = self
                .inlets
                .iter()
                .any(|inlet| inlet.descriptor.source_id == descriptor.source_id);
            if !live {
                log::info!("Hot-adding source '{}'", descriptor.source_id);
                self.add_source(&mut writer, descriptor).await;
            }
        }
        self.writer = Some(writer);
    }

    /// Drain everything buffered, flush and finalize the container.
    async fn drain(mut self) {
        self.shared.set_state(SessionState::Stopping);

        let mut inlets = std::mem::take(&mut self.inlets);
        for inlet in &mut inlets {
            inlet.close().await;
        }
        for inlet in &inlets {
            let (batch, dropped) = inlet.poll();
            let stream_id = inlet.stream_id;
            if dropped > 0 {
                self.shared.emit(SessionEvent::SamplesDropped {
                    stream_id,
                    count: dropped,
                });
            }
            if let Some(mut batch) = batch {
                inlet.correct(&mut batch);
                let written = batch.len() as u64;
                if let Err(e) = self.writer().append_batch(stream_id, &mut batch) {
                    self.fault(e);
                    return;
                }
                if let Some(tracker) = self.trackers.get(&stream_id) {
                    tracker.written.fetch_add(written, Ordering::Relaxed);
                    tracker.batches.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if let Err(e) = self.writer().finalize() {
            self.fault(e);
            return;
        }
        self.shared.set_state(SessionState::Finalized);
    }

    /// Writer-level failure: the one class that is session-fatal. The
    /// container stays recoverable by linear scan up to the last flush.
    fn fault(&self, error: RecorderError) {
        let message = error.to_string();
        log::error!("Session {} faulted: {}", self.shared.id, message);
        self.shared.emit(SessionEvent::Faulted {
            message: message.clone(),
        });
        self.shared.set_state(SessionState::Faulted { message });
        self.shared.cancel.cancel();
    }
}
