// Stream inlet
//
// One inlet per discovered source. A background transport task receives
// batches into a lock-free ring; a probe task keeps the clock estimator
// fed. The controller tick polls the ring and applies timestamp
// correction. The inlet only detects liveness problems; removal policy
// stays with the session.

use crate::buffer::{OverflowStrategy, RingMetrics, SampleRing};
use crate::clock::{local_clock, spawn_probe_task, ClockEstimate, OffsetEstimator};
use crate::config::RecorderConfig;
use crate::source::{create_source, ReconnectPolicy, SampleBatch, SourceDescriptor};
use crate::types::RecorderResult;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Inlet {
    pub stream_id: u32,
    pub descriptor: SourceDescriptor,
    ring: Arc<SampleRing>,
    estimator: Arc<RwLock<OffsetEstimator>>,
    last_activity: Arc<RwLock<f64>>,
    samples_received: Arc<AtomicU64>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Inlet {
    /// Connect the transport and spawn the receive and probe tasks.
    pub async fn open(
        stream_id: u32,
        descriptor: SourceDescriptor,
        config: &RecorderConfig,
        parent: &CancellationToken,
    ) -> RecorderResult<Self> {
        let reconnect = ReconnectPolicy {
            max_attempts: config.reconnect_max_attempts,
            base_delay_ms: config.reconnect_base_delay_ms,
        };
        let mut source = create_source(&descriptor, reconnect)?;
        let descriptor = source.connect().await?;

        let cancel = parent.child_token();
        let ring = Arc::new(SampleRing::new(
            config.ring_capacity(descriptor.nominal_srate),
            OverflowStrategy::DropOldest,
        ));
        let estimator = Arc::new(RwLock::new(OffsetEstimator::new(
            config.probe_window,
            config.min_confidence,
            config.estimate_stale_ms as f64 / 1000.0,
        )));
        let last_activity = Arc::new(RwLock::new(local_clock()));
        let samples_received = Arc::new(AtomicU64::new(0));

        let (tx, mut rx) = mpsc::channel::<SampleBatch>(100);
        let mut tasks = Vec::with_capacity(3);

        let transport_cancel = cancel.clone();
        let source_id = descriptor.source_id.clone();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                result = source.start(tx) => {
                    if let Err(e) = result {
                        log::warn!("Transport for '{}' ended: {}", source_id, e);
                    }
                }
                _ = transport_cancel.cancelled() => {}
            }
        }));

        let forward_ring = Arc::clone(&ring);
        let forward_activity = Arc::clone(&last_activity);
        let forward_received = Arc::clone(&samples_received);
        let forward_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let accept = |batch: SampleBatch| {
                *forward_activity.write() = local_clock();
                if !batch.is_empty() {
                    forward_received.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    forward_ring.push(batch);
                }
            };
            loop {
                tokio::select! {
                    biased;

                    _ = forward_cancel.cancelled() => {
                        // Flush anything the transport already handed over.
                        while let Ok(batch) = rx.try_recv() {
                            accept(batch);
                        }
                        break;
                    }

                    batch = rx.recv() => match batch {
                        Some(batch) => accept(batch),
                        None => break,
                    }
                }
            }
        }));

        if !descriptor.probe_addr.is_empty() {
            tasks.push(spawn_probe_task(
                descriptor.probe_addr.clone(),
                Arc::clone(&estimator),
                config.probe_interval_ms,
                cancel.clone(),
            ));
        }

        Ok(Self {
            stream_id,
            descriptor,
            ring,
            estimator,
            last_activity,
            samples_received,
            cancel,
            tasks,
        })
    }

    /// Non-blocking: everything received since the last poll merged into
    /// one batch, plus the samples dropped by ring overflow since then.
    pub fn poll(&self) -> (Option<SampleBatch>, u64) {
        let dropped = self.ring.take_dropped();
        let mut merged: Option<SampleBatch> = None;
        for batch in self.ring.drain() {
            match merged.as_mut() {
                None => merged = Some(batch),
                Some(head) => {
                    if let Err(e) = head.merge(batch) {
                        log::error!(
                            "Discarding inconsistent batch from '{}': {}",
                            self.descriptor.source_id,
                            e
                        );
                    }
                }
            }
        }
        (merged, dropped)
    }

    /// Map source timestamps onto the local time base. Without a usable
    /// estimate the batch keeps its spacing, is re-anchored at receipt
    /// time and flagged uncorrected.
    pub fn correct(&self, batch: &mut SampleBatch) {
        let now = local_clock();
        match self.estimator.read().current(now) {
            Some(estimate) => {
                for ts in &mut batch.timestamps {
                    *ts = estimate.correct(*ts, now);
                }
                batch.uncorrected = false;
            }
            None => {
                if let Some(&last) = batch.timestamps.last() {
                    let shift = batch.received_at - last;
                    for ts in &mut batch.timestamps {
                        *ts += shift;
                    }
                }
                batch.uncorrected = true;
            }
        }
    }

    pub fn clock_estimate(&self) -> Option<ClockEstimate> {
        self.estimator.read().current(local_clock())
    }

    /// True when neither samples nor heartbeats arrived within `timeout`
    pub fn is_stale(&self, timeout: Duration) -> bool {
        local_clock() - *self.last_activity.read() > timeout.as_secs_f64()
    }

    pub fn samples_received(&self) -> u64 {
        self.samples_received.load(Ordering::Relaxed)
    }

    pub fn ring_metrics(&self) -> RingMetrics {
        self.ring.metrics()
    }

    /// Cancel the background tasks and wait for them to drain and exit.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}
