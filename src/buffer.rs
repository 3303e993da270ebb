// Lock-free ring buffer between an inlet's receive task and the
// controller tick
//
// Built on crossbeam's ArrayQueue so the network side never blocks on a
// slow consumer: when the ring is full the oldest unread batches are
// discarded and the dropped sample count is surfaced on the next poll.

use crate::source::SampleBatch;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use crossbeam::queue::ArrayQueue;

/// What to do when a push finds the ring full
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OverflowStrategy {
    /// Discard oldest unread batches; the real-time recording default
    DropOldest,

    /// Discard the incoming batch, preserving what is already buffered
    DropNewest,
}

/// Counters for buffer monitoring, all sample-granular
#[derive(Debug, Clone, Default)]
pub struct RingMetrics {
    pub samples_pushed: u64,
    pub samples_dropped: u64,
    pub current_batches: usize,
    pub peak_batches: usize,
    pub capacity: usize,
}

pub struct SampleRing {
    queue: Arc<ArrayQueue<SampleBatch>>,
    capacity: usize,
    strategy: OverflowStrategy,

    samples_pushed: AtomicU64,
    samples_dropped: AtomicU64,
    /// Drops since the last `take_dropped`, reported as one event per poll
    pending_dropped: AtomicU64,
    peak_batches: AtomicUsize,
}

impl SampleRing {
    pub fn new(capacity: usize, strategy: OverflowStrategy) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity)),
            capacity,
            strategy,
            samples_pushed: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
            pending_dropped: AtomicU64::new(0),
            peak_batches: AtomicUsize::new(0),
        }
    }

    /// Push a batch, applying the overflow strategy. Never blocks.
    pub fn push(&self, batch: SampleBatch) {
        let incoming = batch.len() as u64;
        match self.strategy {
            OverflowStrategy::DropOldest => {
                let mut batch = batch;
                loop {
                    match self.queue.push(batch) {
                        Ok(()) => break,
                        Err(rejected) => {
                            if let Some(evicted) = self.queue.pop() {
                                self.record_drop(evicted.len() as u64);
                            }
                            batch = rejected;
                        }
                    }
                }
                self.samples_pushed.fetch_add(incoming, Ordering::Relaxed);
            }
            OverflowStrategy::DropNewest => {
                if self.queue.push(batch).is_err() {
                    self.record_drop(incoming);
                } else {
                    self.samples_pushed.fetch_add(incoming, Ordering::Relaxed);
                }
            }
        }
        self.peak_batches
            .fetch_max(self.queue.len(), Ordering::Relaxed);
    }

    fn record_drop(&self, samples: u64) {
        self.samples_dropped.fetch_add(samples, Ordering::Relaxed);
        self.pending_dropped.fetch_add(samples, Ordering::Relaxed);
    }

    /// Drain every buffered batch, oldest first
    pub fn drain(&self) -> Vec<SampleBatch> {
        let mut batches = Vec::with_capacity(self.queue.len());
        while let Some(batch) = self.queue.pop() {
            batches.push(batch);
        }
        batches
    }

    /// Samples dropped since the last call; at most one overflow event per
    /// poll is derived from this
    pub fn take_dropped(&self) -> u64 {
        self.pending_dropped.swap(0, Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn metrics(&self) -> RingMetrics {
        RingMetrics {
            samples_pushed: self.samples_pushed.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            current_batches: self.queue.len(),
            peak_batches: self.peak_batches.load(Ordering::Relaxed),
            capacity: self.capacity,
        }
    }
}
