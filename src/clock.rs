// Clock synchronization
//
// Each inlet gets an offset estimator fed by periodic UDP round-trip
// probes against the source's probe endpoint. The estimator keeps a small
// sliding window of probes and selects the minimum-latency one as the
// current offset (midpoint estimate), with drift taken as the slope of
// offset over probe time across the window. Estimates never regress: a
// lower-confidence candidate only replaces the current estimate once the
// current one has gone stale.

use crate::types::{RecorderError, RecorderResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

/// RTT at which probe confidence halves
const RTT_SCALE: f64 = 0.010;

const PROBE_REPLY_TIMEOUT: Duration = Duration::from_millis(500);

static CLOCK_ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Seconds on the recorder's monotonic time base. All corrected sample
/// timestamps and probe times are expressed on this clock.
pub fn local_clock() -> f64 {
    CLOCK_ANCHOR
        .get_or_init(Instant::now)
        .elapsed()
        .as_secs_f64()
}

/// One round-trip measurement against a source's probe endpoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeSample {
    /// Round-trip latency in seconds
    pub rtt: f64,
    /// remote_time - (send_time + recv_time) / 2
    pub offset: f64,
    /// Local clock at completion
    pub at: f64,
}

/// The offset/drift estimate currently applied to an inlet's timestamps
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ClockEstimate {
    /// Remote minus local clock, in seconds, at `measured_at`
    pub offset: f64,
    /// Rate of offset change, in seconds per second
    pub drift: f64,
    /// Confidence in [0, 1] at measurement time; decays with age
    pub confidence: f64,
    /// Local clock when the selected probe completed
    pub measured_at: f64,
}

impl ClockEstimate {
    /// Offset extrapolated to `now` along the drift slope
    pub fn offset_at(&self, now: f64) -> f64 {
        self.offset + self.drift * (now - self.measured_at)
    }

    /// Map a source-reported timestamp onto the local time base
    pub fn correct(&self, remote_ts: f64, now: f64) -> f64 {
        remote_ts - self.offset_at(now)
    }
}

/// Sliding-window minimum-latency offset estimator for one inlet
pub struct OffsetEstimator {
    window: VecDeque<ProbeSample>,
    capacity: usize,
    min_confidence: f64,
    /// Seconds after which the applied estimate may be replaced regardless
    /// of candidate confidence, and decays to unusable
    stale_after: f64,
    applied: Option<ClockEstimate>,
}

impl OffsetEstimator {
    pub fn new(capacity: usize, min_confidence: f64, stale_after: f64) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            min_confidence,
            stale_after,
            applied: None,
        }
    }

    fn probe_confidence(&self, probe: &ProbeSample) -> f64 {
        RTT_SCALE / (RTT_SCALE + probe.rtt.max(0.0))
    }

    fn effective_confidence(&self, estimate: &ClockEstimate, now: f64) -> f64 {
        let age = (now - estimate.measured_at).max(0.0);
        estimate.confidence * (1.0 - age / self.stale_after).max(0.0)
    }

    /// Feed one probe and re-select the applied estimate
    pub fn push(&mut self, probe: ProbeSample) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(probe);

        let candidate = self.select();
        let now = probe.at;
        let replace = match &self.applied {
            None => true,
            Some(current) => {
                candidate.confidence >= self.effective_confidence(current, now)
                    || now - current.measured_at > self.stale_after
            }
        };
        if replace {
            self.applied = Some(candidate);
        }
    }

    /// Minimum-RTT probe in the window, most recent winning ties, with
    /// drift as the least-squares slope of offset over probe time.
    fn select(&self) -> ClockEstimate {
        let best = self
            .window
            .iter()
            .fold(None::<&ProbeSample>, |best, p| match best {
                Some(b) if p.rtt > b.rtt => Some(b),
                _ => Some(p),
            })
            .expect("select called on empty window");

        ClockEstimate {
            offset: best.offset,
            drift: self.drift_slope(),
            confidence: self.probe_confidence(best),
            measured_at: best.at,
        }
    }

    fn drift_slope(&self) -> f64 {
        let n = self.window.len();
        if n < 2 {
            return 0.0;
        }
        let mean_t = self.window.iter().map(|p| p.at).sum::<f64>() / n as f64;
        let mean_o = self.window.iter().map(|p| p.offset).sum::<f64>() / n as f64;
        let (num, den) = self.window.iter().fold((0.0, 0.0), |(num, den), p| {
            let dt = p.at - mean_t;
            (num + dt * (p.offset - mean_o), den + dt * dt)
        });
        if den.abs() < f64::EPSILON {
            0.0
        } else {
            num / den
        }
    }

    /// The estimate to apply right now, or None when confidence has decayed
    /// below the usable floor (caller falls back to receipt timestamps).
    pub fn current(&self, now: f64) -> Option<ClockEstimate> {
        self.applied
            .filter(|est| self.effective_confidence(est, now) >= self.min_confidence)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub t1: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProbeReply {
    pub t1: f64,
    pub t2: f64,
}

/// One round trip on a connected UDP socket. Stale replies (echoing an
/// older t1) are discarded until the deadline.
pub async fn run_probe(socket: &UdpSocket) -> RecorderResult<ProbeSample> {
    let t1 = local_clock();
    let request = serde_json::to_vec(&ProbeRequest { t1 })
        .map_err(|e| RecorderError::Parse(e.to_string()))?;
    socket.send(&request).await?;

    let mut buf = [0u8; 256];
    let deadline = tokio::time::Instant::now() + PROBE_REPLY_TIMEOUT;
    loop {
        let len = tokio::time::timeout_at(deadline, socket.recv(&mut buf))
            .await
            .map_err(|_| RecorderError::Timeout("probe reply".into()))??;
        let reply: ProbeReply = match serde_json::from_slice(&buf[..len]) {
            Ok(r) => r,
            Err(e) => {
                log::debug!("Discarding malformed probe reply: {}", e);
                continue;
            }
        };
        if (reply.t1 - t1).abs() > f64::EPSILON {
            continue;
        }
        let t3 = local_clock();
        return Ok(ProbeSample {
            rtt: t3 - t1,
            offset: reply.t2 - (t1 + t3) / 2.0,
            at: t3,
        });
    }
}

/// Background probe loop for one inlet. Probe failures are absorbed and
/// logged; they never propagate to the session.
pub fn spawn_probe_task(
    probe_addr: String,
    estimator: Arc<RwLock<OffsetEstimator>>,
    interval_ms: u64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => s,
            Err(e) => {
                log::warn!("Probe socket bind failed for {}: {}", probe_addr, e);
                return;
            }
        };
        if let Err(e) = socket.connect(&probe_addr).await {
            log::warn!("Probe socket connect to {} failed: {}", probe_addr, e);
            return;
        }

        let mut tick = interval(Duration::from_millis(interval_ms.max(1)));
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = tick.tick() => {
                    match run_probe(&socket).await {
                        Ok(probe) => estimator.write().push(probe),
                        Err(e) => log::debug!("Clock probe to {} failed: {}", probe_addr, e),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(rtt_ms: f64, offset_ms: f64, at: f64) -> ProbeSample {
        ProbeSample {
            rtt: rtt_ms / 1000.0,
            offset: offset_ms / 1000.0,
            at,
        }
    }

    #[test]
    fn test_minimum_latency_selection() {
        let mut est = OffsetEstimator::new(8, 0.0, 60.0);
        est.push(probe(12.0, 50.0, 1.0));
        est.push(probe(3.0, 47.0, 2.0));
        est.push(probe(8.0, 49.0, 3.0));

        let current = est.current(3.0).unwrap();
        assert!((current.offset - 0.047).abs() < 1e-9);
    }

    #[test]
    fn test_equal_rtt_most_recent_wins() {
        let mut est = OffsetEstimator::new(8, 0.0, 60.0);
        est.push(probe(3.0, 40.0, 1.0));
        est.push(probe(3.0, 44.0, 2.0));

        let current = est.current(2.0).unwrap();
        assert!((current.offset - 0.044).abs() < 1e-9);
        assert!((current.measured_at - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_never_regresses_to_worse_probe() {
        // Window of two: a good probe followed by enough bad ones to evict it.
        let mut est = OffsetEstimator::new(2, 0.0, 60.0);
        est.push(probe(3.0, 47.0, 1.0));
        est.push(probe(30.0, 90.0, 2.0));
        est.push(probe(30.0, 91.0, 3.0));

        // The good probe left the window, but the applied estimate is fresh
        // enough that the low-confidence candidate must not replace it.
        let current = est.current(3.0).unwrap();
        assert!((current.offset - 0.047).abs() < 1e-9);
    }

    #[test]
    fn test_stale_estimate_is_replaced() {
        let mut est = OffsetEstimator::new(2, 0.0, 5.0);
        est.push(probe(3.0, 47.0, 1.0));
        est.push(probe(30.0, 90.0, 2.0));
        // Past stale_after the gate opens even for a worse candidate.
        est.push(probe(30.0, 91.0, 10.0));

        let current = est.current(10.0).unwrap();
        assert!((current.offset - 0.091).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_decays_below_floor() {
        let mut est = OffsetEstimator::new(8, 0.25, 10.0);
        est.push(probe(3.0, 47.0, 1.0));
        assert!(est.current(1.0).is_some());
        // Nine seconds later the decayed confidence is below the floor.
        assert!(est.current(10.0).is_none());
    }

    #[test]
    fn test_drift_slope_of_linear_offsets() {
        let mut est = OffsetEstimator::new(8, 0.0, 60.0);
        // Offset growing 2 ms per second.
        for i in 0..5 {
            let t = i as f64;
            est.push(probe(3.0, 10.0 + 2.0 * t, t));
        }
        let current = est.current(4.0).unwrap();
        assert!((current.drift - 0.002).abs() < 1e-9);
    }

    #[test]
    fn test_correction_applies_drift() {
        let est = ClockEstimate {
            offset: 0.100,
            drift: 0.001,
            confidence: 1.0,
            measured_at: 10.0,
        };
        // Two seconds later the extrapolated offset is 102 ms.
        let corrected = est.correct(5.0, 12.0);
        assert!((corrected - (5.0 - 0.102)).abs() < 1e-9);
    }

    #[test]
    fn test_local_clock_monotonic() {
        let a = local_clock();
        let b = local_clock();
        assert!(b >= a);
    }
}
