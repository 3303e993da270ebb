// Recorder configuration
//
// All knobs are optional in the JSON representation; missing fields fall
// back to the defaults below. The CLI loads a config file first and then
// applies flag overrides on top.

use crate::types::{RecorderError, RecorderResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// When the chunk writer flushes buffered chunks to durable storage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Flush whenever this much time has passed since the last flush
    Interval { interval_ms: u64 },

    /// Flush whenever this many bytes have accumulated since the last flush
    Size { max_bytes: u64 },
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::Interval { interval_ms: 1000 }
    }
}

/// Top-level recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Controller tick cadence; the tick is the only writer consumer
    pub tick_interval_ms: u64,

    /// An inlet with no samples and no heartbeat for this long is lost
    pub liveness_timeout_ms: u64,

    /// Per-inlet ring capacity in batches; None derives from the source rate
    pub ring_buffer_capacity: Option<usize>,

    pub flush_policy: FlushPolicy,

    /// Proceed with zero sources at start and rely on hot-add
    pub allow_empty_start: bool,

    /// How long `stop()` waits for a cooperative drain before forcing closure
    pub stop_timeout_ms: u64,

    /// UDP port queried during discovery
    pub discovery_port: u16,

    /// How long initial discovery collects replies
    pub discovery_timeout_ms: u64,

    /// Cadence of hot-add rediscovery during recording; 0 disables it
    pub rediscover_interval_ms: u64,

    /// Cadence of clock probes per inlet
    pub probe_interval_ms: u64,

    /// Sliding window length of the offset estimator, in probes
    pub probe_window: usize,

    /// Estimates below this confidence are not applied
    pub min_confidence: f64,

    /// A clock estimate older than this may be replaced regardless of confidence
    pub estimate_stale_ms: u64,

    /// Transport reconnect attempts before an inlet is declared lost
    pub reconnect_max_attempts: u32,

    /// Base delay of the exponential reconnect backoff
    pub reconnect_base_delay_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            liveness_timeout_ms: 5000,
            ring_buffer_capacity: None,
            flush_policy: FlushPolicy::default(),
            allow_empty_start: false,
            stop_timeout_ms: 5000,
            discovery_port: 16571,
            discovery_timeout_ms: 2000,
            rediscover_interval_ms: 5000,
            probe_interval_ms: 1000,
            probe_window: 8,
            min_confidence: 0.25,
            estimate_stale_ms: 10_000,
            reconnect_max_attempts: 5,
            reconnect_base_delay_ms: 250,
        }
    }
}

impl RecorderConfig {
    /// Load a configuration from a JSON file
    pub fn from_file(path: &Path) -> RecorderResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| RecorderError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RecorderResult<()> {
        if self.tick_interval_ms == 0 {
            return Err(RecorderError::InvalidConfig(
                "tick_interval_ms must be positive".into(),
            ));
        }
        if self.liveness_timeout_ms < self.tick_interval_ms {
            return Err(RecorderError::InvalidConfig(
                "liveness_timeout_ms must be at least one tick interval".into(),
            ));
        }
        if let Some(0) = self.ring_buffer_capacity {
            return Err(RecorderError::InvalidConfig(
                "ring_buffer_capacity must be positive".into(),
            ));
        }
        if self.probe_window == 0 {
            return Err(RecorderError::InvalidConfig(
                "probe_window must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(RecorderError::InvalidConfig(
                "min_confidence must be within [0, 1]".into(),
            ));
        }
        match self.flush_policy {
            FlushPolicy::Interval { interval_ms: 0 } => Err(RecorderError::InvalidConfig(
                "flush interval_ms must be positive".into(),
            )),
            FlushPolicy::Size { max_bytes: 0 } => Err(RecorderError::InvalidConfig(
                "flush max_bytes must be positive".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Ring capacity for a source with the given nominal rate: roughly two
    /// seconds of batches at the typical wire cadence, floored at 64.
    pub fn ring_capacity(&self, nominal_srate: f64) -> usize {
        self.ring_buffer_capacity
            .unwrap_or_else(|| ((nominal_srate / 8.0).ceil() as usize).max(64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RecorderConfig::default();
        assert_eq!(config.tick_interval_ms, 1000);
        assert_eq!(config.liveness_timeout_ms, 5000);
        assert!(!config.allow_empty_start);
        assert_eq!(config.flush_policy, FlushPolicy::Interval { interval_ms: 1000 });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RecorderConfig =
            serde_json::from_str(r#"{"tick_interval_ms": 250, "allow_empty_start": true}"#)
                .unwrap();
        assert_eq!(config.tick_interval_ms, 250);
        assert!(config.allow_empty_start);
        assert_eq!(config.discovery_port, 16571);
    }

    #[test]
    fn test_flush_policy_json() {
        let p: FlushPolicy =
            serde_json::from_str(r#"{"mode": "size", "max_bytes": 65536}"#).unwrap();
        assert_eq!(p, FlushPolicy::Size { max_bytes: 65536 });
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = RecorderConfig::default();
        config.tick_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = RecorderConfig::default();
        config.liveness_timeout_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ring_capacity_derivation() {
        let config = RecorderConfig::default();
        // Irregular-rate streams get the floor.
        assert_eq!(config.ring_capacity(0.0), 64);
        assert_eq!(config.ring_capacity(5000.0), 625);

        let mut config = RecorderConfig::default();
        config.ring_buffer_capacity = Some(16);
        assert_eq!(config.ring_capacity(5000.0), 16);
    }
}
