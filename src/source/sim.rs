// Simulated sample source
//
// Generates a synthetic signal at the descriptor's nominal rate without
// touching the network: sine waves plus noise for numeric formats, marker
// strings for string-format streams. Used for offline recordings and as
// the deterministic source in tests.

use super::{Payload, SampleBatch, SampleSource, SourceDescriptor};
use crate::clock::local_clock;
use crate::source::{ChannelInfo, SampleFormat};
use crate::types::RecorderResult;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;

const CHUNK_INTERVAL: Duration = Duration::from_millis(50);

pub struct SimSource {
    descriptor: SourceDescriptor,
    connected: bool,
    /// Running sample index, keeps the waveform phase-continuous
    sample_index: u64,
}

impl SimSource {
    pub fn new(
        name: &str,
        content_type: &str,
        source_id: &str,
        channels: usize,
        nominal_srate: f64,
        format: SampleFormat,
    ) -> Self {
        let channels = (0..channels)
            .map(|i| ChannelInfo {
                label: format!("Ch{}", i + 1),
                unit: if format == SampleFormat::String {
                    String::new()
                } else {
                    "uV".to_string()
                },
            })
            .collect();
        Self::from_descriptor(SourceDescriptor {
            name: name.to_string(),
            content_type: content_type.to_string(),
            source_id: source_id.to_string(),
            nominal_srate,
            format,
            channels,
            data_addr: format!("sim:{}", source_id),
            probe_addr: String::new(),
        })
    }

    pub fn from_descriptor(descriptor: SourceDescriptor) -> Self {
        Self {
            descriptor,
            connected: false,
            sample_index: 0,
        }
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    /// Next `n` samples of the synthetic signal, timestamped on the local
    /// clock. Also used by the publisher as its signal generator.
    pub fn generate_chunk(&mut self, n: usize) -> (Vec<f64>, Payload) {
        let rate = self.descriptor.nominal_srate.max(1.0);
        let channels = self.descriptor.channel_count().max(1);
        let now = local_clock();
        let timestamps: Vec<f64> = (0..n)
            .map(|i| now - (n - 1 - i) as f64 / rate)
            .collect();

        let payload = match self.descriptor.format {
            SampleFormat::String => {
                let rows = (0..n)
                    .map(|i| {
                        (0..channels)
                            .map(|_| format!("marker-{}", self.sample_index + i as u64))
                            .collect()
                    })
                    .collect();
                Payload::String(rows)
            }
            format => {
                let mut rng = rand::rng();
                let rows_f64: Vec<Vec<f64>> = (0..n)
                    .map(|i| {
                        let t = (self.sample_index + i as u64) as f64 / rate;
                        (0..channels)
                            .map(|ch| {
                                let hz = 1.0 + ch as f64;
                                (2.0 * std::f64::consts::PI * hz * t).sin()
                                    + rng.random_range(-0.05..0.05)
                            })
                            .collect()
                    })
                    .collect();
                match format {
                    SampleFormat::Float32 => Payload::Float32(
                        rows_f64
                            .iter()
                            .map(|r| r.iter().map(|&v| v as f32).collect())
                            .collect(),
                    ),
                    SampleFormat::Float64 => Payload::Float64(rows_f64),
                    SampleFormat::Int16 => Payload::Int16(
                        rows_f64
                            .iter()
                            .map(|r| r.iter().map(|&v| (v * 1000.0) as i16).collect())
                            .collect(),
                    ),
                    SampleFormat::Int32 => Payload::Int32(
                        rows_f64
                            .iter()
                            .map(|r| r.iter().map(|&v| (v * 1000.0) as i32).collect())
                            .collect(),
                    ),
                    SampleFormat::String => unreachable!(),
                }
            }
        };

        self.sample_index += n as u64;
        (timestamps, payload)
    }
}

#[async_trait]
impl SampleSource for SimSource {
    async fn connect(&mut self) -> RecorderResult<SourceDescriptor> {
        self.connected = true;
        Ok(self.descriptor.clone())
    }

    async fn start(&mut self, sender: mpsc::Sender<SampleBatch>) -> RecorderResult<()> {
        self.connected = true;
        let per_chunk = if self.descriptor.nominal_srate > 0.0 {
            ((self.descriptor.nominal_srate * CHUNK_INTERVAL.as_secs_f64()).ceil() as usize).max(1)
        } else {
            1
        };

        loop {
            tokio::time::sleep(CHUNK_INTERVAL).await;
            let (timestamps, payload) = self.generate_chunk(per_chunk);
            let batch = SampleBatch::new(timestamps, payload, local_clock());
            if sender.send(batch).await.is_err() {
                log::debug!("Simulated source receiver closed");
                return Ok(());
            }
        }
    }

    async fn stop(&mut self) -> RecorderResult<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_timestamps_are_ordered() {
        let mut source = SimSource::new("Sim", "EEG", "sim-1", 4, 200.0, SampleFormat::Float32);
        let (timestamps, payload) = source.generate_chunk(10);
        assert_eq!(timestamps.len(), 10);
        assert_eq!(payload.len(), 10);
        assert!(payload.rows_match_width(4));
        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_marker_stream_rows() {
        let mut source = SimSource::new("Marks", "Markers", "sim-m", 1, 0.0, SampleFormat::String);
        let (_, payload) = source.generate_chunk(2);
        match payload {
            Payload::String(rows) => {
                assert_eq!(rows, vec![vec!["marker-0".to_string()], vec!["marker-1".to_string()]]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_delivers_batches() {
        let mut source = SimSource::new("Sim", "EEG", "sim-2", 2, 100.0, SampleFormat::Float32);
        source.connect().await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = tokio::spawn(async move { source.start(tx).await });

        let batch = rx.recv().await.unwrap();
        assert!(!batch.is_empty());
        drop(rx);
        assert!(handle.await.unwrap().is_ok());
    }
}
