// TCP sample transport
//
// Newline-delimited JSON: the source sends a `hello` carrying its
// descriptor on every fresh connection, then `samples` and `heartbeat`
// messages. Recoverable disconnects are retried with bounded exponential
// backoff; a successful reconnect keeps the same logical stream, so the
// writer never opens a second metadata block for it.

use super::{Payload, ReconnectPolicy, SampleBatch, SampleSource, SourceDescriptor};
use crate::clock::local_clock;
use crate::types::{RecorderError, RecorderResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages exchanged on the sample transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Hello {
        descriptor: SourceDescriptor,
    },
    Samples {
        timestamps: Vec<f64>,
        payload: Payload,
    },
    Heartbeat,
}

pub struct TcpSampleSource {
    addr: String,
    descriptor: SourceDescriptor,
    reconnect: ReconnectPolicy,
    reader: Option<BufReader<TcpStream>>,
}

impl TcpSampleSource {
    pub fn new(addr: String, descriptor: SourceDescriptor, reconnect: ReconnectPolicy) -> Self {
        Self {
            addr,
            descriptor,
            reconnect,
            reader: None,
        }
    }

    /// Open a connection and consume the hello line
    async fn open(&self) -> RecorderResult<BufReader<TcpStream>> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| RecorderError::Connection(format!("{}: {}", self.addr, e)))?;
        let mut reader = BufReader::new(stream);

        let mut line = String::new();
        let read = tokio::time::timeout(HELLO_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| RecorderError::Timeout(format!("hello from {}", self.addr)))??;
        if read == 0 {
            return Err(RecorderError::Connection(format!(
                "{} closed before hello",
                self.addr
            )));
        }

        let message: WireMessage = serde_json::from_str(line.trim())
            .map_err(|e| RecorderError::Parse(format!("invalid hello: {}", e)))?;
        match message {
            WireMessage::Hello { descriptor } => {
                if descriptor.source_id != self.descriptor.source_id {
                    return Err(RecorderError::Connection(format!(
                        "{} identifies as '{}', expected '{}'",
                        self.addr, descriptor.source_id, self.descriptor.source_id
                    )));
                }
                if descriptor.format != self.descriptor.format
                    || descriptor.channels.len() != self.descriptor.channels.len()
                {
                    log::warn!(
                        "Source '{}' layout changed since discovery; keeping discovered layout",
                        self.descriptor.source_id
                    );
                }
                Ok(reader)
            }
            _ => Err(RecorderError::Parse("expected hello".into())),
        }
    }

    fn decode(&self, line: &str) -> RecorderResult<WireMessage> {
        serde_json::from_str(line).map_err(|e| RecorderError::Parse(format!("invalid JSON: {}", e)))
    }
}

#[async_trait]
impl SampleSource for TcpSampleSource {
    async fn connect(&mut self) -> RecorderResult<SourceDescriptor> {
        if self.reader.is_none() {
            log::info!(
                "Connecting to '{}' at {}",
                self.descriptor.source_id,
                self.addr
            );
            self.reader = Some(self.open().await?);
        }
        Ok(self.descriptor.clone())
    }

    async fn start(&mut self, sender: mpsc::Sender<SampleBatch>) -> RecorderResult<()> {
        let channels = self.descriptor.channel_count();
        let mut attempt: u32 = 0;

        loop {
            let mut reader = match self.reader.take() {
                Some(r) => r,
                None => {
                    if attempt >= self.reconnect.max_attempts {
                        return Err(RecorderError::Connection(format!(
                            "{} unreachable after {} reconnect attempts",
                            self.addr, attempt
                        )));
                    }
                    let delay = self.reconnect.delay(attempt);
                    attempt += 1;
                    log::info!(
                        "Reconnecting to {} in {:?} (attempt {})",
                        self.addr,
                        delay,
                        attempt
                    );
                    tokio::time::sleep(delay).await;
                    match self.open().await {
                        Ok(r) => {
                            attempt = 0;
                            r
                        }
                        Err(e) => {
                            log::warn!("Reconnect to {} failed: {}", self.addr, e);
                            continue;
                        }
                    }
                }
            };

            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        log::info!("{} closed the connection", self.addr);
                        break;
                    }
                    Ok(_) => match self.decode(line.trim()) {
                        Ok(WireMessage::Samples {
                            timestamps,
                            payload,
                        }) => {
                            if timestamps.len() != payload.len()
                                || !payload.rows_match_width(channels)
                            {
                                log::error!(
                                    "Malformed batch from '{}' dropped ({} timestamps, {} rows)",
                                    self.descriptor.source_id,
                                    timestamps.len(),
                                    payload.len()
                                );
                                continue;
                            }
                            let batch = SampleBatch::new(timestamps, payload, local_clock());
                            if sender.send(batch).await.is_err() {
                                log::debug!("Batch receiver closed, stopping transport");
                                return Ok(());
                            }
                        }
                        Ok(WireMessage::Heartbeat) => {
                            let beat =
                                SampleBatch::heartbeat(self.descriptor.format, local_clock());
                            if sender.send(beat).await.is_err() {
                                return Ok(());
                            }
                        }
                        Ok(WireMessage::Hello { .. }) => {
                            log::debug!("Duplicate hello from {}", self.addr);
                        }
                        Err(e) => {
                            log::error!("Failed to parse message from {}: {}", self.addr, e);
                        }
                    },
                    Err(e) => {
                        log::warn!("Read error on {}: {}", self.addr, e);
                        break;
                    }
                }
            }
            // Connection lost; fall through to the reconnect path.
        }
    }

    async fn stop(&mut self) -> RecorderResult<()> {
        self.reader = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.reader.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ChannelInfo, SampleFormat};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn descriptor(addr: &str) -> SourceDescriptor {
        SourceDescriptor {
            name: "TestEEG".into(),
            content_type: "EEG".into(),
            source_id: "test-eeg-1".into(),
            nominal_srate: 100.0,
            format: SampleFormat::Float32,
            channels: vec![
                ChannelInfo {
                    label: "C1".into(),
                    unit: "uV".into(),
                },
                ChannelInfo {
                    label: "C2".into(),
                    unit: "uV".into(),
                },
            ],
            data_addr: format!("tcp://{}", addr),
            probe_addr: String::new(),
        }
    }

    #[tokio::test]
    async fn test_hello_then_samples() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let expected = descriptor(&addr);

        let served = expected.clone();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let hello = serde_json::to_string(&WireMessage::Hello { descriptor: served }).unwrap();
            let samples = serde_json::to_string(&WireMessage::Samples {
                timestamps: vec![0.1, 0.2],
                payload: Payload::Float32(vec![vec![1.0, 2.0], vec![3.0, 4.0]]),
            })
            .unwrap();
            conn.write_all(format!("{}\n{}\n", hello, samples).as_bytes())
                .await
                .unwrap();
            // Drop the connection so the transport exhausts its reconnect budget.
        });

        let mut source = TcpSampleSource::new(
            addr,
            expected,
            ReconnectPolicy {
                max_attempts: 1,
                base_delay_ms: 10,
            },
        );
        let got = source.connect().await.unwrap();
        assert_eq!(got.source_id, "test-eeg-1");

        let (tx, mut rx) = mpsc::channel(8);
        let run = tokio::spawn(async move { source.start(tx).await });

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.timestamps, vec![0.1, 0.2]);

        // With the listener gone, start() must give up with a connection error.
        let result = run.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_hello_source_id_mismatch_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut wrong = descriptor(&addr);
        wrong.source_id = "someone-else".into();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let hello = serde_json::to_string(&WireMessage::Hello { descriptor: wrong }).unwrap();
            conn.write_all(format!("{}\n", hello).as_bytes())
                .await
                .unwrap();
        });

        let mut source = TcpSampleSource::new(
            addr.clone(),
            descriptor(&addr),
            ReconnectPolicy {
                max_attempts: 0,
                base_delay_ms: 10,
            },
        );
        assert!(source.connect().await.is_err());
    }
}
