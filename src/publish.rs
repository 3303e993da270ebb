// Stream publisher
//
// The outlet side of the wire protocol, used by the `publish` subcommand
// to put a synthetic test stream on the network and by the integration
// tests as the recorder's counterpart. Three background tasks: a
// discovery responder answering matching queries with an announce, a UDP
// probe echo for clock synchronization, and a TCP accept loop that feeds
// each connection a hello followed by NDJSON sample chunks and
// heartbeats.

use crate::clock::{local_clock, ProbeReply, ProbeRequest};
use crate::discovery::DiscoveryMessage;
use crate::source::{SampleFormat, SimSource, SourceDescriptor, WireMessage};
use crate::types::RecorderResult;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub name: String,
    pub content_type: String,
    pub source_id: String,
    pub channels: usize,
    pub nominal_srate: f64,
    pub format: SampleFormat,
    /// UDP port the discovery responder listens on
    pub discovery_port: u16,
    /// TCP sample port; 0 picks an ephemeral port
    pub data_port: u16,
    /// UDP probe port; 0 picks an ephemeral port
    pub probe_port: u16,
    /// Host written into the announced endpoints
    pub advertise_host: String,
    pub chunk_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl PublisherConfig {
    pub fn new(
        name: &str,
        content_type: &str,
        source_id: &str,
        channels: usize,
        nominal_srate: f64,
        format: SampleFormat,
    ) -> Self {
        Self {
            name: name.to_string(),
            content_type: content_type.to_string(),
            source_id: source_id.to_string(),
            channels,
            nominal_srate,
            format,
            discovery_port: 16571,
            data_port: 0,
            probe_port: 0,
            advertise_host: "127.0.0.1".to_string(),
            chunk_interval_ms: 50,
            heartbeat_interval_ms: 1000,
        }
    }
}

pub struct Publisher {
    descriptor: SourceDescriptor,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Publisher {
    /// Bind all three endpoints and start serving
    pub async fn spawn(config: PublisherConfig) -> RecorderResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.data_port)).await?;
        let data_port = listener.local_addr()?.port();
        let probe_socket = UdpSocket::bind(("0.0.0.0", config.probe_port)).await?;
        let probe_port = probe_socket.local_addr()?.port();
        let discovery_socket = UdpSocket::bind(("0.0.0.0", config.discovery_port)).await?;

        let template = SimSource::new(
            &config.name,
            &config.content_type,
            &config.source_id,
            config.channels,
            config.nominal_srate,
            config.format,
        );
        let mut descriptor = template.descriptor().clone();
        descriptor.data_addr = format!("tcp://{}:{}", config.advertise_host, data_port);
        descriptor.probe_addr = format!("{}:{}", config.advertise_host, probe_port);

        log::info!(
            "Publishing '{}' ({}) on {} (probe {})",
            descriptor.name,
            descriptor.source_id,
            descriptor.data_addr,
            descriptor.probe_addr
        );

        let cancel = CancellationToken::new();
        let tasks = vec![
            spawn_discovery_responder(discovery_socket, descriptor.clone(), cancel.clone()),
            spawn_probe_echo(probe_socket, cancel.clone()),
            spawn_accept_loop(listener, descriptor.clone(), config, cancel.clone()),
        ];

        Ok(Self {
            descriptor,
            cancel,
            tasks,
        })
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_discovery_responder(
    socket: UdpSocket,
    descriptor: SourceDescriptor,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (len, from) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("Discovery responder receive error: {}", e);
                        continue;
                    }
                },
            };

            match serde_json::from_slice::<DiscoveryMessage>(&buf[..len]) {
                Ok(DiscoveryMessage::Query { query }) => {
                    if !query.matches(&descriptor) {
                        continue;
                    }
                    let announce = DiscoveryMessage::Announce {
                        descriptor: descriptor.clone(),
                    };
                    match serde_json::to_vec(&announce) {
                        Ok(payload) => {
                            if let Err(e) = socket.send_to(&payload, from).await {
                                log::warn!("Announce to {} failed: {}", from, e);
                            }
                        }
                        Err(e) => log::error!("Announce serialization failed: {}", e),
                    }
                }
                Ok(DiscoveryMessage::Announce { .. }) => {}
                Err(e) => log::debug!("Malformed discovery datagram from {}: {}", from, e),
            }
        }
    })
}

fn spawn_probe_echo(socket: UdpSocket, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 256];
        loop {
            let (len, from) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("Probe echo receive error: {}", e);
                        continue;
                    }
                },
            };

            let request: ProbeRequest = match serde_json::from_slice(&buf[..len]) {
                Ok(r) => r,
                Err(e) => {
                    log::debug!("Malformed probe from {}: {}", from, e);
                    continue;
                }
            };
            let reply = ProbeReply {
                t1: request.t1,
                t2: local_clock(),
            };
            match serde_json::to_vec(&reply) {
                Ok(payload) => {
                    if let Err(e) = socket.send_to(&payload, from).await {
                        log::debug!("Probe reply to {} failed: {}", from, e);
                    }
                }
                Err(e) => log::error!("Probe reply serialization failed: {}", e),
            }
        }
    })
}

fn spawn_accept_loop(
    listener: TcpListener,
    descriptor: SourceDescriptor,
    config: PublisherConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (conn, peer) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        log::warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };

            log::info!("Feeding samples to {}", peer);
            let feeder_descriptor = descriptor.clone();
            let feeder_config = config.clone();
            let feeder_cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) =
                    feed_connection(conn, feeder_descriptor, feeder_config, feeder_cancel).await
                {
                    log::info!("Connection to {} ended: {}", peer, e);
                }
            });
        }
    })
}

async fn feed_connection(
    mut conn: TcpStream,
    descriptor: SourceDescriptor,
    config: PublisherConfig,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let mut generator = SimSource::from_descriptor(descriptor.clone());
    let per_chunk = if descriptor.nominal_srate > 0.0 {
        ((descriptor.nominal_srate * config.chunk_interval_ms as f64 / 1000.0).ceil() as usize)
            .max(1)
    } else {
        1
    };

    send_line(&mut conn, &WireMessage::Hello { descriptor }).await?;

    let mut chunk_tick = interval(Duration::from_millis(config.chunk_interval_ms.max(1)));
    let mut heartbeat_tick = interval(Duration::from_millis(config.heartbeat_interval_ms.max(1)));

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return Ok(()),

            _ = chunk_tick.tick() => {
                let (timestamps, payload) = generator.generate_chunk(per_chunk);
                send_line(&mut conn, &WireMessage::Samples { timestamps, payload }).await?;
            }

            _ = heartbeat_tick.tick() => {
                send_line(&mut conn, &WireMessage::Heartbeat).await?;
            }
        }
    }
}

async fn send_line(conn: &mut TcpStream, message: &WireMessage) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    conn.write_all(&line).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{discover, DiscoveryQuery};

    #[tokio::test]
    async fn test_publisher_answers_discovery() {
        let mut config =
            PublisherConfig::new("PubEEG", "EEG", "pub-1", 2, 100.0, SampleFormat::Float32);
        config.discovery_port = 18901;
        let publisher = Publisher::spawn(config).await.unwrap();

        let found = discover(
            &DiscoveryQuery {
                content_type: Some("EEG".into()),
                ..Default::default()
            },
            Duration::from_millis(500),
            18901,
        )
        .await
        .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].source_id, "pub-1");
        assert!(found[0].data_addr.starts_with("tcp://127.0.0.1:"));
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn test_publisher_ignores_non_matching_query() {
        let mut config =
            PublisherConfig::new("PubEMG", "EMG", "pub-2", 2, 100.0, SampleFormat::Float32);
        config.discovery_port = 18902;
        let publisher = Publisher::spawn(config).await.unwrap();

        let found = discover(
            &DiscoveryQuery {
                content_type: Some("Gaze".into()),
                ..Default::default()
            },
            Duration::from_millis(300),
            18902,
        )
        .await
        .unwrap();

        assert!(found.is_empty());
        publisher.shutdown().await;
    }
}
