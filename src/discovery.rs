// Source discovery
//
// A discovery round broadcasts a JSON query datagram on the discovery
// port and collects announce replies until the deadline. Sources answer
// with their descriptor when the query's filters match. Replies are
// deduplicated by source id, first reply winning, and returned sorted by
// source id so registration order is stable across runs.

use crate::source::SourceDescriptor;
use crate::types::{RecorderError, RecorderResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Filter applied to announce replies; empty fields match anything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryQuery {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
}

impl DiscoveryQuery {
    pub fn matches(&self, descriptor: &SourceDescriptor) -> bool {
        self.name.as_deref().is_none_or(|v| v == descriptor.name)
            && self
                .content_type
                .as_deref()
                .is_none_or(|v| v == descriptor.content_type)
            && self
                .source_id
                .as_deref()
                .is_none_or(|v| v == descriptor.source_id)
    }

    /// Predicate rendering for logs, e.g. `name='EEG' and type='signal'`
    pub fn predicate(&self) -> String {
        let mut parts = Vec::new();
        if let Some(ref v) = self.name {
            parts.push(format!("name='{}'", v));
        }
        if let Some(ref v) = self.content_type {
            parts.push(format!("type='{}'", v));
        }
        if let Some(ref v) = self.source_id {
            parts.push(format!("source_id='{}'", v));
        }
        if parts.is_empty() {
            "*".to_string()
        } else {
            parts.join(" and ")
        }
    }
}

/// Datagrams exchanged on the discovery port
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryMessage {
    Query { query: DiscoveryQuery },
    Announce { descriptor: SourceDescriptor },
}

/// One discovery round: broadcast the query, collect matching announces
/// until the timeout elapses.
pub async fn discover(
    query: &DiscoveryQuery,
    timeout: Duration,
    port: u16,
) -> RecorderResult<Vec<SourceDescriptor>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    if let Err(e) = socket.set_broadcast(true) {
        log::warn!("Broadcast flag unavailable, using loopback only: {}", e);
    }

    log::info!("Resolving sources matching {}", query.predicate());

    let payload = serde_json::to_vec(&DiscoveryMessage::Query {
        query: query.clone(),
    })
    .map_err(|e| RecorderError::Parse(e.to_string()))?;

    for target in [
        format!("255.255.255.255:{}", port),
        format!("127.0.0.1:{}", port),
    ] {
        if let Err(e) = socket.send_to(&payload, &target).await {
            log::debug!("Query to {} not sent: {}", target, e);
        }
    }

    let mut found: Vec<SourceDescriptor> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut buf = vec![0u8; 64 * 1024];
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let received = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Err(e)) => {
                log::warn!("Discovery receive error: {}", e);
                break;
            }
            Ok(Ok((len, from))) => (len, from),
        };
        let (len, from) = received;

        match serde_json::from_slice::<DiscoveryMessage>(&buf[..len]) {
            Ok(DiscoveryMessage::Announce { descriptor }) => {
                if !query.matches(&descriptor) {
                    log::debug!(
                        "Announce from {} ('{}') does not match, ignoring",
                        from,
                        descriptor.source_id
                    );
                    continue;
                }
                if seen.insert(descriptor.source_id.clone()) {
                    log::info!(
                        "Resolved source '{}' ({}, {} channels @ {} Hz) at {}",
                        descriptor.name,
                        descriptor.content_type,
                        descriptor.channel_count(),
                        descriptor.nominal_srate,
                        descriptor.data_addr
                    );
                    found.push(descriptor);
                }
            }
            Ok(DiscoveryMessage::Query { .. }) => {}
            Err(e) => {
                log::debug!("Malformed discovery datagram from {}: {}", from, e);
            }
        }
    }

    found.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SampleFormat;

    fn descriptor(name: &str, content_type: &str, source_id: &str) -> SourceDescriptor {
        SourceDescriptor {
            name: name.into(),
            content_type: content_type.into(),
            source_id: source_id.into(),
            nominal_srate: 100.0,
            format: SampleFormat::Float32,
            channels: vec![],
            data_addr: "sim:test".into(),
            probe_addr: String::new(),
        }
    }

    #[test]
    fn test_query_matching() {
        let d = descriptor("EMG", "signal", "emg-1");

        assert!(DiscoveryQuery::default().matches(&d));
        assert!(DiscoveryQuery {
            content_type: Some("signal".into()),
            ..Default::default()
        }
        .matches(&d));
        assert!(!DiscoveryQuery {
            content_type: Some("Markers".into()),
            ..Default::default()
        }
        .matches(&d));
        assert!(DiscoveryQuery {
            name: Some("EMG".into()),
            source_id: Some("emg-1".into()),
            ..Default::default()
        }
        .matches(&d));
    }

    #[test]
    fn test_predicate_rendering() {
        assert_eq!(DiscoveryQuery::default().predicate(), "*");
        let q = DiscoveryQuery {
            name: Some("EEG".into()),
            content_type: Some("signal".into()),
            source_id: None,
        };
        assert_eq!(q.predicate(), "name='EEG' and type='signal'");
    }

    #[tokio::test]
    async fn test_round_trip_against_responder() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = responder.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (len, from) = responder.recv_from(&mut buf).await.unwrap();
            let message: DiscoveryMessage = serde_json::from_slice(&buf[..len]).unwrap();
            assert!(matches!(message, DiscoveryMessage::Query { .. }));
            let announce = DiscoveryMessage::Announce {
                descriptor: descriptor("EEG", "signal", "eeg-1"),
            };
            responder
                .send_to(&serde_json::to_vec(&announce).unwrap(), from)
                .await
                .unwrap();
        });

        let found = discover(
            &DiscoveryQuery::default(),
            Duration::from_millis(500),
            port,
        )
        .await
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].source_id, "eeg-1");
    }

    #[tokio::test]
    async fn test_empty_when_nobody_answers() {
        // Port 9 (discard) will not answer on loopback.
        let found = discover(&DiscoveryQuery::default(), Duration::from_millis(100), 9)
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
