// End-to-end session behavior against a loopback publisher: discovery,
// recording, hot-add, stream loss, fault on total loss, empty-start
// refusal, stop idempotence.
//
// Each test uses its own discovery port so they can run concurrently.

use std::time::Duration;
use streamrec::types::SessionEvent;
use streamrec::{
    scan, DiscoveryQuery, Publisher, PublisherConfig, RecorderConfig, SampleFormat, Session,
    SessionState,
};
use tempfile::TempDir;

fn recorder_config(discovery_port: u16) -> RecorderConfig {
    let mut config = RecorderConfig::default();
    config.discovery_port = discovery_port;
    config.discovery_timeout_ms = 1000;
    config.tick_interval_ms = 200;
    config.liveness_timeout_ms = 1000;
    config.probe_interval_ms = 100;
    config.stop_timeout_ms = 5000;
    config
}

fn publisher_config(discovery_port: u16, source_id: &str) -> PublisherConfig {
    let mut config =
        PublisherConfig::new("E2E", "EEG", source_id, 4, 200.0, SampleFormat::Float32);
    config.discovery_port = discovery_port;
    config
}

async fn wait_for_event<F>(
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    timeout: Duration,
    mut predicate: F,
) -> bool
where
    F: FnMut(&SessionEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Err(_) => return false,
            Ok(Err(_)) => return false,
            Ok(Ok(event)) => event,
        };
        if predicate(&event) {
            return true;
        }
    }
}

#[tokio::test]
async fn records_published_stream_end_to_end() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session.xdf");
    let port = 19501;

    let publisher = Publisher::spawn(publisher_config(port, "e2e-1")).await.unwrap();

    let session = Session::start(
        DiscoveryQuery {
            content_type: Some("EEG".into()),
            ..Default::default()
        },
        &path,
        recorder_config(port),
    )
    .await
    .unwrap();
    assert!(matches!(session.state(), SessionState::Recording { .. }));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    session.stop().await.unwrap();
    assert_eq!(session.state(), SessionState::Finalized);

    // Idempotent stop: success again, container untouched.
    let first_len = std::fs::metadata(&path).unwrap().len();
    session.stop().await.unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), first_len);

    let result = scan(&path).unwrap();
    assert!(result.finalized);
    assert_eq!(result.streams.len(), 1);

    let stream = &result.streams[0];
    assert_eq!(stream.source_id, "e2e-1");
    assert_eq!(stream.channel_count, 4);
    assert!(stream.scanned_samples > 0);
    assert!(stream.timestamps_monotonic);
    assert_eq!(
        stream.footer.as_ref().unwrap().sample_count,
        stream.scanned_samples
    );
    let scanned_offsets: Vec<u64> = stream.chunks.iter().map(|c| c.offset).collect();
    assert_eq!(stream.footer.as_ref().unwrap().chunk_offsets, scanned_offsets);

    // status() agrees with the container.
    let stats = session.status();
    assert_eq!(stats.streams.len(), 1);
    assert_eq!(stats.streams[0].samples_written, stream.scanned_samples);

    publisher.shutdown().await;
}

#[tokio::test]
async fn hot_add_and_stream_loss_keep_session_alive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hotadd.xdf");
    let port = 19502;

    let mut config = recorder_config(port);
    config.allow_empty_start = true;
    config.rediscover_interval_ms = 400;
    config.discovery_timeout_ms = 300;
    // Fail reconnects fast so loss is declared promptly.
    config.reconnect_max_attempts = 1;
    config.reconnect_base_delay_ms = 50;

    let session = Session::start(DiscoveryQuery::default(), &path, config)
        .await
        .unwrap();
    let mut events = session.subscribe();

    // The source appears only after the session is already recording.
    let publisher = Publisher::spawn(publisher_config(port, "late-1")).await.unwrap();
    let added = wait_for_event(&mut events, Duration::from_secs(10), |event| {
        matches!(event, SessionEvent::StreamAdded { source_id, .. } if source_id == "late-1")
    })
    .await;
    assert!(added, "hot-add did not happen");

    tokio::time::sleep(Duration::from_millis(800)).await;

    // Take the source away; the session must report the loss and carry on.
    publisher.shutdown().await;
    let lost = wait_for_event(&mut events, Duration::from_secs(15), |event| {
        matches!(event, SessionEvent::StreamLost { source_id, .. } if source_id == "late-1")
    })
    .await;
    assert!(lost, "stream loss was not reported");
    assert!(matches!(session.state(), SessionState::Recording { .. }));

    session.stop().await.unwrap();
    let result = scan(&path).unwrap();
    assert!(result.finalized);
    assert_eq!(result.streams.len(), 1);
    assert!(result.streams[0].scanned_samples > 0);

    let stats = session.status();
    assert!(stats.streams[0].lost);
}

#[tokio::test]
async fn losing_all_sources_without_rediscovery_faults_the_session() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("faulted.xdf");
    let port = 19503;

    let publisher = Publisher::spawn(publisher_config(port, "gone-1")).await.unwrap();

    let mut config = recorder_config(port);
    config.rediscover_interval_ms = 0;
    config.reconnect_max_attempts = 1;
    config.reconnect_base_delay_ms = 50;
    // Flush every batch so the fault loses nothing already appended.
    config.flush_policy = streamrec::FlushPolicy::Size { max_bytes: 1 };

    let session = Session::start(
        DiscoveryQuery {
            source_id: Some("gone-1".into()),
            ..Default::default()
        },
        &path,
        config,
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;
    publisher.shutdown().await;

    let state = session.wait().await;
    assert!(matches!(state, SessionState::Faulted { .. }));

    // Unfinalized but recoverable by linear scan up to the last flush.
    let result = scan(&path).unwrap();
    assert!(!result.finalized);
    assert!(result.streams[0].scanned_samples > 0);

    // stop() on a faulted session is a no-op success.
    session.stop().await.unwrap();
}

#[tokio::test]
async fn empty_start_refused_without_allow_flag() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("never_created.xdf");
    let port = 19504; // nobody answers here

    let mut config = recorder_config(port);
    config.discovery_timeout_ms = 300;

    let result = Session::start(DiscoveryQuery::default(), &path, config).await;
    assert!(matches!(
        result,
        Err(streamrec::RecorderError::NoSourcesFound { .. })
    ));
    // No output container was created.
    assert!(!path.exists());
}
