use crate::cli::RecordArgs;
use crate::exit_codes;
use std::time::Duration;
use streamrec::types::{RecorderError, SessionEvent, SessionState};
use streamrec::{DiscoveryQuery, RecorderConfig, Session};
use tokio::sync::broadcast::error::RecvError;

pub async fn execute(args: RecordArgs) -> i32 {
    let mut config = match &args.config {
        Some(path) => match RecorderConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                return exit_codes::IO_ERROR;
            }
        },
        None => RecorderConfig::default(),
    };
    if let Some(port) = args.discovery_port {
        config.discovery_port = port;
    }
    if let Some(timeout) = args.discovery_timeout_ms {
        config.discovery_timeout_ms = timeout;
    }
    if args.allow_empty_start {
        config.allow_empty_start = true;
    }

    let query = DiscoveryQuery {
        name: args.name.clone(),
        content_type: args.content_type.clone(),
        source_id: args.source_id.clone(),
    };

    let session = match Session::start(query, &args.output, config).await {
        Ok(session) => session,
        Err(RecorderError::NoSourcesFound { timeout_ms }) => {
            eprintln!(
                "Error: no matching sources found within {} ms",
                timeout_ms
            );
            return exit_codes::NO_SOURCES_FOUND;
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::IO_ERROR;
        }
    };

    let mut events = session.subscribe();
    let json_events = args.json_events;
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if json_events {
                        if let Ok(line) = serde_json::to_string(&event) {
                            println!("{}", line);
                        }
                    } else {
                        match event {
                            SessionEvent::StatsUpdate { .. } => {
                                log::debug!("{:?}", event)
                            }
                            other => log::info!("{:?}", other),
                        }
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("Event stream lagged, {} events missed", missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let duration = args.duration.map(Duration::from_secs_f64);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupt received, stopping");
        }
        _ = session.wait() => {}
        _ = async {
            match duration {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        } => {
            log::info!("Requested duration elapsed, stopping");
        }
    }

    let code = match session.stop().await {
        Err(RecorderError::StopTimedOut) => {
            eprintln!("Error: stop timed out; output is usable up to the last flush");
            exit_codes::STOP_TIMED_OUT
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            exit_codes::IO_ERROR
        }
        Ok(()) => match session.state() {
            SessionState::Faulted { message } => {
                eprintln!("Error: session faulted: {}", message);
                exit_codes::IO_ERROR
            }
            _ => exit_codes::SUCCESS,
        },
    };

    let stats = session.status();
    if json_events {
        if let Ok(line) = serde_json::to_string(&stats) {
            println!("{}", line);
        }
    } else if code == exit_codes::SUCCESS {
        println!("Recorded {} stream(s) to {}", stats.streams.len(), stats.output_path);
        for stream in &stats.streams {
            println!(
                "  [{}] {} ({}) {} samples written, {} dropped{}",
                stream.stream_id,
                stream.name,
                stream.source_id,
                stream.samples_written,
                stream.samples_dropped,
                if stream.lost { ", lost" } else { "" }
            );
        }
    }

    printer.abort();
    code
}
