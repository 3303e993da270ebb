use crate::cli::PublishArgs;
use crate::exit_codes;
use streamrec::{Publisher, PublisherConfig, SampleFormat};

pub async fn execute(args: PublishArgs) -> i32 {
    let Some(format) = SampleFormat::from_xdf_name(&args.format) else {
        eprintln!(
            "Error: unknown format '{}' (expected float32, float64, int16, int32 or string)",
            args.format
        );
        return exit_codes::IO_ERROR;
    };

    let source_id = args.source_id.clone().unwrap_or_else(|| args.name.clone());
    let mut config = PublisherConfig::new(
        &args.name,
        &args.content_type,
        &source_id,
        args.channels,
        args.rate,
        format,
    );
    config.discovery_port = args.discovery_port;
    config.data_port = args.data_port;
    config.probe_port = args.probe_port;
    config.advertise_host = args.advertise_host.clone();

    let publisher = match Publisher::spawn(config).await {
        Ok(publisher) => publisher,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::IO_ERROR;
        }
    };

    println!(
        "Publishing '{}' ({}) at {} — Ctrl-C to stop",
        publisher.descriptor().name,
        publisher.descriptor().source_id,
        publisher.descriptor().data_addr
    );
    let _ = tokio::signal::ctrl_c().await;
    publisher.shutdown().await;
    exit_codes::SUCCESS
}
