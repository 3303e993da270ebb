use crate::cli::DiscoverArgs;
use crate::exit_codes;
use std::time::Duration;
use streamrec::{discover, DiscoveryQuery};

pub async fn execute(args: DiscoverArgs) -> i32 {
    let query = DiscoveryQuery {
        name: args.name.clone(),
        content_type: args.content_type.clone(),
        source_id: args.source_id.clone(),
    };

    let found = match discover(&query, Duration::from_millis(args.timeout_ms), args.port).await {
        Ok(found) => found,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::IO_ERROR;
        }
    };

    if found.is_empty() {
        eprintln!(
            "No sources matching {} answered within {} ms",
            query.predicate(),
            args.timeout_ms
        );
        return exit_codes::NO_SOURCES_FOUND;
    }

    if args.json {
        match serde_json::to_string_pretty(&found) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: {}", e);
                return exit_codes::IO_ERROR;
            }
        }
    } else {
        println!(
            "{:<20} {:<10} {:<20} {:>8} {:>9}  {}",
            "NAME", "TYPE", "SOURCE ID", "RATE", "CHANNELS", "ENDPOINT"
        );
        for descriptor in &found {
            println!(
                "{:<20} {:<10} {:<20} {:>8} {:>9}  {}",
                descriptor.name,
                descriptor.content_type,
                descriptor.source_id,
                descriptor.nominal_srate,
                descriptor.channel_count(),
                descriptor.data_addr
            );
        }
    }
    exit_codes::SUCCESS
}
