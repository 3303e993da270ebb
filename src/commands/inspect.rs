use crate::cli::InspectArgs;
use crate::exit_codes;
use streamrec::scan;

pub fn execute(args: InspectArgs) -> i32 {
    let result = match scan(&args.file) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::IO_ERROR;
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&result) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: {}", e);
                return exit_codes::IO_ERROR;
            }
        }
        return exit_codes::SUCCESS;
    }

    println!("{}", result.path);
    println!(
        "  {} stream(s), {} boundaries, {}{}",
        result.streams.len(),
        result.boundaries,
        if result.finalized {
            "finalized"
        } else {
            "NOT finalized (linear scan only)"
        },
        if result.truncated { ", truncated tail" } else { "" }
    );

    for stream in &result.streams {
        println!(
            "  [{}] '{}' ({}, {}) {} channels @ {} Hz",
            stream.stream_id,
            stream.name,
            stream.content_type,
            stream
                .format
                .map(|f| f.xdf_name())
                .unwrap_or("unknown format"),
            stream.channel_count,
            stream.nominal_srate
        );
        let footer_count = stream
            .footer
            .as_ref()
            .map(|f| f.sample_count.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "      samples: {} scanned / {} in footer, {} chunks, {} clock offsets{}",
            stream.scanned_samples,
            footer_count,
            stream.chunks.len(),
            stream.clock_offsets,
            if stream.timestamps_monotonic {
                ""
            } else {
                ", NON-MONOTONIC timestamps"
            }
        );
        if let (Some(first), Some(last)) = (stream.first_timestamp, stream.last_timestamp) {
            println!("      time range: {:.6} .. {:.6} s", first, last);
        }
    }
    exit_codes::SUCCESS
}
