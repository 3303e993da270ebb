use clap::Parser;

mod cli;
mod commands;
mod exit_codes;

use cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();

    let exit_code = match cli.command {
        cli::Command::Record(args) => commands::record::execute(args).await,
        cli::Command::Discover(args) => commands::discover::execute(args).await,
        cli::Command::Inspect(args) => commands::inspect::execute(args),
        cli::Command::Publish(args) => commands::publish::execute(args).await,
    };

    std::process::exit(exit_code);
}
