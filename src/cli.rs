use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "streamrec",
    version,
    about = "Continuous multi-stream signal recorder",
    long_about = "Discover sample sources on the network, synchronize their clocks\n\
                  and record them into a crash-tolerant XDF container."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Record matching sources into an XDF container
    Record(RecordArgs),
    /// List the sources answering a discovery query
    Discover(DiscoverArgs),
    /// Inspect an XDF container, including unfinalized ones
    Inspect(InspectArgs),
    /// Publish a synthetic test stream
    Publish(PublishArgs),
}

#[derive(Args)]
pub struct RecordArgs {
    /// Output container path
    #[arg(short, long)]
    pub output: PathBuf,

    /// Match sources by stream name
    #[arg(long)]
    pub name: Option<String>,

    /// Match sources by content type (e.g. EEG, Markers)
    #[arg(long = "type")]
    pub content_type: Option<String>,

    /// Match sources by source id
    #[arg(long)]
    pub source_id: Option<String>,

    /// Stop automatically after this many seconds
    #[arg(long)]
    pub duration: Option<f64>,

    /// JSON configuration file
    #[arg(long, env = "STREAMREC_CONFIG")]
    pub config: Option<PathBuf>,

    /// UDP discovery port
    #[arg(long)]
    pub discovery_port: Option<u16>,

    /// How long initial discovery waits for replies, in milliseconds
    #[arg(long)]
    pub discovery_timeout_ms: Option<u64>,

    /// Start with zero sources and rely on hot-add
    #[arg(long, default_value_t = false)]
    pub allow_empty_start: bool,

    /// Print session events as JSON lines on stdout
    #[arg(long, default_value_t = false)]
    pub json_events: bool,
}

#[derive(Args)]
pub struct DiscoverArgs {
    /// Match sources by stream name
    #[arg(long)]
    pub name: Option<String>,

    /// Match sources by content type
    #[arg(long = "type")]
    pub content_type: Option<String>,

    /// Match sources by source id
    #[arg(long)]
    pub source_id: Option<String>,

    /// How long to collect replies, in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub timeout_ms: u64,

    /// UDP discovery port
    #[arg(long, default_value_t = 16571)]
    pub port: u16,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct InspectArgs {
    /// Container path
    pub file: PathBuf,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct PublishArgs {
    /// Stream name
    #[arg(long, default_value = "TestStream")]
    pub name: String,

    /// Content type
    #[arg(long = "type", default_value = "EEG")]
    pub content_type: String,

    /// Source id; defaults to the stream name
    #[arg(long)]
    pub source_id: Option<String>,

    /// Channel count
    #[arg(long, default_value_t = 8)]
    pub channels: usize,

    /// Nominal sample rate in Hz; 0 marks an irregular stream
    #[arg(long, default_value_t = 250.0)]
    pub rate: f64,

    /// Sample format: float32, float64, int16, int32 or string
    #[arg(long, default_value = "float32")]
    pub format: String,

    /// UDP discovery port to answer on
    #[arg(long, default_value_t = 16571)]
    pub discovery_port: u16,

    /// TCP sample port; 0 picks an ephemeral port
    #[arg(long, default_value_t = 0)]
    pub data_port: u16,

    /// UDP probe port; 0 picks an ephemeral port
    #[arg(long, default_value_t = 0)]
    pub probe_port: u16,

    /// Host written into the announced endpoints
    #[arg(long, default_value = "127.0.0.1")]
    pub advertise_host: String,
}
