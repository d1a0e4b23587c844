use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tcprtt::config::SinkKind;

/// tcprtt: passive TCP round-trip time and jitter monitor
#[derive(Parser, Debug)]
#[command(name = "tcprtt", version, about)]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(short = 'C', long)]
    pub config: Option<PathBuf>,

    /// Network interface to capture on (e.g., "eth0").
    /// If not specified, the default interface is used.
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Replay a pcap file instead of capturing live
    #[arg(short = 'r', long)]
    pub pcap_file: Option<PathBuf>,

    /// Base BPF filter; host restrictions are appended
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Extra local IPv4 address (repeatable)
    #[arg(long = "ip")]
    pub ips: Vec<Ipv4Addr>,

    /// Snapshot length (max bytes per packet to capture)
    #[arg(short, long)]
    pub snaplen: Option<i32>,

    /// Read timeout in milliseconds for the capture handle
    #[arg(short = 't', long)]
    pub timeout_ms: Option<i32>,

    /// Idle flow lifetime in seconds (0 disables)
    #[arg(long)]
    pub idle_ttl: Option<u64>,

    /// Grace period after FIN+ACK in seconds (0 disables)
    #[arg(long)]
    pub exp_ttl: Option<u64>,

    /// Truncate smoothed values to whole nanoseconds before reporting
    #[arg(long)]
    pub soft: bool,

    /// Reporting interval in seconds
    #[arg(long)]
    pub interval: Option<u64>,

    /// Metric sink
    #[arg(long, value_enum)]
    pub sink: Option<SinkKind>,

    /// DogStatsD address (host:port)
    #[arg(long)]
    pub statsd_addr: Option<String>,

    /// Output file for the jsonl sink
    #[arg(long)]
    pub jsonl_path: Option<PathBuf>,

    /// Submit histograms instead of gauges
    #[arg(long)]
    pub histograms: bool,

    /// Extra metric tag (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Dispatcher worker threads (0 = auto)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// List available network interfaces and exit
    #[arg(short, long)]
    pub list_interfaces: bool,
}
