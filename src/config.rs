use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::analysis::SmoothingMode;

fn empty_path_none<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<PathBuf>::deserialize(deserializer)?;
    Ok(opt.and_then(|path| {
        if path.as_os_str().is_empty() {
            None
        } else {
            Some(path)
        }
    }))
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "config io error: {}", err),
            ConfigError::Parse(err) => write!(f, "config parse error: {}", err),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub flow: FlowConfig,
    pub report: ReportConfig,
    pub metrics: MetricsConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.report.interval_secs == 0 {
            return Err(ConfigError::Invalid("report.interval_secs must be > 0".into()));
        }
        if !(self.report.force_flush_pct > 0.0 && self.report.force_flush_pct <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "report.force_flush_pct must be in (0, 1], got {}",
                self.report.force_flush_pct
            )));
        }
        if self.flow.max_pending == 0 {
            return Err(ConfigError::Invalid("flow.max_pending must be > 0".into()));
        }
        if self.pipeline.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.channel_capacity must be > 0".into(),
            ));
        }
        if self.metrics.sink == SinkKind::Jsonl && self.metrics.jsonl_path.is_none() {
            return Err(ConfigError::Invalid(
                "metrics.jsonl_path is required for the jsonl sink".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub interface: Option<String>,
    /// Replay a capture file instead of sniffing live.
    #[serde(deserialize_with = "empty_path_none")]
    pub pcap_file: Option<PathBuf>,
    pub snaplen: i32,
    pub timeout_ms: i32,
    pub filter: String,
    /// Extra local addresses besides the interface's own.
    pub ips: Vec<Ipv4Addr>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            interface: None,
            pcap_file: None,
            snaplen: 65535,
            timeout_ms: 1000,
            filter: "tcp".into(),
            ips: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Idle lifetime of an active flow; 0 disables idle expiry.
    pub idle_ttl_secs: u64,
    /// Grace period after FIN+ACK; 0 disables it.
    pub exp_ttl_secs: u64,
    /// Cap on unacknowledged sends tracked per flow.
    pub max_pending: usize,
    /// Truncate to whole nanoseconds before converting to milliseconds.
    pub soft: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            idle_ttl_secs: 45,
            exp_ttl_secs: 5,
            max_pending: 4096,
            soft: false,
        }
    }
}

impl FlowConfig {
    pub fn idle_ttl(&self) -> Option<Duration> {
        nonzero_secs(self.idle_ttl_secs)
    }

    pub fn exp_ttl(&self) -> Option<Duration> {
        nonzero_secs(self.exp_ttl_secs)
    }

    pub fn smoothing(&self) -> SmoothingMode {
        if self.soft {
            SmoothingMode::Soft
        } else {
            SmoothingMode::Float
        }
    }
}

fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub interval_secs: u64,
    pub flush_interval_secs: u64,
    /// Fraction of physical memory above which every flow is flushed.
    pub force_flush_pct: f64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        ReportConfig {
            interval_secs: 30,
            flush_interval_secs: 300,
            force_flush_pct: 0.75,
        }
    }
}

impl ReportConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Statsd,
    Jsonl,
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub sink: SinkKind,
    pub statsd_addr: String,
    /// Lines batched into one datagram.
    pub buffer_lines: usize,
    /// Submit histograms instead of gauges.
    pub histograms: bool,
    pub tags: Vec<String>,
    /// IP to hostname table used for `src:`/`dst:` tags.
    pub lookup: BTreeMap<Ipv4Addr, String>,
    #[serde(deserialize_with = "empty_path_none")]
    pub jsonl_path: Option<PathBuf>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            sink: SinkKind::Log,
            statsd_addr: "127.0.0.1:8125".into(),
            buffer_lines: 5,
            histograms: false,
            tags: Vec::new(),
            lookup: BTreeMap::new(),
            jsonl_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Dispatcher threads (0 = auto).
    pub workers: usize,
    /// Capacity of each capture → worker queue.
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            workers: 0,
            channel_capacity: 8192,
        }
    }
}
