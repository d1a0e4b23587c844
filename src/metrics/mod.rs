//! Metric sinks for per-flow RTT statistics.
//!
//! A sink receives already-converted values (milliseconds) together with
//! their tags and decides how to ship them: DogStatsD datagrams, JSON lines
//! or log records.

pub mod jsonl;
pub mod statsd;

use serde::Serialize;
use std::fmt;

use crate::config::{MetricsConfig, SinkKind};

pub use jsonl::JsonlSink;
pub use statsd::StatsdSink;

pub const METRIC_RTT_AVG: &str = "system.net.tcp.rtt.avg";
pub const METRIC_RTT_JITTER: &str = "system.net.tcp.rtt.jitter";
pub const METRIC_RTT_LAST: &str = "system.net.tcp.rtt";

#[derive(Debug)]
pub enum SinkError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Config(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Io(e) => write!(f, "metric sink io error: {}", e),
            SinkError::Json(e) => write!(f, "metric encoding error: {}", e),
            SinkError::Config(msg) => write!(f, "metric sink config error: {}", msg),
        }
    }
}

impl std::error::Error for SinkError {}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::Io(e)
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(e: serde_json::Error) -> Self {
        SinkError::Json(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Histogram,
}

impl MetricKind {
    /// DogStatsD type suffix.
    pub fn suffix(self) -> &'static str {
        match self {
            MetricKind::Gauge => "g",
            MetricKind::Histogram => "h",
        }
    }
}

/// One value ready for submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub name: &'static str,
    pub kind: MetricKind,
    pub value: f64,
    pub tags: Vec<String>,
}

pub trait MetricSink: Send {
    fn submit(&mut self, metric: &Metric) -> Result<(), SinkError>;

    /// Push out anything buffered.
    fn flush(&mut self) -> Result<(), SinkError>;
}

/// Writes every metric as a structured log record.
#[derive(Debug, Default)]
pub struct LogSink;

impl MetricSink for LogSink {
    fn submit(&mut self, metric: &Metric) -> Result<(), SinkError> {
        tracing::info!(
            metric = metric.name,
            kind = metric.kind.suffix(),
            value = metric.value,
            tags = %metric.tags.join(","),
            "rtt metric"
        );
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Build the sink selected in the config.
pub fn build_sink(config: &MetricsConfig) -> Result<Box<dyn MetricSink>, SinkError> {
    match config.sink {
        SinkKind::Statsd => Ok(Box::new(StatsdSink::connect(
            &config.statsd_addr,
            config.buffer_lines,
        )?)),
        SinkKind::Jsonl => {
            let path = config
                .jsonl_path
                .as_deref()
                .ok_or_else(|| SinkError::Config("jsonl sink needs a path".into()))?;
            Ok(Box::new(JsonlSink::create(path)?))
        }
        SinkKind::Log => Ok(Box::new(LogSink)),
    }
}
