//! Newline-delimited JSON metric log.

use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{Metric, MetricSink, SinkError};

#[derive(Serialize)]
struct Record<'a> {
    ts: f64,
    #[serde(flatten)]
    metric: &'a Metric,
}

pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Open `path` for appending, creating it if needed.
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JsonlSink {
            writer: BufWriter::new(file),
        })
    }
}

impl MetricSink for JsonlSink {
    fn submit(&mut self, metric: &Metric) -> Result<(), SinkError> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        serde_json::to_writer(&mut self.writer, &Record { ts, metric })?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}
