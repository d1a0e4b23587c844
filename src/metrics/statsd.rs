//! DogStatsD over UDP.
//!
//! Lines look like `name:value|g|#tag1,tag2` and are batched
//! newline-separated, `buffer_lines` per datagram.

use std::fmt::Write as _;
use std::net::{ToSocketAddrs, UdpSocket};

use super::{Metric, MetricSink, SinkError};

pub struct StatsdSink {
    socket: UdpSocket,
    buffer_lines: usize,
    lines: Vec<String>,
}

impl StatsdSink {
    pub fn connect<A: ToSocketAddrs>(addr: A, buffer_lines: usize) -> Result<Self, SinkError> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(addr)?;
        Ok(StatsdSink {
            socket,
            buffer_lines: buffer_lines.max(1),
            lines: Vec::with_capacity(buffer_lines.max(1)),
        })
    }

    fn send_buffered(&mut self) -> Result<(), SinkError> {
        if self.lines.is_empty() {
            return Ok(());
        }
        let datagram = self.lines.join("\n");
        self.lines.clear();
        self.socket.send(datagram.as_bytes())?;
        Ok(())
    }
}

/// Render one DogStatsD line.
pub fn format_line(metric: &Metric) -> String {
    let mut line = format!("{}:{}|{}", metric.name, metric.value, metric.kind.suffix());
    if !metric.tags.is_empty() {
        let _ = write!(line, "|#{}", metric.tags.join(","));
    }
    line
}

impl MetricSink for StatsdSink {
    fn submit(&mut self, metric: &Metric) -> Result<(), SinkError> {
        self.lines.push(format_line(metric));
        if self.lines.len() >= self.buffer_lines {
            self.send_buffered()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.send_buffered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricKind;
    use std::time::Duration;

    fn metric(name: &'static str, value: f64) -> Metric {
        Metric {
            name,
            kind: MetricKind::Gauge,
            value,
            tags: vec!["src:web-1".into(), "dst:10.0.0.2".into()],
        }
    }

    #[test]
    fn line_format() {
        assert_eq!(
            format_line(&metric("system.net.tcp.rtt.avg", 5.25)),
            "system.net.tcp.rtt.avg:5.25|g|#src:web-1,dst:10.0.0.2"
        );
        let bare = Metric {
            name: "system.net.tcp.rtt",
            kind: MetricKind::Histogram,
            value: 3.0,
            tags: Vec::new(),
        };
        assert_eq!(format_line(&bare), "system.net.tcp.rtt:3|h");
    }

    #[test]
    fn batches_lines_per_datagram() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut sink = StatsdSink::connect(server.local_addr().unwrap(), 2).unwrap();

        sink.submit(&metric("a", 1.0)).unwrap();
        sink.submit(&metric("b", 2.0)).unwrap();
        sink.submit(&metric("c", 3.0)).unwrap();

        let mut buf = [0u8; 1500];
        let n = server.recv(&mut buf).unwrap();
        let first = std::str::from_utf8(&buf[..n]).unwrap();
        assert_eq!(first.lines().count(), 2);
        assert!(first.starts_with("a:1|g"));

        sink.flush().unwrap();
        let n = server.recv(&mut buf).unwrap();
        let second = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(second.starts_with("c:3|g"));
    }
}
