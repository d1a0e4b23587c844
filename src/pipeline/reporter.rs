//! Reporting loop: periodic metric submission, window flushes and the
//! consumer side of flow expiry.
//!
//! Values are copied out under each record's lock and the lock is released
//! before anything reaches the sink.

use crossbeam_channel::{select, tick};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::analysis::SmoothingMode;
use crate::config::{FlowConfig, MetricsConfig, ReportConfig};
use crate::flow::{FlowKey, FlowTable};
use crate::metrics::{
    Metric, MetricKind, MetricSink, METRIC_RTT_AVG, METRIC_RTT_JITTER, METRIC_RTT_LAST,
};

use super::memory;

/// Upper bound on how long the loop waits before re-checking `running`.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    pub interval: Duration,
    pub flush_interval: Duration,
    pub force_flush_pct: f64,
    pub smoothing: SmoothingMode,
    pub histograms: bool,
    pub tags: Vec<String>,
    pub lookup: BTreeMap<Ipv4Addr, String>,
}

impl ReporterConfig {
    pub fn new(report: &ReportConfig, flow: &FlowConfig, metrics: &MetricsConfig) -> Self {
        ReporterConfig {
            interval: report.interval(),
            flush_interval: report.flush_interval(),
            force_flush_pct: report.force_flush_pct,
            smoothing: flow.smoothing(),
            histograms: metrics.histograms,
            tags: metrics.tags.clone(),
            lookup: metrics.lookup.clone(),
        }
    }
}

/// What one reporting pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub reported: usize,
    pub flushed: usize,
    pub forced: bool,
    pub submit_errors: usize,
}

struct Sampled {
    key: FlowKey,
    srtt_ns: f64,
    jitter_ns: f64,
    last_ns: u64,
}

pub struct Reporter {
    table: Arc<FlowTable>,
    sink: Box<dyn MetricSink>,
    config: ReporterConfig,
    memory_reader: fn() -> std::io::Result<f64>,
    memory_warned: bool,
}

impl Reporter {
    pub fn new(table: Arc<FlowTable>, sink: Box<dyn MetricSink>, config: ReporterConfig) -> Self {
        Reporter {
            table,
            sink,
            config,
            memory_reader: memory::usage_fraction,
            memory_warned: false,
        }
    }

    /// Replace the memory pressure source.
    pub fn with_memory_reader(mut self, reader: fn() -> std::io::Result<f64>) -> Self {
        self.memory_reader = reader;
        self
    }

    pub fn run(mut self, running: &AtomicBool) {
        let ticker = tick(self.config.interval);
        let expirations = self.table.expirations().clone();
        tracing::info!(interval = ?self.config.interval, "started reporting");

        while running.load(Ordering::Relaxed) {
            select! {
                recv(ticker) -> _ => {
                    let summary = self.report(SystemTime::now());
                    tracing::debug!(
                        reported = summary.reported,
                        flushed = summary.flushed,
                        flows = self.table.len(),
                        "report tick"
                    );
                }
                recv(expirations) -> key => {
                    if let Ok(key) = key {
                        self.handle_expiration(&key);
                    }
                }
                default(POLL_INTERVAL) => {}
            }
        }

        if let Err(e) = self.sink.flush() {
            tracing::warn!(error = %e, "final metric flush failed");
        }
        tracing::info!("done reporting");
    }

    pub fn handle_expiration(&self, key: &FlowKey) -> bool {
        match self.table.expire(key) {
            Some(_) => {
                tracing::info!(flow = %key, "flow expired");
                true
            }
            None => {
                tracing::trace!(flow = %key, "stale expiry notification");
                false
            }
        }
    }

    /// One reporting pass over every flow.
    pub fn report(&mut self, now: SystemTime) -> TickSummary {
        let forced = self.memory_pressure();
        let mut summary = TickSummary {
            forced,
            ..TickSummary::default()
        };
        let mut sampled = Vec::new();

        self.table.for_each(|record| {
            let mut state = record.lock();
            let has_samples = state.sample_count() > 0;
            if has_samples {
                sampled.push(Sampled {
                    key: *record.key(),
                    srtt_ns: state.rtt.srtt_ns(),
                    jitter_ns: state.rtt.jitter_ns(),
                    last_ns: state.rtt.last_ns(),
                });
            }
            let stale = now
                .duration_since(state.last_flush)
                .map_or(false, |age| age >= self.config.flush_interval);
            if stale || forced {
                if stale && !has_samples {
                    tracing::debug!(flow = %record.key(), "flushing long-lived flow");
                }
                state.flush(now);
                summary.flushed += 1;
            } else if has_samples {
                state.flush_window(now);
                summary.flushed += 1;
            }
        });

        for flow in &sampled {
            summary.submit_errors += self.submit_flow(flow);
            summary.reported += 1;
        }
        if let Err(e) = self.sink.flush() {
            tracing::warn!(error = %e, "metric flush failed");
            summary.submit_errors += 1;
        }
        summary
    }

    fn submit_flow(&mut self, flow: &Sampled) -> usize {
        let smoothing = self.config.smoothing;
        let kind = if self.config.histograms {
            MetricKind::Histogram
        } else {
            MetricKind::Gauge
        };

        let mut tags = Vec::with_capacity(2 + self.config.tags.len());
        tags.push(format!("src:{}", self.host_name(*flow.key.local.ip())));
        tags.push(format!("dst:{}", self.host_name(*flow.key.remote.ip())));
        tags.extend(self.config.tags.iter().cloned());

        let values = [
            (METRIC_RTT_AVG, smoothing.to_millis(flow.srtt_ns)),
            (METRIC_RTT_JITTER, smoothing.to_millis(flow.jitter_ns)),
            (METRIC_RTT_LAST, smoothing.to_millis(flow.last_ns as f64)),
        ];

        let mut errors = 0;
        for (name, value) in values {
            let metric = Metric {
                name,
                kind,
                value,
                tags: tags.clone(),
            };
            match self.sink.submit(&metric) {
                Ok(()) => {
                    tracing::debug!(flow = %flow.key, metric = name, value, "reported");
                }
                Err(e) => {
                    errors += 1;
                    tracing::info!(flow = %flow.key, metric = name, value, error = %e, "failed to report metric");
                }
            }
        }
        errors
    }

    fn host_name(&self, ip: Ipv4Addr) -> String {
        self.config
            .lookup
            .get(&ip)
            .cloned()
            .unwrap_or_else(|| ip.to_string())
    }

    fn memory_pressure(&mut self) -> bool {
        match (self.memory_reader)() {
            Ok(pct) if pct >= self.config.force_flush_pct => {
                tracing::warn!(
                    usage_pct = pct * 100.0,
                    "forcing flush, memory use above allowed share of system memory"
                );
                true
            }
            Ok(_) => false,
            Err(e) => {
                if !self.memory_warned {
                    tracing::warn!(error = %e, "cannot read memory usage, forced flushes disabled");
                    self.memory_warned = true;
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowRecord, TimerService};
    use crate::metrics::testutil::MemorySink;
    use std::net::SocketAddrV4;
    use std::thread;

    fn no_pressure() -> std::io::Result<f64> {
        Ok(0.1)
    }

    fn full_pressure() -> std::io::Result<f64> {
        Ok(0.99)
    }

    fn key(port: u16) -> FlowKey {
        FlowKey {
            local: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), port),
            remote: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 443),
        }
    }

    fn config() -> ReporterConfig {
        let mut lookup = BTreeMap::new();
        lookup.insert(Ipv4Addr::new(10, 0, 0, 1), "web-1".to_string());
        ReporterConfig {
            interval: Duration::from_millis(20),
            flush_interval: Duration::from_secs(300),
            force_flush_pct: 0.75,
            smoothing: SmoothingMode::Float,
            histograms: false,
            tags: vec!["env:test".into()],
            lookup,
        }
    }

    struct Fixture {
        running: Arc<AtomicBool>,
        service: TimerService,
        table: Arc<FlowTable>,
    }

    impl Fixture {
        fn new() -> Self {
            let running = Arc::new(AtomicBool::new(true));
            let table = Arc::new(FlowTable::new());
            let service = TimerService::spawn(table.expiry_sender(), running.clone()).unwrap();
            Fixture {
                running,
                service,
                table,
            }
        }

        fn add(&self, port: u16, samples: &[u64]) {
            let handle = self.service.handle();
            let (record, _) = self
                .table
                .insert_if_absent(key(port), || FlowRecord::new(key(port), &handle));
            let mut state = record.lock();
            for &rtt in samples {
                state.rtt.record(rtt);
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            self.service.shutdown();
        }
    }

    #[test]
    fn reports_sampled_flows_and_flushes_them() {
        let fx = Fixture::new();
        fx.add(1000, &[4_000_000, 4_000_000]);
        fx.add(1001, &[]);

        let sink = MemorySink::default();
        let mut reporter = Reporter::new(Arc::clone(&fx.table), Box::new(sink.clone()), config())
            .with_memory_reader(no_pressure);

        let summary = reporter.report(SystemTime::now());
        assert_eq!(summary.reported, 1);
        assert_eq!(summary.flushed, 1);
        assert!(!summary.forced);

        let metrics = sink.metrics.lock().clone();
        assert_eq!(metrics.len(), 3);
        assert_eq!(metrics[0].name, METRIC_RTT_AVG);
        assert_eq!(metrics[0].value, 4.0);
        assert_eq!(metrics[1].name, METRIC_RTT_JITTER);
        assert_eq!(metrics[1].value, 0.0);
        assert_eq!(metrics[2].name, METRIC_RTT_LAST);
        assert_eq!(
            metrics[0].tags,
            vec!["src:web-1".to_string(), "dst:10.0.0.2".into(), "env:test".into()]
        );

        // Window was reset, so the next pass has nothing to say.
        assert_eq!(reporter.report(SystemTime::now()).reported, 0);
        let record = fx.table.lookup(&key(1000)).unwrap();
        assert_eq!(record.lock().rtt.srtt_ns(), 4_000_000.0);
    }

    #[test]
    fn in_flight_send_survives_a_tick() {
        use crate::analysis::{correlate, Correlation};
        use crate::flow::Direction;
        use crate::protocol::tcp::TcpTimestamp;
        use crate::protocol::{SegmentFlags, TcpSegment};

        let fx = Fixture::new();
        fx.add(1500, &[3_000_000]);
        let mut reporter = Reporter::new(
            Arc::clone(&fx.table),
            Box::new(MemorySink::default()),
            config(),
        )
        .with_memory_reader(no_pressure);

        let record = fx.table.lookup(&key(1500)).unwrap();
        let mut seg = TcpSegment {
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 1500,
            dst_port: 443,
            seq: 7000,
            ack: 0,
            flags: SegmentFlags {
                ack: true,
                ..Default::default()
            },
            timestamp: Some(TcpTimestamp {
                value: 42,
                echo_reply: 0,
            }),
            payload_len: 100,
            captured_ns: 1_000_000_000,
        };
        assert_eq!(
            correlate(&mut record.lock(), &seg, Direction::Outbound, 1024),
            Correlation::Seeded
        );

        assert_eq!(reporter.report(SystemTime::now()).reported, 1);
        assert_eq!(record.lock().pending_len(), 1);

        std::mem::swap(&mut seg.src, &mut seg.dst);
        std::mem::swap(&mut seg.src_port, &mut seg.dst_port);
        seg.seq = 1;
        seg.ack = 7000;
        seg.timestamp = Some(TcpTimestamp {
            value: 9,
            echo_reply: 42,
        });
        seg.payload_len = 0;
        seg.captured_ns = 1_006_000_000;
        assert_eq!(
            correlate(&mut record.lock(), &seg, Direction::Inbound, 1024),
            Correlation::Sampled(6_000_000)
        );
        assert_eq!(record.lock().sample_count(), 1);
    }

    #[test]
    fn memory_pressure_flushes_everything() {
        let fx = Fixture::new();
        fx.add(2000, &[]);
        fx.add(2001, &[]);
        let mut reporter = Reporter::new(
            Arc::clone(&fx.table),
            Box::new(MemorySink::default()),
            config(),
        )
        .with_memory_reader(full_pressure);

        let summary = reporter.report(SystemTime::now());
        assert!(summary.forced);
        assert_eq!(summary.flushed, 2);
    }

    #[test]
    fn long_lived_flows_are_flushed() {
        let fx = Fixture::new();
        fx.add(3000, &[]);
        let mut reporter = Reporter::new(
            Arc::clone(&fx.table),
            Box::new(MemorySink::default()),
            config(),
        )
        .with_memory_reader(no_pressure);

        assert_eq!(reporter.report(SystemTime::now()).flushed, 0);
        let later = SystemTime::now() + Duration::from_secs(301);
        assert_eq!(reporter.report(later).flushed, 1);
    }

    #[test]
    fn histogram_mode_and_soft_rounding() {
        let fx = Fixture::new();
        fx.add(4000, &[1_500_999]);
        let sink = MemorySink::default();
        let mut cfg = config();
        cfg.histograms = true;
        cfg.smoothing = SmoothingMode::Soft;
        let mut reporter = Reporter::new(Arc::clone(&fx.table), Box::new(sink.clone()), cfg)
            .with_memory_reader(no_pressure);

        reporter.report(SystemTime::now());
        let metrics = sink.metrics.lock().clone();
        assert!(metrics.iter().all(|m| m.kind == MetricKind::Histogram));
        assert_eq!(metrics[0].value, 1.500999);
    }

    #[test]
    fn run_loop_ticks_and_reaps() {
        let fx = Fixture::new();
        fx.add(5000, &[2_000_000]);
        let record = fx.table.lookup(&key(5000)).unwrap();
        record.timer().arm(Duration::from_millis(10));

        let sink = MemorySink::default();
        let reporter = Reporter::new(Arc::clone(&fx.table), Box::new(sink.clone()), config())
            .with_memory_reader(no_pressure);
        let running = Arc::new(AtomicBool::new(true));
        let join = {
            let running = Arc::clone(&running);
            thread::spawn(move || reporter.run(&running))
        };

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !fx.table.is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        running.store(false, Ordering::SeqCst);
        join.join().unwrap();

        assert!(fx.table.is_empty());
        assert!(*sink.flushes.lock() >= 1);
    }
}
