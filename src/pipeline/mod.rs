//! Sharded processing pipeline around one shared flow table.
//!
//! Architecture:
//!
//! ```text
//! pcap capture (main thread)
//!   |
//!   |-- 4-tuple hash → shard = hash % N
//!   |
//!   +--[bounded channel]--→ Worker 0  (decode, dispatch)
//!   +--[bounded channel]--→ Worker 1
//!   ...
//!   +--[bounded channel]--→ Worker N-1
//!                               |
//!                               v
//!                          FlowTable ←── timer service (arms / fires)
//!                               |
//!                               v
//!                          Reporter (tick, flush, expire) ──→ metric sink
//! ```
//!
//! Routing both directions of a connection to the same worker keeps record
//! lock contention low; correctness does not depend on it.

pub mod dispatcher;
pub mod memory;
pub mod reporter;
pub mod router;
pub mod worker;

use crossbeam_channel::{bounded, Sender, TrySendError};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crate::config::PipelineConfig;
use crate::flow::{FlowTable, HostSet, TimerService};
use crate::metrics::MetricSink;

pub use dispatcher::{DispatchConfig, Dispatched, Dispatcher};
pub use reporter::{Reporter, ReporterConfig};

/// An owned packet buffer sent from the capture thread to a worker.
#[derive(Debug)]
pub struct OwnedPacket {
    /// Capture time in nanoseconds since the Unix epoch.
    pub captured_ns: u64,
    pub data: Vec<u8>,
}

/// Counters shared by the capture thread and the workers.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub captured: AtomicU64,
    /// Packets dropped because a worker queue was full.
    pub dropped: AtomicU64,
    pub decode_errors: AtomicU64,
    /// Decodable frames that were not TCP over IPv4.
    pub skipped: AtomicU64,
    pub segments: AtomicU64,
    pub flows_created: AtomicU64,
    pub samples: AtomicU64,
    pub clock_anomalies: AtomicU64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            captured: self.captured.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            segments: self.segments.load(Ordering::Relaxed),
            flows_created: self.flows_created.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            clock_anomalies: self.clock_anomalies.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub captured: u64,
    pub dropped: u64,
    pub decode_errors: u64,
    pub skipped: u64,
    pub segments: u64,
    pub flows_created: u64,
    pub samples: u64,
    pub clock_anomalies: u64,
}

#[derive(Debug)]
pub enum PipelineError {
    Spawn(io::Error),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Spawn(e) => write!(f, "failed to spawn pipeline thread: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<io::Error> for PipelineError {
    fn from(e: io::Error) -> Self {
        PipelineError::Spawn(e)
    }
}

/// Everything the pipeline needs besides its own threads.
pub struct PipelineParts {
    pub config: PipelineConfig,
    pub dispatch: DispatchConfig,
    pub reporter: ReporterConfig,
    pub hosts: HostSet,
    pub sink: Box<dyn MetricSink>,
}

/// Handle returned by [`spawn`]. The capture thread feeds packets through
/// [`PipelineHandle::submit`].
pub struct PipelineHandle {
    senders: Vec<Sender<OwnedPacket>>,
    table: Arc<FlowTable>,
    stats: Arc<PipelineStats>,
    running: Arc<AtomicBool>,
    timers: Option<TimerService>,
    worker_handles: Vec<thread::JoinHandle<()>>,
    reporter_handle: Option<thread::JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn num_workers(&self) -> usize {
        self.senders.len()
    }

    pub fn table(&self) -> &Arc<FlowTable> {
        &self.table
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Route one packet to its shard. Never blocks: a full queue drops the
    /// packet and counts it.
    pub fn submit(&self, packet: OwnedPacket) {
        self.stats.captured.fetch_add(1, Ordering::Relaxed);
        let shard = router::shard_for_packet(&packet.data, self.senders.len());
        match self.senders[shard].try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    tracing::warn!(shard, dropped, "worker queue full, dropping packets");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::trace!(shard, "worker gone, dropping packet");
            }
        }
    }

    /// Route one packet to its shard, waiting for queue space. Used for file
    /// replay, where the reader would otherwise outrun the workers.
    pub fn submit_blocking(&self, packet: OwnedPacket) {
        self.stats.captured.fetch_add(1, Ordering::Relaxed);
        let shard = router::shard_for_packet(&packet.data, self.senders.len());
        if self.senders[shard].send(packet).is_err() {
            tracing::trace!(shard, "worker gone, dropping packet");
        }
    }

    /// Stop every pipeline thread and join it. Workers drain their queues
    /// first. The flow table stays readable afterwards.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.senders.clear();
        for h in self.worker_handles.drain(..) {
            let _ = h.join();
        }
        if let Some(h) = self.reporter_handle.take() {
            let _ = h.join();
        }
        if let Some(mut timers) = self.timers.take() {
            timers.shutdown();
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resolve the worker count: 0 means half the cores, between 1 and 8.
pub fn worker_count(configured: usize) -> usize {
    if configured == 0 {
        (num_cpus::get() / 2).clamp(1, 8)
    } else {
        configured
    }
}

/// Spawn the timer service, the workers and the reporter.
///
/// `running` is shared with the caller; clearing it stops everything. If any
/// thread fails to start, the ones already running are stopped and joined
/// before the error is returned.
pub fn spawn(parts: PipelineParts, running: Arc<AtomicBool>) -> Result<PipelineHandle, PipelineError> {
    let num_workers = worker_count(parts.config.workers);
    tracing::info!(num_workers, hosts = parts.hosts.len(), "starting pipeline");

    let table = Arc::new(FlowTable::new());
    let stats = Arc::new(PipelineStats::default());
    let timers = TimerService::spawn(table.expiry_sender(), running.clone())?;

    let mut handle = PipelineHandle {
        senders: Vec::with_capacity(num_workers),
        table: Arc::clone(&table),
        stats: Arc::clone(&stats),
        running: running.clone(),
        timers: None,
        worker_handles: Vec::with_capacity(num_workers),
        reporter_handle: None,
    };
    let dispatcher = Dispatcher::new(
        Arc::clone(&table),
        Arc::new(parts.hosts),
        timers.handle(),
        parts.dispatch,
    );
    handle.timers = Some(timers);

    for shard_id in 0..num_workers {
        let (pkt_tx, pkt_rx) = bounded::<OwnedPacket>(parts.config.channel_capacity);
        let mut worker = worker::Worker::new(shard_id, dispatcher.clone(), Arc::clone(&stats));
        let running = running.clone();

        // On error `handle` drops here and joins what already started.
        let join = thread::Builder::new()
            .name(format!("rtt-worker-{}", shard_id))
            .spawn(move || worker.run(pkt_rx, &running))?;

        handle.senders.push(pkt_tx);
        handle.worker_handles.push(join);
    }

    let reporter = Reporter::new(Arc::clone(&table), parts.sink, parts.reporter);
    let reporter_running = running.clone();
    let join = thread::Builder::new()
        .name("rtt-reporter".into())
        .spawn(move || reporter.run(&reporter_running))?;
    handle.reporter_handle = Some(join);

    Ok(handle)
}
