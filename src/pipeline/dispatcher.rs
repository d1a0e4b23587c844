//! Per-segment entry point into the flow table.
//!
//! Every worker owns a `Dispatcher`; all of them share one `FlowTable`.
//! The record lock is held through the whole of lifecycle handling and
//! correlation and dropped with the guard on every path.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use crate::analysis::{correlate, Correlation};
use crate::config::FlowConfig;
use crate::flow::{classify, FlowRecord, FlowTable, HostSet, TimerHandle};
use crate::protocol::TcpSegment;

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub idle_ttl: Option<Duration>,
    pub exp_ttl: Option<Duration>,
    pub max_pending: usize,
}

impl From<&FlowConfig> for DispatchConfig {
    fn from(cfg: &FlowConfig) -> Self {
        DispatchConfig {
            idle_ttl: cfg.idle_ttl(),
            exp_ttl: cfg.exp_ttl(),
            max_pending: cfg.max_pending.max(1),
        }
    }
}

/// Result of dispatching one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatched {
    /// This segment created the flow.
    pub created: bool,
    /// This segment started the close.
    pub closing: bool,
    pub correlation: Correlation,
}

#[derive(Clone)]
pub struct Dispatcher {
    table: Arc<FlowTable>,
    hosts: Arc<HostSet>,
    timers: TimerHandle,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        table: Arc<FlowTable>,
        hosts: Arc<HostSet>,
        timers: TimerHandle,
        config: DispatchConfig,
    ) -> Self {
        Dispatcher {
            table,
            hosts,
            timers,
            config,
        }
    }

    pub fn table(&self) -> &Arc<FlowTable> {
        &self.table
    }

    pub fn dispatch(&self, segment: &TcpSegment) -> Dispatched {
        let src = SocketAddrV4::new(segment.src, segment.src_port);
        let dst = SocketAddrV4::new(segment.dst, segment.dst_port);
        let (key, direction) = classify(src, dst, &self.hosts);

        let (record, created) = match self.table.lookup(&key) {
            Some(record) => (record, false),
            None => self
                .table
                .insert_if_absent(key, || FlowRecord::new(key, &self.timers)),
        };
        if created {
            tracing::debug!(flow = %key, %direction, "new flow");
        }

        let mut state = record.lock();
        state.packets += 1;
        state.last_seen_ns = segment.captured_ns;

        let mut closing = false;
        if !state.done {
            if let Some(ttl) = self.config.idle_ttl {
                record.timer().arm(ttl);
            }
            // Without a grace period the flow stays active and only idles out.
            if let (true, Some(ttl)) = (segment.is_fin_ack(), self.config.exp_ttl) {
                state.done = true;
                closing = true;
                record.timer().arm(ttl);
                tracing::debug!(flow = %key, "FIN+ACK seen, flow closing");
            }
        }

        let correlation = if segment.timestamp.is_some() {
            correlate(&mut state, segment, direction, self.config.max_pending)
        } else {
            Correlation::NoTimestamp
        };
        if let Correlation::Sampled(rtt_ns) = correlation {
            tracing::trace!(flow = %key, rtt_ns, "rtt sample");
        }

        Dispatched {
            created,
            closing,
            correlation,
        }
    }
}
