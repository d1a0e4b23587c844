//! Per-flow record: identity, the mutable RTT bookkeeping behind a lock,
//! and the flow's expiry timer.

use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddrV4;
use std::time::SystemTime;

use super::timer::{ExpiryTimer, TimerHandle};
use super::FlowKey;
use crate::analysis::rtt::RttEstimator;

/// Correlation key for an outbound segment: `(TSval, seq)` on the way out,
/// `(TSecr, ack)` on the way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpKey {
    pub timestamp: u32,
    pub seq: u32,
}

/// Where a record sits in its expiry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Idle timer re-armed on every packet.
    Active,
    /// FIN+ACK seen; only the grace timer is left running.
    Closing,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Active => write!(f, "active"),
            Lifecycle::Closing => write!(f, "closing"),
        }
    }
}

/// Everything about a flow that changes after creation.
#[derive(Debug)]
pub struct FlowState {
    /// Outbound data awaiting its acknowledgment, with send time (ns).
    pub(crate) pending: AHashMap<TcpKey, u64>,
    /// Ack numbers that already produced (or were refused) a sample.
    pub(crate) acknowledged: AHashSet<u32>,
    pub rtt: RttEstimator,
    pub last_flush: SystemTime,
    /// Graceful close observed.
    pub done: bool,
    pub packets: u64,
    /// Capture time of the most recent segment (ns).
    pub last_seen_ns: u64,
}

impl FlowState {
    pub(crate) fn new(now: SystemTime) -> Self {
        FlowState {
            pending: AHashMap::new(),
            acknowledged: AHashSet::new(),
            rtt: RttEstimator::default(),
            last_flush: now,
            done: false,
            packets: 0,
            last_seen_ns: 0,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.done {
            Lifecycle::Closing
        } else {
            Lifecycle::Active
        }
    }

    #[inline]
    pub fn sample_count(&self) -> u64 {
        self.rtt.samples()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn acknowledged_len(&self) -> usize {
        self.acknowledged.len()
    }

    /// Reset the reporting window. Sends still in flight stay pending so
    /// their acknowledgments produce samples in the next window.
    pub fn flush_window(&mut self, now: SystemTime) {
        self.rtt.reset_window();
        self.last_flush = now;
    }

    /// Reset the window and drop all correlation state.
    ///
    /// Smoothed RTT and jitter survive so the estimate stays continuous
    /// across windows. Clearing `acknowledged` cannot cause a double count:
    /// every matched send was already removed from `pending`.
    pub fn flush(&mut self, now: SystemTime) {
        self.flush_window(now);
        self.pending.clear();
        self.acknowledged.clear();
    }
}

/// One tracked connection.
#[derive(Debug)]
pub struct FlowRecord {
    key: FlowKey,
    state: Mutex<FlowState>,
    timer: ExpiryTimer,
}

impl FlowRecord {
    /// A fresh record with a disarmed timer.
    pub fn new(key: FlowKey, timers: &TimerHandle) -> Self {
        FlowRecord {
            key,
            state: Mutex::new(FlowState::new(SystemTime::now())),
            timer: timers.timer(key),
        }
    }

    #[inline]
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    #[inline]
    pub fn local(&self) -> SocketAddrV4 {
        self.key.local
    }

    #[inline]
    pub fn remote(&self) -> SocketAddrV4 {
        self.key.remote
    }

    /// Take the record lock. Never call this while holding the table lock.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock()
    }

    #[inline]
    pub fn timer(&self) -> &ExpiryTimer {
        &self.timer
    }

    /// Copy the current statistics out under the lock.
    pub fn snapshot(&self) -> FlowSnapshot {
        let state = self.lock();
        FlowSnapshot::new(&self.key, &state)
    }
}

/// Point-in-time statistics for one flow, in nanoseconds.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSnapshot {
    pub key: String,
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
    pub lifecycle: Lifecycle,
    pub packets: u64,
    pub last_seen_ns: u64,
    /// Samples in the current reporting window.
    pub samples: u64,
    /// Samples since the flow was created.
    pub total_samples: u64,
    pub srtt_ns: f64,
    pub jitter_ns: f64,
    pub last_rtt_ns: u64,
    pub min_rtt_ns: Option<u64>,
    pub max_rtt_ns: Option<u64>,
}

impl FlowSnapshot {
    pub fn new(key: &FlowKey, state: &FlowState) -> Self {
        FlowSnapshot {
            key: key.to_string(),
            local: key.local,
            remote: key.remote,
            lifecycle: state.lifecycle(),
            packets: state.packets,
            last_seen_ns: state.last_seen_ns,
            samples: state.rtt.samples(),
            total_samples: state.rtt.lifetime_samples(),
            srtt_ns: state.rtt.srtt_ns(),
            jitter_ns: state.rtt.jitter_ns(),
            last_rtt_ns: state.rtt.last_ns(),
            min_rtt_ns: state.rtt.min_ns(),
            max_rtt_ns: state.rtt.max_ns(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::timer::TimerService;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn window_flush_keeps_in_flight_sends() {
        let running = Arc::new(AtomicBool::new(true));
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut svc = TimerService::spawn(tx, running.clone()).unwrap();

        let key = FlowKey {
            local: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1001),
            remote: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80),
        };
        let record = FlowRecord::new(key, &svc.handle());
        {
            let mut state = record.lock();
            state.pending.insert(TcpKey { timestamp: 5, seq: 9 }, 10);
            state.acknowledged.insert(7);
            state.rtt.record(2_000_000);

            let later = state.last_flush + Duration::from_secs(1);
            state.flush_window(later);
            assert_eq!(state.sample_count(), 0);
            assert_eq!(state.pending_len(), 1);
            assert_eq!(state.acknowledged_len(), 1);
            assert_eq!(state.last_flush, later);
        }

        running.store(false, Ordering::SeqCst);
        svc.shutdown();
    }

    #[test]
    fn flush_resets_window_but_keeps_smoothing() {
        let running = Arc::new(AtomicBool::new(true));
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut svc = TimerService::spawn(tx, running.clone()).unwrap();

        let key = FlowKey {
            local: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1000),
            remote: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80),
        };
        let record = FlowRecord::new(key, &svc.handle());
        {
            let mut state = record.lock();
            state.pending.insert(TcpKey { timestamp: 1, seq: 2 }, 10);
            state.acknowledged.insert(2);
            state.rtt.record(4_000_000);
            assert_eq!(state.sample_count(), 1);

            let later = state.last_flush + Duration::from_secs(1);
            state.flush(later);
            assert_eq!(state.sample_count(), 0);
            assert_eq!(state.pending_len(), 0);
            assert_eq!(state.acknowledged_len(), 0);
            assert_eq!(state.rtt.srtt_ns(), 4_000_000.0);
            assert_eq!(state.last_flush, later);
        }
        assert!(!record.timer().is_armed());
        assert_eq!(record.snapshot().lifecycle, Lifecycle::Active);

        running.store(false, Ordering::SeqCst);
        svc.shutdown();
    }
}
