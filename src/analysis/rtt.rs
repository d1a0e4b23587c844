//! Timestamp correlation and RTT smoothing.
//!
//! An outbound data segment is remembered under `(TSval, seq)`. The peer
//! echoes TSval back as TSecr, so an inbound segment looked up under
//! `(TSecr, ack)` finds the send time of the data it acknowledges.
//! Each acknowledgment number yields at most one sample.

use serde::{Deserialize, Serialize};

use crate::flow::record::{FlowState, TcpKey};
use crate::flow::Direction;
use crate::protocol::TcpSegment;

/// Weight of a new sample in the smoothed RTT (1/8).
pub const SRTT_GAIN: f64 = 8.0;
/// Weight of a new deviation in the jitter estimate (1/4).
pub const JITTER_GAIN: f64 = 4.0;

/// Sends older than this are dropped when the pending table is full.
const PENDING_MAX_AGE_NS: u64 = 10_000_000_000;

const NANOS_PER_MILLI: f64 = 1_000_000.0;

/// How nanosecond statistics are turned into reported milliseconds.
///
/// The two orders round differently on the same input, and the reported
/// values are visible to dashboards, so both are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmoothingMode {
    /// Float all the way: `ns as f64 / 1e6`.
    #[default]
    Float,
    /// Truncate to whole nanoseconds first: `(ns as i64) as f64 / 1e6`.
    Soft,
}

impl SmoothingMode {
    #[inline]
    pub fn to_millis(self, ns: f64) -> f64 {
        match self {
            SmoothingMode::Float => ns / NANOS_PER_MILLI,
            SmoothingMode::Soft => (ns as i64) as f64 / NANOS_PER_MILLI,
        }
    }
}

/// Running RTT statistics for one flow, all in nanoseconds.
#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
    srtt: f64,
    jitter: f64,
    last: u64,
    min: Option<u64>,
    max: Option<u64>,
    /// Samples since the last window reset.
    samples: u64,
    /// Samples over the whole flow lifetime; drives initialisation.
    lifetime_samples: u64,
}

impl RttEstimator {
    /// Feed one RTT sample.
    pub fn record(&mut self, rtt_ns: u64) {
        let rtt = rtt_ns as f64;
        if self.lifetime_samples == 0 {
            self.srtt = rtt;
            self.jitter = 0.0;
        } else {
            let deviation = (rtt - self.srtt).abs();
            self.jitter += (deviation - self.jitter) / JITTER_GAIN;
            self.srtt += (rtt - self.srtt) / SRTT_GAIN;
        }
        self.last = rtt_ns;
        self.min = Some(self.min.map_or(rtt_ns, |m| m.min(rtt_ns)));
        self.max = Some(self.max.map_or(rtt_ns, |m| m.max(rtt_ns)));
        self.samples += 1;
        self.lifetime_samples += 1;
    }

    /// Start a new reporting window: min/max and the sample counter reset,
    /// the smoothed values carry over.
    pub fn reset_window(&mut self) {
        self.samples = 0;
        self.min = None;
        self.max = None;
    }

    pub fn srtt_ns(&self) -> f64 {
        self.srtt
    }

    pub fn jitter_ns(&self) -> f64 {
        self.jitter
    }

    pub fn last_ns(&self) -> u64 {
        self.last
    }

    pub fn min_ns(&self) -> Option<u64> {
        self.min
    }

    pub fn max_ns(&self) -> Option<u64> {
        self.max
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn lifetime_samples(&self) -> u64 {
        self.lifetime_samples
    }
}

/// What the correlator did with one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// No timestamp option; nothing to correlate.
    NoTimestamp,
    /// Outbound segment without payload.
    NoData,
    /// Outbound data remembered for a future match.
    Seeded,
    /// Inbound segment matched nothing pending.
    Miss,
    /// Matched a send whose ack number was already used, or lacked ACK.
    Duplicate,
    /// Matched, but the capture clock went backwards; sample discarded.
    ClockAnomaly,
    /// New RTT sample in nanoseconds.
    Sampled(u64),
}

/// Apply one segment to a flow's state. Caller holds the record lock.
pub fn correlate(
    state: &mut FlowState,
    segment: &TcpSegment,
    direction: Direction,
    max_pending: usize,
) -> Correlation {
    let Some(ts) = segment.timestamp else {
        return Correlation::NoTimestamp;
    };

    match direction {
        Direction::Outbound => {
            if segment.payload_len == 0 {
                return Correlation::NoData;
            }
            let key = TcpKey {
                timestamp: ts.value,
                seq: segment.seq,
            };
            if state.pending.len() >= max_pending && !state.pending.contains_key(&key) {
                prune_pending(state, segment.captured_ns);
            }
            state.pending.insert(key, segment.captured_ns);
            Correlation::Seeded
        }
        Direction::Inbound => {
            let key = TcpKey {
                timestamp: ts.echo_reply,
                seq: segment.ack,
            };
            let Some(sent_ns) = state.pending.remove(&key) else {
                return Correlation::Miss;
            };

            let first_ack = state.acknowledged.insert(segment.ack);
            if !segment.flags.ack || !first_ack {
                return Correlation::Duplicate;
            }

            if segment.captured_ns <= sent_ns {
                tracing::debug!(
                    sent_ns,
                    acked_ns = segment.captured_ns,
                    "discarding non-positive RTT sample"
                );
                return Correlation::ClockAnomaly;
            }

            let rtt = segment.captured_ns - sent_ns;
            state.rtt.record(rtt);
            Correlation::Sampled(rtt)
        }
    }
}

fn prune_pending(state: &mut FlowState, now_ns: u64) {
    let before = state.pending.len();
    state
        .pending
        .retain(|_, sent| now_ns.saturating_sub(*sent) < PENDING_MAX_AGE_NS);
    if state.pending.len() == before {
        // Nothing stale: the peer is simply not echoing what we expect.
        state.pending.clear();
    }
    tracing::debug!(before, after = state.pending.len(), "pruned pending sends");
}
