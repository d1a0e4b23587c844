//! Per-shard worker: decodes packets from its bounded queue and hands each
//! TCP segment to the shared dispatcher.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::analysis::Correlation;
use crate::protocol::{self, TcpSegment};

use super::dispatcher::Dispatcher;
use super::{OwnedPacket, PipelineStats};

const RECV_TIMEOUT: Duration = Duration::from_millis(50);

pub struct Worker {
    shard_id: usize,
    dispatcher: Dispatcher,
    stats: Arc<PipelineStats>,
}

impl Worker {
    pub fn new(shard_id: usize, dispatcher: Dispatcher, stats: Arc<PipelineStats>) -> Self {
        Worker {
            shard_id,
            dispatcher,
            stats,
        }
    }

    pub fn run(&mut self, rx: Receiver<OwnedPacket>, running: &AtomicBool) {
        loop {
            if !running.load(Ordering::Relaxed) {
                // Drain what the capture thread already queued.
                while let Ok(pkt) = rx.try_recv() {
                    self.process_packet(&pkt);
                }
                break;
            }

            match rx.recv_timeout(RECV_TIMEOUT) {
                Ok(pkt) => self.process_packet(&pkt),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        tracing::debug!(shard = self.shard_id, "worker shut down");
    }

    pub fn process_packet(&mut self, pkt: &OwnedPacket) {
        let parsed = match protocol::parse_packet(&pkt.data) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(shard = self.shard_id, error = %e, "parse error");
                return;
            }
        };

        let Some(segment) = TcpSegment::from_packet(&parsed, pkt.captured_ns) else {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let outcome = self.dispatcher.dispatch(&segment);
        self.stats.segments.fetch_add(1, Ordering::Relaxed);
        if outcome.created {
            self.stats.flows_created.fetch_add(1, Ordering::Relaxed);
        }
        match outcome.correlation {
            Correlation::Sampled(_) => {
                self.stats.samples.fetch_add(1, Ordering::Relaxed);
            }
            Correlation::ClockAnomaly => {
                self.stats.clock_anomalies.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}
