//! Per-flow self-expiry timers backed by one service thread.
//!
//! Every [`ExpiryTimer`] is an atomic deadline. Arming only stores the new
//! deadline; the service thread is told about a timer when it has no entry
//! queued for it yet, or when the deadline moved earlier. When an entry
//! pops, the service re-reads the deadline and either re-queues the timer
//! or posts the flow key to the expiration channel. So a busy flow costs
//! one atomic store per packet, not one heap push.
//!
//! Firing is "no earlier than the deadline": a timer that was re-armed after
//! it fired can leave a stale key in the channel, which is why consumers ask
//! [`ExpiryTimer::is_due`] before deleting anything.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::FlowKey;

const DISARMED: u64 = u64::MAX;

/// Upper bound on how long the service sleeps before re-checking `running`.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct TimerSlot {
    key: FlowKey,
    /// Nanoseconds since the service epoch, or `DISARMED`.
    deadline: AtomicU64,
    /// True while the service holds (or is about to receive) a heap entry.
    queued: AtomicBool,
}

/// Cloneable handle used to create timers bound to one service.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    epoch: Instant,
    schedule_tx: Sender<Arc<TimerSlot>>,
}

impl TimerHandle {
    /// Create a disarmed timer that posts `key` when it fires.
    pub fn timer(&self, key: FlowKey) -> ExpiryTimer {
        ExpiryTimer {
            slot: Arc::new(TimerSlot {
                key,
                deadline: AtomicU64::new(DISARMED),
                queued: AtomicBool::new(false),
            }),
            handle: self.clone(),
        }
    }

    #[inline]
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// A resettable deadline for one flow.
#[derive(Debug)]
pub struct ExpiryTimer {
    slot: Arc<TimerSlot>,
    handle: TimerHandle,
}

impl ExpiryTimer {
    /// (Re)arm the timer to fire `after` from now, replacing any previous
    /// deadline, earlier or later.
    pub fn arm(&self, after: Duration) {
        let deadline = self
            .handle
            .now_ns()
            .saturating_add(after.as_nanos() as u64)
            .min(DISARMED - 1);
        let previous = self.slot.deadline.swap(deadline, Ordering::SeqCst);
        let already_queued = self.slot.queued.swap(true, Ordering::SeqCst);
        if !already_queued || deadline < previous {
            // A closed channel means the service is gone; nothing left to fire.
            let _ = self.handle.schedule_tx.send(Arc::clone(&self.slot));
        }
    }

    /// Stop the timer. Any queued entry is discarded when it pops.
    pub fn cancel(&self) {
        self.slot.deadline.store(DISARMED, Ordering::SeqCst);
    }

    pub fn is_armed(&self) -> bool {
        self.slot.deadline.load(Ordering::SeqCst) != DISARMED
    }

    /// True once an armed deadline has passed.
    pub fn is_due(&self) -> bool {
        let deadline = self.slot.deadline.load(Ordering::SeqCst);
        deadline != DISARMED && deadline <= self.handle.now_ns()
    }

    /// Time left before the deadline, `None` when disarmed.
    pub fn remaining(&self) -> Option<Duration> {
        let deadline = self.slot.deadline.load(Ordering::SeqCst);
        if deadline == DISARMED {
            return None;
        }
        Some(Duration::from_nanos(
            deadline.saturating_sub(self.handle.now_ns()),
        ))
    }
}

struct Scheduled {
    at: u64,
    seq: u64,
    slot: Arc<TimerSlot>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        (self.at, self.seq) == (other.at, other.seq)
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

/// Owns the timer thread.
pub struct TimerService {
    handle: TimerHandle,
    join: Option<thread::JoinHandle<()>>,
}

impl TimerService {
    /// Start the service. Fired keys are sent on `expire_tx`; the thread
    /// exits once `running` goes false.
    pub fn spawn(expire_tx: Sender<FlowKey>, running: Arc<AtomicBool>) -> io::Result<Self> {
        let (schedule_tx, schedule_rx) = crossbeam_channel::unbounded();
        let epoch = Instant::now();
        let handle = TimerHandle { epoch, schedule_tx };

        let join = thread::Builder::new()
            .name("rtt-timers".into())
            .spawn(move || run(epoch, schedule_rx, expire_tx, &running))?;

        Ok(TimerService {
            handle,
            join: Some(join),
        })
    }

    pub fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }

    /// Join the thread. The caller must have cleared `running` first.
    pub fn shutdown(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run(
    epoch: Instant,
    schedule_rx: Receiver<Arc<TimerSlot>>,
    expire_tx: Sender<FlowKey>,
    running: &AtomicBool,
) {
    let mut heap: BinaryHeap<Reverse<Scheduled>> = BinaryHeap::new();
    let mut seq: u64 = 0;
    let mut push = |heap: &mut BinaryHeap<Reverse<Scheduled>>, at: u64, slot: Arc<TimerSlot>| {
        seq += 1;
        heap.push(Reverse(Scheduled { at, seq, slot }));
    };

    while running.load(Ordering::Relaxed) {
        let now = epoch.elapsed().as_nanos() as u64;

        while heap.peek().map_or(false, |Reverse(top)| top.at <= now) {
            let Some(Reverse(entry)) = heap.pop() else {
                break;
            };
            let slot = entry.slot;
            slot.queued.store(false, Ordering::SeqCst);
            let deadline = slot.deadline.load(Ordering::SeqCst);
            if deadline == DISARMED {
                continue;
            }
            if deadline > now {
                // Re-armed since this entry was queued.
                if !slot.queued.swap(true, Ordering::SeqCst) {
                    push(&mut heap, deadline, slot);
                }
                continue;
            }
            tracing::trace!(flow = %slot.key, "expiry timer fired");
            if expire_tx.send(slot.key).is_err() {
                return;
            }
        }

        let wait = heap
            .peek()
            .map(|Reverse(top)| Duration::from_nanos(top.at.saturating_sub(now)))
            .unwrap_or(POLL_INTERVAL)
            .min(POLL_INTERVAL);

        match schedule_rx.recv_timeout(wait) {
            Ok(slot) => {
                let deadline = slot.deadline.load(Ordering::SeqCst);
                if deadline == DISARMED {
                    slot.queued.store(false, Ordering::SeqCst);
                } else {
                    push(&mut heap, deadline, slot);
                }
                // Drain whatever else is waiting without sleeping again.
                for slot in schedule_rx.try_iter() {
                    let deadline = slot.deadline.load(Ordering::SeqCst);
                    if deadline == DISARMED {
                        slot.queued.store(false, Ordering::SeqCst);
                    } else {
                        push(&mut heap, deadline, slot);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::debug!(pending = heap.len(), "timer service stopped");
}
