//! The concurrent flow table.
//!
//! Membership sits behind one `RwLock` (the structural lock); each record
//! has its own mutex. The structural lock is only ever held for map
//! operations and is always released before a record lock is taken.

use ahash::AHashMap;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use std::sync::Arc;

use super::record::FlowRecord;
use super::FlowKey;

pub struct FlowTable {
    flows: RwLock<AHashMap<FlowKey, Arc<FlowRecord>>>,
    expire_tx: Sender<FlowKey>,
    expire_rx: Receiver<FlowKey>,
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowTable {
    pub fn new() -> Self {
        let (expire_tx, expire_rx) = crossbeam_channel::unbounded();
        FlowTable {
            flows: RwLock::new(AHashMap::new()),
            expire_tx,
            expire_rx,
        }
    }

    /// Sender timers use to post expired keys.
    pub fn expiry_sender(&self) -> Sender<FlowKey> {
        self.expire_tx.clone()
    }

    /// Receiving side of the expiration queue. The reporting loop is its
    /// only consumer.
    pub fn expirations(&self) -> &Receiver<FlowKey> {
        &self.expire_rx
    }

    pub fn len(&self) -> usize {
        self.flows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.read().is_empty()
    }

    /// Find a record without touching its lock.
    pub fn lookup(&self, key: &FlowKey) -> Option<Arc<FlowRecord>> {
        self.flows.read().get(key).cloned()
    }

    /// Insert the record built by `make` unless another caller got there
    /// first. Returns the record now stored under `key` and whether this
    /// call created it. `make` runs under the write lock, so it must not
    /// block.
    pub fn insert_if_absent<F>(&self, key: FlowKey, make: F) -> (Arc<FlowRecord>, bool)
    where
        F: FnOnce() -> FlowRecord,
    {
        let mut flows = self.flows.write();
        if let Some(existing) = flows.get(&key) {
            return (Arc::clone(existing), false);
        }
        let record = Arc::new(make());
        flows.insert(key, Arc::clone(&record));
        (record, true)
    }

    /// Unconditionally remove `key`. In-flight holders of the record keep
    /// their `Arc`; whatever they write afterwards is discarded with it.
    pub fn delete(&self, key: &FlowKey) -> Option<Arc<FlowRecord>> {
        self.flows.write().remove(key)
    }

    /// Handle an expiration notification: remove the record only if it is
    /// still present and its timer is still past due. A record that saw
    /// traffic after the notification was posted stays.
    pub fn expire(&self, key: &FlowKey) -> Option<Arc<FlowRecord>> {
        let removed = {
            let mut flows = self.flows.write();
            match flows.get(key) {
                Some(record) if record.timer().is_due() => flows.remove(key),
                _ => None,
            }
        };
        if let Some(record) = &removed {
            record.timer().cancel();
        }
        removed
    }

    /// Copy out the current membership. The structural lock is released
    /// before this returns.
    pub fn snapshot(&self) -> Vec<Arc<FlowRecord>> {
        self.flows.read().values().cloned().collect()
    }

    /// Visit every record present when the call started. The visitor runs
    /// without the structural lock, so it is free to lock the record.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&FlowRecord),
    {
        for record in self.snapshot() {
            visitor(&record);
        }
    }
}
