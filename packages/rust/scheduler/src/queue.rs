//! Priority queue of zones awaiting dispatch.
//!
//! Ordering is max-priority-first with FIFO tie-break on the zone's original
//! insertion sequence. A zone keeps its sequence number when it is requeued
//! for a fallback attempt or reprioritized, so replaying identical input
//! always yields the identical dispatch order.
//!
//! The queue is not internally synchronized; the controller keeps it under
//! the same lock as the zone table so a dequeue and the matching status
//! change happen atomically.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::trace;

use zoneflow_shared::ZoneId;

/// `f64` with a total order (`NaN` sorts above everything, never panics).
#[derive(Debug, Clone, Copy)]
struct Priority(f64);

impl PartialEq for Priority {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for Priority {}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    priority: Reverse<Priority>,
    seq: u64,
}

/// A zone handed out by the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub zone_id: ZoneId,
    pub priority: f64,
    /// Original insertion sequence.
    pub seq: u64,
}

/// Counts returned by [`ProcessingQueue::status`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub queued: usize,
    /// Queued with every dependency resolved.
    pub ready: usize,
    /// Queued but waiting on a dependency.
    pub blocked: usize,
    /// Removed by `cancel` since creation.
    pub cancelled: usize,
}

#[derive(Debug)]
struct Pending {
    key: Key,
    waiting_on: HashSet<ZoneId>,
}

#[derive(Debug, Default)]
pub struct ProcessingQueue {
    order: BTreeMap<Key, ZoneId>,
    entries: HashMap<ZoneId, Pending>,
    seqs: HashMap<ZoneId, u64>,
    resolved: HashSet<ZoneId>,
    next_seq: u64,
    cancelled: usize,
}

impl ProcessingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a zone. Dependencies already resolved are ignored. Returns `false`
    /// if the zone is already queued.
    pub fn enqueue(&mut self, zone_id: ZoneId, priority: f64, depends_on: &[ZoneId]) -> bool {
        if self.entries.contains_key(&zone_id) {
            return false;
        }
        let seq = *self.seqs.entry(zone_id.clone()).or_insert_with(|| {
            let s = self.next_seq;
            self.next_seq += 1;
            s
        });
        let key = Key {
            priority: Reverse(Priority(priority)),
            seq,
        };
        let waiting_on = depends_on
            .iter()
            .filter(|d| **d != zone_id && !self.resolved.contains(*d))
            .cloned()
            .collect();
        trace!(zone_id = %zone_id, priority, seq, "enqueue");
        self.order.insert(key, zone_id.clone());
        self.entries.insert(zone_id, Pending { key, waiting_on });
        true
    }

    /// Pop the highest-priority zone whose dependencies are all resolved.
    pub fn dequeue_next(&mut self) -> Option<QueueEntry> {
        self.dequeue_next_with(|_| Some(())).map(|(entry, ())| entry)
    }

    /// Walk ready zones in order and pop the first one `accept` takes.
    ///
    /// `accept` typically tries to acquire a resource token; zones it refuses
    /// stay queued in place.
    pub fn dequeue_next_with<T>(
        &mut self,
        mut accept: impl FnMut(&QueueEntry) -> Option<T>,
    ) -> Option<(QueueEntry, T)> {
        let mut chosen = None;
        for (key, zone_id) in &self.order {
            let ready = self
                .entries
                .get(zone_id)
                .is_some_and(|p| p.waiting_on.is_empty());
            if !ready {
                continue;
            }
            let entry = QueueEntry {
                zone_id: zone_id.clone(),
                priority: key.priority.0.0,
                seq: key.seq,
            };
            if let Some(value) = accept(&entry) {
                chosen = Some((*key, entry, value));
                break;
            }
        }
        let (key, entry, value) = chosen?;
        self.order.remove(&key);
        self.entries.remove(&entry.zone_id);
        Some((entry, value))
    }

    /// Change a queued zone's priority, keeping its FIFO position among equals.
    pub fn reprioritize(&mut self, zone_id: &ZoneId, priority: f64) -> bool {
        let Some(pending) = self.entries.get_mut(zone_id) else {
            return false;
        };
        self.order.remove(&pending.key);
        pending.key.priority = Reverse(Priority(priority));
        self.order.insert(pending.key, zone_id.clone());
        true
    }

    /// Remove a queued zone. Its dependents are released.
    pub fn cancel(&mut self, zone_id: &ZoneId) -> bool {
        let Some(pending) = self.entries.remove(zone_id) else {
            return false;
        };
        self.order.remove(&pending.key);
        self.cancelled += 1;
        self.resolve(zone_id);
        true
    }

    /// Remove every queued zone, returning them in dispatch order.
    pub fn cancel_all(&mut self) -> Vec<ZoneId> {
        let ids: Vec<ZoneId> = std::mem::take(&mut self.order).into_values().collect();
        self.entries.clear();
        self.cancelled += ids.len();
        for id in &ids {
            self.resolved.insert(id.clone());
        }
        ids
    }

    /// Mark a zone as finished (any terminal state) so dependents can run.
    pub fn resolve(&mut self, zone_id: &ZoneId) {
        self.resolved.insert(zone_id.clone());
        for pending in self.entries.values_mut() {
            pending.waiting_on.remove(zone_id);
        }
    }

    /// Drop every outstanding dependency wait. Used to break dependency
    /// cycles once nothing else can make progress. Returns how many zones
    /// were released.
    pub fn release_blocked(&mut self) -> usize {
        let mut released = 0;
        for pending in self.entries.values_mut() {
            if !pending.waiting_on.is_empty() {
                pending.waiting_on.clear();
                released += 1;
            }
        }
        released
    }

    /// Forget that a zone finished, e.g. when it is retried.
    pub fn unresolve(&mut self, zone_id: &ZoneId) {
        self.resolved.remove(zone_id);
    }

    pub fn is_resolved(&self, zone_id: &ZoneId) -> bool {
        self.resolved.contains(zone_id)
    }

    pub fn contains(&self, zone_id: &ZoneId) -> bool {
        self.entries.contains_key(zone_id)
    }

    pub fn priority_of(&self, zone_id: &ZoneId) -> Option<f64> {
        self.entries.get(zone_id).map(|p| p.key.priority.0.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn status(&self) -> QueueStatus {
        let ready = self
            .entries
            .values()
            .filter(|p| p.waiting_on.is_empty())
            .count();
        QueueStatus {
            queued: self.entries.len(),
            ready,
            blocked: self.entries.len() - ready,
            cancelled: self.cancelled,
        }
    }
}
