//! Result hand-off to the downstream store.

use std::collections::HashSet;

use parking_lot::Mutex;

use zoneflow_shared::{Result, ZoneId, ZoneResult};

/// Destination for final zone records. Called from worker tasks; must not
/// block for long.
pub trait ResultSink: Send + Sync {
    fn deliver(&self, result: &ZoneResult) -> Result<()>;
}

/// Discards everything.
pub struct NullSink;

impl ResultSink for NullSink {
    fn deliver(&self, _result: &ZoneResult) -> Result<()> {
        Ok(())
    }
}

/// Keeps delivered results in memory, in delivery order.
#[derive(Default)]
pub struct MemorySink {
    results: Mutex<Vec<ZoneResult>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<ZoneResult> {
        self.results.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }

    /// Deliveries for one zone, oldest first.
    pub fn for_zone(&self, zone_id: &ZoneId) -> Vec<ZoneResult> {
        self.results
            .lock()
            .iter()
            .filter(|r| &r.zone_id == zone_id)
            .cloned()
            .collect()
    }
}

impl ResultSink for MemorySink {
    fn deliver(&self, result: &ZoneResult) -> Result<()> {
        self.results.lock().push(result.clone());
        Ok(())
    }
}

/// Tracks which (zone, attempt count) pairs were already handed off, so a
/// zone is delivered at most once per attempt history.
#[derive(Debug, Default)]
pub(crate) struct HandoffLedger {
    delivered: HashSet<(ZoneId, usize)>,
}

impl HandoffLedger {
    /// Returns `true` the first time a pair is claimed.
    pub(crate) fn claim(&mut self, zone_id: &ZoneId, attempt_count: usize) -> bool {
        self.delivered.insert((zone_id.clone(), attempt_count))
    }
}
