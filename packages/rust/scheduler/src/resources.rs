//! Resource manager: global concurrency ceiling, per-tool limits, memory budget.
//!
//! [`ResourceManager::try_acquire`] never blocks. A refusal is a scheduling
//! signal (try later, or degrade to a cheaper tool), not an error. Tokens
//! release their slot when dropped, so a panicking or cancelled worker can
//! never leak capacity.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use zoneflow_shared::{EngineConfig, ZoneflowError};

/// Static limits, fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub global_ceiling: u32,
    pub memory_budget_mb: u64,
    pub tool_limits: HashMap<String, u32>,
}

impl ResourceLimits {
    pub fn new(global_ceiling: u32, memory_budget_mb: u64) -> Self {
        Self {
            global_ceiling,
            memory_budget_mb,
            tool_limits: HashMap::new(),
        }
    }

    pub fn with_tool_limit(mut self, tool: impl Into<String>, limit: u32) -> Self {
        self.tool_limits.insert(tool.into(), limit);
        self
    }
}

impl From<&EngineConfig> for ResourceLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            global_ceiling: config.engine.max_concurrency,
            memory_budget_mb: config.engine.memory_budget_mb,
            tool_limits: config
                .tools
                .iter()
                .filter_map(|t| t.max_concurrency.map(|l| (t.name.clone(), l)))
                .collect(),
        }
    }
}

/// Why an acquisition was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    GlobalCeiling { ceiling: u32 },
    ToolLimit { tool: String, limit: u32 },
    MemoryBudget { requested_mb: u64, remaining_mb: u64 },
}

impl Refusal {
    pub fn is_memory(&self) -> bool {
        matches!(self, Self::MemoryBudget { .. })
    }

    /// Translate into the engine's error taxonomy.
    pub fn into_error(self, tool: &str) -> ZoneflowError {
        ZoneflowError::ToolUnavailable {
            tool: tool.to_string(),
            reason: self.to_string(),
        }
    }
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GlobalCeiling { ceiling } => write!(f, "global ceiling of {ceiling} reached"),
            Self::ToolLimit { tool, limit } => write!(f, "tool '{tool}' limit of {limit} reached"),
            Self::MemoryBudget {
                requested_mb,
                remaining_mb,
            } => write!(
                f,
                "needs {requested_mb} MiB but only {remaining_mb} MiB of budget remain"
            ),
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    active: u32,
    peak: u32,
    memory_in_use: u64,
    per_tool: HashMap<String, u32>,
}

/// Thread-safe resource ledger. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct ResourceManager {
    limits: Arc<ResourceLimits>,
    ledger: Arc<Mutex<Ledger>>,
}

/// Proof of an acquired slot. Releases on drop.
#[derive(Debug)]
pub struct ResourceToken {
    tool: String,
    memory_mb: u64,
    ledger: Arc<Mutex<Ledger>>,
}

impl ResourceToken {
    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory_mb
    }
}

impl Drop for ResourceToken {
    fn drop(&mut self) {
        let mut ledger = self.ledger.lock();
        ledger.active = ledger.active.saturating_sub(1);
        ledger.memory_in_use = ledger.memory_in_use.saturating_sub(self.memory_mb);
        if let Some(n) = ledger.per_tool.get_mut(&self.tool) {
            *n = n.saturating_sub(1);
        }
        trace!(tool = %self.tool, active = ledger.active, "released resource token");
    }
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits: Arc::new(limits),
            ledger: Arc::new(Mutex::new(Ledger::default())),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Try to reserve one slot for `tool` with an estimated memory footprint.
    ///
    /// An estimate larger than the whole budget is admitted only while nothing
    /// else holds memory, so an oversized tool can still make progress alone.
    pub fn try_acquire(&self, tool: &str, memory_mb: u64) -> Result<ResourceToken, Refusal> {
        let mut ledger = self.ledger.lock();

        if ledger.active >= self.limits.global_ceiling {
            return Err(Refusal::GlobalCeiling {
                ceiling: self.limits.global_ceiling,
            });
        }

        let in_use_for_tool = ledger.per_tool.get(tool).copied().unwrap_or(0);
        if let Some(&limit) = self.limits.tool_limits.get(tool) {
            if in_use_for_tool >= limit {
                return Err(Refusal::ToolLimit {
                    tool: tool.to_string(),
                    limit,
                });
            }
        }

        let remaining = self
            .limits
            .memory_budget_mb
            .saturating_sub(ledger.memory_in_use);
        let oversized_alone = memory_mb > self.limits.memory_budget_mb && ledger.memory_in_use == 0;
        if memory_mb > remaining && !oversized_alone {
            return Err(Refusal::MemoryBudget {
                requested_mb: memory_mb,
                remaining_mb: remaining,
            });
        }

        ledger.active += 1;
        ledger.peak = ledger.peak.max(ledger.active);
        ledger.memory_in_use += memory_mb;
        *ledger.per_tool.entry(tool.to_string()).or_insert(0) += 1;
        trace!(tool, active = ledger.active, memory_mb, "acquired resource token");

        Ok(ResourceToken {
            tool: tool.to_string(),
            memory_mb,
            ledger: Arc::clone(&self.ledger),
        })
    }

    /// Explicit release; equivalent to dropping the token.
    pub fn release(&self, token: ResourceToken) {
        drop(token);
    }

    pub fn global_slots_available(&self) -> u32 {
        self.limits
            .global_ceiling
            .saturating_sub(self.ledger.lock().active)
    }

    /// Fraction of capacity free for `tool` in [0,1]: the tighter of the
    /// global ceiling and the tool's own limit.
    pub fn tool_availability(&self, tool: &str) -> f64 {
        let ledger = self.ledger.lock();
        let ceiling = self.limits.global_ceiling.max(1) as f64;
        let global = (ceiling - ledger.active as f64).max(0.0) / ceiling;
        let per_tool = match self.limits.tool_limits.get(tool) {
            Some(&limit) if limit > 0 => {
                let used = ledger.per_tool.get(tool).copied().unwrap_or(0) as f64;
                (limit as f64 - used).max(0.0) / limit as f64
            }
            Some(_) => 0.0,
            None => 1.0,
        };
        global.min(per_tool)
    }

    pub fn in_use(&self) -> u32 {
        self.ledger.lock().active
    }

    /// Highest number of simultaneously held tokens seen so far.
    pub fn peak(&self) -> u32 {
        self.ledger.lock().peak
    }

    pub fn memory_in_use(&self) -> u64 {
        self.ledger.lock().memory_in_use
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn global_ceiling_refuses_third() {
        let rm = ResourceManager::new(ResourceLimits::new(2, 1024));
        let a = rm.try_acquire("x", 10).expect("first");
        let _b = rm.try_acquire("y", 10).expect("second");
        assert_eq!(
            rm.try_acquire("z", 10).unwrap_err(),
            Refusal::GlobalCeiling { ceiling: 2 }
        );
        assert_eq!(rm.global_slots_available(), 0);

        rm.release(a);
        assert_eq!(rm.global_slots_available(), 1);
        assert!(rm.try_acquire("z", 10).is_ok());
    }

    #[test]
    fn per_tool_limit() {
        let rm = ResourceManager::new(ResourceLimits::new(5, 1024).with_tool_limit("tess", 1));
        let _t = rm.try_acquire("tess", 10).expect("first tess");
        let err = rm.try_acquire("tess", 10).unwrap_err();
        assert!(matches!(err, Refusal::ToolLimit { limit: 1, .. }));
        assert!(rm.try_acquire("paddle", 10).is_ok());
        assert_eq!(rm.tool_availability("tess"), 0.0);
    }

    #[test]
    fn memory_budget_refuses_instead_of_blocking() {
        let rm = ResourceManager::new(ResourceLimits::new(5, 1000));
        let _big = rm.try_acquire("layoutlm", 800).expect("fits");
        let err = rm.try_acquire("layoutlm", 400).unwrap_err();
        assert!(err.is_memory());
        assert_eq!(
            err,
            Refusal::MemoryBudget {
                requested_mb: 400,
                remaining_mb: 200
            }
        );
        let small = rm.try_acquire("tess", 128).expect("small fits");
        assert_eq!(rm.memory_in_use(), 928);
        drop(small);
        assert_eq!(rm.memory_in_use(), 800);
    }

    #[test]
    fn oversized_tool_runs_alone() {
        let rm = ResourceManager::new(ResourceLimits::new(5, 500));
        let t = rm.try_acquire("huge", 900).expect("alone");
        assert!(rm.try_acquire("small", 10).unwrap_err().is_memory());
        drop(t);
        let _s = rm.try_acquire("small", 10).expect("small");
        assert!(rm.try_acquire("huge", 900).unwrap_err().is_memory());
    }

    #[test]
    fn refusal_maps_to_tool_unavailable() {
        let err = Refusal::GlobalCeiling { ceiling: 3 }.into_error("paddle");
        assert_eq!(err.kind(), zoneflow_shared::ErrorKind::ToolUnavailable);
        assert!(err.to_string().contains("global ceiling of 3"));
    }

    #[test]
    fn availability_tracks_usage() {
        let rm = ResourceManager::new(ResourceLimits::new(4, 1024).with_tool_limit("t", 2));
        assert_eq!(rm.tool_availability("t"), 1.0);
        let _a = rm.try_acquire("t", 1).expect("a");
        assert_eq!(rm.tool_availability("t"), 0.5);
        assert_eq!(rm.tool_availability("other"), 0.75);
    }

    /// Hammer the ledger from many threads; the ceiling must hold at every instant.
    #[test]
    fn concurrent_acquire_never_exceeds_ceiling() {
        let ceiling = 3;
        let rm = ResourceManager::new(ResourceLimits::new(ceiling, u64::MAX));
        let observed = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let rm = rm.clone();
                let observed = Arc::clone(&observed);
                let max_seen = Arc::clone(&max_seen);
                std::thread::spawn(move || {
                    for j in 0..200u32 {
                        if let Ok(token) = rm.try_acquire("t", 1) {
                            let now = observed.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            assert!(rm.in_use() <= ceiling);
                            if (i + j) % 7 == 0 {
                                std::thread::sleep(Duration::from_micros(50));
                            }
                            observed.fetch_sub(1, Ordering::SeqCst);
                            drop(token);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread");
        }

        assert!(max_seen.load(Ordering::SeqCst) <= ceiling);
        assert!(rm.peak() <= ceiling);
        assert_eq!(rm.in_use(), 0);
        assert_eq!(rm.memory_in_use(), 0);
    }

    #[tokio::test]
    async fn tokens_release_across_tasks() {
        let rm = ResourceManager::new(ResourceLimits::new(2, 1024));
        let token = rm.try_acquire("t", 1).expect("token");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            drop(token);
        });
        handle.await.expect("task");
        assert_eq!(rm.in_use(), 0);
    }
}
