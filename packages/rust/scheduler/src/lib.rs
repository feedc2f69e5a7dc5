//! Scheduling state for Zoneflow: the processing queue and the resource ledger.
//!
//! These are the only shared mutable structures in the engine.

pub mod queue;
pub mod resources;

pub use queue::{ProcessingQueue, QueueEntry, QueueStatus};
pub use resources::{Refusal, ResourceLimits, ResourceManager, ResourceToken};
