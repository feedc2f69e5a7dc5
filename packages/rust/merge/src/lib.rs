//! Cross-tool result reconciliation.
//!
//! [`ResultMerger`] compares two or more completed attempts for the same zone
//! and either produces a [`MergedResult`](zoneflow_shared::MergedResult) or
//! falls back to the best single attempt, always recording what was discarded.

pub mod merger;
pub mod similarity;

pub use merger::{MergeOutcome, ResultMerger};
pub use similarity::{best_agreement, similarity};
