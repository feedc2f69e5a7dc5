//! Processing orchestration for classified document zones.
//!
//! [`ProcessingController`] schedules zones onto extraction tools under
//! resource limits, scores every attempt, falls back to other tools when
//! confidence is low or a tool fails, merges agreeing outputs, and hands
//! one final [`ZoneResult`](zoneflow_shared::ZoneResult) per zone to a
//! [`ResultSink`].

pub mod controller;
mod engine;
pub mod events;
pub mod fallback;
pub mod results;
mod run;
mod worker;

pub use controller::{ControllerBuilder, ProcessingController, RunSummary};
pub use events::{
    BroadcastObserver, EngineEvent, EngineObserver, ProgressSnapshot, SilentObserver, ZoneFailure,
};
pub use fallback::{FallbackDecision, FallbackManager};
pub use results::{MemorySink, NullSink, ResultSink};
