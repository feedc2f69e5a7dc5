//! Shared types, error model, and configuration for Zoneflow.
//!
//! This crate is the foundation depended on by all other Zoneflow crates.
//! It provides:
//! - [`ZoneflowError`] and [`ErrorKind`]: the unified error taxonomy
//! - Domain types ([`Zone`], [`ProcessingZone`], [`ConfidenceScore`], [`ZoneResult`], ...)
//! - Configuration ([`EngineConfig`], config loading and validation)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    BackoffPolicy, CapabilityConfig, ConfidenceConfig, CurveConfig, EngineConfig, EngineSection,
    FactorWeights, FallbackConfig, FallbackStrategy, MergeConfig, PriorityConfig,
    PriorityStrategyKind, PriorityWeights, ToolConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from,
};
pub use error::{ErrorKind, Result, ZoneflowError};
pub use types::{
    AttemptError, BoundingBox, CandidateQuality, ConfidenceFactor, ConfidenceScore, Conflict,
    ContentType, FallbackState, FallbackTrigger, MergeCandidate, MergePolicy, MergedResult,
    ProcessingAttempt, ProcessingZone, ResultSource, RunId, RunState, ScoreContext, ToolOutput,
    Zone, ZoneId, ZoneResult, ZoneStatus, ZoneWarning,
};
