//! Scoring for Zoneflow: zone priorities and attempt confidence.
//!
//! Everything here is a pure function of its inputs plus immutable
//! configuration, so it is safe to share across workers without locking.

pub mod calibration;
pub mod confidence;
pub mod normalize;
pub mod priority;

pub use calibration::{BinnedCalibrator, CalibrationSample, Calibrator, IdentityCalibrator};
pub use confidence::{ConfidenceEngine, ScoreInput};
pub use normalize::Normalizer;
pub use priority::{
    Multiplicative, PriorityCalculator, PriorityInputs, PriorityStrategy, WeightedSum,
    normalize_time,
};
