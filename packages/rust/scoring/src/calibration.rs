//! Confidence calibration against historical ground truth.
//!
//! [`IdentityCalibrator`] is the cold-start default. [`BinnedCalibrator`]
//! builds per (tool, content type) reliability curves from
//! `(predicted, actual)` samples.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use zoneflow_shared::{ContentType, Result, ZoneflowError};

/// One historical observation: what we predicted and how accurate the
/// extraction turned out to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub tool: String,
    pub content_type: ContentType,
    pub predicted: f64,
    pub actual: f64,
}

/// Adjusts weighted confidence using historical data.
pub trait Calibrator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Calibrated score in [0,1].
    fn calibrate(&self, tool: &str, content_type: ContentType, score: f64) -> f64;

    /// Observed mean accuracy for the key, if enough history exists.
    fn reliability(&self, _tool: &str, _content_type: ContentType) -> Option<f64> {
        None
    }
}

/// No-op calibration.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCalibrator;

impl Calibrator for IdentityCalibrator {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn calibrate(&self, _tool: &str, _content_type: ContentType, score: f64) -> f64 {
        score.clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// Binned reliability curves
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ReliabilityCurve {
    /// `(mean predicted, mean actual)` per populated bin, sorted by predicted.
    points: Vec<(f64, f64)>,
    mean_accuracy: f64,
}

impl ReliabilityCurve {
    fn apply(&self, score: f64) -> f64 {
        let (Some(first), Some(last)) = (self.points.first(), self.points.last()) else {
            return score;
        };
        if score <= first.0 {
            return first.1;
        }
        if score >= last.0 {
            return last.1;
        }
        for w in self.points.windows(2) {
            let ((x0, y0), (x1, y1)) = (w[0], w[1]);
            if score <= x1 {
                if x1 - x0 <= f64::EPSILON {
                    return y1;
                }
                return y0 + (score - x0) / (x1 - x0) * (y1 - y0);
            }
        }
        last.1
    }
}

/// Equal-width histogram calibration per (tool, content type).
#[derive(Debug, Clone, Default)]
pub struct BinnedCalibrator {
    curves: HashMap<(String, ContentType), ReliabilityCurve>,
}

impl BinnedCalibrator {
    /// Fit curves from samples. Keys with fewer than `min_samples`
    /// observations are left uncalibrated.
    pub fn fit(samples: &[CalibrationSample], bins: u32, min_samples: u32) -> Self {
        let bins = bins.max(1) as usize;
        let mut grouped: HashMap<(String, ContentType), Vec<&CalibrationSample>> = HashMap::new();
        for s in samples {
            if s.predicted.is_finite() && s.actual.is_finite() {
                grouped
                    .entry((s.tool.clone(), s.content_type))
                    .or_default()
                    .push(s);
            }
        }

        let mut curves = HashMap::new();
        for (key, group) in grouped {
            if group.len() < min_samples as usize {
                debug!(tool = %key.0, content_type = %key.1, samples = group.len(), "too few samples, leaving uncalibrated");
                continue;
            }

            // (sum predicted, sum actual, count) per bin
            let mut acc = vec![(0.0, 0.0, 0usize); bins];
            for s in &group {
                let p = s.predicted.clamp(0.0, 1.0);
                let idx = ((p * bins as f64) as usize).min(bins - 1);
                acc[idx].0 += p;
                acc[idx].1 += s.actual.clamp(0.0, 1.0);
                acc[idx].2 += 1;
            }
            let points = acc
                .into_iter()
                .filter(|(_, _, n)| *n > 0)
                .map(|(p, a, n)| (p / n as f64, a / n as f64))
                .collect();
            let mean_accuracy =
                group.iter().map(|s| s.actual.clamp(0.0, 1.0)).sum::<f64>() / group.len() as f64;

            curves.insert(
                key,
                ReliabilityCurve {
                    points,
                    mean_accuracy,
                },
            );
        }

        Self { curves }
    }

    /// Load samples from a JSON array file and fit.
    pub fn load(path: &Path, bins: u32, min_samples: u32) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ZoneflowError::io(path, e))?;
        let samples: Vec<CalibrationSample> = serde_json::from_str(&content).map_err(|e| {
            ZoneflowError::config(format!(
                "invalid calibration history {}: {e}",
                path.display()
            ))
        })?;
        let calibrator = Self::fit(&samples, bins, min_samples);
        info!(
            path = %path.display(),
            samples = samples.len(),
            keys = calibrator.curves.len(),
            "loaded calibration history"
        );
        Ok(calibrator)
    }

    pub fn is_calibrated(&self, tool: &str, content_type: ContentType) -> bool {
        self.curves.contains_key(&(tool.to_string(), content_type))
    }
}

impl Calibrator for BinnedCalibrator {
    fn name(&self) -> &'static str {
        "binned"
    }

    fn calibrate(&self, tool: &str, content_type: ContentType, score: f64) -> f64 {
        let score = score.clamp(0.0, 1.0);
        match self.curves.get(&(tool.to_string(), content_type)) {
            Some(curve) => curve.apply(score).clamp(0.0, 1.0),
            None => score,
        }
    }

    fn reliability(&self, tool: &str, content_type: ContentType) -> Option<f64> {
        self.curves
            .get(&(tool.to_string(), content_type))
            .map(|c| c.mean_accuracy)
    }
}
