//! Confidence engine: normalization, weighting, calibration, explanation.
//!
//! Every stage is pure. A score records the weight version and fingerprint it
//! was computed with, and the attempt stores the [`ScoreContext`], so
//! [`ConfidenceEngine::rescore`] reproduces any historical score exactly.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use zoneflow_shared::{
    ConfidenceConfig, ConfidenceFactor, ConfidenceScore, ContentType, EngineConfig,
    FactorWeights, ProcessingAttempt, Result, ScoreContext, ZoneflowError,
};

use crate::calibration::{BinnedCalibrator, Calibrator, IdentityCalibrator};
use crate::normalize::Normalizer;

/// Reliability assumed for a tool with no capability entry and no history.
const DEFAULT_RELIABILITY: f64 = 0.5;

/// What the engine needs to know about one attempt.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInput<'a> {
    pub tool: &'a str,
    pub content_type: ContentType,
    /// Native confidence as reported by the tool.
    pub raw_confidence: Option<f64>,
}

pub struct ConfidenceEngine {
    config: ConfidenceConfig,
    agreement_threshold: f64,
    active: FactorWeights,
    normalizers: HashMap<String, Normalizer>,
    accuracy: HashMap<(String, ContentType), f64>,
    calibrator: Arc<dyn Calibrator>,
}

impl ConfidenceEngine {
    /// Build from config, loading the calibration history if one is configured.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let calibrator: Arc<dyn Calibrator> = match &config.confidence.calibration_file {
            Some(path) => Arc::new(BinnedCalibrator::load(
                Path::new(path),
                config.confidence.calibration_bins,
                config.confidence.calibration_min_samples,
            )?),
            None => Arc::new(IdentityCalibrator),
        };
        Self::new(config, calibrator)
    }

    pub fn new(config: &EngineConfig, calibrator: Arc<dyn Calibrator>) -> Result<Self> {
        let active = config.confidence.active_weights().copied().ok_or_else(|| {
            ZoneflowError::config(format!(
                "no weight set for active version {}",
                config.confidence.active_version
            ))
        })?;

        let normalizers = config
            .tools
            .iter()
            .map(|t| (t.name.clone(), Normalizer::from_tool(t)))
            .collect();
        let accuracy = config
            .tools
            .iter()
            .flat_map(|t| {
                t.capabilities
                    .iter()
                    .map(|c| ((t.name.clone(), c.content_type), c.accuracy))
            })
            .collect();

        debug!(
            version = active.version,
            calibrator = calibrator.name(),
            "confidence engine ready"
        );

        Ok(Self {
            config: config.confidence.clone(),
            agreement_threshold: config.merge.agreement_threshold,
            active,
            normalizers,
            accuracy,
            calibrator,
        })
    }

    pub fn active_weights(&self) -> &FactorWeights {
        &self.active
    }

    pub fn calibrator_name(&self) -> &'static str {
        self.calibrator.name()
    }

    // -----------------------------------------------------------------------
    // Stage 1: normalization
    // -----------------------------------------------------------------------

    /// Returns `(raw_score, normalized_score, signal_missing)`.
    ///
    /// A missing signal maps to the configured floor, never to 0 or 1.
    pub fn normalize(&self, tool: &str, raw: Option<f64>) -> (f64, f64, bool) {
        match raw.filter(|r| r.is_finite()) {
            Some(r) => {
                let normalizer = self.normalizers.get(tool).cloned().unwrap_or_default();
                (normalizer.to_unit(r), normalizer.normalize(r), false)
            }
            None => {
                let floor = self.config.missing_signal_floor;
                (floor, floor, true)
            }
        }
    }

    /// Historical accuracy for a tool and content type.
    pub fn reliability(&self, tool: &str, content_type: ContentType) -> f64 {
        self.calibrator
            .reliability(tool, content_type)
            .or_else(|| self.accuracy.get(&(tool.to_string(), content_type)).copied())
            .unwrap_or(DEFAULT_RELIABILITY)
    }

    // -----------------------------------------------------------------------
    // Stage 2: weighting
    // -----------------------------------------------------------------------

    /// Factor breakdown for a normalized score.
    pub fn factors(
        &self,
        input: &ScoreInput<'_>,
        normalized: f64,
        context: &ScoreContext,
        weights: &FactorWeights,
    ) -> Vec<ConfidenceFactor> {
        let n = normalized.clamp(0.0, 1.0);

        let reliability = self.reliability(input.tool, input.content_type);
        let tool_reliability = n * reliability;

        let complexity = context.complexity.clamp(0.0, 1.0);
        let content_complexity = n.powf(1.0 - 0.5 * complexity);

        let neighbor_mean = if context.neighbor_confidences.is_empty() {
            None
        } else {
            Some(
                context.neighbor_confidences.iter().sum::<f64>()
                    / context.neighbor_confidences.len() as f64,
            )
        };
        let contextual_agreement = match neighbor_mean {
            Some(m) if m >= self.config.high_confidence_level => {
                (n + self.config.contextual_bonus * m).min(1.0)
            }
            _ => n,
        };

        let cross_validation = match context.peer_agreement {
            Some(p) if p >= self.agreement_threshold => {
                (n + self.config.cross_validation_bonus * p).min(1.0)
            }
            _ => n,
        };

        let neighbor_text = match neighbor_mean {
            Some(m) => format!(
                "{} neighboring zone(s) averaging {m:.2}",
                context.neighbor_confidences.len()
            ),
            None => "no scored neighboring zones".to_string(),
        };
        let peer_text = match context.peer_agreement {
            Some(p) if p >= self.agreement_threshold => {
                format!("another tool agrees ({:.0}% similar)", p * 100.0)
            }
            Some(p) => format!("no agreeing tool (best match {:.0}% similar)", p * 100.0),
            None => "no other tool output to compare".to_string(),
        };

        vec![
            factor(
                "tool_reliability",
                weights.tool_reliability,
                tool_reliability,
                format!(
                    "{} historically {:.0}% accurate on {} content",
                    input.tool,
                    reliability * 100.0,
                    input.content_type
                ),
            ),
            factor(
                "content_complexity",
                weights.content_complexity,
                content_complexity,
                format!(
                    "{} content at complexity {complexity:.2} discounts less harshly",
                    input.content_type
                ),
            ),
            factor(
                "contextual_agreement",
                weights.contextual_agreement,
                contextual_agreement,
                neighbor_text,
            ),
            factor(
                "cross_validation",
                weights.cross_validation,
                cross_validation,
                peer_text,
            ),
        ]
    }

    // -----------------------------------------------------------------------
    // Full pipeline
    // -----------------------------------------------------------------------

    /// Score with the active weight set.
    pub fn score(&self, input: &ScoreInput<'_>, context: &ScoreContext) -> ConfidenceScore {
        self.score_with(input, context, &self.active)
    }

    /// Score with an explicit weight set.
    pub fn score_with(
        &self,
        input: &ScoreInput<'_>,
        context: &ScoreContext,
        weights: &FactorWeights,
    ) -> ConfidenceScore {
        let (raw_score, normalized_score, signal_missing) =
            self.normalize(input.tool, input.raw_confidence);

        let explanation = self.factors(input, normalized_score, context, weights);
        let weighted_score = unit(explanation.iter().map(|f| f.contribution).sum());

        // Stage 3: calibration
        let calibrated_score = unit(self.calibrator.calibrate(
            input.tool,
            input.content_type,
            weighted_score,
        ));

        ConfidenceScore {
            raw_score: unit(raw_score),
            normalized_score: unit(normalized_score),
            weighted_score,
            calibrated_score,
            final_confidence: calibrated_score,
            signal_missing,
            weights_version: weights.version,
            weights_fingerprint: weights.fingerprint(),
            explanation,
        }
    }

    /// Recompute a stored attempt's score with the weight version it recorded.
    /// Returns `None` for attempts that were never scored.
    pub fn rescore(
        &self,
        attempt: &ProcessingAttempt,
        content_type: ContentType,
    ) -> Result<Option<ConfidenceScore>> {
        let (Some(score), Some(context)) = (&attempt.score, &attempt.context) else {
            return Ok(None);
        };
        let weights = self.config.weights(score.weights_version).ok_or_else(|| {
            ZoneflowError::config(format!(
                "weight set version {} is no longer configured",
                score.weights_version
            ))
        })?;
        let input = ScoreInput {
            tool: &attempt.tool,
            content_type,
            raw_confidence: attempt.raw_confidence,
        };
        Ok(Some(self.score_with(&input, context, weights)))
    }
}

fn factor(name: &str, weight: f64, value: f64, description: String) -> ConfidenceFactor {
    let value = unit(value);
    ConfidenceFactor {
        name: name.to_string(),
        weight,
        value,
        contribution: weight * value,
        description,
    }
}

fn unit(v: f64) -> f64 {
    if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use zoneflow_shared::{CapabilityConfig, CurveConfig, ToolConfig};

    use super::*;
    use crate::calibration::CalibrationSample;

    fn tool(name: &str, range: [f64; 2], accuracy: f64) -> ToolConfig {
        ToolConfig {
            name: name.into(),
            max_concurrency: None,
            memory_mb: 128,
            confidence_range: range,
            curve: CurveConfig::Linear,
            command: None,
            capabilities: vec![CapabilityConfig {
                content_type: ContentType::Table,
                accuracy,
                speed: 1.0,
                complexity: 0.6,
            }],
        }
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.tools = vec![tool("paddle", [0.0, 1.0], 0.9), tool("tess", [0.0, 100.0], 0.8)];
        config.engine.default_tool = "paddle".into();
        config
    }

    fn table_input(raw: Option<f64>) -> ScoreInput<'static> {
        ScoreInput {
            tool: "paddle",
            content_type: ContentType::Table,
            raw_confidence: raw,
        }
    }

    fn table_context() -> ScoreContext {
        ScoreContext {
            complexity: 0.6,
            ..ScoreContext::default()
        }
    }

    #[test]
    fn weighted_pipeline_values() {
        let engine = ConfidenceEngine::from_config(&config()).expect("engine");
        let high = engine.score(&table_input(Some(0.82)), &table_context());
        assert!((high.final_confidence - 0.797).abs() < 0.005, "got {}", high.final_confidence);

        let low = engine.score(&table_input(Some(0.55)), &table_context());
        assert!(low.final_confidence < 0.7);
        assert!(low.final_confidence > 0.5);
    }

    #[test]
    fn every_field_in_unit_interval() {
        let engine = ConfidenceEngine::from_config(&config()).expect("engine");
        for raw in [-1.0, 0.0, 0.3, 1.0, 5.0] {
            let ctx = ScoreContext {
                complexity: 1.0,
                neighbor_confidences: vec![1.0, 1.0],
                peer_agreement: Some(1.0),
            };
            let s = engine.score(&table_input(Some(raw)), &ctx);
            for v in [
                s.raw_score,
                s.normalized_score,
                s.weighted_score,
                s.calibrated_score,
                s.final_confidence,
            ] {
                assert!((0.0..=1.0).contains(&v), "{v} out of range");
            }
        }
    }

    #[test]
    fn missing_signal_uses_floor() {
        let engine = ConfidenceEngine::from_config(&config()).expect("engine");
        let s = engine.score(&table_input(None), &table_context());
        assert!(s.signal_missing);
        assert_eq!(s.normalized_score, 0.3);
        assert!(s.final_confidence > 0.0);
    }

    #[test]
    fn native_range_is_mapped() {
        let engine = ConfidenceEngine::from_config(&config()).expect("engine");
        let input = ScoreInput {
            tool: "tess",
            content_type: ContentType::Table,
            raw_confidence: Some(82.0),
        };
        let s = engine.score(&input, &table_context());
        assert!((s.normalized_score - 0.82).abs() < 1e-12);
    }

    #[test]
    fn neighbors_and_peers_add_bonus() {
        let engine = ConfidenceEngine::from_config(&config()).expect("engine");
        let base = engine.score(&table_input(Some(0.6)), &table_context());

        let with_neighbors = ScoreContext {
            neighbor_confidences: vec![0.9, 0.95],
            ..table_context()
        };
        let s = engine.score(&table_input(Some(0.6)), &with_neighbors);
        assert!(s.final_confidence > base.final_confidence);

        let weak_neighbors = ScoreContext {
            neighbor_confidences: vec![0.4],
            ..table_context()
        };
        let s = engine.score(&table_input(Some(0.6)), &weak_neighbors);
        assert_eq!(s.final_confidence, base.final_confidence);

        let agreeing = ScoreContext {
            peer_agreement: Some(0.95),
            ..table_context()
        };
        let s = engine.score(&table_input(Some(0.6)), &agreeing);
        assert!(s.final_confidence > base.final_confidence);
    }

    #[test]
    fn explanation_lists_every_factor() {
        let engine = ConfidenceEngine::from_config(&config()).expect("engine");
        let s = engine.score(&table_input(Some(0.7)), &table_context());
        let names: Vec<_> = s.explanation.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "tool_reliability",
                "content_complexity",
                "contextual_agreement",
                "cross_validation"
            ]
        );
        let sum: f64 = s.explanation.iter().map(|f| f.contribution).sum();
        assert!((sum - s.weighted_score).abs() < 1e-12);
        assert!(s.explanation.iter().all(|f| !f.description.is_empty()));
        assert!(s.summary().starts_with("confidence"));
    }

    #[test]
    fn rescore_reproduces_historical_version() {
        let mut cfg = config();
        let v1 = engine_score(&cfg);

        // Introduce v2 and make it active; v1 scores must stay reproducible.
        cfg.confidence.weight_sets.push(FactorWeights {
            version: 2,
            tool_reliability: 0.1,
            content_complexity: 0.3,
            contextual_agreement: 0.3,
            cross_validation: 0.3,
        });
        cfg.confidence.active_version = 2;
        let engine = ConfidenceEngine::from_config(&cfg).expect("engine");

        let attempt = ProcessingAttempt {
            index: 0,
            tool: "paddle".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_ms: 5,
            output: None,
            raw_confidence: Some(0.82),
            context: Some(table_context()),
            score: Some(v1.clone()),
            error: None,
            trigger: None,
        };
        let again = engine
            .rescore(&attempt, ContentType::Table)
            .expect("rescore")
            .expect("scored");
        assert_eq!(again, v1);

        let fresh = engine.score(&table_input(Some(0.82)), &table_context());
        assert_eq!(fresh.weights_version, 2);
        assert_ne!(fresh.weights_fingerprint, v1.weights_fingerprint);
    }

    fn engine_score(cfg: &EngineConfig) -> ConfidenceScore {
        ConfidenceEngine::from_config(cfg)
            .expect("engine")
            .score(&table_input(Some(0.82)), &table_context())
    }

    #[test]
    fn calibration_adjusts_and_supplies_reliability() {
        let samples: Vec<_> = (0..40)
            .map(|i| {
                let p = 0.2 + i as f64 * 0.02;
                CalibrationSample {
                    tool: "paddle".into(),
                    content_type: ContentType::Table,
                    predicted: p,
                    actual: (p - 0.15).max(0.0),
                }
            })
            .collect();
        let calibrator = Arc::new(BinnedCalibrator::fit(&samples, 10, 10));
        let engine = ConfidenceEngine::new(&config(), calibrator).expect("engine");
        let identity = ConfidenceEngine::from_config(&config()).expect("engine");

        let calibrated = engine.score(&table_input(Some(0.82)), &table_context());
        let raw = identity.score(&table_input(Some(0.82)), &table_context());
        assert!(calibrated.final_confidence < raw.final_confidence);
        assert_eq!(engine.calibrator_name(), "binned");
    }
}
