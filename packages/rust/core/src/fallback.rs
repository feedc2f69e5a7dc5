//! Fallback manager.
//!
//! Per zone: `NotStarted → Attempting(tool) → {Succeeded | LowConfidence |
//! Failed} → Attempting(next) → … → Exhausted`. This module only decides;
//! the controller owns the zone record and applies the decision.

use std::sync::Arc;
use std::time::Duration;

use zoneflow_shared::{
    BackoffPolicy, ContentType, EngineConfig, ErrorKind, FallbackState, FallbackStrategy,
    FallbackTrigger, ProcessingZone, ToolOutput, Zone, ZoneflowError,
};

/// What to do after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackDecision {
    /// Threshold met; stop.
    Complete,
    /// Try `tool` after `delay`.
    Retry {
        tool: String,
        delay: Duration,
        trigger: FallbackTrigger,
    },
    /// No tools or attempts left.
    Exhausted { trigger: FallbackTrigger },
}

#[derive(Debug, Clone)]
pub struct FallbackManager {
    config: Arc<EngineConfig>,
}

impl FallbackManager {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    pub fn strategy(&self, content_type: ContentType) -> &FallbackStrategy {
        self.config.strategy_for(content_type)
    }

    pub fn threshold(&self, content_type: ContentType) -> f64 {
        self.strategy(content_type).confidence_threshold
    }

    /// Trigger for a failed tool call.
    pub fn classify_error(error: &ZoneflowError) -> FallbackTrigger {
        match error.kind() {
            ErrorKind::ToolTimeout => FallbackTrigger::ToolTimeout,
            _ => FallbackTrigger::ToolError,
        }
    }

    /// Structural checks on tool output, before scoring.
    pub fn validate_output(zone: &Zone, output: &ToolOutput) -> Option<(FallbackTrigger, String)> {
        if output.content.trim().is_empty() {
            return Some((
                FallbackTrigger::ValidationFailure,
                "tool returned empty content".to_string(),
            ));
        }
        match output.detected_content_type {
            Some(detected) if detected != zone.content_type => Some((
                FallbackTrigger::ContentMismatch,
                format!(
                    "tool detected {detected} but zone is classified {}",
                    zone.content_type
                ),
            )),
            _ => None,
        }
    }

    /// Trigger for a successfully scored attempt, if it falls short.
    pub fn classify_confidence(&self, content_type: ContentType, confidence: f64) -> Option<FallbackTrigger> {
        (confidence < self.threshold(content_type)).then_some(FallbackTrigger::LowConfidence)
    }

    /// State after an attempt concluded with `trigger`.
    pub fn state_after(trigger: Option<FallbackTrigger>) -> FallbackState {
        match trigger {
            None => FallbackState::Succeeded,
            Some(FallbackTrigger::LowConfidence) => FallbackState::LowConfidence,
            Some(_) => FallbackState::Failed,
        }
    }

    /// Delay before retry number `retry` (0-based): `base × multiplier^retry`, capped.
    pub fn backoff(policy: &BackoffPolicy, retry: u32) -> Duration {
        let factor = policy.multiplier.max(1.0).powi(retry.min(64) as i32);
        let ms = (policy.base_ms as f64 * factor).min(policy.max_ms as f64);
        Duration::from_millis(ms.max(0.0) as u64)
    }

    /// Next untried tool in the zone's chain.
    pub fn next_tool(zone: &ProcessingZone) -> Option<&str> {
        let tried = zone.tried_tools();
        zone.fallback_chain
            .iter()
            .map(String::as_str)
            .find(|t| !tried.contains(t))
    }

    /// Decide after the latest attempt. `budget` is the number of attempts the
    /// zone may make in total.
    pub fn decide(
        &self,
        zone: &ProcessingZone,
        trigger: Option<FallbackTrigger>,
        budget: u32,
    ) -> FallbackDecision {
        let Some(trigger) = trigger else {
            return FallbackDecision::Complete;
        };
        let made = zone.attempts.len() as u32;
        if made >= budget {
            return FallbackDecision::Exhausted { trigger };
        }
        match Self::next_tool(zone) {
            Some(tool) => {
                let strategy = self.strategy(zone.zone.content_type);
                FallbackDecision::Retry {
                    tool: tool.to_string(),
                    delay: Self::backoff(&strategy.backoff, made.saturating_sub(1)),
                    trigger,
                }
            }
            None => FallbackDecision::Exhausted { trigger },
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use zoneflow_shared::{BoundingBox, ProcessingAttempt};

    use super::*;

    fn zone(content_type: ContentType) -> Zone {
        Zone {
            id: "z".into(),
            page_number: 1,
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 1.0,
                height: 1.0,
                page_width: 1.0,
                page_height: 1.0,
            },
            content_type,
            user_priority: None,
            depends_on: vec![],
        }
    }

    fn attempt(index: u32, tool: &str) -> ProcessingAttempt {
        ProcessingAttempt {
            index,
            tool: tool.into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_ms: 1,
            output: None,
            raw_confidence: None,
            context: None,
            score: None,
            error: None,
            trigger: None,
        }
    }

    fn manager() -> FallbackManager {
        FallbackManager::new(Arc::new(EngineConfig::default()))
    }

    fn processing(chain: &[&str]) -> ProcessingZone {
        ProcessingZone::new(
            Arc::new(zone(ContentType::Table)),
            "primary".into(),
            chain.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            base_ms: 100,
            multiplier: 2.0,
            max_ms: 500,
        };
        let delays: Vec<u64> = (0..5)
            .map(|n| FallbackManager::backoff(&policy, n).as_millis() as u64)
            .collect();
        assert_eq!(delays, [100, 200, 400, 500, 500]);
        assert_eq!(FallbackManager::backoff(&policy, u32::MAX).as_millis(), 500);
    }

    #[test]
    fn complete_when_no_trigger() {
        let z = processing(&["b"]);
        assert_eq!(manager().decide(&z, None, 3), FallbackDecision::Complete);
    }

    #[test]
    fn retries_next_untried_tool() {
        let mut z = processing(&["b", "c"]);
        z.attempts.push(attempt(0, "primary"));
        match manager().decide(&z, Some(FallbackTrigger::LowConfidence), 3) {
            FallbackDecision::Retry { tool, trigger, .. } => {
                assert_eq!(tool, "b");
                assert_eq!(trigger, FallbackTrigger::LowConfidence);
            }
            other => panic!("expected retry, got {other:?}"),
        }

        z.attempts.push(attempt(1, "b"));
        assert!(matches!(
            manager().decide(&z, Some(FallbackTrigger::ToolError), 3),
            FallbackDecision::Retry { ref tool, .. } if tool == "c"
        ));
    }

    #[test]
    fn exhausts_on_budget_or_empty_chain() {
        let mut z = processing(&["b", "c"]);
        z.attempts.push(attempt(0, "primary"));
        z.attempts.push(attempt(1, "b"));
        assert_eq!(
            manager().decide(&z, Some(FallbackTrigger::ToolTimeout), 2),
            FallbackDecision::Exhausted {
                trigger: FallbackTrigger::ToolTimeout
            }
        );

        let mut z = processing(&[]);
        z.attempts.push(attempt(0, "primary"));
        assert!(matches!(
            manager().decide(&z, Some(FallbackTrigger::LowConfidence), 3),
            FallbackDecision::Exhausted { .. }
        ));
    }

    #[test]
    fn output_validation_triggers() {
        let z = zone(ContentType::Table);
        let empty = ToolOutput::new("   ", Some(0.9));
        assert_eq!(
            FallbackManager::validate_output(&z, &empty).map(|(t, _)| t),
            Some(FallbackTrigger::ValidationFailure)
        );

        let mut mismatch = ToolOutput::new("a picture", Some(0.9));
        mismatch.detected_content_type = Some(ContentType::Image);
        assert_eq!(
            FallbackManager::validate_output(&z, &mismatch).map(|(t, _)| t),
            Some(FallbackTrigger::ContentMismatch)
        );

        let ok = ToolOutput::new("| a | b |", Some(0.9));
        assert!(FallbackManager::validate_output(&z, &ok).is_none());
    }

    #[test]
    fn error_and_confidence_classification() {
        let timeout = ZoneflowError::ToolTimeout {
            tool: "t".into(),
            timeout_ms: 10,
        };
        assert_eq!(FallbackManager::classify_error(&timeout), FallbackTrigger::ToolTimeout);
        let failed = ZoneflowError::ToolExecution {
            tool: "t".into(),
            message: "boom".into(),
        };
        assert_eq!(FallbackManager::classify_error(&failed), FallbackTrigger::ToolError);

        let m = manager();
        assert_eq!(
            m.classify_confidence(ContentType::Table, 0.55),
            Some(FallbackTrigger::LowConfidence)
        );
        assert_eq!(m.classify_confidence(ContentType::Table, 0.7), None);
        assert_eq!(
            FallbackManager::state_after(Some(FallbackTrigger::ToolError)),
            FallbackState::Failed
        );
    }
}
