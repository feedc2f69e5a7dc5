//! Components shared by every run of one controller.

use std::sync::Arc;

use tracing::{debug, warn};

use zoneflow_merge::{MergeOutcome, ResultMerger, best_agreement};
use zoneflow_scheduler::ResourceManager;
use zoneflow_scoring::{
    ConfidenceEngine, PriorityCalculator, PriorityInputs, ScoreInput, normalize_time,
};
use zoneflow_shared::{
    CandidateQuality, EngineConfig, MergeCandidate, ProcessingZone, Result, ZoneResult, ZoneStatus,
};
use zoneflow_tools::{CapabilityRegistry, ToolAssignmentEngine, ToolRegistry};

use crate::events::{EngineObserver, ProgressSnapshot, ZoneFailure};
use crate::fallback::FallbackManager;
use crate::results::ResultSink;

/// Something to tell observers and the sink once the run lock is released.
#[derive(Debug)]
pub(crate) enum Notice {
    Progress(ProgressSnapshot),
    Finished {
        result: Box<ZoneResult>,
        failure: Option<ZoneFailure>,
    },
}

pub(crate) struct Engine {
    pub config: Arc<EngineConfig>,
    pub registry: ToolRegistry,
    pub capabilities: Arc<CapabilityRegistry>,
    pub assignment: ToolAssignmentEngine,
    pub priority: PriorityCalculator,
    pub confidence: ConfidenceEngine,
    pub merger: ResultMerger,
    pub fallback: FallbackManager,
    pub observers: Vec<Arc<dyn EngineObserver>>,
    pub sink: Arc<dyn ResultSink>,
}

impl Engine {
    pub fn workers(&self) -> usize {
        self.config.engine.max_concurrency.max(1) as usize
    }

    pub fn is_known_tool(&self, tool: &str) -> bool {
        self.config.tool(tool).is_some() || self.registry.contains(tool)
    }

    /// Scheduling priority for running `zone` on `tool`.
    pub fn priority_for(
        &self,
        zone: &ProcessingZone,
        tool: &str,
        dependents: usize,
        resources: &ResourceManager,
    ) -> f64 {
        let content_type = zone.zone.content_type;
        let slowest = self.capabilities.slowest_seconds();
        let expected = self
            .capabilities
            .expected_seconds(tool, content_type)
            .unwrap_or(slowest);
        self.priority.priority(&PriorityInputs {
            complexity: self.capabilities.complexity(content_type),
            availability: resources.tool_availability(tool),
            user_priority: zone.zone.user_priority(),
            dependency_weight: self.priority.dependency_weight(dependents),
            time_estimate: normalize_time(expected, slowest),
        })
    }

    /// Offer every successful attempt to the merger. The merged confidence is
    /// raised to a rescore of the strongest contributor that credits the
    /// agreement it found.
    pub fn merge_attempts(&self, zone: &ProcessingZone) -> Result<MergeOutcome> {
        let candidates: Vec<MergeCandidate> = zone
            .attempts
            .iter()
            .filter(|a| a.succeeded())
            .filter_map(|a| {
                let output = a.output.as_ref()?;
                let score = a.score.as_ref()?;
                Some(MergeCandidate {
                    attempt_index: a.index,
                    tool: a.tool.clone(),
                    content: output.content.clone(),
                    confidence: score.final_confidence,
                    quality: CandidateQuality {
                        normalized_score: score.normalized_score,
                        content_chars: output.content.chars().count(),
                        duration_ms: a.duration_ms,
                    },
                })
            })
            .collect();

        let mut outcome = self.merger.merge(&candidates, zone.zone.content_type)?;
        if let MergeOutcome::Merged(merged) = &mut outcome {
            let lead = candidates
                .iter()
                .filter(|c| merged.contributors.contains(&c.attempt_index))
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
            let lead = lead
                .and_then(|c| zone.attempts.get(c.attempt_index as usize))
                .and_then(|a| a.context.as_ref().map(|ctx| (a, ctx)));
            if let Some((attempt, context)) = lead {
                let others = candidates
                    .iter()
                    .filter(|c| {
                        c.attempt_index != attempt.index
                            && merged.contributors.contains(&c.attempt_index)
                    })
                    .map(|c| c.content.as_str());
                let mut context = context.clone();
                context.peer_agreement = best_agreement(&merged.content, others);
                let rescored = self.confidence.score(
                    &ScoreInput {
                        tool: &attempt.tool,
                        content_type: zone.zone.content_type,
                        raw_confidence: attempt.raw_confidence,
                    },
                    &context,
                );
                debug!(
                    merged = merged.confidence,
                    rescored = rescored.final_confidence,
                    "rescored merged result"
                );
                merged.confidence = merged.confidence.max(rescored.final_confidence);
            }
        }
        Ok(outcome)
    }

    /// Deliver notices to the sink and observers. Never called under the run lock.
    pub fn emit(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::Progress(snapshot) => {
                    for o in &self.observers {
                        o.on_progress(&snapshot);
                    }
                }
                Notice::Finished { result, failure } => {
                    if let Err(e) = self.sink.deliver(&result) {
                        warn!(zone_id = %result.zone_id, error = %e, "result hand-off failed");
                    }
                    match (result.status, &failure) {
                        (ZoneStatus::Completed, _) => {
                            for o in &self.observers {
                                o.on_zone_completed(&result.zone_id, &result);
                            }
                        }
                        (ZoneStatus::Failed, Some(failure)) => {
                            for o in &self.observers {
                                o.on_zone_failed(&result.zone_id, failure);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
