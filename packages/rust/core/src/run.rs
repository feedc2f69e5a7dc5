//! Per-run state: the zone table, the queue, and every transition on them.
//!
//! Everything here runs under the run's lock and never awaits. Transitions
//! return [`Notice`]s that the caller emits after releasing the lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use zoneflow_merge::MergeOutcome;
use zoneflow_scheduler::{ProcessingQueue, ResourceManager, ResourceToken};
use zoneflow_shared::{
    ErrorKind, FallbackState, ProcessingAttempt, ProcessingZone, Result, ResultSource, RunId,
    RunState, Zone, ZoneId, ZoneResult, ZoneStatus, ZoneWarning, ZoneflowError,
};

use crate::engine::{Engine, Notice};
use crate::events::{ProgressSnapshot, ProgressTracker, ZoneFailure};
use crate::fallback::{FallbackDecision, FallbackManager};
use crate::results::HandoffLedger;

/// Shared handle to one run.
pub(crate) struct Run {
    pub id: RunId,
    pub inner: Mutex<RunInner>,
    /// Wakes parked workers on any state change.
    pub wake: Notify,
    pub cancel: CancellationToken,
    pub resources: ResourceManager,
    pub workers: Mutex<Vec<JoinHandle<()>>>,
}

pub(crate) struct ZoneEntry {
    pub pz: ProcessingZone,
    /// Total attempts this zone may make.
    pub budget: u32,
    /// Tool for the next dispatch.
    pub next_tool: String,
    pub dependents: usize,
    pub neighbors: Vec<ZoneId>,
    pub first_dispatch: Option<Instant>,
    pub merge: Option<MergeOutcome>,
    pub low_confidence: bool,
    pub result: Option<ZoneResult>,
}

/// Work handed to a worker by [`RunInner::try_dispatch`].
pub(crate) struct Dispatch {
    pub zone: Arc<Zone>,
    pub tool: String,
    pub index: u32,
    pub timeout: Duration,
    pub token: ResourceToken,
}

/// What the worker does after an attempt is concluded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Conclusion {
    Done,
    Backoff(Duration),
}

/// Inputs gathered from the zone table for scoring an attempt.
pub(crate) struct ScoringView {
    pub neighbor_confidences: Vec<f64>,
    pub peer_contents: Vec<String>,
}

pub(crate) struct RunInner {
    pub state: RunState,
    pub zones: HashMap<ZoneId, ZoneEntry>,
    /// Zone ids in input order.
    pub order: Vec<ZoneId>,
    pub queue: ProcessingQueue,
    pub in_flight: usize,
    pub backing_off: usize,
    pub live_workers: usize,
    ledger: HandoffLedger,
    tracker: ProgressTracker,
}

impl RunInner {
    pub fn new(engine: &Engine, zones: Vec<Zone>, resources: &ResourceManager) -> Result<Self> {
        let mut ids = HashSet::with_capacity(zones.len());
        for z in &zones {
            if !ids.insert(z.id.clone()) {
                return Err(ZoneflowError::validation(format!("duplicate zone id '{}'", z.id)));
            }
        }

        let mut dependents: HashMap<ZoneId, usize> = HashMap::new();
        for z in &zones {
            for d in z.depends_on.iter().filter(|d| **d != z.id && ids.contains(*d)) {
                *dependents.entry(d.clone()).or_default() += 1;
            }
        }

        let neighbor_gap = engine.config.engine.neighbor_gap;
        let mut neighbors: HashMap<ZoneId, Vec<ZoneId>> = HashMap::new();
        for a in &zones {
            let list = zones
                .iter()
                .filter(|b| b.id != a.id)
                .filter(|b| a.is_neighbor_of(b, neighbor_gap) || a.depends_on.contains(&b.id))
                .map(|b| b.id.clone())
                .collect();
            neighbors.insert(a.id.clone(), list);
        }

        let mut inner = Self {
            state: RunState::Running,
            zones: HashMap::with_capacity(zones.len()),
            order: Vec::with_capacity(zones.len()),
            queue: ProcessingQueue::new(),
            in_flight: 0,
            backing_off: 0,
            live_workers: 0,
            ledger: HandoffLedger::default(),
            tracker: ProgressTracker::new(),
        };

        for zone in zones {
            let id = zone.id.clone();
            let assignment = engine.assignment.assign(&zone);
            let budget = engine.fallback.strategy(zone.content_type).max_attempts.max(1);
            let mut pz = ProcessingZone::new(
                Arc::new(zone),
                assignment.primary.clone(),
                assignment.fallback_chain,
            );
            if let Some(w) = assignment.warning {
                pz.warnings.push(w);
            }

            let (known, unknown): (Vec<ZoneId>, Vec<ZoneId>) = pz
                .dependencies
                .drain(..)
                .partition(|d| *d != id && ids.contains(d));
            pz.dependencies = known;
            for d in unknown {
                warn!(zone_id = %id, dependency = %d, "ignoring unknown dependency");
                pz.warnings.push(ZoneWarning::UnknownDependency { zone_id: d });
            }

            let fan_out = dependents.get(&id).copied().unwrap_or(0);
            pz.priority = engine.priority_for(&pz, &assignment.primary, fan_out, resources);
            inner.queue.enqueue(id.clone(), pz.priority, &pz.dependencies);

            inner.zones.insert(
                id.clone(),
                ZoneEntry {
                    pz,
                    budget,
                    next_tool: assignment.primary,
                    dependents: fan_out,
                    neighbors: neighbors.remove(&id).unwrap_or_default(),
                    first_dispatch: None,
                    merge: None,
                    low_confidence: false,
                    result: None,
                },
            );
            inner.order.push(id);
        }
        Ok(inner)
    }

    /// Nothing queued, running or waiting to be requeued.
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.in_flight == 0 && self.backing_off == 0
    }

    /// Queued zones exist but every one waits on a dependency that can never
    /// finish.
    pub fn is_stalled(&self) -> bool {
        let status = self.queue.status();
        status.queued > 0 && status.ready == 0 && self.in_flight == 0 && self.backing_off == 0
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Pop the best ready zone that can get a resource token. On a memory
    /// refusal a cheaper untried tool from the zone's chain is used instead.
    pub fn try_dispatch(&mut self, engine: &Engine, resources: &ResourceManager) -> Option<Dispatch> {
        let Self {
            queue,
            zones,
            in_flight,
            ..
        } = self;
        let (entry, (tool, token, degraded_from)) = queue.dequeue_next_with(|entry| {
            let e = zones.get(&entry.zone_id)?;
            acquire(engine, resources, e)
        })?;

        let e = zones.get_mut(&entry.zone_id)?;
        if let Some(from) = degraded_from {
            warn!(
                zone_id = %entry.zone_id,
                from = %from,
                to = %tool,
                "memory budget exceeded, degrading to cheaper tool"
            );
            e.pz.warnings.push(ZoneWarning::Degraded {
                from,
                to: tool.clone(),
            });
        }
        let index = e.pz.attempts.len() as u32;
        e.next_tool = tool.clone();
        e.pz.status = ZoneStatus::Processing;
        e.pz.fallback_state = FallbackState::Attempting {
            tool: tool.clone(),
            attempt: index + 1,
        };
        e.first_dispatch.get_or_insert_with(Instant::now);
        let timeout = Duration::from_millis(engine.fallback.strategy(e.pz.zone.content_type).timeout_ms);
        *in_flight += 1;

        Some(Dispatch {
            zone: Arc::clone(&e.pz.zone),
            tool,
            index,
            timeout,
            token,
        })
    }

    /// Neighbor confidences and earlier outputs for scoring an attempt.
    pub fn scoring_view(&self, zone_id: &ZoneId) -> ScoringView {
        let Some(e) = self.zones.get(zone_id) else {
            return ScoringView {
                neighbor_confidences: Vec::new(),
                peer_contents: Vec::new(),
            };
        };
        let neighbor_confidences = e
            .neighbors
            .iter()
            .filter_map(|n| self.zones.get(n))
            .filter(|n| n.pz.status == ZoneStatus::Completed)
            .filter_map(|n| n.result.as_ref().map(|r| r.final_confidence))
            .collect();
        let peer_contents = e
            .pz
            .attempts
            .iter()
            .filter(|a| a.succeeded())
            .filter_map(|a| a.output.as_ref().map(|o| o.content.clone()))
            .collect();
        ScoringView {
            neighbor_confidences,
            peer_contents,
        }
    }

    // -----------------------------------------------------------------------
    // Attempt outcome
    // -----------------------------------------------------------------------

    /// Record a finished attempt and move the zone's fallback state on.
    pub fn conclude(
        &mut self,
        engine: &Engine,
        run_id: RunId,
        zone_id: &ZoneId,
        attempt: ProcessingAttempt,
        notices: &mut Vec<Notice>,
    ) -> Conclusion {
        self.in_flight = self.in_flight.saturating_sub(1);
        let Some(e) = self.zones.get_mut(zone_id) else {
            return Conclusion::Done;
        };

        let content_type = e.pz.zone.content_type;
        let threshold = engine.fallback.threshold(content_type);
        let trigger = attempt.trigger;
        info!(
            zone_id = %zone_id,
            tool = %attempt.tool,
            attempt = attempt.index + 1,
            duration_ms = attempt.duration_ms,
            confidence = attempt.final_confidence(),
            trigger = trigger.map(|t| t.as_str()),
            "attempt finished"
        );
        e.pz.attempts.push(attempt);
        e.pz.fallback_state = FallbackManager::state_after(trigger);

        // Rebuilt on every conclusion; an earlier merge may name a stale kept attempt.
        e.merge = None;
        if e.pz.attempts.iter().filter(|a| a.succeeded()).count() >= 2 {
            match engine.merge_attempts(&e.pz) {
                Ok(outcome) => e.merge = Some(outcome),
                Err(err) => warn!(zone_id = %zone_id, error = %err, "merge failed"),
            }
        }

        if trigger.is_none() {
            self.finalize(engine, run_id, zone_id, ZoneStatus::Completed, notices);
            return Conclusion::Done;
        }

        let accepted = matches!(
            &e.merge,
            Some(MergeOutcome::Merged(m)) if m.confidence >= threshold
        );
        if accepted {
            info!(zone_id = %zone_id, "merged result meets threshold");
            self.finalize(engine, run_id, zone_id, ZoneStatus::Completed, notices);
            return Conclusion::Done;
        }

        match engine.fallback.decide(&e.pz, trigger, e.budget) {
            FallbackDecision::Complete => {
                self.finalize(engine, run_id, zone_id, ZoneStatus::Completed, notices);
                Conclusion::Done
            }
            FallbackDecision::Retry {
                tool,
                delay,
                trigger,
            } => {
                info!(
                    zone_id = %zone_id,
                    next_tool = %tool,
                    trigger = %trigger,
                    delay_ms = delay.as_millis() as u64,
                    "falling back"
                );
                e.next_tool = tool;
                self.backing_off += 1;
                Conclusion::Backoff(delay)
            }
            FallbackDecision::Exhausted { trigger } => {
                e.pz.fallback_state = FallbackState::Exhausted;
                let status = if e.pz.best_attempt().is_some() {
                    ZoneStatus::Completed
                } else {
                    ZoneStatus::Failed
                };
                info!(zone_id = %zone_id, trigger = %trigger, status = ?status, "fallback exhausted");
                self.finalize(engine, run_id, zone_id, status, notices);
                Conclusion::Done
            }
        }
    }

    /// Put a zone back in the queue after its backoff delay.
    pub fn requeue(&mut self, engine: &Engine, resources: &ResourceManager, zone_id: &ZoneId) {
        self.backing_off = self.backing_off.saturating_sub(1);
        let Some(e) = self.zones.get_mut(zone_id) else {
            return;
        };
        e.pz.status = ZoneStatus::Queued;
        e.pz.priority = engine.priority_for(&e.pz, &e.next_tool, e.dependents, resources);
        self.queue
            .enqueue(zone_id.clone(), e.pz.priority, &e.pz.dependencies);
    }

    /// Give up on a zone that was running or backing off when the run was
    /// cancelled.
    pub fn abandon(
        &mut self,
        engine: &Engine,
        run_id: RunId,
        zone_id: &ZoneId,
        was_backing_off: bool,
        notices: &mut Vec<Notice>,
    ) {
        if was_backing_off {
            self.backing_off = self.backing_off.saturating_sub(1);
        } else {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
        self.finalize(engine, run_id, zone_id, ZoneStatus::Cancelled, notices);
    }

    // -----------------------------------------------------------------------
    // Terminal states
    // -----------------------------------------------------------------------

    /// Move a zone to a terminal status, build its result and queue the
    /// hand-off.
    pub fn finalize(
        &mut self,
        engine: &Engine,
        run_id: RunId,
        zone_id: &ZoneId,
        status: ZoneStatus,
        notices: &mut Vec<Notice>,
    ) {
        let Some(e) = self.zones.get_mut(zone_id) else {
            return;
        };
        let content_type = e.pz.zone.content_type;
        let threshold = engine.fallback.threshold(content_type);
        e.pz.status = status;

        let best = e.pz.best_attempt();
        let best_confidence = best.and_then(|a| a.final_confidence()).unwrap_or(0.0);
        let explanation = best
            .and_then(|a| a.score.as_ref())
            .map(|s| s.explanation.clone())
            .unwrap_or_default();
        let (content, confidence, source) = match (&e.merge, best) {
            (Some(MergeOutcome::Merged(m)), _) if m.confidence >= best_confidence => (
                Some(m.content.clone()),
                m.confidence,
                ResultSource::Merged(m.clone()),
            ),
            (_, Some(b)) => (
                b.output.as_ref().map(|o| o.content.clone()),
                best_confidence,
                ResultSource::SingleAttempt {
                    attempt_index: b.index,
                    tool: b.tool.clone(),
                },
            ),
            (_, None) => (None, 0.0, ResultSource::None),
        };
        let conflicts = e
            .merge
            .as_ref()
            .map(|m| m.conflicts().to_vec())
            .unwrap_or_default();

        e.pz.warnings.retain(|w| {
            !matches!(
                w,
                ZoneWarning::LowConfidence { .. } | ZoneWarning::MergeConflictUnresolved { .. }
            )
        });
        e.low_confidence = status == ZoneStatus::Completed && confidence < threshold;
        if e.low_confidence {
            e.pz.warnings.push(ZoneWarning::LowConfidence {
                confidence,
                threshold,
            });
        }
        if status == ZoneStatus::Completed && !conflicts.is_empty() {
            e.pz.warnings.push(ZoneWarning::MergeConflictUnresolved {
                conflicts: conflicts.len(),
            });
        }

        let result = ZoneResult {
            run_id,
            zone_id: zone_id.clone(),
            content_type,
            status,
            low_confidence: e.low_confidence,
            content,
            final_confidence: confidence,
            source,
            explanation,
            conflicts,
            warnings: e.pz.warnings.clone(),
            attempts: e.pz.attempts.clone(),
            completed_at: Utc::now(),
        };
        let failure = (status == ZoneStatus::Failed).then(|| failure_of(&e.pz));
        e.result = Some(result.clone());
        if let Some(started) = e.first_dispatch {
            self.tracker.record(started.elapsed());
        }

        info!(
            zone_id = %zone_id,
            status = ?status,
            confidence,
            low_confidence = result.low_confidence,
            attempts = result.attempts.len(),
            "zone finished"
        );

        self.queue.resolve(zone_id);
        if self.ledger.claim(zone_id, result.attempts.len()) {
            notices.push(Notice::Finished {
                result: Box::new(result),
                failure,
            });
        }
    }

    /// Cancel every queued zone.
    pub fn cancel_queued(&mut self, engine: &Engine, run_id: RunId, notices: &mut Vec<Notice>) {
        for zone_id in self.queue.cancel_all() {
            self.finalize(engine, run_id, &zone_id, ZoneStatus::Cancelled, notices);
        }
    }

    // -----------------------------------------------------------------------
    // Progress
    // -----------------------------------------------------------------------

    pub fn snapshot(&mut self, run_id: RunId, workers: usize) -> ProgressSnapshot {
        let mut counts = [0usize; 5];
        let mut low_confidence = 0;
        let mut confidence_sum = 0.0;
        for e in self.zones.values() {
            let slot = match e.pz.status {
                ZoneStatus::Queued => 0,
                ZoneStatus::Processing => 1,
                ZoneStatus::Completed => 2,
                ZoneStatus::Failed => 3,
                ZoneStatus::Cancelled => 4,
            };
            counts[slot] += 1;
            if e.pz.status == ZoneStatus::Completed {
                if e.low_confidence {
                    low_confidence += 1;
                }
                confidence_sum += e.result.as_ref().map_or(0.0, |r| r.final_confidence);
            }
        }
        let [queued, processing, completed, failed, cancelled] = counts;
        let remaining = queued + processing;
        let average_confidence = if completed == 0 {
            0.0
        } else {
            confidence_sum / completed as f64
        };
        let eta = match self.state {
            RunState::Running | RunState::Paused => self.tracker.eta(remaining, workers),
            RunState::Completed | RunState::Cancelled => Some(Duration::ZERO),
        };
        ProgressSnapshot {
            run_id,
            seq: self.tracker.next_seq(),
            run_state: self.state,
            total_zones: self.zones.len(),
            queued,
            processing,
            completed,
            failed,
            cancelled,
            low_confidence,
            average_confidence,
            estimated_time_remaining_ms: eta.map(|d| d.as_millis() as u64),
            throughput_rate: self.tracker.throughput(),
            elapsed_ms: self.tracker.elapsed().as_millis() as u64,
        }
    }

    pub fn progress(&mut self, run_id: RunId, workers: usize, notices: &mut Vec<Notice>) {
        notices.push(Notice::Progress(self.snapshot(run_id, workers)));
    }

    /// Results of terminal zones, in input order.
    pub fn results(&self) -> Vec<ZoneResult> {
        self.order
            .iter()
            .filter_map(|id| self.zones.get(id))
            .filter(|e| e.pz.status.is_terminal())
            .filter_map(|e| e.result.clone())
            .collect()
    }
}

/// Token for the zone's next tool, or for a cheaper untried tool when the
/// memory budget refuses it.
fn acquire(
    engine: &Engine,
    resources: &ResourceManager,
    e: &ZoneEntry,
) -> Option<(String, ResourceToken, Option<String>)> {
    let tool = e.next_tool.as_str();
    let needed = engine.capabilities.memory_mb(tool);
    match resources.try_acquire(tool, needed) {
        Ok(token) => Some((tool.to_string(), token, None)),
        Err(refusal) if refusal.is_memory() => {
            let tried = e.pz.tried_tools();
            e.pz.fallback_chain
                .iter()
                .filter(|c| c.as_str() != tool && !tried.contains(&c.as_str()))
                .filter(|c| engine.capabilities.memory_mb(c) < needed)
                .find_map(|c| {
                    resources
                        .try_acquire(c, engine.capabilities.memory_mb(c))
                        .ok()
                        .map(|token| (c.clone(), token, Some(tool.to_string())))
                })
        }
        Err(_) => None,
    }
}

fn failure_of(pz: &ProcessingZone) -> ZoneFailure {
    let last_error = pz.attempts.iter().rev().find_map(|a| a.error.as_ref());
    match last_error {
        Some(err) => ZoneFailure {
            kind: err.kind,
            message: err.message.clone(),
            attempts: pz.attempts.len(),
        },
        None => ZoneFailure {
            kind: ErrorKind::ToolExecutionError,
            message: "no attempt produced usable output".into(),
            attempts: pz.attempts.len(),
        },
    }
}
