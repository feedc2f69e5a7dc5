//! Worker tasks: pull a zone, run one attempt, hand the outcome back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use zoneflow_merge::best_agreement;
use zoneflow_scoring::ScoreInput;
use zoneflow_shared::{
    AttemptError, ErrorKind, ProcessingAttempt, Result, RunState, ScoreContext, ToolOutput, Zone,
    ZoneflowError,
};
use zoneflow_tools::ToolAdapter;

use crate::engine::Engine;
use crate::fallback::FallbackManager;
use crate::run::{Conclusion, Dispatch, Run, ScoringView};

/// Upper bound on how long an idle task sleeps before rechecking run state.
pub(crate) const PARK_TIMEOUT: Duration = Duration::from_millis(100);

/// How an adapter call ended.
pub(crate) enum Execution {
    Finished(Result<ToolOutput>),
    /// The run was cancelled while the call was in flight.
    Cancelled,
}

/// Run one adapter call under the attempt timeout. On cancellation the
/// adapter gets `grace` to wind down before the call is dropped.
pub(crate) async fn execute(
    adapter: Option<Arc<dyn ToolAdapter>>,
    zone: &Zone,
    tool: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    grace: Duration,
) -> Execution {
    let Some(adapter) = adapter else {
        return Execution::Finished(Err(ZoneflowError::ToolUnavailable {
            tool: tool.to_string(),
            reason: "no adapter registered".into(),
        }));
    };

    let call = adapter.execute(zone, timeout, cancel.child_token());
    tokio::pin!(call);
    tokio::select! {
        res = tokio::time::timeout(timeout, &mut call) => match res {
            Ok(out) => Execution::Finished(out),
            Err(_) => Execution::Finished(Err(ZoneflowError::ToolTimeout {
                tool: tool.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })),
        },
        _ = cancel.cancelled() => {
            if tokio::time::timeout(grace, &mut call).await.is_err() {
                warn!(tool, zone_id = %zone.id, "tool ignored cancellation, abandoning call");
            }
            Execution::Cancelled
        }
    }
}

/// Timing of one adapter call.
pub(crate) struct AttemptTiming {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Validate and score an adapter outcome into an immutable attempt record.
pub(crate) fn build_attempt(
    engine: &Engine,
    zone: &Zone,
    tool: &str,
    index: u32,
    timing: AttemptTiming,
    outcome: Result<ToolOutput>,
    view: ScoringView,
) -> ProcessingAttempt {
    let mut attempt = ProcessingAttempt {
        index,
        tool: tool.to_string(),
        started_at: timing.started_at,
        finished_at: timing.finished_at,
        duration_ms: timing.duration.as_millis() as u64,
        output: None,
        raw_confidence: None,
        context: None,
        score: None,
        error: None,
        trigger: None,
    };

    let output = match outcome {
        Ok(output) => output,
        Err(err) => {
            let trigger = FallbackManager::classify_error(&err);
            attempt.error = Some(AttemptError {
                kind: err.kind(),
                trigger,
                message: err.to_string(),
            });
            attempt.trigger = Some(trigger);
            return attempt;
        }
    };

    attempt.raw_confidence = output.raw_confidence;
    if let Some((trigger, message)) = FallbackManager::validate_output(zone, &output) {
        attempt.error = Some(AttemptError {
            kind: ErrorKind::ToolExecutionError,
            trigger,
            message,
        });
        attempt.trigger = Some(trigger);
        attempt.output = Some(output);
        return attempt;
    }

    let context = ScoreContext {
        complexity: engine.capabilities.complexity(zone.content_type),
        neighbor_confidences: view.neighbor_confidences,
        peer_agreement: best_agreement(
            &output.content,
            view.peer_contents.iter().map(String::as_str),
        ),
    };
    let score = engine.confidence.score(
        &ScoreInput {
            tool,
            content_type: zone.content_type,
            raw_confidence: output.raw_confidence,
        },
        &context,
    );
    debug!(zone_id = %zone.id, tool, explanation = %score.summary(), "scored attempt");

    attempt.trigger = engine
        .fallback
        .classify_confidence(zone.content_type, score.final_confidence);
    attempt.context = Some(context);
    attempt.score = Some(score);
    attempt.output = Some(output);
    attempt
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

enum Step {
    Work(Dispatch),
    Park,
    Exit,
}

#[instrument(skip_all, fields(run_id = %run.id, worker = worker))]
pub(crate) async fn worker_loop(engine: Arc<Engine>, run: Arc<Run>, worker: usize) {
    debug!("worker started");
    loop {
        let notified = run.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let mut notices = Vec::new();
        let step = {
            let mut inner = run.inner.lock();
            if run.cancel.is_cancelled() {
                inner.live_workers = inner.live_workers.saturating_sub(1);
                Step::Exit
            } else if inner.is_drained() {
                if matches!(inner.state, RunState::Running | RunState::Paused) {
                    inner.state = RunState::Completed;
                    info!("run complete");
                    inner.progress(run.id, engine.workers(), &mut notices);
                }
                inner.live_workers = inner.live_workers.saturating_sub(1);
                Step::Exit
            } else if inner.state == RunState::Paused {
                Step::Park
            } else {
                if inner.is_stalled() {
                    let released = inner.queue.release_blocked();
                    warn!(released, "dependency cycle detected, releasing blocked zones");
                }
                match inner.try_dispatch(&engine, &run.resources) {
                    Some(dispatch) => {
                        inner.progress(run.id, engine.workers(), &mut notices);
                        Step::Work(dispatch)
                    }
                    None => Step::Park,
                }
            }
        };
        engine.emit(notices);

        match step {
            Step::Exit => {
                run.wake.notify_waiters();
                break;
            }
            Step::Park => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = run.cancel.cancelled() => {}
                    _ = tokio::time::sleep(PARK_TIMEOUT) => {}
                }
            }
            Step::Work(dispatch) => process(&engine, &run, dispatch).await,
        }
    }
    debug!("worker stopped");
}

#[instrument(skip_all, fields(zone_id = %dispatch.zone.id, tool = %dispatch.tool, attempt = dispatch.index + 1))]
async fn process(engine: &Engine, run: &Run, dispatch: Dispatch) {
    let Dispatch {
        zone,
        tool,
        index,
        timeout,
        token,
    } = dispatch;
    debug!(timeout_ms = timeout.as_millis() as u64, "dispatching");

    let started_at = Utc::now();
    let started = Instant::now();
    let grace = Duration::from_millis(engine.config.engine.cancel_grace_ms);
    let execution = execute(
        engine.registry.get(&tool),
        &zone,
        &tool,
        timeout,
        &run.cancel,
        grace,
    )
    .await;
    drop(token);
    run.wake.notify_waiters();

    let timing = AttemptTiming {
        started_at,
        finished_at: Utc::now(),
        duration: started.elapsed(),
    };

    let outcome = match execution {
        Execution::Finished(outcome) if !run.cancel.is_cancelled() => outcome,
        _ => {
            let mut notices = Vec::new();
            {
                let mut inner = run.inner.lock();
                inner.abandon(engine, run.id, &zone.id, false, &mut notices);
                inner.progress(run.id, engine.workers(), &mut notices);
            }
            engine.emit(notices);
            return;
        }
    };

    let view = run.inner.lock().scoring_view(&zone.id);
    let attempt = build_attempt(engine, &zone, &tool, index, timing, outcome, view);

    let mut notices = Vec::new();
    let conclusion = {
        let mut inner = run.inner.lock();
        let conclusion = if run.cancel.is_cancelled() {
            inner.abandon(engine, run.id, &zone.id, false, &mut notices);
            Conclusion::Done
        } else {
            inner.conclude(engine, run.id, &zone.id, attempt, &mut notices)
        };
        inner.progress(run.id, engine.workers(), &mut notices);
        conclusion
    };
    engine.emit(notices);

    if let Conclusion::Backoff(delay) = conclusion {
        let cancelled = tokio::select! {
            _ = run.cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        };
        let mut notices = Vec::new();
        {
            let mut inner = run.inner.lock();
            if cancelled || run.cancel.is_cancelled() {
                inner.abandon(engine, run.id, &zone.id, true, &mut notices);
            } else {
                inner.requeue(engine, &run.resources, &zone.id);
            }
            inner.progress(run.id, engine.workers(), &mut notices);
        }
        engine.emit(notices);
    }
    run.wake.notify_waiters();
}
