//! Processing controller: run lifecycle and the public control surface.
//!
//! A run owns a worker pool the size of the global concurrency ceiling.
//! Workers pull zones from the run's queue, execute one attempt each, and
//! feed the outcome back through the fallback manager. All bookkeeping for a
//! run lives behind one lock that is never held across an await.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use zoneflow_merge::ResultMerger;
use zoneflow_scheduler::{ResourceLimits, ResourceManager};
use zoneflow_scoring::{Calibrator, ConfidenceEngine, PriorityCalculator};
use zoneflow_shared::{
    EngineConfig, ProcessingZone, Result, RunId, RunState, Zone, ZoneId, ZoneResult, ZoneStatus,
    ZoneflowError,
};
use zoneflow_tools::{CapabilityRegistry, ToolAssignmentEngine, ToolRegistry};

use crate::engine::Engine;
use crate::events::{EngineObserver, ProgressSnapshot};
use crate::fallback::FallbackManager;
use crate::results::{NullSink, ResultSink};
use crate::run::{Run, RunInner};
use crate::worker::{PARK_TIMEOUT, worker_loop};

/// Final state of a run, returned by [`ProcessingController::wait`].
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub progress: ProgressSnapshot,
    /// Terminal zones in input order.
    pub results: Vec<ZoneResult>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct ControllerBuilder {
    config: EngineConfig,
    registry: ToolRegistry,
    observers: Vec<Arc<dyn EngineObserver>>,
    sink: Arc<dyn ResultSink>,
    calibrator: Option<Arc<dyn Calibrator>>,
}

impl ControllerBuilder {
    pub fn observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Overrides the calibrator derived from the configuration.
    pub fn calibrator(mut self, calibrator: Arc<dyn Calibrator>) -> Self {
        self.calibrator = Some(calibrator);
        self
    }

    /// Validate the configuration and assemble the engine.
    pub fn build(self) -> Result<ProcessingController> {
        self.config.validate()?;

        for tool in &self.config.tools {
            if !self.registry.contains(&tool.name) {
                warn!(tool = %tool.name, "configured tool has no adapter; attempts on it will fail");
            }
        }

        let confidence = match self.calibrator {
            Some(c) => ConfidenceEngine::new(&self.config, c)?,
            None => ConfidenceEngine::from_config(&self.config)?,
        };
        let config = Arc::new(self.config);
        let capabilities = Arc::new(CapabilityRegistry::from_config(&config));
        let engine = Engine {
            assignment: ToolAssignmentEngine::new(Arc::clone(&capabilities), Arc::clone(&config)),
            priority: PriorityCalculator::from_config(&config.priority),
            merger: ResultMerger::new(config.merge.clone()),
            fallback: FallbackManager::new(Arc::clone(&config)),
            registry: self.registry,
            capabilities,
            confidence,
            observers: self.observers,
            sink: self.sink,
            config,
        };
        info!(
            tools = ?engine.registry.names(),
            workers = engine.workers(),
            priority = engine.priority.strategy_name(),
            calibrator = engine.confidence.calibrator_name(),
            "controller ready"
        );
        Ok(ProcessingController {
            engine: Arc::new(engine),
            runs: Mutex::new(HashMap::new()),
        })
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct ProcessingController {
    engine: Arc<Engine>,
    runs: Mutex<HashMap<RunId, Arc<Run>>>,
}

impl ProcessingController {
    pub fn builder(config: EngineConfig, registry: ToolRegistry) -> ControllerBuilder {
        ControllerBuilder {
            config,
            registry,
            observers: Vec::new(),
            sink: Arc::new(NullSink),
            calibrator: None,
        }
    }

    pub fn new(config: EngineConfig, registry: ToolRegistry) -> Result<Self> {
        Self::builder(config, registry).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.engine.config
    }

    fn run(&self, run_id: &RunId) -> Result<Arc<Run>> {
        self.runs
            .lock()
            .get(run_id)
            .cloned()
            .ok_or_else(|| ZoneflowError::UnknownRun(run_id.to_string()))
    }

    fn spawn_workers(&self, run: &Arc<Run>, count: usize) {
        let mut handles = run.workers.lock();
        for worker in 0..count {
            handles.push(tokio::spawn(worker_loop(
                Arc::clone(&self.engine),
                Arc::clone(run),
                worker,
            )));
        }
    }

    /// Queue every zone and start the worker pool. Must be called from
    /// within a Tokio runtime.
    #[instrument(skip_all, fields(zones = zones.len()))]
    pub fn start(&self, zones: Vec<Zone>) -> Result<RunId> {
        let resources = ResourceManager::new(ResourceLimits::from(&*self.engine.config));
        let mut inner = RunInner::new(&self.engine, zones, &resources)?;
        let run_id = RunId::new();
        let workers = self.engine.workers();
        inner.live_workers = workers;

        let mut notices = Vec::new();
        inner.progress(run_id, workers, &mut notices);
        let total = inner.zones.len();

        let run = Arc::new(Run {
            id: run_id,
            inner: Mutex::new(inner),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            resources,
            workers: Mutex::new(Vec::new()),
        });
        self.runs.lock().insert(run_id, Arc::clone(&run));

        info!(%run_id, zones = total, workers, "run started");
        self.engine.emit(notices);
        self.spawn_workers(&run, workers);
        Ok(run_id)
    }

    /// Stop dispatching new zones. In-flight attempts run to completion.
    pub fn pause(&self, run_id: &RunId) -> Result<()> {
        let run = self.run(run_id)?;
        let mut notices = Vec::new();
        {
            let mut inner = run.inner.lock();
            match inner.state {
                RunState::Cancelled => return Err(ZoneflowError::RunCancelled(run_id.to_string())),
                RunState::Running => {
                    inner.state = RunState::Paused;
                    info!(%run_id, "run paused");
                    inner.progress(run.id, self.engine.workers(), &mut notices);
                }
                RunState::Paused | RunState::Completed => {}
            }
        }
        self.engine.emit(notices);
        Ok(())
    }

    pub fn resume(&self, run_id: &RunId) -> Result<()> {
        let run = self.run(run_id)?;
        let mut notices = Vec::new();
        {
            let mut inner = run.inner.lock();
            match inner.state {
                RunState::Cancelled => return Err(ZoneflowError::RunCancelled(run_id.to_string())),
                RunState::Paused => {
                    inner.state = RunState::Running;
                    info!(%run_id, "run resumed");
                    inner.progress(run.id, self.engine.workers(), &mut notices);
                }
                RunState::Running | RunState::Completed => {}
            }
        }
        self.engine.emit(notices);
        run.wake.notify_waiters();
        Ok(())
    }

    /// Cancel queued zones and interrupt in-flight attempts. Results that
    /// arrive after this point are discarded. Cancelling twice is a no-op.
    pub fn cancel(&self, run_id: &RunId) -> Result<()> {
        let run = self.run(run_id)?;
        let mut notices = Vec::new();
        {
            let mut inner = run.inner.lock();
            if matches!(inner.state, RunState::Cancelled | RunState::Completed) {
                return Ok(());
            }
            inner.state = RunState::Cancelled;
            run.cancel.cancel();
            inner.cancel_queued(&self.engine, run.id, &mut notices);
            info!(%run_id, in_flight = inner.in_flight, "run cancelled");
            inner.progress(run.id, self.engine.workers(), &mut notices);
        }
        self.engine.emit(notices);
        run.wake.notify_waiters();
        Ok(())
    }

    /// Re-run a finished zone for one more attempt, on `tool` or the next
    /// untried tool in its chain.
    ///
    /// Returns `false` without doing anything when the zone is still queued
    /// or running, or when it already completed above its threshold and no
    /// tool was named.
    pub fn retry(&self, run_id: &RunId, zone_id: &ZoneId, tool: Option<&str>) -> Result<bool> {
        let run = self.run(run_id)?;
        let engine = &self.engine;
        let mut notices = Vec::new();
        let spawn = {
            let mut inner = run.inner.lock();
            if inner.state == RunState::Cancelled {
                return Err(ZoneflowError::RunCancelled(run_id.to_string()));
            }
            let e = inner
                .zones
                .get_mut(zone_id)
                .ok_or_else(|| ZoneflowError::UnknownZone {
                    run_id: run_id.to_string(),
                    zone_id: zone_id.to_string(),
                })?;

            match (e.pz.status, tool) {
                (ZoneStatus::Queued | ZoneStatus::Processing, _) => return Ok(false),
                (ZoneStatus::Completed, None) if !e.low_confidence => return Ok(false),
                _ => {}
            }
            let next = match tool {
                Some(t) if !engine.is_known_tool(t) => {
                    return Err(ZoneflowError::validation(format!("unknown tool '{t}'")));
                }
                Some(t) => t.to_string(),
                None => FallbackManager::next_tool(&e.pz)
                    .unwrap_or(e.pz.assigned_tool.as_str())
                    .to_string(),
            };

            info!(%run_id, zone_id = %zone_id, tool = %next, "retrying zone");
            e.budget = e.pz.attempts.len() as u32 + 1;
            e.next_tool = next;
            e.merge = None;
            e.result = None;
            e.low_confidence = false;
            e.pz.status = ZoneStatus::Queued;
            e.pz.priority = engine.priority_for(&e.pz, &e.next_tool, e.dependents, &run.resources);
            let priority = e.pz.priority;
            let dependencies = e.pz.dependencies.clone();

            inner.queue.unresolve(zone_id);
            inner.queue.enqueue(zone_id.clone(), priority, &dependencies);
            if inner.state == RunState::Completed {
                inner.state = RunState::Running;
            }
            let spawn = if inner.live_workers == 0 {
                inner.live_workers = engine.workers();
                engine.workers()
            } else {
                0
            };
            inner.progress(run.id, engine.workers(), &mut notices);
            spawn
        };
        engine.emit(notices);
        if spawn > 0 {
            self.spawn_workers(&run, spawn);
        } else {
            run.wake.notify_waiters();
        }
        Ok(true)
    }

    /// Change a zone's user priority. Only affects zones still queued;
    /// returns whether the queue was updated.
    pub fn set_user_priority(&self, run_id: &RunId, zone_id: &ZoneId, user_priority: f64) -> Result<bool> {
        let run = self.run(run_id)?;
        let mut inner = run.inner.lock();
        let e = inner
            .zones
            .get_mut(zone_id)
            .ok_or_else(|| ZoneflowError::UnknownZone {
                run_id: run_id.to_string(),
                zone_id: zone_id.to_string(),
            })?;
        Arc::make_mut(&mut e.pz.zone).user_priority = Some(user_priority.clamp(0.0, 1.0));
        e.pz.priority =
            self.engine
                .priority_for(&e.pz, &e.next_tool, e.dependents, &run.resources);
        let priority = e.pz.priority;
        Ok(inner.queue.reprioritize(zone_id, priority))
    }

    pub fn progress(&self, run_id: &RunId) -> Result<ProgressSnapshot> {
        let run = self.run(run_id)?;
        let snapshot = run.inner.lock().snapshot(run.id, self.engine.workers());
        Ok(snapshot)
    }

    /// Current record of one zone.
    pub fn zone(&self, run_id: &RunId, zone_id: &ZoneId) -> Result<ProcessingZone> {
        let run = self.run(run_id)?;
        let inner = run.inner.lock();
        inner
            .zones
            .get(zone_id)
            .map(|e| e.pz.clone())
            .ok_or_else(|| ZoneflowError::UnknownZone {
                run_id: run_id.to_string(),
                zone_id: zone_id.to_string(),
            })
    }

    /// Results of every terminal zone so far, in input order.
    pub fn results(&self, run_id: &RunId) -> Result<Vec<ZoneResult>> {
        let run = self.run(run_id)?;
        let results = run.inner.lock().results();
        Ok(results)
    }

    /// The run's resource manager (shares state with the live run).
    pub fn resources(&self, run_id: &RunId) -> Result<ResourceManager> {
        Ok(self.run(run_id)?.resources.clone())
    }

    /// Wait until every worker of the run has exited. Safe to drop and call
    /// again, e.g. after a cancel.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunSummary> {
        let run = self.run(run_id)?;
        loop {
            let notified = run.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let idle = run.inner.lock().live_workers == 0;
            let all_finished = {
                let handles = run.workers.lock();
                !handles.is_empty() && handles.iter().all(JoinHandle::is_finished)
            };
            if idle || all_finished {
                break;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(PARK_TIMEOUT) => {}
            }
        }

        let handles = std::mem::take(&mut *run.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(%run_id, error = %e, "worker task failed");
            }
        }
        let mut inner = run.inner.lock();
        Ok(RunSummary {
            run_id: run.id,
            progress: inner.snapshot(run.id, self.engine.workers()),
            results: inner.results(),
        })
    }

    /// Drop a finished run's state. Running or paused runs are kept.
    pub fn forget(&self, run_id: &RunId) -> Result<bool> {
        let run = self.run(run_id)?;
        let finished = matches!(
            run.inner.lock().state,
            RunState::Completed | RunState::Cancelled
        );
        if finished {
            self.runs.lock().remove(run_id);
        }
        Ok(finished)
    }
}
