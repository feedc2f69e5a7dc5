//! Progress snapshots and observer callbacks.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;

use zoneflow_shared::{ErrorKind, RunId, RunState, ZoneId, ZoneResult};

/// Point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub run_id: RunId,
    /// Monotonic per run; orders snapshots emitted from different workers.
    pub seq: u64,
    pub run_state: RunState,
    pub total_zones: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Completed zones flagged as best-effort.
    pub low_confidence: usize,
    /// Mean final confidence over completed zones.
    pub average_confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining_ms: Option<u64>,
    /// Zones finished per minute since the run started.
    pub throughput_rate: f64,
    pub elapsed_ms: u64,
}

impl ProgressSnapshot {
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }
}

/// Why a zone ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: usize,
}

/// Receives engine notifications. Implementations must not block; they are
/// called from worker tasks.
pub trait EngineObserver: Send + Sync {
    fn on_progress(&self, snapshot: &ProgressSnapshot);
    fn on_zone_completed(&self, zone_id: &ZoneId, result: &ZoneResult);
    fn on_zone_failed(&self, zone_id: &ZoneId, failure: &ZoneFailure);
}

/// No-op observer for headless/test usage.
pub struct SilentObserver;

impl EngineObserver for SilentObserver {
    fn on_progress(&self, _snapshot: &ProgressSnapshot) {}
    fn on_zone_completed(&self, _zone_id: &ZoneId, _result: &ZoneResult) {}
    fn on_zone_failed(&self, _zone_id: &ZoneId, _failure: &ZoneFailure) {}
}

/// Owned copy of a notification, for channel delivery.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Progress(ProgressSnapshot),
    ZoneCompleted {
        zone_id: ZoneId,
        result: Box<ZoneResult>,
    },
    ZoneFailed {
        zone_id: ZoneId,
        failure: ZoneFailure,
    },
}

/// Fans notifications out over a tokio broadcast channel. Slow receivers
/// lag and lose old events; the engine never waits on them.
pub struct BroadcastObserver {
    tx: broadcast::Sender<EngineEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    fn send(&self, event: EngineEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}

impl EngineObserver for BroadcastObserver {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self.send(EngineEvent::Progress(snapshot.clone()));
    }

    fn on_zone_completed(&self, zone_id: &ZoneId, result: &ZoneResult) {
        self.send(EngineEvent::ZoneCompleted {
            zone_id: zone_id.clone(),
            result: Box::new(result.clone()),
        });
    }

    fn on_zone_failed(&self, zone_id: &ZoneId, failure: &ZoneFailure) {
        self.send(EngineEvent::ZoneFailed {
            zone_id: zone_id.clone(),
            failure: failure.clone(),
        });
    }
}

// ---------------------------------------------------------------------------
// Rate tracking
// ---------------------------------------------------------------------------

/// Timing data behind the ETA and throughput fields.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    started: Instant,
    finished: usize,
    total_zone_time: Duration,
    seq: u64,
}

impl ProgressTracker {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
            finished: 0,
            total_zone_time: Duration::ZERO,
            seq: 0,
        }
    }

    /// Record one zone reaching a terminal state after `elapsed` wall time.
    pub(crate) fn record(&mut self, elapsed: Duration) {
        self.finished += 1;
        self.total_zone_time += elapsed;
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Zones per minute.
    pub(crate) fn throughput(&self) -> f64 {
        let minutes = self.elapsed().as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            0.0
        } else {
            self.finished as f64 / minutes
        }
    }

    /// Mean zone time × remaining zones, spread over the worker count.
    pub(crate) fn eta(&self, remaining: usize, workers: usize) -> Option<Duration> {
        if remaining == 0 {
            return Some(Duration::ZERO);
        }
        if self.finished == 0 {
            return None;
        }
        let mean = self.total_zone_time.as_secs_f64() / self.finished as f64;
        let lanes = workers.clamp(1, remaining);
        let waves = remaining.div_ceil(lanes);
        Some(Duration::from_secs_f64(mean * waves as f64))
    }
}
