#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use zoneflow_core::{
    EngineObserver, MemorySink, ProcessingController, ProgressSnapshot, ZoneFailure,
};
use zoneflow_shared::{
    BackoffPolicy, BoundingBox, CapabilityConfig, ContentType, CurveConfig, EngineConfig,
    FallbackStrategy, ToolConfig, Zone, ZoneId, ZoneResult,
};
use zoneflow_tools::{ScriptedAdapter, ToolRegistry};

pub fn zone(id: &str, content_type: ContentType) -> Zone {
    zone_on_page(id, content_type, 1)
}

pub fn zone_on_page(id: &str, content_type: ContentType, page: u32) -> Zone {
    Zone {
        id: id.into(),
        page_number: page,
        bbox: BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 100.0,
            height: 20.0,
            page_width: 1000.0,
            page_height: 1000.0,
        },
        content_type,
        user_priority: None,
        depends_on: vec![],
    }
}

/// One zone per page so none of them count as neighbors.
pub fn zones(ids: &[&str], content_type: ContentType) -> Vec<Zone> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| zone_on_page(id, content_type, i as u32 + 1))
        .collect()
}

pub fn tool(name: &str, caps: &[(ContentType, f64, f64)]) -> ToolConfig {
    ToolConfig {
        name: name.into(),
        max_concurrency: None,
        memory_mb: 128,
        confidence_range: [0.0, 1.0],
        curve: CurveConfig::Linear,
        command: None,
        capabilities: caps
            .iter()
            .map(|&(content_type, accuracy, speed)| CapabilityConfig {
                content_type,
                accuracy,
                speed,
                complexity: 0.6,
            })
            .collect(),
    }
}

/// "alpha" (fast) and "beta" (slower) both cover text and tables. Backoff
/// is kept short so fallbacks do not slow the tests down.
pub fn config() -> EngineConfig {
    let caps_alpha = [(ContentType::Text, 0.9, 1.0), (ContentType::Table, 0.9, 1.0)];
    let caps_beta = [(ContentType::Text, 0.9, 2.0), (ContentType::Table, 0.9, 2.0)];
    let mut config = EngineConfig::default();
    config.tools = vec![tool("alpha", &caps_alpha), tool("beta", &caps_beta)];
    config.engine.default_tool = "alpha".into();
    config.engine.max_concurrency = 2;
    config.engine.cancel_grace_ms = 50;
    config.fallback.default = FallbackStrategy {
        confidence_threshold: 0.3,
        fallback_tools: vec![],
        max_attempts: 3,
        timeout_ms: 2_000,
        backoff: BackoffPolicy {
            base_ms: 1,
            multiplier: 2.0,
            max_ms: 10,
        },
    };
    config.fallback.content_types.clear();
    config
}

pub fn registry(adapters: &[&Arc<ScriptedAdapter>]) -> ToolRegistry {
    adapters
        .iter()
        .fold(ToolRegistry::new(), |r, a| r.with(Arc::clone(a) as _))
}

pub fn controller(
    config: EngineConfig,
    adapters: &[&Arc<ScriptedAdapter>],
    sink: &Arc<MemorySink>,
) -> ProcessingController {
    ProcessingController::builder(config, registry(adapters))
        .sink(Arc::clone(sink) as _)
        .build()
        .expect("controller")
}

/// Poll until `cond` holds, failing after a few seconds.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn result_for<'a>(results: &'a [ZoneResult], id: &str) -> &'a ZoneResult {
    results
        .iter()
        .find(|r| r.zone_id == ZoneId::from(id))
        .unwrap_or_else(|| panic!("no result for {id}"))
}

/// Records every callback it receives.
#[derive(Default)]
pub struct RecordingObserver {
    pub progress: Mutex<Vec<ProgressSnapshot>>,
    pub completed: Mutex<Vec<ZoneId>>,
    pub failed: Mutex<Vec<(ZoneId, ZoneFailure)>>,
}

impl EngineObserver for RecordingObserver {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self.progress.lock().push(snapshot.clone());
    }

    fn on_zone_completed(&self, zone_id: &ZoneId, _result: &ZoneResult) {
        self.completed.lock().push(zone_id.clone());
    }

    fn on_zone_failed(&self, zone_id: &ZoneId, failure: &ZoneFailure) {
        self.failed.lock().push((zone_id.clone(), failure.clone()));
    }
}
