//! Dispatch order, dependencies, resource degradation and fallback triggers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use zoneflow_core::{MemorySink, ProcessingController};
use zoneflow_shared::{
    ContentType, ErrorKind, FallbackTrigger, RunState, ZoneId, ZoneStatus, ZoneWarning,
};
use zoneflow_tools::{ScriptedAdapter, ScriptedResponse};

use common::*;

fn ids(list: &[&str]) -> Vec<ZoneId> {
    list.iter().map(|s| ZoneId::from(*s)).collect()
}

#[tokio::test]
async fn equal_priorities_dispatch_in_input_order() {
    let mut config = config();
    config.engine.max_concurrency = 1;
    let alpha = Arc::new(
        ScriptedAdapter::new("alpha").with_default(ScriptedResponse::output("text", Some(0.9))),
    );
    let sink = Arc::new(MemorySink::new());
    let controller = controller(config, &[&alpha], &sink);

    let run = controller
        .start(zones(&["z1", "z2", "z3", "z4"], ContentType::Text))
        .expect("start");
    controller.wait(&run).await.expect("wait");

    assert_eq!(alpha.calls(), ids(&["z1", "z2", "z3", "z4"]));
    let delivered: Vec<ZoneId> = sink.results().into_iter().map(|r| r.zone_id).collect();
    assert_eq!(delivered, ids(&["z1", "z2", "z3", "z4"]));
}

#[tokio::test]
async fn user_priority_moves_a_queued_zone_forward() {
    let mut config = config();
    config.engine.max_concurrency = 1;
    let alpha = Arc::new(
        ScriptedAdapter::new("alpha").with_default(ScriptedResponse::output("text", Some(0.9))),
    );
    let sink = Arc::new(MemorySink::new());
    let controller = controller(config, &[&alpha], &sink);

    let run = controller
        .start(zones(&["z1", "z2", "z3"], ContentType::Text))
        .expect("start");
    controller.pause(&run).expect("pause");
    assert!(
        controller
            .set_user_priority(&run, &ZoneId::from("z3"), 1.0)
            .expect("reprioritize")
    );
    controller.resume(&run).expect("resume");
    controller.wait(&run).await.expect("wait");

    assert_eq!(alpha.calls(), ids(&["z3", "z1", "z2"]));
    // Finished zones are no longer in the queue.
    assert!(
        !controller
            .set_user_priority(&run, &ZoneId::from("z1"), 0.0)
            .expect("reprioritize")
    );
}

#[tokio::test]
async fn dependencies_finish_first_and_unknown_ones_are_ignored() {
    let mut config = config();
    config.engine.max_concurrency = 1;
    let alpha = Arc::new(
        ScriptedAdapter::new("alpha").with_default(ScriptedResponse::output("text", Some(0.9))),
    );
    let sink = Arc::new(MemorySink::new());
    let controller = controller(config, &[&alpha], &sink);

    let mut input = zones(&["caption", "figure"], ContentType::Text);
    input[0].depends_on = ids(&["figure", "ghost"]);

    let run = controller.start(input).expect("start");
    let summary = controller.wait(&run).await.expect("wait");

    assert_eq!(alpha.calls(), ids(&["figure", "caption"]));
    let caption = result_for(&summary.results, "caption");
    assert_eq!(caption.status, ZoneStatus::Completed);
    assert!(caption.warnings.contains(&ZoneWarning::UnknownDependency {
        zone_id: ZoneId::from("ghost")
    }));
}

#[tokio::test]
async fn dependency_cycles_do_not_stall_the_run() {
    let mut config = config();
    config.engine.max_concurrency = 1;
    let alpha = Arc::new(
        ScriptedAdapter::new("alpha").with_default(ScriptedResponse::output("text", Some(0.9))),
    );
    let sink = Arc::new(MemorySink::new());
    let controller = controller(config, &[&alpha], &sink);

    let mut input = zones(&["a", "b"], ContentType::Text);
    input[0].depends_on = ids(&["b"]);
    input[1].depends_on = ids(&["a"]);

    let run = controller.start(input).expect("start");
    let summary = tokio::time::timeout(Duration::from_secs(3), controller.wait(&run))
        .await
        .expect("cycle released")
        .expect("wait");
    assert_eq!(summary.progress.completed, 2);
}

#[tokio::test]
async fn memory_pressure_degrades_to_a_cheaper_tool() {
    let mut config = config();
    config.engine.memory_budget_mb = 1200;
    config.tools[0].memory_mb = 1024;
    config.tools[1].memory_mb = 128;

    let gate = Arc::new(Semaphore::new(0));
    let alpha = Arc::new(
        ScriptedAdapter::new("alpha")
            .with_default(ScriptedResponse::output("alpha text", Some(0.9)))
            .with_gate(Arc::clone(&gate)),
    );
    let beta = Arc::new(
        ScriptedAdapter::new("beta").with_default(ScriptedResponse::output("beta text", Some(0.9))),
    );
    let sink = Arc::new(MemorySink::new());
    let controller = controller(config, &[&alpha, &beta], &sink);

    let run = controller
        .start(zones(&["z1", "z2"], ContentType::Text))
        .expect("start");
    wait_until("z2 finished on beta", || sink.len() == 1).await;
    gate.add_permits(1);
    let summary = controller.wait(&run).await.expect("wait");

    let z1 = result_for(&summary.results, "z1");
    assert_eq!(z1.attempts[0].tool, "alpha");
    assert!(
        !z1.warnings
            .iter()
            .any(|w| matches!(w, ZoneWarning::Degraded { .. }))
    );

    let z2 = result_for(&summary.results, "z2");
    assert_eq!(z2.status, ZoneStatus::Completed);
    assert_eq!(z2.attempts.len(), 1);
    assert_eq!(z2.attempts[0].tool, "beta");
    assert!(z2.warnings.contains(&ZoneWarning::Degraded {
        from: "alpha".into(),
        to: "beta".into()
    }));
}

#[tokio::test]
async fn exhausted_zone_fails_and_notifies_once() {
    let mut config = config();
    let caps = [(ContentType::Text, 0.9, 3.0)];
    config.tools.push(tool("gamma", &caps));
    let failing = |name: &str| {
        Arc::new(ScriptedAdapter::new(name).with_default(ScriptedResponse::error("engine crashed")))
    };
    let (alpha, beta, gamma) = (failing("alpha"), failing("beta"), failing("gamma"));
    let observer = Arc::new(RecordingObserver::default());
    let sink = Arc::new(MemorySink::new());
    let controller = ProcessingController::builder(config, registry(&[&alpha, &beta, &gamma]))
        .sink(Arc::clone(&sink) as _)
        .observer(Arc::clone(&observer) as _)
        .build()
        .expect("controller");

    let run = controller
        .start(vec![zone("z1", ContentType::Text)])
        .expect("start");
    let summary = controller.wait(&run).await.expect("wait");

    let r = result_for(&summary.results, "z1");
    assert_eq!(r.status, ZoneStatus::Failed);
    assert!(!r.low_confidence);
    assert!(r.content.is_none());
    let tools: Vec<&str> = r.attempts.iter().map(|a| a.tool.as_str()).collect();
    assert_eq!(tools, ["alpha", "beta", "gamma"]);
    assert!(
        r.attempts
            .iter()
            .all(|a| a.trigger == Some(FallbackTrigger::ToolError))
    );

    let failed = observer.failed.lock();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, ZoneId::from("z1"));
    assert_eq!(failed[0].1.kind, ErrorKind::ToolExecutionError);
    assert_eq!(failed[0].1.attempts, 3);
    assert!(observer.completed.lock().is_empty());
    assert_eq!(sink.len(), 1);
    assert_eq!(summary.progress.failed, 1);
}

#[tokio::test]
async fn timeout_triggers_fallback() {
    let mut config = config();
    config.fallback.default.timeout_ms = 50;
    let alpha = Arc::new(ScriptedAdapter::new("alpha").with_default(ScriptedResponse::Hang));
    let beta = Arc::new(
        ScriptedAdapter::new("beta").with_default(ScriptedResponse::output("beta text", Some(0.9))),
    );
    let sink = Arc::new(MemorySink::new());
    let controller = controller(config, &[&alpha, &beta], &sink);

    let run = controller
        .start(vec![zone("z1", ContentType::Text)])
        .expect("start");
    let summary = controller.wait(&run).await.expect("wait");

    let r = result_for(&summary.results, "z1");
    assert_eq!(r.status, ZoneStatus::Completed);
    assert_eq!(r.attempts.len(), 2);
    assert_eq!(r.attempts[0].trigger, Some(FallbackTrigger::ToolTimeout));
    assert_eq!(
        r.attempts[0].error.as_ref().map(|e| e.kind),
        Some(ErrorKind::ToolTimeout)
    );
    assert_eq!(r.content.as_deref(), Some("beta text"));
}

#[tokio::test]
async fn mismatched_and_empty_outputs_are_rejected() {
    let mut config = config();
    let caps = [(ContentType::Text, 0.9, 3.0)];
    config.tools.push(tool("gamma", &caps));
    let alpha = Arc::new(ScriptedAdapter::new("alpha").respond(
        "z1",
        ScriptedResponse::detected("| a | b |", Some(0.9), ContentType::Table),
    ));
    let beta =
        Arc::new(ScriptedAdapter::new("beta").respond("z1", ScriptedResponse::output("  ", Some(0.9))));
    let gamma = Arc::new(
        ScriptedAdapter::new("gamma").respond("z1", ScriptedResponse::output("plain text", Some(0.9))),
    );
    let sink = Arc::new(MemorySink::new());
    let controller = controller(config, &[&alpha, &beta, &gamma], &sink);

    let run = controller
        .start(vec![zone("z1", ContentType::Text)])
        .expect("start");
    let summary = controller.wait(&run).await.expect("wait");

    let r = result_for(&summary.results, "z1");
    let triggers: Vec<_> = r.attempts.iter().map(|a| a.trigger).collect();
    assert_eq!(
        triggers,
        [
            Some(FallbackTrigger::ContentMismatch),
            Some(FallbackTrigger::ValidationFailure),
            None
        ]
    );
    assert!(r.attempts[0].output.is_some());
    assert!(r.attempts[0].score.is_none());
    assert_eq!(r.content.as_deref(), Some("plain text"));
}

#[tokio::test]
async fn uncovered_content_type_uses_the_default_tool() {
    let alpha = Arc::new(
        ScriptedAdapter::new("alpha").with_default(ScriptedResponse::output("a chart", Some(0.9))),
    );
    let sink = Arc::new(MemorySink::new());
    let controller = controller(config(), &[&alpha], &sink);

    let run = controller
        .start(vec![zone("img", ContentType::Image)])
        .expect("start");
    let summary = controller.wait(&run).await.expect("wait");

    let r = result_for(&summary.results, "img");
    assert_eq!(r.status, ZoneStatus::Completed);
    assert_eq!(r.attempts[0].tool, "alpha");
    assert!(r.warnings.contains(&ZoneWarning::ContentTypeUnsupported {
        content_type: ContentType::Image,
        default_tool: "alpha".into()
    }));
}

#[tokio::test]
async fn observers_see_progress_through_to_completion() {
    let alpha = Arc::new(
        ScriptedAdapter::new("alpha").with_default(ScriptedResponse::output("text", Some(0.9))),
    );
    let observer = Arc::new(RecordingObserver::default());
    let sink = Arc::new(MemorySink::new());
    let controller = ProcessingController::builder(config(), registry(&[&alpha]))
        .sink(Arc::clone(&sink) as _)
        .observer(Arc::clone(&observer) as _)
        .build()
        .expect("controller");

    let run = controller
        .start(zones(&["z1", "z2", "z3"], ContentType::Text))
        .expect("start");
    controller.wait(&run).await.expect("wait");

    let progress = observer.progress.lock();
    assert_eq!(progress.first().map(|p| p.queued), Some(3));
    assert!(
        progress
            .iter()
            .any(|p| p.run_state == RunState::Completed && p.completed == 3)
    );
    assert!(progress.iter().all(|p| p.total_zones == 3));
    assert_eq!(observer.completed.lock().len(), 3);
    assert!(observer.failed.lock().is_empty());
}
