//! End-to-end runs over scripted tools.

mod common;

use std::sync::Arc;

use tokio::sync::Semaphore;
use zoneflow_core::MemorySink;
use zoneflow_shared::{
    ContentType, FactorWeights, FallbackTrigger, ResultSource, RunState, ZoneStatus, ZoneWarning,
};
use zoneflow_tools::{ScriptedAdapter, ScriptedResponse};

use common::*;

#[tokio::test]
async fn low_confidence_table_falls_back_to_second_tool() {
    let mut config = config();
    let mut table = config.fallback.default.clone();
    table.confidence_threshold = 0.7;
    config.fallback.content_types.insert(ContentType::Table, table);

    let alpha = Arc::new(
        ScriptedAdapter::new("alpha")
            .respond("t1", ScriptedResponse::output("Q1 | 100\nQ2 | 200", Some(0.55))),
    );
    let beta = Arc::new(
        ScriptedAdapter::new("beta")
            .respond("t1", ScriptedResponse::output("Region | Revenue\nNorth | 1,200", Some(0.82))),
    );
    let sink = Arc::new(MemorySink::new());
    let controller = controller(config, &[&alpha, &beta], &sink);

    let run = controller
        .start(vec![zone("t1", ContentType::Table)])
        .expect("start");
    let summary = controller.wait(&run).await.expect("wait");

    assert_eq!(summary.progress.run_state, RunState::Completed);
    let result = result_for(&summary.results, "t1");
    assert_eq!(result.status, ZoneStatus::Completed);
    assert!(!result.low_confidence);
    assert_eq!(result.attempts.len(), 2);
    assert_eq!(result.attempts[0].tool, "alpha");
    assert_eq!(result.attempts[0].trigger, Some(FallbackTrigger::LowConfidence));
    assert_eq!(result.attempts[1].tool, "beta");

    let first = result.attempts[0].final_confidence().expect("scored");
    assert!(first > 0.5 && first < 0.7, "got {first}");
    assert!(
        (result.final_confidence - 0.797).abs() < 0.01,
        "got {}",
        result.final_confidence
    );
    assert_eq!(
        result.source,
        ResultSource::SingleAttempt {
            attempt_index: 1,
            tool: "beta".into()
        }
    );
    assert_eq!(
        result.content.as_deref(),
        Some("Region | Revenue\nNorth | 1,200")
    );
    // The rejected table stays visible as a conflict against the kept one.
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].kept, 1);
    assert_eq!(result.conflicts[0].discarded, 0);
    assert_eq!(result.conflicts[0].discarded_tool, "alpha");
    assert!(
        result
            .warnings
            .iter()
            .any(|w| matches!(w, ZoneWarning::MergeConflictUnresolved { conflicts: 1 }))
    );
    assert_eq!(sink.len(), 1);
}

#[tokio::test]
async fn conflicts_follow_the_attempt_finally_kept() {
    let mut config = config();
    config.fallback.default.confidence_threshold = 0.7;
    let caps = [(ContentType::Text, 0.9, 3.0)];
    config.tools.push(tool("gamma", &caps));

    let alpha = Arc::new(
        ScriptedAdapter::new("alpha")
            .respond("z1", ScriptedResponse::output("smudged scan of the header", Some(0.3))),
    );
    let beta = Arc::new(
        ScriptedAdapter::new("beta")
            .respond("z1", ScriptedResponse::output("Quarterly 0verview draft", Some(0.4))),
    );
    let gamma = Arc::new(
        ScriptedAdapter::new("gamma")
            .respond("z1", ScriptedResponse::output("Annual Report 2023", Some(0.95))),
    );
    let sink = Arc::new(MemorySink::new());
    let controller = controller(config, &[&alpha, &beta, &gamma], &sink);

    let run = controller
        .start(vec![zone("z1", ContentType::Text)])
        .expect("start");
    let summary = controller.wait(&run).await.expect("wait");
    let result = result_for(&summary.results, "z1");

    assert_eq!(result.status, ZoneStatus::Completed);
    assert!(!result.low_confidence);
    let tools: Vec<&str> = result.attempts.iter().map(|a| a.tool.as_str()).collect();
    assert_eq!(tools, ["alpha", "beta", "gamma"]);
    assert_eq!(
        result.source,
        ResultSource::SingleAttempt {
            attempt_index: 2,
            tool: "gamma".into()
        }
    );
    assert_eq!(result.content.as_deref(), Some("Annual Report 2023"));

    let mut pairs: Vec<(u32, u32)> = result
        .conflicts
        .iter()
        .map(|c| (c.kept, c.discarded))
        .collect();
    pairs.sort_unstable();
    assert_eq!(pairs, [(2, 0), (2, 1)]);
}

#[tokio::test]
async fn agreeing_outputs_merge_but_stay_low_confidence() {
    let mut config = config();
    config.confidence.weight_sets = vec![FactorWeights {
        version: 1,
        tool_reliability: 1.0,
        content_complexity: 0.0,
        contextual_agreement: 0.0,
        cross_validation: 0.0,
    }];
    config.confidence.active_version = 1;
    for t in &mut config.tools {
        for c in &mut t.capabilities {
            c.accuracy = 1.0;
        }
    }
    config.fallback.default.confidence_threshold = 0.95;
    config.fallback.default.max_attempts = 2;

    let alpha = Arc::new(
        ScriptedAdapter::new("alpha")
            .respond("z1", ScriptedResponse::output("abcdefghijklmnopqrst", Some(0.9))),
    );
    let beta = Arc::new(
        ScriptedAdapter::new("beta")
            .respond("z1", ScriptedResponse::output("abcdefghijklmnopqrsX", Some(0.85))),
    );
    let sink = Arc::new(MemorySink::new());
    let controller = controller(config, &[&alpha, &beta], &sink);

    let run = controller
        .start(vec![zone("z1", ContentType::Text)])
        .expect("start");
    let summary = controller.wait(&run).await.expect("wait");
    let result = result_for(&summary.results, "z1");

    assert_eq!(result.status, ZoneStatus::Completed);
    assert!(result.low_confidence);
    assert_eq!(result.attempts.len(), 2);
    assert!((result.final_confidence - 0.9).abs() < 1e-9);
    assert_eq!(result.content.as_deref(), Some("abcdefghijklmnopqrst"));
    let ResultSource::Merged(merged) = &result.source else {
        panic!("expected a merged result, got {:?}", result.source);
    };
    assert!((merged.merge_quality - 0.8075).abs() < 1e-6, "got {}", merged.merge_quality);
    assert_eq!(merged.contributors.len(), 2);
    assert!(merged.conflicts.is_empty());
    assert!(result.conflicts.is_empty());
    assert!(
        result
            .warnings
            .iter()
            .any(|w| matches!(w, ZoneWarning::LowConfidence { .. }))
    );
    assert_eq!(summary.progress.low_confidence, 1);
}

#[tokio::test]
async fn concurrency_ceiling_holds_excess_zones_in_queue() {
    let gate = Arc::new(Semaphore::new(0));
    let alpha = Arc::new(
        ScriptedAdapter::new("alpha")
            .with_default(ScriptedResponse::output("body text", Some(0.9)))
            .with_gate(Arc::clone(&gate)),
    );
    let sink = Arc::new(MemorySink::new());
    let controller = controller(config(), &[&alpha], &sink);

    let run = controller
        .start(zones(&["z1", "z2", "z3"], ContentType::Text))
        .expect("start");

    wait_until("two calls in flight", || alpha.in_flight() == 2).await;
    let progress = controller.progress(&run).expect("progress");
    assert_eq!(progress.processing, 2);
    assert_eq!(progress.queued, 1);
    assert_eq!(progress.completed, 0);
    assert!(
        controller
            .resources(&run)
            .expect("resources")
            .try_acquire("alpha", 0)
            .is_err()
    );

    gate.add_permits(3);
    let summary = controller.wait(&run).await.expect("wait");
    assert_eq!(summary.progress.completed, 3);
    assert_eq!(alpha.peak_concurrency(), 2);
    assert_eq!(sink.len(), 3);
}
