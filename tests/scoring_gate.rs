//! Output-quality gating end to end: thresholds, quality retries, and the
//! recorded scoring history.

use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use weftflow::ExecutorError;
use weftflow::events::RunEvent;
use weftflow::graphs::{
    Criterion, NodeSpec, OnScoreExhausted, OnScoreFailure, ScoringPolicy, StepNode, StepSpec,
    Workflow,
};
use weftflow::runtime::GraphExecutor;
use weftflow::scoring::ScoringEngine;
use weftflow::step::InMemoryRegistry;
use weftflow::store::{InMemoryStateStore, StateStore};
use weftflow::utils::testing::{CountingStep, ScriptedEvaluator};

fn scored_step(id: &str, handler: &str, policy: ScoringPolicy) -> StepNode {
    StepNode::new(
        id,
        NodeSpec::Step(StepSpec {
            handler: handler.into(),
            scoring: Some(policy),
            ..StepSpec::default()
        }),
    )
}

fn retry_policy() -> ScoringPolicy {
    ScoringPolicy {
        criteria: vec![Criterion::new("overall")],
        minimum: 0.7,
        on_failure: OnScoreFailure::Retry,
        retry_limit: 2,
        ..ScoringPolicy::default()
    }
}

#[tokio::test]
async fn passing_output_is_accepted_first_try() {
    let calls = Arc::new(AtomicU32::new(0));
    let store = Arc::new(InMemoryStateStore::new());
    let workflow = Workflow::new("scored", vec![scored_step("draft", "gen", retry_policy())]);
    let executor = GraphExecutor::new(workflow)
        .with_registry(
            InMemoryRegistry::new().register("gen", CountingStep::new(calls.clone(), json!("v1"))),
        )
        .with_scoring(ScoringEngine::new(ScriptedEvaluator::new([0.9])))
        .with_store(store.clone());
    let handle = executor.run(json!(null)).await.unwrap();
    assert_eq!(handle.output, Some(json!("v1")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let state = store.load(&handle.run_id).await.unwrap();
    assert_eq!(state.scoring.history.len(), 1);
    assert!(state.scoring.history[0].passed);
    assert_eq!(state.scoring.final_score, Some(0.9));
}

#[tokio::test]
async fn failing_output_is_regenerated_until_it_passes() {
    let calls = Arc::new(AtomicU32::new(0));
    let store = Arc::new(InMemoryStateStore::new());
    let workflow = Workflow::new("scored", vec![scored_step("draft", "gen", retry_policy())]);
    let executor = GraphExecutor::new(workflow)
        .with_registry(
            InMemoryRegistry::new().register("gen", CountingStep::new(calls.clone(), json!("v"))),
        )
        .with_scoring(ScoringEngine::new(ScriptedEvaluator::new([0.5, 0.8])))
        .with_store(store.clone());
    let handle = executor.run(json!(null)).await.unwrap();
    assert_eq!(handle.status, weftflow::RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let state = store.load(&handle.run_id).await.unwrap();
    assert_eq!(state.scoring.history.len(), 2);
    assert!(!state.scoring.history[0].passed);
    assert!(state.scoring.history[1].passed);
    assert_eq!(state.scoring.retry_count_by_step.get("draft"), Some(&1));
}

#[tokio::test]
async fn on_failure_continue_keeps_the_failing_output() {
    let store = Arc::new(InMemoryStateStore::new());
    let policy = ScoringPolicy {
        on_failure: OnScoreFailure::Continue,
        ..retry_policy()
    };
    let calls = Arc::new(AtomicU32::new(0));
    let workflow = Workflow::new("lenient", vec![scored_step("draft", "gen", policy)]);
    let executor = GraphExecutor::new(workflow)
        .with_registry(
            InMemoryRegistry::new().register("gen", CountingStep::new(calls.clone(), json!("meh"))),
        )
        .with_scoring(ScoringEngine::new(ScriptedEvaluator::new([0.4])))
        .with_store(store.clone());
    let handle = executor.run(json!(null)).await.unwrap();
    assert_eq!(handle.output, Some(json!("meh")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let state = store.load(&handle.run_id).await.unwrap();
    assert!(!state.scoring.history[0].passed);
}

#[tokio::test]
async fn on_failure_abort_fails_the_step() {
    let policy = ScoringPolicy {
        on_failure: OnScoreFailure::Abort,
        ..retry_policy()
    };
    let calls = Arc::new(AtomicU32::new(0));
    let workflow = Workflow::new("strict", vec![scored_step("draft", "gen", policy)]);
    let executor = GraphExecutor::new(workflow)
        .with_registry(
            InMemoryRegistry::new().register("gen", CountingStep::new(calls, json!("bad"))),
        )
        .with_scoring(ScoringEngine::new(ScriptedEvaluator::new([0.2])));
    let err = executor.run(json!(null)).await.unwrap_err();
    match err {
        ExecutorError::StepExecutionFailed { source, .. } => {
            assert_eq!(source.code, "score_below_threshold");
        }
        other => panic!("expected step failure, got {other:?}"),
    }
}

#[tokio::test]
async fn exhausted_retries_follow_on_exhausted() {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = ScoringPolicy {
        on_exhausted: OnScoreExhausted::Abort,
        ..retry_policy()
    };
    let workflow = Workflow::new("hopeless", vec![scored_step("draft", "gen", policy)]);
    let executor = GraphExecutor::new(workflow)
        .with_registry(
            InMemoryRegistry::new().register("gen", CountingStep::new(calls.clone(), json!("x"))),
        )
        .with_scoring(ScoringEngine::new(ScriptedEvaluator::new([0.1, 0.2, 0.2])));
    let err = executor.run(json!(null)).await.unwrap_err();
    assert!(matches!(err, ExecutorError::StepExecutionFailed { .. }));
    // Initial attempt plus retry_limit retries.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn require_improvement_stops_a_plateaued_loop() {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = ScoringPolicy {
        retry_limit: 5,
        require_improvement: true,
        min_improvement: 0.05,
        ..retry_policy()
    };
    let workflow = Workflow::new("plateau", vec![scored_step("draft", "gen", policy)]);
    let executor = GraphExecutor::new(workflow)
        .with_registry(
            InMemoryRegistry::new().register("gen", CountingStep::new(calls.clone(), json!("x"))),
        )
        .with_scoring(ScoringEngine::new(ScriptedEvaluator::new([0.4, 0.5, 0.45])));
    // Third attempt regresses; policy says keep it and continue.
    let handle = executor.run(json!(null)).await.unwrap();
    assert_eq!(handle.status, weftflow::RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn scoring_policy_without_an_evaluator_is_a_config_error() {
    let workflow = Workflow::new("orphan", vec![scored_step("draft", "gen", retry_policy())]);
    let executor = GraphExecutor::new(workflow).with_registry(
        InMemoryRegistry::new().register("gen", CountingStep::new(Arc::new(AtomicU32::new(0)), json!(1))),
    );
    let err = executor.run(json!(null)).await.unwrap_err();
    assert!(matches!(err, ExecutorError::InvalidStepConfig { .. }));
}

#[tokio::test]
async fn score_events_carry_attempt_and_verdict() {
    let workflow = Workflow::new("observed", vec![scored_step("draft", "gen", retry_policy())]);
    let executor = GraphExecutor::new(workflow)
        .with_registry(
            InMemoryRegistry::new()
                .register("gen", CountingStep::new(Arc::new(AtomicU32::new(0)), json!("v"))),
        )
        .with_scoring(ScoringEngine::new(ScriptedEvaluator::new([0.5, 0.8])));
    let events = executor.take_events().unwrap();
    executor.run(json!(null)).await.unwrap();

    let scores: Vec<(u32, f64, bool)> = events
        .try_iter()
        .filter_map(|e| match e {
            RunEvent::ScoreRecorded {
                attempt,
                score,
                passed,
                ..
            } => Some((attempt, score, passed)),
            _ => None,
        })
        .collect();
    assert_eq!(scores, vec![(0, 0.5, false), (1, 0.8, true)]);
}
