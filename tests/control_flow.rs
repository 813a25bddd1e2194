//! Control-flow node kinds: parallel, branch, switch, foreach, while, try,
//! map/reduce.

use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use weftflow::ExecutorError;
use weftflow::graphs::{NodeSpec, StepNode, StepSpec, SwitchCase, WaitFor, Workflow};
use weftflow::runtime::{ExecutorConfig, GraphExecutor};
use weftflow::step::{InMemoryRegistry, StepContext, StepError, StepHandler};
use weftflow::utils::testing::{
    AlwaysFail, CountingStep, DoubleStep, EchoStep, SlowStep, SumStep, fn_step,
};

fn step_with_input(id: &str, handler: &str, input: &str) -> StepNode {
    StepNode::new(
        id,
        NodeSpec::Step(StepSpec {
            handler: handler.into(),
            input: Some(input.into()),
            ..StepSpec::default()
        }),
    )
}

fn basic_registry() -> InMemoryRegistry {
    InMemoryRegistry::new()
        .register("echo", EchoStep)
        .register("double", DoubleStep)
        .register("sum", SumStep)
}

#[tokio::test]
async fn parallel_all_collects_every_child() {
    let workflow = Workflow::new(
        "par",
        vec![StepNode::new(
            "fan",
            NodeSpec::Parallel {
                children: vec![
                    step_with_input("x", "echo", "1"),
                    step_with_input("y", "echo", "2"),
                ],
                wait_for: WaitFor::All,
            },
        )],
    );
    let executor = GraphExecutor::new(workflow).with_registry(basic_registry());
    let handle = executor.run(json!(null)).await.unwrap();
    assert_eq!(handle.output, Some(json!({"x": 1, "y": 2})));
}

#[tokio::test(start_paused = true)]
async fn parallel_any_takes_first_success_and_tolerates_failures() {
    let registry = basic_registry()
        .register("slow", SlowStep { delay_ms: 5_000, output: json!("slow") })
        .register("failing", AlwaysFail::operational("boom"));
    let workflow = Workflow::new(
        "race",
        vec![StepNode::new(
            "fan",
            NodeSpec::Parallel {
                children: vec![
                    StepNode::step("dead", "failing"),
                    step_with_input("quick", "echo", "\"quick\""),
                    StepNode::step("late", "slow"),
                ],
                wait_for: WaitFor::Any,
            },
        )],
    );
    let executor = GraphExecutor::new(workflow).with_registry(registry);
    let handle = executor.run(json!(null)).await.unwrap();
    assert_eq!(handle.output, Some(json!("quick")));
}

#[tokio::test]
async fn parallel_any_with_all_children_failing_errors_out() {
    let registry = InMemoryRegistry::new()
        .register("f1", AlwaysFail::operational("a"))
        .register("f2", AlwaysFail::operational("b"));
    let workflow = Workflow::new(
        "doomed",
        vec![StepNode::new(
            "fan",
            NodeSpec::Parallel {
                children: vec![StepNode::step("x", "f1"), StepNode::step("y", "f2")],
                wait_for: WaitFor::Any,
            },
        )],
    );
    let executor = GraphExecutor::new(workflow).with_registry(registry);
    assert!(executor.run(json!(null)).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn parallel_first_propagates_the_first_completion_even_a_failure() {
    let registry = basic_registry()
        .register("slow", SlowStep { delay_ms: 5_000, output: json!("slow") })
        .register("failing", AlwaysFail::operational("boom"));
    let workflow = Workflow::new(
        "first",
        vec![StepNode::new(
            "fan",
            NodeSpec::Parallel {
                children: vec![StepNode::step("dead", "failing"), StepNode::step("late", "slow")],
                wait_for: WaitFor::First,
            },
        )],
    );
    let executor = GraphExecutor::new(workflow).with_registry(registry);
    let err = executor.run(json!(null)).await.unwrap_err();
    assert!(matches!(err, ExecutorError::StepExecutionFailed { .. }));
}

#[tokio::test]
async fn branch_takes_then_or_else_on_truthiness() {
    let build = || {
        Workflow::new(
            "branch",
            vec![StepNode::new(
                "gate",
                NodeSpec::Branch {
                    condition: "input.flag".into(),
                    then: vec![step_with_input("yes", "echo", "\"then\"")],
                    otherwise: vec![step_with_input("no", "echo", "\"else\"")],
                },
            )],
        )
    };
    let executor = GraphExecutor::new(build()).with_registry(basic_registry());
    let handle = executor.run(json!({"flag": true})).await.unwrap();
    assert_eq!(handle.output, Some(json!("then")));

    let executor = GraphExecutor::new(build()).with_registry(basic_registry());
    let handle = executor.run(json!({"flag": 0})).await.unwrap();
    assert_eq!(handle.output, Some(json!("else")));
}

#[tokio::test]
async fn branch_without_matching_arm_yields_null() {
    let workflow = Workflow::new(
        "empty-else",
        vec![StepNode::new(
            "gate",
            NodeSpec::Branch {
                condition: "input.flag".into(),
                then: vec![step_with_input("yes", "echo", "1")],
                otherwise: vec![],
            },
        )],
    );
    let executor = GraphExecutor::new(workflow).with_registry(basic_registry());
    let handle = executor.run(json!({"flag": false})).await.unwrap();
    assert_eq!(handle.output, Some(Value::Null));
}

#[tokio::test]
async fn switch_matches_cases_structurally_then_falls_back() {
    let build = || {
        Workflow::new(
            "switch",
            vec![StepNode::new(
                "route",
                NodeSpec::Switch {
                    value: "input.kind".into(),
                    cases: vec![
                        SwitchCase {
                            when: json!("pdf"),
                            body: vec![step_with_input("p", "echo", "\"parsed pdf\"")],
                        },
                        SwitchCase {
                            when: json!("csv"),
                            body: vec![step_with_input("c", "echo", "\"parsed csv\"")],
                        },
                    ],
                    default: vec![step_with_input("d", "echo", "\"unknown\"")],
                },
            )],
        )
    };
    let executor = GraphExecutor::new(build()).with_registry(basic_registry());
    let handle = executor.run(json!({"kind": "csv"})).await.unwrap();
    assert_eq!(handle.output, Some(json!("parsed csv")));

    let executor = GraphExecutor::new(build()).with_registry(basic_registry());
    let handle = executor.run(json!({"kind": "xml"})).await.unwrap();
    assert_eq!(handle.output, Some(json!("unknown")));
}

#[tokio::test]
async fn foreach_preserves_input_order() {
    let workflow = Workflow::new(
        "each",
        vec![StepNode::new(
            "loop",
            NodeSpec::Foreach {
                items: "input.items".into(),
                body: vec![StepNode::step("double", "double")],
                max_concurrency: None,
                break_when: None,
            },
        )],
    );
    let executor = GraphExecutor::new(workflow).with_registry(basic_registry());
    let handle = executor.run(json!({"items": [1, 2, 3, 4]})).await.unwrap();
    assert_eq!(handle.output, Some(json!([2.0, 4.0, 6.0, 8.0])));
}

#[tokio::test]
async fn foreach_break_when_stops_dispatching() {
    let workflow = Workflow::new(
        "each",
        vec![StepNode::new(
            "loop",
            NodeSpec::Foreach {
                items: "input.items".into(),
                body: vec![StepNode::step("double", "double")],
                max_concurrency: Some(1),
                // Any non-zero doubled value stops the loop.
                break_when: Some("output".into()),
            },
        )],
    );
    let executor = GraphExecutor::new(workflow).with_registry(basic_registry());
    let handle = executor.run(json!({"items": [0, 3, 9, 11]})).await.unwrap();
    assert_eq!(handle.output, Some(json!([0.0, 6.0])));
}

#[tokio::test]
async fn foreach_over_non_array_is_a_config_error() {
    let workflow = Workflow::new(
        "each",
        vec![StepNode::new(
            "loop",
            NodeSpec::Foreach {
                items: "input.items".into(),
                body: vec![StepNode::step("double", "double")],
                max_concurrency: None,
                break_when: None,
            },
        )],
    );
    let executor = GraphExecutor::new(workflow).with_registry(basic_registry());
    let err = executor.run(json!({"items": "oops"})).await.unwrap_err();
    assert!(matches!(err, ExecutorError::InvalidStepConfig { .. }));
}

#[tokio::test]
async fn while_runs_body_at_least_once_and_stops_on_false() {
    let remaining = Arc::new(AtomicU32::new(2));
    let countdown = {
        let remaining = Arc::clone(&remaining);
        fn_step(move |_| {
            let left = remaining.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            Ok(json!({"more": left > 0, "left": left}))
        })
    };
    let workflow = Workflow::new(
        "poll",
        vec![StepNode::new(
            "wait",
            NodeSpec::While {
                condition: "steps.check.more".into(),
                body: vec![StepNode::step("check", "countdown")],
                max_iterations: Some(10),
            },
        )],
    );
    let executor = GraphExecutor::new(workflow)
        .with_registry(InMemoryRegistry::new().register("countdown", countdown));
    let handle = executor.run(json!(null)).await.unwrap();
    assert_eq!(handle.output, Some(json!({"more": false, "left": 0})));
}

#[tokio::test]
async fn while_exceeding_max_iterations_fails() {
    let calls = Arc::new(AtomicU32::new(0));
    let workflow = Workflow::new(
        "spin",
        vec![StepNode::new(
            "forever",
            NodeSpec::While {
                condition: "true".into(),
                body: vec![StepNode::step("tick", "count")],
                max_iterations: Some(3),
            },
        )],
    );
    let executor = GraphExecutor::new(workflow).with_registry(
        InMemoryRegistry::new().register("count", CountingStep::new(calls.clone(), json!(1))),
    );
    let err = executor.run(json!(null)).await.unwrap_err();
    match err {
        ExecutorError::MaxIterationsExceeded { node_id, max } => {
            assert_eq!(node_id, "forever");
            assert_eq!(max, 3);
        }
        other => panic!("expected max-iterations, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn try_catch_binds_the_error_and_recovers() {
    let registry = basic_registry().register("failing", AlwaysFail::operational("upstream_down"));
    let workflow = Workflow::new(
        "guarded",
        vec![StepNode::new(
            "try1",
            NodeSpec::Try {
                body: vec![StepNode::step("risky", "failing")],
                catch: Some(vec![step_with_input("recover", "echo", "error.code")]),
                finally: None,
            },
        )],
    );
    let executor = GraphExecutor::new(workflow).with_registry(registry);
    let handle = executor.run(json!(null)).await.unwrap();
    assert_eq!(handle.output, Some(json!("step_failed")));
}

#[tokio::test]
async fn try_without_catch_propagates() {
    let registry = InMemoryRegistry::new().register("failing", AlwaysFail::operational("boom"));
    let workflow = Workflow::new(
        "unguarded",
        vec![StepNode::new(
            "try1",
            NodeSpec::Try {
                body: vec![StepNode::step("risky", "failing")],
                catch: None,
                finally: None,
            },
        )],
    );
    let executor = GraphExecutor::new(workflow).with_registry(registry);
    assert!(matches!(
        executor.run(json!(null)).await.unwrap_err(),
        ExecutorError::StepExecutionFailed { .. }
    ));
}

#[tokio::test]
async fn definition_errors_are_not_catchable() {
    let workflow = Workflow::new(
        "miswired",
        vec![StepNode::new(
            "try1",
            NodeSpec::Try {
                body: vec![StepNode::step("risky", "no_such_handler")],
                catch: Some(vec![step_with_input("recover", "echo", "\"caught\"")]),
                finally: None,
            },
        )],
    );
    let executor = GraphExecutor::new(workflow).with_registry(basic_registry());
    assert!(matches!(
        executor.run(json!(null)).await.unwrap_err(),
        ExecutorError::StepNotFound { .. }
    ));
}

#[tokio::test]
async fn finally_runs_on_success_and_its_failure_wins() {
    let ran_finally = Arc::new(AtomicU32::new(0));
    let registry = basic_registry()
        .register("cleanup", CountingStep::new(ran_finally.clone(), json!(null)))
        .register("failing", AlwaysFail::operational("cleanup_broke"));

    let ok_workflow = Workflow::new(
        "tidy",
        vec![StepNode::new(
            "try1",
            NodeSpec::Try {
                body: vec![step_with_input("work", "echo", "\"done\"")],
                catch: None,
                finally: Some(vec![StepNode::step("sweep", "cleanup")]),
            },
        )],
    );
    let executor = GraphExecutor::new(ok_workflow).with_registry(registry.clone());
    let handle = executor.run(json!(null)).await.unwrap();
    assert_eq!(handle.output, Some(json!("done")));
    assert_eq!(ran_finally.load(Ordering::SeqCst), 1);

    let broken_finally = Workflow::new(
        "untidy",
        vec![StepNode::new(
            "try1",
            NodeSpec::Try {
                body: vec![step_with_input("work", "echo", "\"done\"")],
                catch: None,
                finally: Some(vec![StepNode::step("sweep", "failing")]),
            },
        )],
    );
    let executor = GraphExecutor::new(broken_finally).with_registry(registry);
    assert!(executor.run(json!(null)).await.is_err());
}

#[tokio::test]
async fn finally_runs_exactly_once_when_the_body_fails() {
    let ran_finally = Arc::new(AtomicU32::new(0));
    let registry = basic_registry()
        .register("cleanup", CountingStep::new(ran_finally.clone(), json!(null)))
        .register("failing", AlwaysFail::operational("upstream_down"));
    let workflow = Workflow::new(
        "tidy-failure",
        vec![StepNode::new(
            "try1",
            NodeSpec::Try {
                body: vec![StepNode::step("risky", "failing")],
                catch: None,
                finally: Some(vec![StepNode::step("sweep", "cleanup")]),
            },
        )],
    );
    let executor = GraphExecutor::new(workflow).with_registry(registry);
    let err = executor.run(json!(null)).await.unwrap_err();
    assert!(matches!(err, ExecutorError::StepExecutionFailed { .. }));
    assert_eq!(ran_finally.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn finally_runs_exactly_once_when_catch_also_fails() {
    let ran_finally = Arc::new(AtomicU32::new(0));
    let registry = basic_registry()
        .register("cleanup", CountingStep::new(ran_finally.clone(), json!(null)))
        .register("failing", AlwaysFail::operational("upstream_down"))
        .register("worse", AlwaysFail::operational("recovery_down"));
    let workflow = Workflow::new(
        "doubly-broken",
        vec![StepNode::new(
            "try1",
            NodeSpec::Try {
                body: vec![StepNode::step("risky", "failing")],
                catch: Some(vec![StepNode::step("rescue", "worse")]),
                finally: Some(vec![StepNode::step("sweep", "cleanup")]),
            },
        )],
    );
    let executor = GraphExecutor::new(workflow).with_registry(registry);
    // The catch block's own failure propagates, after finally has run.
    let err = executor.run(json!(null)).await.unwrap_err();
    match err {
        ExecutorError::StepExecutionFailed { source, .. } => {
            assert_eq!(source.code, "recovery_down");
        }
        other => panic!("expected the catch failure, got {other:?}"),
    }
    assert_eq!(ran_finally.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn map_reduce_doubles_then_sums() {
    let workflow = Workflow::new(
        "mr",
        vec![StepNode::new(
            "totals",
            NodeSpec::MapReduce {
                items: "input.items".into(),
                map: Box::new(StepNode::step("double", "double")),
                reduce: Box::new(StepNode::step("sum", "sum")),
                max_concurrency: Some(2),
            },
        )],
    );
    let executor = GraphExecutor::new(workflow).with_registry(basic_registry());
    let handle = executor.run(json!({"items": [1, 2, 3, 4, 5]})).await.unwrap();
    assert_eq!(handle.output, Some(json!(30.0)));
}

/// Tracks how many invocations overlap, for concurrency-window assertions.
struct GaugeStep {
    current: Arc<AtomicU32>,
    peak: Arc<AtomicU32>,
}

#[async_trait]
impl StepHandler for GaugeStep {
    async fn invoke(&self, input: Value, _ctx: StepContext) -> Result<Value, StepError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(input)
    }
}

#[tokio::test(start_paused = true)]
async fn foreach_without_a_window_uses_the_executor_bound() {
    let current = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let workflow = Workflow::new(
        "bounded",
        vec![StepNode::new(
            "loop",
            NodeSpec::Foreach {
                items: "input.items".into(),
                body: vec![StepNode::step("work", "gauge")],
                max_concurrency: None,
                break_when: None,
            },
        )],
    );
    let executor = GraphExecutor::with_config(
        workflow,
        ExecutorConfig::default().with_max_concurrency(1),
    )
    .with_registry(InMemoryRegistry::new().register(
        "gauge",
        GaugeStep {
            current: current.clone(),
            peak: peak.clone(),
        },
    ));
    executor.run(json!({"items": [1, 2, 3]})).await.unwrap();
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn nested_scopes_shadow_outer_step_outputs() {
    // An inner foreach body step named like a root step: `steps.probe` inside
    // the loop must see the iteration's own output, not the root one.
    let registry = basic_registry();
    let workflow = Workflow::new(
        "shadow",
        vec![
            step_with_input("probe", "echo", "\"outer\""),
            StepNode::new(
                "loop",
                NodeSpec::Foreach {
                    items: "[\"inner\"]".into(),
                    body: vec![
                        step_with_input("probe", "echo", "item"),
                        step_with_input("read", "echo", "steps.probe").with_depends_on(["probe"]),
                    ],
                    max_concurrency: None,
                    break_when: None,
                },
            )
            .with_depends_on(["probe"]),
        ],
    )
    .with_output("steps.loop");
    let executor = GraphExecutor::new(workflow).with_registry(registry);
    let handle = executor.run(json!(null)).await.unwrap();
    assert_eq!(
        handle.output,
        Some(json!([{"probe": "inner", "read": "inner"}]))
    );
}
