//! Core executor behavior: dependency ordering, outputs, failure surfaces,
//! and the run-event stream.

use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

use weftflow::ExecutorError;
use weftflow::events::RunEvent;
use weftflow::graphs::{GraphGenerator, NodeSpec, StepNode, StepSpec, Workflow};
use weftflow::runtime::GraphExecutor;
use weftflow::state::RunStatus;
use weftflow::step::{InMemoryRegistry, StepError};
use weftflow::store::{InMemoryStateStore, StateStore};
use weftflow::utils::testing::{DoubleStep, EchoStep, fn_step};

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

#[tokio::test]
async fn single_step_run_completes_with_its_output() {
    let workflow = Workflow::new("echo", vec![StepNode::step("echo", "echo")]);
    let executor = GraphExecutor::new(workflow)
        .with_registry(InMemoryRegistry::new().register("echo", EchoStep));
    let handle = executor.run(json!({"hello": "world"})).await.unwrap();
    assert_eq!(handle.status, RunStatus::Completed);
    assert_eq!(handle.output, Some(json!({"hello": "world"})));
}

#[tokio::test]
async fn outputs_flow_between_dependent_steps() {
    let workflow = Workflow::new(
        "chain",
        vec![
            step_with_input("first", "double", "input.n"),
            step_with_input("second", "double", "steps.first").with_depends_on(["first"]),
        ],
    )
    .with_output("steps.second");
    let executor = GraphExecutor::new(workflow)
        .with_registry(InMemoryRegistry::new().register("double", DoubleStep));
    let handle = executor.run(json!({"n": 3})).await.unwrap();
    assert_eq!(handle.output, Some(json!(12.0)));
}

#[tokio::test]
async fn dependencies_gate_dispatch_order() {
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let order = Arc::clone(&order);
        fn_step(move |input: Value| {
            let label = input.as_str().unwrap_or("?").to_string();
            order.lock().unwrap().push(label);
            Ok(input)
        })
    };
    let workflow = Workflow::new(
        "ordered",
        vec![
            step_with_input("c", "record", "\"c\"").with_depends_on(["b"]),
            step_with_input("a", "record", "\"a\""),
            step_with_input("b", "record", "\"b\"").with_depends_on(["a"]),
        ],
    );
    let executor = GraphExecutor::new(workflow)
        .with_registry(InMemoryRegistry::new().register("record", recorder));
    executor.run(json!(null)).await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn root_scope_with_multiple_nodes_yields_keyed_output() {
    let workflow = Workflow::new(
        "pair",
        vec![
            step_with_input("left", "echo", "1"),
            step_with_input("right", "echo", "2"),
        ],
    );
    let executor = GraphExecutor::new(workflow)
        .with_registry(InMemoryRegistry::new().register("echo", EchoStep));
    let handle = executor.run(json!(null)).await.unwrap();
    assert_eq!(handle.output, Some(json!({"left": 1, "right": 2})));
}

#[tokio::test]
async fn dependency_cycle_surfaces_as_deadlock() {
    let workflow = Workflow::new(
        "cycle",
        vec![
            StepNode::step("a", "echo").with_depends_on(["b"]),
            StepNode::step("b", "echo").with_depends_on(["a"]),
        ],
    );
    let executor = GraphExecutor::new(workflow)
        .with_registry(InMemoryRegistry::new().register("echo", EchoStep));
    let err = executor.run(json!(null)).await.unwrap_err();
    match err {
        ExecutorError::Deadlock { nodes } => {
            assert_eq!(nodes.len(), 2);
            assert!(nodes.contains(&"a".to_string()));
            assert!(nodes.contains(&"b".to_string()));
        }
        other => panic!("expected deadlock, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_handler_fails_the_run() {
    let workflow = Workflow::new("missing", vec![StepNode::step("a", "nope")]);
    let executor = GraphExecutor::new(workflow);
    let err = executor.run(json!(null)).await.unwrap_err();
    assert!(matches!(err, ExecutorError::StepNotFound { .. }));
}

#[tokio::test]
async fn failed_run_is_persisted_with_its_error() {
    let store = Arc::new(InMemoryStateStore::new());
    let failing = fn_step(|_| Err(StepError::new("boom", "no")));
    let workflow = Workflow::new("failing", vec![StepNode::step("a", "fail")]);
    let executor = GraphExecutor::new(workflow)
        .with_registry(InMemoryRegistry::new().register("fail", failing))
        .with_store(store.clone());

    let events = executor.take_events().unwrap();
    let err = executor.run(json!(null)).await.unwrap_err();
    assert!(matches!(err, ExecutorError::StepExecutionFailed { .. }));

    let mut run_id = None;
    while let Ok(event) = events.try_recv() {
        if let RunEvent::RunFailed { run_id: id, .. } = event {
            run_id = Some(id);
        }
    }
    let state = store.load(&run_id.expect("run_failed event")).await.unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.error.as_ref().unwrap()["code"], json!("step_failed"));
}

#[tokio::test]
async fn event_stream_brackets_the_run() {
    let workflow = Workflow::new("evt", vec![StepNode::step("a", "echo")]);
    let executor = GraphExecutor::new(workflow)
        .with_registry(InMemoryRegistry::new().register("echo", EchoStep));
    let events = executor.take_events().unwrap();
    assert!(executor.take_events().is_none());

    executor.run(json!(1)).await.unwrap();
    let collected: Vec<RunEvent> = events.try_iter().collect();
    assert!(matches!(collected.first(), Some(RunEvent::RunStarted { .. })));
    assert!(matches!(collected.last(), Some(RunEvent::RunCompleted { .. })));
    assert!(
        collected
            .iter()
            .any(|e| matches!(e, RunEvent::NodeCompleted { path, .. } if path == "a"))
    );
}

struct PerItemGraph;

impl GraphGenerator for PerItemGraph {
    fn generate(&self, input: &Value) -> Result<Vec<StepNode>, weftflow::graphs::GraphError> {
        let count = input["items"].as_array().map_or(0, Vec::len);
        Ok((0..count)
            .map(|i| step_with_input(&format!("item{i}"), "double", &format!("input.items.{i}")))
            .collect())
    }
}

#[tokio::test]
async fn generated_workflows_build_nodes_from_input_and_persist_them() {
    let store = Arc::new(InMemoryStateStore::new());
    let workflow = Workflow::generated("per-item", PerItemGraph);
    let executor = GraphExecutor::new(workflow)
        .with_registry(InMemoryRegistry::new().register("double", DoubleStep))
        .with_store(store.clone());
    let handle = executor.run(json!({"items": [1, 2]})).await.unwrap();
    assert_eq!(handle.output, Some(json!({"item0": 2.0, "item1": 4.0})));

    let state = store.load(&handle.run_id).await.unwrap();
    assert_eq!(state.generated_nodes.as_ref().map(Vec::len), Some(2));
}

#[tokio::test]
async fn generated_workflow_with_no_nodes_fails_validation() {
    struct EmptyGraph;
    impl GraphGenerator for EmptyGraph {
        fn generate(&self, _: &Value) -> Result<Vec<StepNode>, weftflow::graphs::GraphError> {
            Ok(Vec::new())
        }
    }
    let executor = GraphExecutor::new(Workflow::generated("empty", EmptyGraph));
    let err = executor.run(json!(null)).await.unwrap_err();
    assert!(matches!(err, ExecutorError::ValidationFailed(_)));
}
