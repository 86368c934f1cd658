//! End-to-end engine tests: scheduling, resume, healing, gates.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ensemble_core::config::SchedulerConfig;
use ensemble_core::model::{NodeKind, NodeState, WorkflowNode, WorkflowStatus};
use ensemble_core::{CoreError, EventBus, StateStore};
use ensemble_workflow::executor::{ExecuteOptions, ExecutionContext, NodeExecutor};
use ensemble_workflow::healing::{ExecutionHistoryLogger, ExecutionStatus, HealingLoop};
use ensemble_workflow::trimodal::{
    BehavioralReport, QualityReport, StructuralReport, VerdictAggregator,
};
use ensemble_workflow::{
    standard_registry, DagExecutor, ExecutorRegistry, FnExecutor, NodeSpec, WorkflowSpec,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn scheduler() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_nodes_per_workflow: 4,
        node_default_timeout_secs: 5,
        retry_backoff_base_ms: 1,
        retry_backoff_cap_ms: 5,
        ..SchedulerConfig::default()
    }
}

struct Harness {
    store: Arc<StateStore>,
    history: Arc<ExecutionHistoryLogger>,
    executor: DagExecutor,
}

fn harness(configure: impl FnOnce(&mut ExecutorRegistry)) -> Harness {
    let store = Arc::new(StateStore::in_memory().unwrap());
    let bus = Arc::new(EventBus::new());
    let history = Arc::new(ExecutionHistoryLogger::in_memory().unwrap());
    let mut registry = standard_registry(Arc::clone(&store));
    configure(&mut registry);
    let healing = Arc::new(HealingLoop::new(Arc::clone(&history), &scheduler()));
    let executor = DagExecutor::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        registry,
        healing,
        scheduler(),
    );
    Harness {
        store,
        history,
        executor,
    }
}

fn node(id: &str, deps: &[&str]) -> NodeSpec {
    NodeSpec {
        id: id.into(),
        kind: NodeKind::Action,
        name: Some(id.into()),
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        inputs: Value::Null,
        max_duration_secs: None,
        phase: None,
        assigned_agent: None,
    }
}

fn spec(name: &str, nodes: Vec<NodeSpec>) -> WorkflowSpec {
    WorkflowSpec {
        name: name.into(),
        fail_on_validation_error: true,
        nodes,
    }
}

fn ok_executor(output: Value) -> Arc<FnExecutor> {
    Arc::new(FnExecutor::new(move |_node, _ctx| Ok(output.clone())))
}

#[tokio::test]
async fn empty_dag_completes_with_zero_nodes_run() {
    let h = harness(|_| {});
    let dag = ensemble_workflow::build(&spec("empty", vec![]), "team_1").unwrap();
    h.executor.register(&dag).unwrap();
    let result = h
        .executor
        .execute(&dag.id, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.nodes_run, 0);
}

#[tokio::test]
async fn diamond_runs_in_dependency_order_with_parallel_middle() {
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let order = Arc::clone(&order);
        Arc::new(FnExecutor::new(move |node, _ctx| {
            order.lock().unwrap().push(node.id.clone());
            Ok(json!({"done": node.id}))
        }))
    };
    let h = harness(|registry| {
        for id in ["requirements", "backend", "frontend", "integration"] {
            registry.register_name(id, Arc::clone(&recorder) as Arc<dyn NodeExecutor>);
        }
    });
    let dag = ensemble_workflow::build(
        &spec(
            "diamond",
            vec![
                node("requirements", &[]),
                node("backend", &["requirements"]),
                node("frontend", &["requirements"]),
                node("integration", &["backend", "frontend"]),
            ],
        ),
        "team_1",
    )
    .unwrap();
    h.executor.register(&dag).unwrap();
    let result = h
        .executor
        .execute(&dag.id, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.nodes_run, 4);

    let seen = order.lock().unwrap().clone();
    let position = |id: &str| seen.iter().position(|n| n == id).unwrap();
    assert_eq!(position("requirements"), 0);
    assert!(position("integration") > position("backend"));
    assert!(position("integration") > position("frontend"));

    // Running nodes only ever had completed dependencies: final states agree.
    let stored = h.store.get_workflow(&dag.id).unwrap();
    assert!(stored.nodes.iter().all(|n| n.state == NodeState::Completed));
}

/// An executor that fails with a timeout on the first attempt and succeeds on
/// the retry, exercising the self-healing loop end to end.
struct FlakyExecutor {
    calls: AtomicU32,
}

#[async_trait]
impl NodeExecutor for FlakyExecutor {
    async fn execute(
        &self,
        _node: &WorkflowNode,
        _ctx: &ExecutionContext,
    ) -> Result<Value, CoreError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(CoreError::Transient("request timed out".into()))
        } else {
            Ok(json!({"healed": true}))
        }
    }
}

#[tokio::test]
async fn transient_timeout_recovers_and_is_recorded() {
    let h = harness(|registry| {
        registry.register_name("deploy", Arc::new(FlakyExecutor {
            calls: AtomicU32::new(0),
        }));
    });
    let dag = ensemble_workflow::build(&spec("healing", vec![node("deploy", &[])]), "team_1").unwrap();
    h.executor.register(&dag).unwrap();
    let result = h
        .executor
        .execute(&dag.id, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);

    // Two persisted attempts: a classified failure, then a recovery.
    let attempts = h.store.attempts_for_node(&dag.id, "deploy").unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(
        attempts[0].error_classification.as_deref(),
        Some("timeout")
    );

    // The history record reflects the recovery.
    let records = h.history.get_records(Some("deploy"), None, 1, 10).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Recovered);
    assert_eq!(records[0].attempt_count, 2);
    assert!(records[0].recovery_applied);

    let stored = h.store.get_workflow(&dag.id).unwrap();
    let deploy = stored.node("deploy").unwrap();
    assert_eq!(deploy.state, NodeState::Completed);
    assert_eq!(deploy.attempt_count, 2);
}

#[tokio::test]
async fn halt_mode_stops_and_produces_recovery_context() {
    let h = harness(|registry| {
        registry.register_name("design", ok_executor(json!({"architecture": "ok"})));
        registry.register_name(
            "implement",
            Arc::new(FnExecutor::new(|_node, _ctx| {
                Err(CoreError::Permanent("dependency missing: payment sdk".into()))
            })),
        );
        registry.register_name("ship", ok_executor(json!({})));
    });
    let mut implement = node("implement", &["design"]);
    implement.phase = Some("implementation".into());
    let dag = ensemble_workflow::build(
        &spec(
            "halting",
            vec![node("design", &[]), implement, node("ship", &["implement"])],
        ),
        "team_1",
    )
    .unwrap();
    h.executor.register(&dag).unwrap();
    let result = h
        .executor
        .execute(&dag.id, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.node_states["implement"], NodeState::Failed);
    // Never dispatched past the failure.
    assert_eq!(result.node_states["ship"], NodeState::Pending);

    let recovery = result.recovery.expect("recovery context");
    assert_eq!(recovery.resume_from_phase, "implementation");
    assert!(recovery
        .recovery_instructions
        .iter()
        .any(|i| i.action == "retry_node:implement"));
    let failure = result.failure.expect("failure report");
    assert_eq!(failure.category, "permanent");
    assert!(!failure.retriable);
}

#[tokio::test]
async fn continue_mode_skips_unreachable_nodes() {
    let h = harness(|registry| {
        registry.register_name("design", ok_executor(json!({})));
        registry.register_name(
            "implement",
            Arc::new(FnExecutor::new(|_node, _ctx| {
                Err(CoreError::Permanent("boom".into()))
            })),
        );
        registry.register_name("docs", ok_executor(json!({})));
        registry.register_name("ship", ok_executor(json!({})));
    });
    let dag = ensemble_workflow::build(
        &spec(
            "continuing",
            vec![
                node("design", &[]),
                node("implement", &["design"]),
                node("docs", &["design"]),
                node("ship", &["implement"]),
            ],
        ),
        "team_1",
    )
    .unwrap();
    h.executor.register(&dag).unwrap();
    let result = h
        .executor
        .execute(
            &dag.id,
            ExecuteOptions {
                fail_on_validation_error: false,
                ..ExecuteOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result.node_states["docs"], NodeState::Completed);
    assert_eq!(result.node_states["ship"], NodeState::Skipped);
    assert_eq!(result.node_states["implement"], NodeState::Failed);
    assert_eq!(result.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn resume_skips_completed_nodes_and_reaches_terminal_state() {
    let design_runs = Arc::new(AtomicU32::new(0));
    let should_fail = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let design_counter = Arc::clone(&design_runs);
    let implement_switch = Arc::clone(&should_fail);
    let h = harness(move |registry| {
        registry.register_name(
            "design",
            Arc::new(FnExecutor::new(move |_node, _ctx| {
                design_counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"design": "done"}))
            })),
        );
        registry.register_name(
            "implement",
            Arc::new(FnExecutor::new(move |_node, _ctx| {
                if implement_switch.load(Ordering::SeqCst) {
                    Err(CoreError::Permanent("not ready".into()))
                } else {
                    Ok(json!({"implemented": true}))
                }
            })),
        );
    });
    let dag = ensemble_workflow::build(
        &spec(
            "resumable",
            vec![node("design", &[]), node("implement", &["design"])],
        ),
        "team_1",
    )
    .unwrap();
    h.executor.register(&dag).unwrap();

    let first = h
        .executor
        .execute(&dag.id, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(first.status, WorkflowStatus::Failed);
    assert_eq!(design_runs.load(Ordering::SeqCst), 1);

    // Fix the underlying problem and resume: design must not re-run, the
    // failed node restarts from pending.
    should_fail.store(false, Ordering::SeqCst);
    let second = h
        .executor
        .execute(&dag.id, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(second.status, WorkflowStatus::Completed);
    assert_eq!(design_runs.load(Ordering::SeqCst), 1);
    assert_eq!(second.node_states["implement"], NodeState::Completed);
}

struct SleepyExecutor;

#[async_trait]
impl NodeExecutor for SleepyExecutor {
    async fn execute(
        &self,
        _node: &WorkflowNode,
        _ctx: &ExecutionContext,
    ) -> Result<Value, CoreError> {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        Ok(Value::Null)
    }
}

#[tokio::test]
async fn cancellation_is_terminal_for_the_run() {
    let h = harness(|registry| {
        registry.register_name("slow", Arc::new(SleepyExecutor));
    });
    let dag = ensemble_workflow::build(&spec("cancellable", vec![node("slow", &[])]), "team_1")
        .unwrap();
    h.executor.register(&dag).unwrap();
    let cancellation = CancellationToken::new();
    let cancel_handle = cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel_handle.cancel();
    });
    let result = h
        .executor
        .execute(
            &dag.id,
            ExecuteOptions {
                cancellation,
                ..ExecuteOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result.status, WorkflowStatus::Cancelled);
    assert_eq!(result.node_states["slow"], NodeState::Cancelled);
}

#[tokio::test]
async fn failed_validator_blocks_downstream_nodes() {
    let h = harness(|registry| {
        registry.register_name("backend", ok_executor(json!({"components": ["models"]})));
        registry.register_name("deploy", ok_executor(json!({})));
    });
    let mut gaps = NodeSpec {
        id: "detect_gaps".into(),
        kind: NodeKind::Validator,
        name: Some("gap_detector".into()),
        depends_on: vec!["backend".into()],
        inputs: json!({
            "phase": "implementation",
            "expected_components": ["models", "routes"],
            "severity_threshold": "critical",
        }),
        max_duration_secs: None,
        phase: Some("implementation".into()),
        assigned_agent: None,
    };
    gaps.phase = Some("implementation".into());
    let dag = ensemble_workflow::build(
        &spec(
            "validated",
            vec![node("backend", &[]), gaps, node("deploy", &["detect_gaps"])],
        ),
        "team_1",
    )
    .unwrap();
    h.executor.register(&dag).unwrap();
    let result = h
        .executor
        .execute(&dag.id, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.node_states["detect_gaps"], NodeState::Failed);
    assert_eq!(result.node_states["deploy"], NodeState::Blocked);

    // The validator's own recovery context is surfaced.
    let recovery = result.recovery.expect("recovery context from gap detector");
    assert_eq!(recovery.resume_from_phase, "implementation");
    assert!(recovery
        .recovery_instructions
        .iter()
        .any(|i| i.action == "create_routes"));
}

#[tokio::test]
async fn verdict_gate_blocks_deployment_without_approval() {
    let h = harness(|registry| {
        registry.register_name("package", ok_executor(json!({})));
        registry.register_name("deploy", ok_executor(json!({})));
    });
    let gate = NodeSpec {
        id: "gate".into(),
        kind: NodeKind::Checkpoint,
        name: Some("verdict_gate".into()),
        depends_on: vec!["package".into()],
        inputs: Value::Null,
        max_duration_secs: None,
        phase: None,
        assigned_agent: None,
    };
    let dag = ensemble_workflow::build(
        &spec(
            "gated",
            vec![node("package", &[]), gate, node("deploy", &["gate"])],
        ),
        "team_1",
    )
    .unwrap();
    h.executor.register(&dag).unwrap();

    // Store a blocked verdict: structural blocker forces BLOCKED.
    let aggregator = VerdictAggregator::with_defaults();
    aggregator
        .generate_and_store(
            &h.store,
            "team_1",
            &dag.id,
            Some(&StructuralReport {
                is_compliant: false,
                conformance_score: 0.5,
                total_violations: 5,
                blocking_violations: 3,
                warning_violations: 2,
            }),
            Some(&BehavioralReport {
                total_contracts: 5,
                contracts_fulfilled: 5,
                overall_pass_rate: 0.98,
                scenarios_passed: 98,
                scenarios_failed: 2,
            }),
            Some(&QualityReport {
                avg_quality_score: 0.95,
                contract_fulfillment_rate: 1.0,
                error_rate: 0.02,
            }),
        )
        .unwrap();

    let result = h
        .executor
        .execute(&dag.id, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.node_states["gate"], NodeState::Failed);
    assert_eq!(result.node_states["deploy"], NodeState::Pending);
    let failure = result.failure.expect("gate failure");
    assert_eq!(failure.category, "gate_blocked");
}

#[tokio::test]
async fn approved_verdict_lets_the_gate_pass() {
    let h = harness(|registry| {
        registry.register_name("package", ok_executor(json!({})));
        registry.register_name("deploy", ok_executor(json!({"deployed": true})));
    });
    let gate = NodeSpec {
        id: "gate".into(),
        kind: NodeKind::Checkpoint,
        name: Some("verdict_gate".into()),
        depends_on: vec!["package".into()],
        inputs: Value::Null,
        max_duration_secs: None,
        phase: None,
        assigned_agent: None,
    };
    let dag = ensemble_workflow::build(
        &spec(
            "gated_ok",
            vec![node("package", &[]), gate, node("deploy", &["gate"])],
        ),
        "team_1",
    )
    .unwrap();
    h.executor.register(&dag).unwrap();

    VerdictAggregator::with_defaults()
        .generate_and_store(
            &h.store,
            "team_1",
            &dag.id,
            Some(&StructuralReport {
                is_compliant: true,
                conformance_score: 0.95,
                total_violations: 2,
                blocking_violations: 0,
                warning_violations: 2,
            }),
            Some(&BehavioralReport {
                total_contracts: 5,
                contracts_fulfilled: 5,
                overall_pass_rate: 0.98,
                scenarios_passed: 98,
                scenarios_failed: 2,
            }),
            Some(&QualityReport {
                avg_quality_score: 0.95,
                contract_fulfillment_rate: 1.0,
                error_rate: 0.02,
            }),
        )
        .unwrap();

    let result = h
        .executor
        .execute(&dag.id, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.node_states["deploy"], NodeState::Completed);
    assert_eq!(result.outputs["gate"]["decision"], "approved");
}
