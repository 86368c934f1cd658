//! Resumable DAG execution.
//!
//! Nodes run group by group in execution order, bounded by the scheduler's
//! concurrency limit. Every node state change is persisted before dispatch
//! and after completion, so `execute` on the same workflow id resumes from
//! durable state: completed nodes are skipped, interrupted ones restart
//! (executors must be idempotent). Failures route through the self-healing
//! loop; validation failures at or above a node's severity threshold block
//! their downstream nodes and, in halt mode, stop the workflow with a
//! recovery context.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use ensemble_core::bus::team_topic;
use ensemble_core::config::SchedulerConfig;
use ensemble_core::error::FailureReport;
use ensemble_core::model::{
    ExecutionAttempt, NodeKind, NodeState, RecoveryContext, RecoveryInstruction, Severity,
    WorkflowDag, WorkflowNode, WorkflowStatus,
};
use ensemble_core::{ids, store, CoreError, EventBus, StateStore};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dag;
use crate::healing::HealingLoop;
use crate::{Result, WorkflowError};

/// Shared run context: the global input plus every completed node's output.
pub struct ExecutionContext {
    pub workflow_id: String,
    pub team_id: String,
    pub global: Value,
    outputs: RwLock<HashMap<String, Value>>,
}

impl ExecutionContext {
    pub fn new(workflow_id: String, team_id: String, global: Value) -> Self {
        Self {
            workflow_id,
            team_id,
            global,
            outputs: RwLock::new(HashMap::new()),
        }
    }

    pub fn node_output(&self, node_id: &str) -> Option<Value> {
        self.outputs.read().unwrap().get(node_id).cloned()
    }

    pub fn set_output(&self, node_id: &str, output: Value) {
        self.outputs.write().unwrap().insert(node_id.to_string(), output);
    }

    pub fn outputs(&self) -> HashMap<String, Value> {
        self.outputs.read().unwrap().clone()
    }
}

/// Executes one node. Implementations must be idempotent: a node interrupted
/// while `running` is re-executed on resume.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(
        &self,
        node: &WorkflowNode,
        ctx: &ExecutionContext,
    ) -> std::result::Result<Value, CoreError>;
}

/// Synchronous closure adapter, mostly for tests and small glue nodes.
pub struct FnExecutor {
    #[allow(clippy::type_complexity)]
    f: Box<
        dyn Fn(&WorkflowNode, &ExecutionContext) -> std::result::Result<Value, CoreError>
            + Send
            + Sync,
    >,
}

impl FnExecutor {
    pub fn new(
        f: impl Fn(&WorkflowNode, &ExecutionContext) -> std::result::Result<Value, CoreError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl NodeExecutor for FnExecutor {
    async fn execute(
        &self,
        node: &WorkflowNode,
        ctx: &ExecutionContext,
    ) -> std::result::Result<Value, CoreError> {
        (self.f)(node, ctx)
    }
}

/// Checkpoints and notifications complete immediately.
pub struct NoopExecutor;

#[async_trait]
impl NodeExecutor for NoopExecutor {
    async fn execute(
        &self,
        node: &WorkflowNode,
        _ctx: &ExecutionContext,
    ) -> std::result::Result<Value, CoreError> {
        Ok(json!({"node": node.id, "status": "completed"}))
    }
}

/// Resolves the executor for a node: explicit `inputs.validator` name first,
/// then the node name, then the node kind.
#[derive(Default)]
pub struct ExecutorRegistry {
    by_name: HashMap<String, Arc<dyn NodeExecutor>>,
    by_kind: HashMap<NodeKind, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_name(&mut self, name: impl Into<String>, executor: Arc<dyn NodeExecutor>) {
        self.by_name.insert(name.into(), executor);
    }

    pub fn register_kind(&mut self, kind: NodeKind, executor: Arc<dyn NodeExecutor>) {
        self.by_kind.insert(kind, executor);
    }

    pub fn resolve(&self, node: &WorkflowNode) -> Option<Arc<dyn NodeExecutor>> {
        if let Some(name) = node.inputs.get("validator").and_then(Value::as_str) {
            if let Some(executor) = self.by_name.get(name) {
                return Some(Arc::clone(executor));
            }
        }
        if let Some(executor) = self.by_name.get(&node.name) {
            return Some(Arc::clone(executor));
        }
        self.by_kind.get(&node.kind).map(Arc::clone)
    }
}

/// Options for one execution run.
#[derive(Clone)]
pub struct ExecuteOptions {
    /// Halt on the first failed node (validation or otherwise) and produce a
    /// recovery context; otherwise continue and skip unreachable nodes.
    pub fail_on_validation_error: bool,
    pub cancellation: CancellationToken,
    pub global_context: Value,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            fail_on_validation_error: true,
            cancellation: CancellationToken::new(),
            global_context: Value::Null,
        }
    }
}

/// Final result of one execution run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub nodes_run: usize,
    pub node_states: HashMap<String, NodeState>,
    pub outputs: HashMap<String, Value>,
    pub recovery: Option<RecoveryContext>,
    pub failure: Option<FailureReport>,
}

enum NodeRun {
    Completed(Value),
    ValidationFailed { output: Value, severity: Severity },
    Failed(CoreError),
}

pub struct DagExecutor {
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    registry: Arc<ExecutorRegistry>,
    healing: Arc<HealingLoop>,
    config: SchedulerConfig,
}

impl DagExecutor {
    pub fn new(
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
        registry: ExecutorRegistry,
        healing: Arc<HealingLoop>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            bus,
            registry: Arc::new(registry),
            healing,
            config,
        }
    }

    /// Persist a freshly built DAG so it can be executed and resumed by id.
    pub fn register(&self, dag: &WorkflowDag) -> Result<()> {
        self.store.upsert_workflow(dag)?;
        Ok(())
    }

    /// Run (or resume) a workflow. Completed nodes are skipped; nodes left
    /// `running` by an interrupted process restart.
    pub async fn execute(&self, workflow_id: &str, options: ExecuteOptions) -> Result<ExecutionResult> {
        let mut dag = self.store.get_workflow(workflow_id)?;
        let order = dag::execution_order(&dag)?;
        let team_id = dag.team_id.clone();

        // Completed nodes stay done; everything else restarts from pending.
        // Interrupted `running` nodes simply re-execute (executors are
        // idempotent), and previously blocked or skipped states re-derive
        // from this run's outcomes.
        for node in dag.nodes.iter_mut() {
            if node.state != NodeState::Completed {
                node.state = NodeState::Pending;
                node.last_error = None;
            }
        }
        dag.status = WorkflowStatus::Running;
        if dag.started_at.is_none() {
            dag.started_at = Some(ids::now_iso());
        }
        self.persist_workflow(&dag, "started")?;

        let ctx = Arc::new(ExecutionContext::new(
            workflow_id.to_string(),
            team_id.clone(),
            options.global_context.clone(),
        ));
        for node in &dag.nodes {
            if node.state == NodeState::Completed {
                ctx.set_output(&node.id, node.outputs.clone());
            }
        }

        let semaphore = Arc::new(Semaphore::new(
            self.config.max_concurrent_nodes_per_workflow.max(1),
        ));
        let mut nodes_run = 0usize;
        let mut recovery: Option<RecoveryContext> = None;
        let mut failure: Option<FailureReport> = None;
        let mut halted = false;
        let mut cancelled = false;
        let mut last_phase: Option<String> = None;

        'groups: for group in &order {
            if halted || cancelled {
                break;
            }
            let phase = dag::dominant_phase(&self.reload(workflow_id)?, group);
            if phase.is_some() && phase != last_phase {
                self.emit(
                    &team_id,
                    "workflow",
                    "phase_changed",
                    json!({
                        "workflow_id": workflow_id,
                        "from_phase": last_phase,
                        "to_phase": phase,
                    }),
                )?;
                last_phase = phase;
            }

            // Decide which members of the group can run at all.
            let current = self.reload(workflow_id)?;
            let mut runnable: Vec<WorkflowNode> = Vec::new();
            for node_id in group {
                let node = current
                    .node(node_id)
                    .ok_or_else(|| WorkflowError::InvalidNode(node_id.clone()))?
                    .clone();
                match node.state {
                    NodeState::Completed => continue,
                    NodeState::Skipped | NodeState::Blocked | NodeState::Cancelled => continue,
                    _ => {}
                }
                let blocked_dep = node.depends_on.iter().any(|dep| {
                    matches!(
                        current.node(dep).map(|n| n.state),
                        Some(NodeState::Blocked) | Some(NodeState::Failed)
                    )
                });
                let incomplete_dep = node
                    .depends_on
                    .iter()
                    .any(|dep| current.node(dep).map(|n| n.state) != Some(NodeState::Completed));
                if blocked_dep {
                    self.mark_node(workflow_id, &node.id, NodeState::Blocked, None, None)?;
                    continue;
                }
                if incomplete_dep {
                    self.mark_node(workflow_id, &node.id, NodeState::Skipped, None, None)?;
                    continue;
                }
                runnable.push(node);
            }

            // Run the group concurrently under the configured bound.
            let mut join_set: JoinSet<(String, NodeRun, Vec<crate::healing::AttemptTrace>, u32)> =
                JoinSet::new();
            for node in runnable {
                nodes_run += 1;
                self.mark_node(workflow_id, &node.id, NodeState::Running, None, None)?;
                let Some(executor) = self.registry.resolve(&node) else {
                    let err = CoreError::Permanent(format!(
                        "no executor registered for node '{}'",
                        node.id
                    ));
                    self.finish_failed_node(workflow_id, &node.id, &err)?;
                    if options.fail_on_validation_error {
                        failure = Some(err.report());
                        recovery = Some(self.recovery_for(&self.reload(workflow_id)?, &node.id, &err.to_string()));
                        halted = true;
                        break 'groups;
                    }
                    self.skip_downstream(workflow_id, &node.id)?;
                    continue;
                };

                let ctx = Arc::clone(&ctx);
                let healing = Arc::clone(&self.healing);
                let semaphore = Arc::clone(&semaphore);
                let cancel = options.cancellation.clone();
                let timeout =
                    Duration::from_secs(node.max_duration_secs.unwrap_or(self.config.node_default_timeout_secs));
                let execution_id = ids::execution_id();
                join_set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                    let node_for_run = node.clone();
                    let outcome = healing
                        .run(&execution_id, &node.name, &cancel, |_attempt| {
                            let node = node_for_run.clone();
                            let ctx = Arc::clone(&ctx);
                            let executor = Arc::clone(&executor);
                            let cancel = cancel.clone();
                            async move {
                                tokio::select! {
                                    _ = cancel.cancelled() => Err(CoreError::Cancelled {
                                        reason: "workflow cancelled".into(),
                                    }),
                                    result = tokio::time::timeout(timeout, executor.execute(&node, &ctx)) => {
                                        match result {
                                            Ok(inner) => inner,
                                            Err(_) => Err(CoreError::Transient(format!(
                                                "node '{}' timed out after {}s",
                                                node.id,
                                                timeout.as_secs()
                                            ))),
                                        }
                                    }
                                }
                            }
                        })
                        .await;
                    let attempts = outcome.attempts;
                    let attempt_count = attempts.len() as u32;
                    let run = match outcome.result {
                        Ok(output) => classify_node_output(&node, output),
                        Err(err) => NodeRun::Failed(err),
                    };
                    (node.id.clone(), run, attempts, attempt_count)
                });
            }

            let mut group_failures: Vec<(String, String)> = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                let Ok((node_id, run, attempts, attempt_count)) = joined else {
                    continue;
                };
                self.persist_attempts(workflow_id, &node_id, &attempts)?;
                match run {
                    NodeRun::Completed(output) => {
                        ctx.set_output(&node_id, output.clone());
                        self.mark_node(
                            workflow_id,
                            &node_id,
                            NodeState::Completed,
                            Some(output),
                            Some(attempt_count),
                        )?;
                    }
                    NodeRun::ValidationFailed { output, severity } => {
                        ctx.set_output(&node_id, output.clone());
                        let message = format!(
                            "validation failed at '{node_id}' with severity {}",
                            severity.name()
                        );
                        self.mark_node(
                            workflow_id,
                            &node_id,
                            NodeState::Failed,
                            Some(output.clone()),
                            Some(attempt_count),
                        )?;
                        self.block_downstream(workflow_id, &node_id)?;
                        group_failures.push((node_id.clone(), message.clone()));
                        if recovery.is_none() {
                            recovery = output
                                .get("recovery_context")
                                .filter(|v| !v.is_null())
                                .and_then(|v| serde_json::from_value(v.clone()).ok());
                        }
                        if failure.is_none() {
                            failure = Some(CoreError::Validation(message).report());
                        }
                    }
                    NodeRun::Failed(err) => {
                        self.finish_failed_node(workflow_id, &node_id, &err)?;
                        if matches!(err, CoreError::Cancelled { .. }) {
                            cancelled = true;
                        }
                        if matches!(err, CoreError::GateBlocked(_)) {
                            // Gate verdicts always halt, whatever the mode.
                            halted = true;
                        }
                        group_failures.push((node_id.clone(), err.to_string()));
                        if failure.is_none() {
                            failure = Some(err.report());
                        }
                    }
                }
            }

            if !group_failures.is_empty() && !cancelled {
                // The recovery context belongs to the first failed node in
                // topological order within the group.
                group_failures.sort();
                let (first_failed, message) = &group_failures[0];
                if options.fail_on_validation_error || halted {
                    if recovery.is_none() {
                        recovery =
                            Some(self.recovery_for(&self.reload(workflow_id)?, first_failed, message));
                    }
                    halted = true;
                } else {
                    for (node_id, _) in &group_failures {
                        self.skip_downstream(workflow_id, node_id)?;
                    }
                }
            }
        }

        // Finalize.
        let mut final_dag = self.reload(workflow_id)?;
        let status = if cancelled {
            WorkflowStatus::Cancelled
        } else if halted || final_dag.nodes.iter().any(|n| n.state == NodeState::Failed) {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };
        final_dag.status = status;
        final_dag.completed_at = Some(ids::now_iso());
        let action = match status {
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Cancelled => "cancelled",
            _ => "failed",
        };
        self.persist_workflow(&final_dag, action)?;
        info!(workflow_id, status = status.name(), nodes_run, "workflow finished");

        Ok(ExecutionResult {
            workflow_id: workflow_id.to_string(),
            status,
            nodes_run,
            node_states: final_dag
                .nodes
                .iter()
                .map(|n| (n.id.clone(), n.state))
                .collect(),
            outputs: ctx.outputs(),
            recovery,
            failure,
        })
    }

    fn reload(&self, workflow_id: &str) -> Result<WorkflowDag> {
        Ok(self.store.get_workflow(workflow_id)?)
    }

    fn persist_workflow(&self, dag: &WorkflowDag, action: &str) -> Result<()> {
        let team_id = dag.team_id.clone();
        let payload = json!({"workflow_id": dag.id, "status": dag.status.name()});
        self.store.with_transaction(|tx| {
            store::upsert_workflow(tx, dag)?;
            store::enqueue_event(tx, &team_topic(&team_id, "workflow", action), &payload)
        })?;
        self.bus.flush_outbox(&self.store)?;
        Ok(())
    }

    fn emit(&self, team_id: &str, category: &str, action: &str, payload: Value) -> Result<()> {
        self.store
            .with_transaction(|tx| store::enqueue_event(tx, &team_topic(team_id, category, action), &payload))?;
        self.bus.flush_outbox(&self.store)?;
        Ok(())
    }

    /// Transition one node, persist the whole graph and publish the matching
    /// node event in the same transaction.
    fn mark_node(
        &self,
        workflow_id: &str,
        node_id: &str,
        state: NodeState,
        outputs: Option<Value>,
        attempt_count: Option<u32>,
    ) -> Result<()> {
        let action = match state {
            NodeState::Running => "started",
            NodeState::Completed => "completed",
            NodeState::Failed => "failed",
            NodeState::Skipped => "skipped",
            NodeState::Blocked => "blocked",
            NodeState::Cancelled => "cancelled",
            NodeState::Pending | NodeState::Ready => "queued",
        };
        self.store.with_transaction(|tx| {
            let mut dag = store::get_workflow(tx, workflow_id)?;
            let team_id = dag.team_id.clone();
            let Some(node) = dag.node_mut(node_id) else {
                return Err(CoreError::NotFound(format!("node {node_id}")));
            };
            node.state = state;
            match state {
                NodeState::Running => node.started_at = Some(ids::now_iso()),
                s if s.is_terminal() => node.completed_at = Some(ids::now_iso()),
                _ => {}
            }
            if let Some(outputs) = outputs {
                node.outputs = outputs;
            }
            if let Some(attempts) = attempt_count {
                node.attempt_count = attempts;
            }
            store::upsert_workflow(tx, &dag)?;
            store::enqueue_event(
                tx,
                &team_topic(&team_id, "node", action),
                &json!({"workflow_id": workflow_id, "node_id": node_id, "state": state.name()}),
            )
        })?;
        self.bus.flush_outbox(&self.store)?;
        Ok(())
    }

    fn finish_failed_node(&self, workflow_id: &str, node_id: &str, err: &CoreError) -> Result<()> {
        let state = if matches!(err, CoreError::Cancelled { .. }) {
            NodeState::Cancelled
        } else {
            NodeState::Failed
        };
        self.store.with_transaction(|tx| {
            let mut dag = store::get_workflow(tx, workflow_id)?;
            let team_id = dag.team_id.clone();
            if let Some(node) = dag.node_mut(node_id) {
                node.state = state;
                node.completed_at = Some(ids::now_iso());
                node.last_error = Some(err.to_string());
            }
            store::upsert_workflow(tx, &dag)?;
            store::enqueue_event(
                tx,
                &team_topic(&team_id, "node", "failed"),
                &json!({
                    "workflow_id": workflow_id,
                    "node_id": node_id,
                    "state": state.name(),
                    "error": err.report(),
                }),
            )
        })?;
        self.bus.flush_outbox(&self.store)?;
        Ok(())
    }

    fn persist_attempts(
        &self,
        workflow_id: &str,
        node_id: &str,
        attempts: &[crate::healing::AttemptTrace],
    ) -> Result<()> {
        for trace in attempts {
            self.store.insert_attempt(&ExecutionAttempt {
                id: ids::attempt_id(),
                workflow_id: workflow_id.to_string(),
                node_id: node_id.to_string(),
                attempt_number: trace.attempt_number,
                started_at: trace.started_at.clone(),
                ended_at: Some(trace.ended_at.clone()),
                outcome: trace.outcome,
                error_classification: trace.error_classification.clone(),
                evidence_refs: Vec::new(),
            })?;
        }
        Ok(())
    }

    fn descendants(dag: &WorkflowDag, root: &str) -> HashSet<String> {
        let mut found: HashSet<String> = HashSet::new();
        let mut frontier = vec![root.to_string()];
        while let Some(current) = frontier.pop() {
            for node in &dag.nodes {
                if node.depends_on.contains(&current) && found.insert(node.id.clone()) {
                    frontier.push(node.id.clone());
                }
            }
        }
        found
    }

    fn block_downstream(&self, workflow_id: &str, node_id: &str) -> Result<()> {
        self.mark_downstream(workflow_id, node_id, NodeState::Blocked)
    }

    fn skip_downstream(&self, workflow_id: &str, node_id: &str) -> Result<()> {
        self.mark_downstream(workflow_id, node_id, NodeState::Skipped)
    }

    fn mark_downstream(&self, workflow_id: &str, node_id: &str, state: NodeState) -> Result<()> {
        let dag = self.reload(workflow_id)?;
        for descendant in Self::descendants(&dag, node_id) {
            if let Some(node) = dag.node(&descendant) {
                if !node.state.is_terminal() {
                    self.mark_node(workflow_id, &descendant, state, None, None)?;
                }
            }
        }
        Ok(())
    }

    /// Structured pointer to where a halted workflow should resume.
    fn recovery_for(&self, dag: &WorkflowDag, failed_node: &str, message: &str) -> RecoveryContext {
        let phase = dag
            .node(failed_node)
            .and_then(|n| n.phase.clone())
            .unwrap_or_else(|| failed_node.to_string());
        let mut instructions = vec![RecoveryInstruction {
            phase: phase.clone(),
            action: format!("retry_node:{failed_node}"),
            details: message.to_string(),
            priority: 1,
        }];
        let unfinished: Vec<String> = dag
            .nodes
            .iter()
            .filter(|n| !matches!(n.state, NodeState::Completed))
            .map(|n| n.id.clone())
            .collect();
        for node_id in &unfinished {
            if node_id != failed_node {
                instructions.push(RecoveryInstruction {
                    phase: dag
                        .node(node_id)
                        .and_then(|n| n.phase.clone())
                        .unwrap_or_else(|| node_id.clone()),
                    action: format!("resume_node:{node_id}"),
                    details: String::new(),
                    priority: 2,
                });
            }
        }
        let completed = dag
            .nodes
            .iter()
            .filter(|n| n.state == NodeState::Completed)
            .count();
        let completion = if dag.nodes.is_empty() {
            1.0
        } else {
            completed as f64 / dag.nodes.len() as f64
        };
        RecoveryContext {
            workflow_id: dag.id.clone(),
            resume_from_phase: phase,
            gaps_summary: json!({
                "failed_node": failed_node,
                "message": message,
                "unfinished_nodes": unfinished,
                "estimated_completion": completion,
            }),
            recovery_instructions: instructions,
            recommended_approach: format!(
                "Resume workflow {} from '{}' after addressing: {}",
                dag.id, failed_node, message
            ),
        }
    }
}

/// Interpret a validator node's output: failures at or above the node's
/// severity threshold (default critical) fail the node.
fn classify_node_output(node: &WorkflowNode, output: Value) -> NodeRun {
    if node.kind != NodeKind::Validator {
        return NodeRun::Completed(output);
    }
    let passed = output
        .get("validation_passed")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    if passed {
        return NodeRun::Completed(output);
    }
    let threshold = node
        .inputs
        .get("severity_threshold")
        .and_then(Value::as_str)
        .and_then(parse_severity)
        .unwrap_or(Severity::Critical);
    let max_severity = output
        .get("critical_failures")
        .and_then(Value::as_array)
        .map(|failures| {
            failures
                .iter()
                .filter_map(|f| f.get("severity").and_then(Value::as_str).and_then(parse_severity))
                .max()
                .unwrap_or(Severity::Critical)
        })
        .unwrap_or(Severity::Critical);
    if max_severity >= threshold {
        NodeRun::ValidationFailed {
            output,
            severity: max_severity,
        }
    } else {
        warn!(node = node.id, "validation failed below threshold, continuing");
        NodeRun::Completed(output)
    }
}

fn parse_severity(raw: &str) -> Option<Severity> {
    match raw.to_lowercase().as_str() {
        "low" => Some(Severity::Low),
        "medium" => Some(Severity::Medium),
        "high" => Some(Severity::High),
        "critical" => Some(Severity::Critical),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_parsing_is_lenient_on_case() {
        assert_eq!(parse_severity("HIGH"), Some(Severity::High));
        assert_eq!(parse_severity("weird"), None);
    }

    #[test]
    fn validator_output_below_threshold_passes() {
        let mut node = WorkflowNode::new("v", NodeKind::Validator, "check");
        node.inputs = json!({"severity_threshold": "critical"});
        let output = json!({
            "validation_passed": false,
            "critical_failures": [{"severity": "high", "message": "thin coverage"}],
        });
        match classify_node_output(&node, output) {
            NodeRun::Completed(_) => {}
            _ => panic!("high severity should pass a critical threshold"),
        }
    }

    #[test]
    fn validator_output_at_threshold_fails() {
        let mut node = WorkflowNode::new("v", NodeKind::Validator, "check");
        node.inputs = json!({"severity_threshold": "high"});
        let output = json!({
            "validation_passed": false,
            "critical_failures": [{"severity": "high", "message": "missing routes"}],
        });
        match classify_node_output(&node, output) {
            NodeRun::ValidationFailed { severity, .. } => assert_eq!(severity, Severity::High),
            _ => panic!("expected validation failure"),
        }
    }
}
