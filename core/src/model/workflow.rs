//! Workflow graph entities persisted for resumable execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Phase,
    #[default]
    Action,
    Checkpoint,
    Validator,
    Notification,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Phase => "phase",
            NodeKind::Action => "action",
            NodeKind::Checkpoint => "checkpoint",
            NodeKind::Validator => "validator",
            NodeKind::Notification => "notification",
        }
    }
}

/// Node execution state.
///
/// `Ready` holds iff the node is pending and every dependency is `Completed`;
/// the engine never mutates a `Running` node from outside its executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Blocked,
    Cancelled,
}

impl NodeState {
    pub fn name(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Ready => "ready",
            NodeState::Running => "running",
            NodeState::Completed => "completed",
            NodeState::Failed => "failed",
            NodeState::Skipped => "skipped",
            NodeState::Blocked => "blocked",
            NodeState::Cancelled => "cancelled",
        }
    }

    /// Terminal states never transition again within one execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Completed
                | NodeState::Failed
                | NodeState::Skipped
                | NodeState::Blocked
                | NodeState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    pub kind: NodeKind,
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub outputs: Value,
    pub state: NodeState,
    pub assigned_agent: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Deadline for a single attempt; None falls back to the scheduler default.
    pub max_duration_secs: Option<u64>,
    /// Optional phase tag consumed by the role-scaling plan.
    pub phase: Option<String>,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            depends_on: Vec::new(),
            inputs: Value::Null,
            outputs: Value::Null,
            state: NodeState::Pending,
            assigned_agent: None,
            started_at: None,
            completed_at: None,
            attempt_count: 0,
            last_error: None,
            max_duration_secs: None,
            phase: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDag {
    pub id: String,
    pub team_id: String,
    pub name: String,
    pub nodes: Vec<WorkflowNode>,
    pub status: WorkflowStatus,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl WorkflowDag {
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut WorkflowNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Recovered,
}

impl AttemptOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure => "failure",
            AttemptOutcome::Recovered => "recovered",
        }
    }
}

/// One execution attempt of a node; the self-healing loop appends these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub id: String,
    pub workflow_id: String,
    pub node_id: String,
    pub attempt_number: u32,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub outcome: AttemptOutcome,
    pub error_classification: Option<String>,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
}

/// One concrete step in a recovery context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryInstruction {
    pub phase: String,
    pub action: String,
    #[serde(default)]
    pub details: String,
    pub priority: u8,
}

/// Structured output identifying where to resume a halted workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryContext {
    pub workflow_id: String,
    pub resume_from_phase: String,
    pub gaps_summary: Value,
    pub recovery_instructions: Vec<RecoveryInstruction>,
    pub recommended_approach: String,
}
