//! Entity model shared across the substrate.
//!
//! All cross-entity references are opaque string identifiers; loading a team
//! never forces loading its members. Status fields are closed enums with
//! exhaustive handling at every use site.

mod contract;
mod conflict;
mod team;
mod workflow;

pub use contract::{
    Assumption, AssumptionStatus, Contract, ContractField, ContractSpec, ContractStatus, Endpoint,
};
pub use conflict::{
    Conflict, ConflictKind, ConflictStatus, ConvergenceSession, ConvergenceStatus,
};
pub use team::{
    AssignmentRecord, HandoffArtifact, MembershipState, PerformanceSummary, Role, Task, TaskStatus,
    Team, TeamMember, TeamState,
};
pub use workflow::{
    AttemptOutcome, ExecutionAttempt, NodeKind, NodeState, RecoveryContext, RecoveryInstruction,
    WorkflowDag, WorkflowNode, WorkflowStatus,
};

use serde::{Deserialize, Serialize};

/// Severity scale used by conflicts and validation findings.
///
/// The derived ordering (`Low < Medium < High < Critical`) is load-bearing:
/// gate thresholds and conflict filters compare severities directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn name(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Opaque reference to an artifact produced by a stream or workflow node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub kind: String,
    pub id: String,
}

impl ArtifactRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}
