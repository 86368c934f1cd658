//! Conflicts between parallel work streams and the convergence sessions that
//! resolve them.

use serde::{Deserialize, Serialize};

use super::Severity;
use crate::ids::now_iso;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    ContractBreach,
    AssumptionInvalidation,
    ConcurrentEdit,
}

impl ConflictKind {
    pub fn name(&self) -> &'static str {
        match self {
            ConflictKind::ContractBreach => "contract_breach",
            ConflictKind::AssumptionInvalidation => "assumption_invalidation",
            ConflictKind::ConcurrentEdit => "concurrent_edit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    #[default]
    Open,
    UnderConvergence,
    Resolved,
}

impl ConflictStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ConflictStatus::Open => "open",
            ConflictStatus::UnderConvergence => "under_convergence",
            ConflictStatus::Resolved => "resolved",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub team_id: String,
    pub kind: ConflictKind,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub affected_agents: Vec<String>,
    #[serde(default)]
    pub source_refs: Vec<String>,
    pub status: ConflictStatus,
    pub created_at: String,
}

impl Conflict {
    pub fn open(
        id: String,
        team_id: String,
        kind: ConflictKind,
        severity: Severity,
        description: String,
    ) -> Self {
        Self {
            id,
            team_id,
            kind,
            severity,
            description,
            affected_agents: Vec::new(),
            source_refs: Vec::new(),
            status: ConflictStatus::Open,
            created_at: now_iso(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    #[default]
    Open,
    Completed,
    Abandoned,
}

impl ConvergenceStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ConvergenceStatus::Open => "open",
            ConvergenceStatus::Completed => "completed",
            ConvergenceStatus::Abandoned => "abandoned",
        }
    }
}

/// Time-boxed reconciliation session over a set of conflicts.
/// Sessions do not nest; at most one is `Open` per team at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceSession {
    pub id: String,
    pub team_id: String,
    pub trigger: String,
    pub description: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub conflict_ids: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub artifacts_updated: Vec<String>,
    pub rework_hours_actual: f64,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub status: ConvergenceStatus,
}
