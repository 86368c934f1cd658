//! Team aggregate: teams, memberships, roles and tasks.

use serde::{Deserialize, Serialize};

use crate::ids::now_iso;

/// Team lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TeamState {
    #[default]
    Forming,
    Active,
    Scaling,
    WindingDown,
    Closed,
}

impl TeamState {
    pub fn name(&self) -> &'static str {
        match self {
            TeamState::Forming => "forming",
            TeamState::Active => "active",
            TeamState::Scaling => "scaling",
            TeamState::WindingDown => "winding_down",
            TeamState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub project_type: String,
    pub state: TeamState,
    pub created_at: String,
    pub updated_at: String,
}

impl Team {
    pub fn new(id: String, name: String, project_type: String) -> Self {
        let now = now_iso();
        Self {
            id,
            name,
            project_type,
            state: TeamState::Forming,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Membership lifecycle state.
///
/// At most one `Active` membership may exist per `(team_id, agent_id)`; the
/// store enforces this on insert and transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MembershipState {
    #[default]
    Pending,
    Active,
    OnStandby,
    Retired,
}

impl MembershipState {
    pub fn name(&self) -> &'static str {
        match self {
            MembershipState::Pending => "pending",
            MembershipState::Active => "active",
            MembershipState::OnStandby => "on_standby",
            MembershipState::Retired => "retired",
        }
    }
}

/// Rolling per-member counters the performance analyzer reads.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PerformanceSummary {
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub collaboration_score: u32,
    pub average_task_duration_hours: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMember {
    pub agent_id: String,
    pub persona_id: String,
    pub team_id: String,
    pub state: MembershipState,
    pub joined_at: String,
    pub retired_at: Option<String>,
    #[serde(default)]
    pub performance: PerformanceSummary,
}

impl TeamMember {
    pub fn pending(agent_id: String, persona_id: String, team_id: String) -> Self {
        Self {
            agent_id,
            persona_id,
            team_id,
            state: MembershipState::Pending,
            joined_at: now_iso(),
            retired_at: None,
            performance: PerformanceSummary::default(),
        }
    }
}

/// One entry in a role's assignment history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentRecord {
    pub from_agent: Option<String>,
    pub to_agent: Option<String>,
    pub assigned_by: String,
    pub reason: String,
    pub at: String,
}

/// Abstract position on a team (e.g. "Security Auditor").
///
/// Tasks are assigned to roles, not agents; `current_agent_id` is resolved at
/// dispatch time so reassignment never rewrites tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub role_id: String,
    pub team_id: String,
    pub description: String,
    pub is_required: bool,
    pub priority: u8,
    pub is_active: bool,
    pub current_agent_id: Option<String>,
    #[serde(default)]
    pub assignment_history: Vec<AssignmentRecord>,
}

/// Task status; `Ready` means all dependencies are `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Ready,
    Running,
    Blocked,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub team_id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub required_role: Option<String>,
    pub priority: u8,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub created_by: String,
    pub assigned_to: Option<String>,
}

/// Summary artifact produced when a member retires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffArtifact {
    pub retiring_agent: String,
    pub successor_agent: Option<String>,
    pub roles_released: Vec<String>,
    pub open_tasks: Vec<String>,
    pub assumptions_authored: Vec<String>,
    pub contracts_in_progress: Vec<String>,
    pub notes: String,
    pub generated_at: String,
}
