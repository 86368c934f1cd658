//! Ensemble team layer
//!
//! Elastic team membership, role-based assignment with seamless handoff,
//! versioned contracts with breaking-change detection, tracked assumptions,
//! speculative parallel work streams with convergence sessions, and
//! performance-driven scaling decisions.

use ensemble_core::CoreError;

pub mod blueprint;
pub mod contracts;
pub mod locks;
pub mod manager;
pub mod parallel;
pub mod performance;
pub mod persona;
pub mod provider;
pub mod roles;

pub use blueprint::{
    Blueprint, BlueprintScorer, Complexity, ExecutionMode, HistoryStore, InMemoryHistoryStore,
    Parallelizability, RequirementClassification, ScoreBreakdown,
};
pub use contracts::{diff_specs, ChangeSet, ContractRegistry};
pub use manager::{Actor, Briefing, ScalingReport, TeamManager};
pub use parallel::{
    ConvergenceMetrics, Mvd, ParallelEngine, StreamSpec, StreamStatus, WorkStream,
};
pub use performance::{
    AgentPerformanceScore, PerformanceAnalyzer, PerformanceThresholds, Recommendation,
    ScalingDirective, TeamHealthMetrics, Trend,
};
pub use persona::{Persona, PersonaDirectory};
pub use provider::{
    AgentProvider, ChatChunk, ChatMessage, ChatStream, ProviderCapabilities, ProviderRouter,
    ScriptedProvider, Usage,
};

/// Errors produced by the team layer on top of the core taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum TeamError {
    #[error("role '{0}' has no suitable member to fill it")]
    RoleUnfilled(String),
    #[error("output references archived version {version} of contract '{name}'")]
    StaleContractReference { name: String, version: String },
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl TeamError {
    /// Collapse into the core taxonomy for surfaces that only know categories.
    pub fn category(&self) -> &'static str {
        match self {
            TeamError::RoleUnfilled(_) => "role_unfilled",
            TeamError::StaleContractReference { .. } => "stale_contract_reference",
            TeamError::Core(err) => err.category(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TeamError>;
