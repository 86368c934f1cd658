//! Ensemble workflow engine
//!
//! Compiles workflow specifications into acyclic node graphs, executes them
//! with bounded concurrency and durable, resumable node state, interleaves
//! validation gates, heals transient failures, and aggregates the trimodal
//! deployment verdict.

use std::sync::Arc;

use ensemble_core::config::{GateConfig, SchedulerConfig};
use ensemble_core::model::NodeKind;
use ensemble_core::{CoreError, EventBus, StateStore};

pub mod artifacts;
pub mod dag;
pub mod executor;
pub mod healing;
pub mod trimodal;
pub mod validation;

pub use artifacts::ArtifactStore;
pub use dag::{build, execution_order, NodeSpec, WorkflowSpec};
pub use executor::{
    DagExecutor, ExecuteOptions, ExecutionContext, ExecutionResult, ExecutorRegistry, FnExecutor,
    NodeExecutor, NoopExecutor,
};
pub use healing::{
    ErrorAnalysis, ErrorCategory, ErrorPatternAnalyzer, ExecutionHistoryLogger, FixVerificationLoop,
    HealingLoop, RecoverySuggestion, TestRunner, VerificationConfig, VerificationResult,
    VerificationStatus,
};
pub use trimodal::{
    BehavioralReport, DeploymentDecision, QualityReport, StructuralReport, TrimodalVerdict,
    VerdictAggregator, VerdictGate,
};
pub use validation::{CompletenessChecker, GapDetector, PhaseValidator};

/// Errors produced while building or executing workflows.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("cycle detected: {0}")]
    CycleDetected(String),
    #[error("node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },
    #[error("invalid node: {0}")]
    InvalidNode(String),
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl WorkflowError {
    pub fn category(&self) -> &'static str {
        match self {
            WorkflowError::CycleDetected(_) => "cycle_detected",
            WorkflowError::UnknownDependency { .. } => "unknown_dependency",
            WorkflowError::InvalidNode(_) => "invalid_node",
            WorkflowError::Core(err) => err.category(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Registry preloaded with the built-in validators, the verdict gate, and
/// no-op executors for checkpoints and notifications.
pub fn standard_registry(store: Arc<StateStore>) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register_name("phase_validator", Arc::new(PhaseValidator));
    registry.register_name("gap_detector", Arc::new(GapDetector));
    registry.register_name("completeness_checker", Arc::new(CompletenessChecker));
    registry.register_name("verdict_gate", Arc::new(VerdictGate::new(store)));
    registry.register_kind(NodeKind::Checkpoint, Arc::new(NoopExecutor));
    registry.register_kind(NodeKind::Notification, Arc::new(NoopExecutor));
    // A validator node with no recognized name falls back to the gap detector.
    registry.register_kind(NodeKind::Validator, Arc::new(GapDetector));
    registry
}

/// Convenience facade owning the wired engine collaborators.
pub struct WorkflowEngine {
    pub store: Arc<StateStore>,
    pub bus: Arc<EventBus>,
    pub executor: DagExecutor,
    pub healing: Arc<HealingLoop>,
    pub aggregator: VerdictAggregator,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
        registry: ExecutorRegistry,
        history: Arc<ExecutionHistoryLogger>,
        scheduler: SchedulerConfig,
        gate: GateConfig,
    ) -> Self {
        let healing = Arc::new(HealingLoop::new(history, &scheduler));
        let executor = DagExecutor::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            registry,
            Arc::clone(&healing),
            scheduler,
        );
        Self {
            store,
            bus,
            executor,
            healing,
            aggregator: VerdictAggregator::new(gate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_categories_cover_builder_failures() {
        assert_eq!(
            WorkflowError::CycleDetected("a".into()).category(),
            "cycle_detected"
        );
        assert_eq!(
            WorkflowError::Core(CoreError::GateBlocked("g".into())).category(),
            "gate_blocked"
        );
    }
}
