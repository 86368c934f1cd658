//! Configuration surface for the orchestrator.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::access::AccessMatrix;
use crate::error::{CoreError, Result};

/// Bounds and timing knobs for the schedulers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_concurrent_nodes_per_workflow: usize,
    pub max_concurrent_streams_per_mvd: usize,
    pub node_default_timeout_secs: u64,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_cap_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes_per_workflow: 4,
            max_concurrent_streams_per_mvd: 4,
            node_default_timeout_secs: 300,
            retry_backoff_base_ms: 500,
            retry_backoff_cap_ms: 30_000,
        }
    }
}

/// Weights for the trimodal verdict; they must sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VerdictWeights {
    pub structural: f64,
    pub behavioral: f64,
    pub quality: f64,
}

impl Default for VerdictWeights {
    fn default() -> Self {
        Self {
            structural: 0.33,
            behavioral: 0.34,
            quality: 0.33,
        }
    }
}

/// Validation gate thresholds consulted before deployment-class nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub min_overall_score: f64,
    pub min_behavioral_pass_rate: f64,
    pub block_on_blocking_violations: bool,
    pub weights: VerdictWeights,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_overall_score: 0.60,
            min_behavioral_pass_rate: 0.80,
            block_on_blocking_violations: true,
            weights: VerdictWeights::default(),
        }
    }
}

/// Blueprint scorer dimension weights; autonormalized with a warning when
/// they do not sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlueprintWeights {
    pub parallelizability: f64,
    pub expertise_coverage: f64,
    pub complexity_alignment: f64,
    pub historical_success: f64,
}

impl Default for BlueprintWeights {
    fn default() -> Self {
        Self {
            parallelizability: 0.30,
            expertise_coverage: 0.30,
            complexity_alignment: 0.20,
            historical_success: 0.20,
        }
    }
}

impl BlueprintWeights {
    pub fn normalized(mut self) -> Self {
        let total = self.parallelizability
            + self.expertise_coverage
            + self.complexity_alignment
            + self.historical_success;
        if (total - 1.0).abs() > 0.001 && total > 0.0 {
            warn!(total, "blueprint weights do not sum to 1.0, normalizing");
            self.parallelizability /= total;
            self.expertise_coverage /= total;
            self.complexity_alignment /= total;
            self.historical_success /= total;
        }
        self
    }
}

/// Execution-history logger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub storage_path: String,
    pub retention_days: i64,
    pub enable_insights: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            storage_path: "ensemble_history.db".to_string(),
            retention_days: 90,
            enable_insights: true,
        }
    }
}

/// Role requirements for one delivery phase.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PhaseRoles {
    #[serde(default)]
    pub required_roles: Vec<String>,
    #[serde(default)]
    pub optional_roles: Vec<String>,
}

/// Phase-keyed scaling plan consumed by `scale_for_phase_transition`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScalingPlan {
    pub phases: HashMap<String, PhaseRoles>,
}

impl ScalingPlan {
    /// The default delivery phases and the roles each needs filled.
    pub fn standard() -> Self {
        let mut phases = HashMap::new();
        phases.insert(
            "requirement_analysis".to_string(),
            PhaseRoles {
                required_roles: vec!["Product Owner".into(), "Tech Lead".into()],
                optional_roles: vec!["UX Designer".into()],
            },
        );
        phases.insert(
            "design".to_string(),
            PhaseRoles {
                required_roles: vec!["Tech Lead".into(), "Backend Lead".into(), "Frontend Lead".into()],
                optional_roles: vec!["UX Designer".into(), "DBA Specialist".into()],
            },
        );
        phases.insert(
            "implementation".to_string(),
            PhaseRoles {
                required_roles: vec![
                    "Backend Lead".into(),
                    "Frontend Lead".into(),
                    "QA Lead".into(),
                ],
                optional_roles: vec!["DBA Specialist".into(), "Documentation Lead".into()],
            },
        );
        phases.insert(
            "testing".to_string(),
            PhaseRoles {
                required_roles: vec!["QA Lead".into(), "Security Auditor".into()],
                optional_roles: vec!["Backend Lead".into(), "Frontend Lead".into()],
            },
        );
        phases.insert(
            "deployment".to_string(),
            PhaseRoles {
                required_roles: vec!["DevOps Engineer".into(), "Deployment Specialist".into()],
                optional_roles: vec!["Security Auditor".into()],
            },
        );
        Self { phases }
    }

    pub fn roles_for(&self, phase: &str) -> Option<&PhaseRoles> {
        self.phases.get(phase)
    }
}

/// Root configuration object; every field defaults so a bare deployment works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub blueprint_weights: BlueprintWeights,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub access_matrix: Option<AccessMatrix>,
    #[serde(default)]
    pub scaling_plan: Option<ScalingPlan>,
    /// Window inside which repeated idempotency-keyed calls return the
    /// original result instead of re-executing.
    #[serde(default = "default_idempotency_window")]
    pub idempotency_window_secs: i64,
}

fn default_idempotency_window() -> i64 {
    24 * 3600
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            gate: GateConfig::default(),
            blueprint_weights: BlueprintWeights::default(),
            history: HistoryConfig::default(),
            access_matrix: None,
            scaling_plan: None,
            idempotency_window_secs: default_idempotency_window(),
        }
    }
}

impl OrchestratorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| CoreError::Validation(format!("config read: {err}")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn scaling_plan(&self) -> ScalingPlan {
        self.scaling_plan.clone().unwrap_or_else(ScalingPlan::standard)
    }
}
