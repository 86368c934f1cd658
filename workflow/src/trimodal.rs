//! Trimodal validation verdict.
//!
//! Aggregates the structural, behavioral and deliverable-quality validator
//! reports into one deployment decision. Missing validators redistribute
//! their weight proportionally and are recorded on the verdict. Gate nodes
//! consult the persisted verdict before deployment-class nodes.

use std::sync::Arc;

use async_trait::async_trait;
use ensemble_core::config::GateConfig;
use ensemble_core::model::WorkflowNode;
use ensemble_core::{ids, CoreError, StateStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::executor::{ExecutionContext, NodeExecutor};
use crate::Result;

/// Structural validator result (per-project code graph conformance).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuralReport {
    pub is_compliant: bool,
    pub conformance_score: f64,
    pub total_violations: u32,
    pub blocking_violations: u32,
    pub warning_violations: u32,
}

/// Behavioral validator result (scenario pass rate over contracts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehavioralReport {
    pub total_contracts: u32,
    pub contracts_fulfilled: u32,
    pub overall_pass_rate: f64,
    pub scenarios_passed: u32,
    pub scenarios_failed: u32,
}

/// Deliverable-quality validator result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub avg_quality_score: f64,
    pub contract_fulfillment_rate: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentDecision {
    Approved,
    Conditional,
    Blocked,
}

impl DeploymentDecision {
    pub fn name(&self) -> &'static str {
        match self {
            DeploymentDecision::Approved => "approved",
            DeploymentDecision::Conditional => "conditional",
            DeploymentDecision::Blocked => "blocked",
        }
    }
}

/// The aggregated verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrimodalVerdict {
    pub execution_id: String,
    pub overall_score: f64,
    pub grade: String,
    pub structural_score: Option<f64>,
    pub behavioral_score: Option<f64>,
    pub quality_score: Option<f64>,
    /// Effective weights after redistributing any missing validator's share.
    pub weights_used: (f64, f64, f64),
    pub missing_validators: Vec<String>,
    pub insufficient_data: bool,
    pub decision: DeploymentDecision,
    pub generated_at: String,
}

pub struct VerdictAggregator {
    config: GateConfig,
}

impl VerdictAggregator {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(GateConfig::default())
    }

    fn structural_score(report: &StructuralReport) -> f64 {
        report.conformance_score.clamp(0.0, 1.0)
    }

    fn behavioral_score(report: &BehavioralReport) -> (f64, bool) {
        if report.total_contracts == 0 {
            // No contracts to exercise: treated as a pass, flagged as thin.
            return (1.0, true);
        }
        let fulfilled_ratio = report.contracts_fulfilled as f64 / report.total_contracts as f64;
        let score = 0.7 * report.overall_pass_rate.clamp(0.0, 1.0) + 0.3 * fulfilled_ratio;
        (score.clamp(0.0, 1.0), false)
    }

    fn quality_score(report: &QualityReport) -> f64 {
        let score = 0.5 * report.avg_quality_score.clamp(0.0, 1.0)
            + 0.3 * report.contract_fulfillment_rate.clamp(0.0, 1.0)
            + 0.2 * (1.0 - report.error_rate.clamp(0.0, 1.0));
        score.clamp(0.0, 1.0)
    }

    fn grade(score: f64) -> &'static str {
        if score >= 0.95 {
            "A+"
        } else if score >= 0.90 {
            "A"
        } else if score >= 0.80 {
            "B"
        } else if score >= 0.70 {
            "C"
        } else if score >= 0.60 {
            "D"
        } else {
            "F"
        }
    }

    /// Combine available validator reports into a verdict.
    pub fn generate_verdict(
        &self,
        execution_id: &str,
        structural: Option<&StructuralReport>,
        behavioral: Option<&BehavioralReport>,
        quality: Option<&QualityReport>,
    ) -> TrimodalVerdict {
        let weights = self.config.weights;
        let structural_score = structural.map(Self::structural_score);
        let (behavioral_score, insufficient_data) = match behavioral {
            Some(report) => {
                let (score, thin) = Self::behavioral_score(report);
                (Some(score), thin)
            }
            None => (None, false),
        };
        let quality_score = quality.map(Self::quality_score);

        let mut missing = Vec::new();
        let mut present_weight = 0.0;
        if structural_score.is_some() {
            present_weight += weights.structural;
        } else {
            missing.push("structural".to_string());
        }
        if behavioral_score.is_some() {
            present_weight += weights.behavioral;
        } else {
            missing.push("behavioral".to_string());
        }
        if quality_score.is_some() {
            present_weight += weights.quality;
        } else {
            missing.push("quality".to_string());
        }

        // Redistribute missing validators' weight proportionally.
        let scale = if present_weight > 0.0 {
            1.0 / present_weight
        } else {
            0.0
        };
        let w_structural = structural_score.map_or(0.0, |_| weights.structural * scale);
        let w_behavioral = behavioral_score.map_or(0.0, |_| weights.behavioral * scale);
        let w_quality = quality_score.map_or(0.0, |_| weights.quality * scale);

        let overall_score = structural_score.unwrap_or(0.0) * w_structural
            + behavioral_score.unwrap_or(0.0) * w_behavioral
            + quality_score.unwrap_or(0.0) * w_quality;

        let blocking = self.config.block_on_blocking_violations
            && structural.map(|s| s.blocking_violations > 0).unwrap_or(false);
        let decision = if blocking || overall_score < self.config.min_overall_score {
            DeploymentDecision::Blocked
        } else if overall_score < 0.80
            || behavioral
                .map(|b| b.total_contracts > 0 && b.overall_pass_rate < self.config.min_behavioral_pass_rate)
                .unwrap_or(false)
        {
            DeploymentDecision::Conditional
        } else {
            DeploymentDecision::Approved
        };

        let verdict = TrimodalVerdict {
            execution_id: execution_id.to_string(),
            overall_score,
            grade: Self::grade(overall_score).to_string(),
            structural_score,
            behavioral_score,
            quality_score,
            weights_used: (w_structural, w_behavioral, w_quality),
            missing_validators: missing,
            insufficient_data,
            decision,
            generated_at: ids::now_iso(),
        };
        info!(
            execution_id,
            score = verdict.overall_score,
            grade = verdict.grade,
            decision = verdict.decision.name(),
            "trimodal verdict generated"
        );
        verdict
    }

    /// Generate and persist, so gate nodes can consult the verdict later.
    pub fn generate_and_store(
        &self,
        store: &StateStore,
        team_id: &str,
        workflow_id: &str,
        structural: Option<&StructuralReport>,
        behavioral: Option<&BehavioralReport>,
        quality: Option<&QualityReport>,
    ) -> Result<TrimodalVerdict> {
        let verdict = self.generate_verdict(workflow_id, structural, behavioral, quality);
        let payload = serde_json::to_value(&verdict).map_err(CoreError::from)?;
        store.insert_verdict(team_id, workflow_id, &payload)?;
        Ok(verdict)
    }
}

/// Gate node executor: consults the latest persisted verdict for the running
/// workflow and blocks deployment-class downstream nodes unless approved.
pub struct VerdictGate {
    store: Arc<StateStore>,
}

impl VerdictGate {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NodeExecutor for VerdictGate {
    async fn execute(
        &self,
        node: &WorkflowNode,
        ctx: &ExecutionContext,
    ) -> std::result::Result<Value, CoreError> {
        let Some(raw) = self.store.latest_verdict(&ctx.workflow_id)? else {
            return Err(CoreError::GateBlocked(format!(
                "gate '{}' found no verdict for workflow {}",
                node.id, ctx.workflow_id
            )));
        };
        let verdict: TrimodalVerdict =
            serde_json::from_value(raw).map_err(CoreError::from)?;
        match verdict.decision {
            DeploymentDecision::Approved => Ok(serde_json::json!({
                "gate": node.id,
                "decision": verdict.decision.name(),
                "overall_score": verdict.overall_score,
                "grade": verdict.grade,
            })),
            DeploymentDecision::Conditional | DeploymentDecision::Blocked => {
                Err(CoreError::GateBlocked(format!(
                    "deployment verdict is {} (score {:.2}, grade {})",
                    verdict.decision.name(),
                    verdict.overall_score,
                    verdict.grade
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn structural(blocking: u32, conformance: f64) -> StructuralReport {
        StructuralReport {
            is_compliant: blocking == 0,
            conformance_score: conformance,
            total_violations: blocking + 2,
            blocking_violations: blocking,
            warning_violations: 2,
        }
    }

    fn behavioral(fulfilled: u32, total: u32, pass_rate: f64) -> BehavioralReport {
        BehavioralReport {
            total_contracts: total,
            contracts_fulfilled: fulfilled,
            overall_pass_rate: pass_rate,
            scenarios_passed: (pass_rate * 100.0) as u32,
            scenarios_failed: 100 - (pass_rate * 100.0) as u32,
        }
    }

    fn quality(avg: f64, fulfillment: f64, errors: f64) -> QualityReport {
        QualityReport {
            avg_quality_score: avg,
            contract_fulfillment_rate: fulfillment,
            error_rate: errors,
        }
    }

    #[test]
    fn happy_path_is_approved_with_high_grade() {
        let aggregator = VerdictAggregator::with_defaults();
        let verdict = aggregator.generate_verdict(
            "exec_1",
            Some(&structural(0, 0.95)),
            Some(&behavioral(5, 5, 0.98)),
            Some(&quality(0.95, 1.0, 0.02)),
        );
        assert_eq!(verdict.decision, DeploymentDecision::Approved);
        assert!(verdict.overall_score >= 0.90);
        assert!(verdict.grade == "A+" || verdict.grade == "A");
        assert!(verdict.missing_validators.is_empty());
        assert!(!verdict.insufficient_data);
    }

    #[test]
    fn perfect_inputs_score_exactly_one() {
        let aggregator = VerdictAggregator::with_defaults();
        let verdict = aggregator.generate_verdict(
            "exec_perfect",
            Some(&structural(0, 1.0)),
            Some(&behavioral(5, 5, 1.0)),
            Some(&quality(1.0, 1.0, 0.0)),
        );
        assert!((verdict.overall_score - 1.0).abs() < 1e-9);
        assert_eq!(verdict.decision, DeploymentDecision::Approved);
        assert_eq!(verdict.grade, "A+");
    }

    #[test]
    fn blocking_violations_always_block() {
        let aggregator = VerdictAggregator::with_defaults();
        let verdict = aggregator.generate_verdict(
            "exec_2",
            Some(&structural(3, 0.50)),
            Some(&behavioral(5, 5, 0.98)),
            Some(&quality(0.95, 1.0, 0.02)),
        );
        assert_eq!(verdict.decision, DeploymentDecision::Blocked);
    }

    #[test]
    fn behavioral_regression_is_conditional_below_eighty() {
        let aggregator = VerdictAggregator::with_defaults();
        let verdict = aggregator.generate_verdict(
            "exec_3",
            Some(&structural(0, 0.95)),
            Some(&behavioral(2, 5, 0.50)),
            Some(&quality(0.95, 1.0, 0.02)),
        );
        assert!(matches!(
            verdict.decision,
            DeploymentDecision::Conditional | DeploymentDecision::Blocked
        ));
        assert!(verdict.overall_score < 0.80, "got {}", verdict.overall_score);
    }

    #[test]
    fn missing_validator_weight_redistributes() {
        let aggregator = VerdictAggregator::with_defaults();
        let verdict = aggregator.generate_verdict(
            "exec_4",
            None,
            Some(&behavioral(5, 5, 1.0)),
            Some(&quality(1.0, 1.0, 0.0)),
        );
        assert_eq!(verdict.missing_validators, vec!["structural"]);
        let (ws, wb, wq) = verdict.weights_used;
        assert_eq!(ws, 0.0);
        assert!((wb + wq - 1.0).abs() < 1e-9);
        assert!((verdict.overall_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_contracts_pass_with_insufficient_data_flag() {
        let aggregator = VerdictAggregator::with_defaults();
        let verdict = aggregator.generate_verdict(
            "exec_5",
            Some(&structural(0, 0.95)),
            Some(&behavioral(0, 0, 0.0)),
            Some(&quality(0.95, 1.0, 0.02)),
        );
        assert!(verdict.insufficient_data);
        assert_eq!(verdict.behavioral_score, Some(1.0));
        assert_eq!(verdict.decision, DeploymentDecision::Approved);
    }

    #[test]
    fn persisted_verdict_round_trips() {
        let store = StateStore::in_memory().unwrap();
        let aggregator = VerdictAggregator::with_defaults();
        let verdict = aggregator
            .generate_and_store(
                &store,
                "team_1",
                "wf_1",
                Some(&structural(0, 1.0)),
                Some(&behavioral(5, 5, 1.0)),
                Some(&quality(1.0, 1.0, 0.0)),
            )
            .unwrap();
        let raw = store.latest_verdict("wf_1").unwrap().unwrap();
        let loaded: TrimodalVerdict = serde_json::from_value(raw).unwrap();
        assert_eq!(loaded.decision, verdict.decision);
        assert_eq!(loaded.grade, verdict.grade);
    }
}
