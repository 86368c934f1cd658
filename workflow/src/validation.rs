//! Built-in validation node executors.
//!
//! Three variants gate workflow progression:
//! - `phase_validator`: structural checks over a phase's produced outputs
//! - `gap_detector`: completeness estimate plus a generated recovery context
//! - `completeness_checker`: per-sub-phase coverage with a blockers list
//!
//! Each emits `{validation_passed, critical_failures, warnings,
//! recovery_context?}`; the engine compares failure severities against the
//! node's threshold.

use async_trait::async_trait;
use ensemble_core::model::{RecoveryContext, RecoveryInstruction, WorkflowNode};
use ensemble_core::CoreError;
use serde_json::{json, Value};

use crate::executor::{ExecutionContext, NodeExecutor};

fn failure(check: &str, message: String, severity: &str, fix: &str) -> Value {
    json!({
        "check": check,
        "message": message,
        "severity": severity,
        "fix": fix,
    })
}

/// Structural checks for one phase: every configured upstream node must have
/// completed with the keys it promised.
///
/// Inputs: `{"phase": str, "required_nodes": [id], "required_keys":
/// {node_id: [key]}}`.
pub struct PhaseValidator;

#[async_trait]
impl NodeExecutor for PhaseValidator {
    async fn execute(
        &self,
        node: &WorkflowNode,
        ctx: &ExecutionContext,
    ) -> Result<Value, CoreError> {
        let phase = node
            .inputs
            .get("phase")
            .and_then(Value::as_str)
            .unwrap_or(&node.name)
            .to_string();
        let mut critical_failures = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        if let Some(required) = node.inputs.get("required_nodes").and_then(Value::as_array) {
            for required_node in required.iter().filter_map(Value::as_str) {
                match ctx.node_output(required_node) {
                    None => critical_failures.push(failure(
                        "node_output",
                        format!("phase '{phase}' is missing output from '{required_node}'"),
                        "critical",
                        &format!("run node '{required_node}' before validating"),
                    )),
                    Some(Value::Null) => warnings.push(format!(
                        "node '{required_node}' completed with empty output"
                    )),
                    Some(_) => {}
                }
            }
        }
        if let Some(required_keys) = node.inputs.get("required_keys").and_then(Value::as_object) {
            for (source, keys) in required_keys {
                let output = ctx.node_output(source).unwrap_or(Value::Null);
                for key in keys.as_array().into_iter().flatten().filter_map(Value::as_str) {
                    if output.get(key).is_none() {
                        critical_failures.push(failure(
                            "output_key",
                            format!("output of '{source}' is missing key '{key}'"),
                            "critical",
                            &format!("produce '{key}' in node '{source}'"),
                        ));
                    }
                }
            }
        }

        Ok(json!({
            "validator": "phase_validator",
            "phase": phase,
            "validation_passed": critical_failures.is_empty(),
            "critical_failures": critical_failures,
            "warnings": warnings,
        }))
    }
}

/// Detects gaps between expected components and what upstream nodes actually
/// produced, and generates the recovery context for a halted workflow.
///
/// Inputs: `{"expected_components": [name], "phase": str}`. Upstream nodes
/// contribute by listing `components: [name]` in their outputs.
pub struct GapDetector;

#[async_trait]
impl NodeExecutor for GapDetector {
    async fn execute(
        &self,
        node: &WorkflowNode,
        ctx: &ExecutionContext,
    ) -> Result<Value, CoreError> {
        let expected: Vec<String> = node
            .inputs
            .get("expected_components")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let phase = node
            .inputs
            .get("phase")
            .and_then(Value::as_str)
            .unwrap_or("implementation")
            .to_string();

        let mut produced: Vec<String> = Vec::new();
        for output in ctx.outputs().values() {
            if let Some(components) = output.get("components").and_then(Value::as_array) {
                produced.extend(components.iter().filter_map(Value::as_str).map(str::to_string));
            }
        }

        let gaps: Vec<String> = expected
            .iter()
            .filter(|component| !produced.contains(component))
            .cloned()
            .collect();
        let completion = if expected.is_empty() {
            1.0
        } else {
            (expected.len() - gaps.len()) as f64 / expected.len() as f64
        };
        let is_deployable = gaps.is_empty();

        let critical_failures: Vec<Value> = gaps
            .iter()
            .map(|gap| {
                failure(
                    "missing_component",
                    format!("component '{gap}' was never produced"),
                    "critical",
                    &format!("create component '{gap}'"),
                )
            })
            .collect();

        let recovery_context = if is_deployable {
            Value::Null
        } else {
            let recovery = RecoveryContext {
                workflow_id: ctx.workflow_id.clone(),
                resume_from_phase: phase.clone(),
                gaps_summary: json!({
                    "total_gaps": gaps.len(),
                    "critical_gaps": gaps.len(),
                    "estimated_completion": completion,
                }),
                recovery_instructions: gaps
                    .iter()
                    .map(|gap| RecoveryInstruction {
                        phase: phase.clone(),
                        action: format!("create_{gap}"),
                        details: format!("component '{gap}' is missing"),
                        priority: 1,
                    })
                    .collect(),
                recommended_approach: format!(
                    "INCREMENTAL COMPLETION: {:.0}% complete. Resume the {} phase focusing on the missing components.",
                    completion * 100.0,
                    phase
                ),
            };
            serde_json::to_value(recovery)?
        };

        Ok(json!({
            "validator": "gap_detector",
            "validation_passed": is_deployable,
            "gaps_detected": gaps.len(),
            "estimated_completion": completion,
            "is_deployable": is_deployable,
            "critical_failures": critical_failures,
            "warnings": [],
            "recovery_context": recovery_context,
        }))
    }
}

/// Coverage check over declared sub-phases: each must have produced its
/// required files; incomplete sub-phases become blockers.
///
/// Inputs: `{"sub_phases": [{"name": str, "source_node": id,
/// "required_files": [path]}]}`. Source nodes contribute `files: [path]`.
pub struct CompletenessChecker;

#[async_trait]
impl NodeExecutor for CompletenessChecker {
    async fn execute(
        &self,
        node: &WorkflowNode,
        ctx: &ExecutionContext,
    ) -> Result<Value, CoreError> {
        let sub_phases = node
            .inputs
            .get("sub_phases")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut blockers: Vec<String> = Vec::new();
        let mut completions: Vec<f64> = Vec::new();
        let mut current_sub_phase = String::new();

        for sub_phase in &sub_phases {
            let name = sub_phase.get("name").and_then(Value::as_str).unwrap_or("");
            let source = sub_phase
                .get("source_node")
                .and_then(Value::as_str)
                .unwrap_or(name);
            let required: Vec<&str> = sub_phase
                .get("required_files")
                .and_then(Value::as_array)
                .map(|files| files.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            let produced: Vec<String> = ctx
                .node_output(source)
                .and_then(|output| {
                    output.get("files").and_then(Value::as_array).map(|files| {
                        files
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                })
                .unwrap_or_default();

            let present = required
                .iter()
                .filter(|file| produced.iter().any(|p| p == *file))
                .count();
            let completion = if required.is_empty() {
                1.0
            } else {
                present as f64 / required.len() as f64
            };
            completions.push(completion);
            if completion < 1.0 {
                if current_sub_phase.is_empty() {
                    current_sub_phase = name.to_string();
                }
                blockers.push(format!(
                    "{name}: Only {present}/{} required files created",
                    required.len()
                ));
            }
        }

        let overall = if completions.is_empty() {
            1.0
        } else {
            completions.iter().sum::<f64>() / completions.len() as f64
        };
        let passed = blockers.is_empty();
        let critical_failures: Vec<Value> = blockers
            .iter()
            .map(|blocker| {
                failure(
                    "sub_phase_incomplete",
                    blocker.clone(),
                    "critical",
                    "complete the sub-phase before proceeding",
                )
            })
            .collect();

        Ok(json!({
            "validator": "completeness_checker",
            "validation_passed": passed,
            "overall_completion": overall,
            "current_sub_phase": current_sub_phase,
            "blockers": blockers,
            "critical_failures": critical_failures,
            "warnings": [],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::model::NodeKind;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("wf_1".into(), "team_1".into(), Value::Null)
    }

    #[tokio::test]
    async fn phase_validator_flags_missing_outputs() {
        let context = ctx();
        context.set_output("design", json!({"architecture": "hexagonal"}));
        let mut node = WorkflowNode::new("validate", NodeKind::Validator, "phase_validator");
        node.inputs = json!({
            "phase": "design",
            "required_nodes": ["design", "api_spec"],
            "required_keys": {"design": ["architecture", "data_model"]},
        });
        let output = PhaseValidator.execute(&node, &context).await.unwrap();
        assert_eq!(output["validation_passed"], false);
        let failures = output["critical_failures"].as_array().unwrap();
        // Missing api_spec output and missing data_model key.
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| f["severity"] == "critical"));
    }

    #[tokio::test]
    async fn phase_validator_passes_complete_phase() {
        let context = ctx();
        context.set_output("design", json!({"architecture": "hexagonal", "data_model": {}}));
        let mut node = WorkflowNode::new("validate", NodeKind::Validator, "phase_validator");
        node.inputs = json!({
            "required_nodes": ["design"],
            "required_keys": {"design": ["architecture", "data_model"]},
        });
        let output = PhaseValidator.execute(&node, &context).await.unwrap();
        assert_eq!(output["validation_passed"], true);
    }

    #[tokio::test]
    async fn gap_detector_generates_recovery_context() {
        let context = ctx();
        context.set_output("backend", json!({"components": ["models", "services"]}));
        let mut node = WorkflowNode::new("gaps", NodeKind::Validator, "gap_detector");
        node.inputs = json!({
            "phase": "implementation",
            "expected_components": ["models", "services", "routes", "controllers"],
        });
        let output = GapDetector.execute(&node, &context).await.unwrap();
        assert_eq!(output["validation_passed"], false);
        assert_eq!(output["gaps_detected"], 2);
        assert_eq!(output["is_deployable"], false);
        assert!((output["estimated_completion"].as_f64().unwrap() - 0.5).abs() < 1e-9);
        let recovery = &output["recovery_context"];
        assert_eq!(recovery["resume_from_phase"], "implementation");
        let instructions = recovery["recovery_instructions"].as_array().unwrap();
        assert_eq!(instructions.len(), 2);
        assert!(instructions.iter().any(|i| i["action"] == "create_routes"));
    }

    #[tokio::test]
    async fn gap_detector_with_no_expectations_is_deployable() {
        let context = ctx();
        let node = WorkflowNode::new("gaps", NodeKind::Validator, "gap_detector");
        let output = GapDetector.execute(&node, &context).await.unwrap();
        assert_eq!(output["validation_passed"], true);
        assert_eq!(output["recovery_context"], Value::Null);
    }

    #[tokio::test]
    async fn completeness_checker_lists_blockers() {
        let context = ctx();
        context.set_output("backend_core", json!({"files": ["service.rs"]}));
        let mut node = WorkflowNode::new("complete", NodeKind::Validator, "completeness_checker");
        node.inputs = json!({
            "sub_phases": [
                {"name": "backend_core", "required_files": ["service.rs", "repo.rs"]},
                {"name": "frontend_structure", "required_files": ["app.tsx"]},
            ],
        });
        let output = CompletenessChecker.execute(&node, &context).await.unwrap();
        assert_eq!(output["validation_passed"], false);
        assert_eq!(output["current_sub_phase"], "backend_core");
        let blockers = output["blockers"].as_array().unwrap();
        assert_eq!(blockers.len(), 2);
        assert!((output["overall_completion"].as_f64().unwrap() - 0.25).abs() < 1e-9);
    }
}
