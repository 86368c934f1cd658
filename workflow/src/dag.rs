//! Workflow specifications and graph construction.
//!
//! A spec (YAML or JSON on disk) compiles into a [`WorkflowDag`] whose node
//! graph must be acyclic. Scheduling works on the level-by-level execution
//! order: each group contains every node whose dependencies are already
//! satisfied, and groups run in sequence while nodes within a group may run
//! concurrently.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use ensemble_core::ids;
use ensemble_core::model::{NodeKind, WorkflowDag, WorkflowNode, WorkflowStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, WorkflowError};

/// One node in a workflow specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Free-form executor configuration (validator thresholds, deliverables).
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub assigned_agent: Option<String>,
}

/// Declarative workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub fail_on_validation_error: bool,
    pub nodes: Vec<NodeSpec>,
}

fn default_true() -> bool {
    true
}

impl WorkflowSpec {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|err| WorkflowError::InvalidNode(format!("workflow spec: {err}")))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| WorkflowError::InvalidNode(format!("workflow spec: {err}")))
    }

    /// Load a spec from disk, choosing the parser by extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| WorkflowError::InvalidNode(format!("read {}: {err}", path.display())))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&raw),
            _ => Self::from_yaml(&raw),
        }
    }
}

/// Compile a spec into a workflow graph, rejecting malformed or cyclic input.
pub fn build(spec: &WorkflowSpec, team_id: &str) -> Result<WorkflowDag> {
    if spec.name.trim().is_empty() {
        return Err(WorkflowError::InvalidNode("workflow name is empty".into()));
    }
    let mut seen = HashSet::new();
    for node in &spec.nodes {
        if node.id.trim().is_empty() {
            return Err(WorkflowError::InvalidNode("node with empty id".into()));
        }
        if !seen.insert(node.id.as_str()) {
            return Err(WorkflowError::InvalidNode(format!(
                "duplicate node id '{}'",
                node.id
            )));
        }
    }
    for node in &spec.nodes {
        for dep in &node.depends_on {
            if dep == &node.id {
                return Err(WorkflowError::CycleDetected(format!(
                    "node '{}' depends on itself",
                    node.id
                )));
            }
            if !seen.contains(dep.as_str()) {
                return Err(WorkflowError::UnknownDependency {
                    node: node.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let nodes = spec
        .nodes
        .iter()
        .map(|spec_node| {
            let mut node = WorkflowNode::new(
                spec_node.id.clone(),
                spec_node.kind,
                spec_node
                    .name
                    .clone()
                    .unwrap_or_else(|| spec_node.id.clone()),
            )
            .with_dependencies(spec_node.depends_on.clone());
            node.inputs = spec_node.inputs.clone();
            node.max_duration_secs = spec_node.max_duration_secs;
            node.phase = spec_node.phase.clone();
            node.assigned_agent = spec_node.assigned_agent.clone();
            node
        })
        .collect();

    let dag = WorkflowDag {
        id: ids::workflow_id(),
        team_id: team_id.to_string(),
        name: spec.name.clone(),
        nodes,
        status: WorkflowStatus::Pending,
        started_at: None,
        completed_at: None,
    };
    // Full cycle check: a valid order must cover every node.
    execution_order(&dag)?;
    Ok(dag)
}

/// Level-by-level topological partition. Every inner list is a set of node
/// ids that may run concurrently; an empty group with nodes remaining means
/// the graph has a cycle.
pub fn execution_order(dag: &WorkflowDag) -> Result<Vec<Vec<String>>> {
    let mut executed: HashSet<&str> = HashSet::new();
    let mut remaining: HashMap<&str, &WorkflowNode> =
        dag.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut groups = Vec::new();

    while !remaining.is_empty() {
        let mut group: Vec<String> = remaining
            .values()
            .filter(|node| {
                node.depends_on
                    .iter()
                    .all(|dep| executed.contains(dep.as_str()))
            })
            .map(|node| node.id.clone())
            .collect();
        if group.is_empty() {
            let stuck: Vec<&str> = remaining.keys().copied().collect();
            return Err(WorkflowError::CycleDetected(format!(
                "no runnable nodes among {stuck:?}"
            )));
        }
        group.sort();
        for id in &group {
            remaining.remove(id.as_str());
        }
        // Collect ids into the executed set after removal so a group never
        // unlocks its own members.
        for node in &dag.nodes {
            if group.contains(&node.id) {
                executed.insert(node.id.as_str());
            }
        }
        groups.push(group);
    }
    Ok(groups)
}

/// The most common phase tag among a group's nodes, used for phase-change
/// events consumed by the role-scaling plan.
pub fn dominant_phase(dag: &WorkflowDag, group: &[String]) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for id in group {
        if let Some(phase) = dag.node(id).and_then(|n| n.phase.as_deref()) {
            *counts.entry(phase).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .max_by_key(|(phase, count)| (*count, std::cmp::Reverse(phase.to_string())))
        .map(|(phase, _)| phase.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(nodes: Vec<NodeSpec>) -> WorkflowSpec {
        WorkflowSpec {
            name: "delivery".into(),
            fail_on_validation_error: true,
            nodes,
        }
    }

    fn node(id: &str, deps: &[&str]) -> NodeSpec {
        NodeSpec {
            id: id.into(),
            kind: NodeKind::Action,
            name: None,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            inputs: Value::Null,
            max_duration_secs: None,
            phase: None,
            assigned_agent: None,
        }
    }

    #[test]
    fn execution_order_partitions_into_levels() {
        let dag = build(
            &spec(vec![
                node("requirements", &[]),
                node("backend", &["requirements"]),
                node("frontend", &["requirements"]),
                node("integration", &["backend", "frontend"]),
            ]),
            "team_x",
        )
        .unwrap();
        let order = execution_order(&dag).unwrap();
        assert_eq!(
            order,
            vec![
                vec!["requirements".to_string()],
                vec!["backend".to_string(), "frontend".to_string()],
                vec!["integration".to_string()],
            ]
        );
        // The groups partition the node set.
        let total: usize = order.iter().map(Vec::len).sum();
        assert_eq!(total, dag.nodes.len());
    }

    #[test]
    fn every_edge_crosses_groups_forward() {
        let dag = build(
            &spec(vec![
                node("a", &[]),
                node("b", &["a"]),
                node("c", &["a", "b"]),
                node("d", &["b"]),
                node("e", &["c", "d"]),
            ]),
            "team_x",
        )
        .unwrap();
        let order = execution_order(&dag).unwrap();
        let level_of = |id: &str| order.iter().position(|g| g.iter().any(|n| n == id)).unwrap();
        for node in &dag.nodes {
            for dep in &node.depends_on {
                assert!(level_of(dep) < level_of(&node.id));
            }
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = build(&spec(vec![node("a", &["a"])]), "team_x").unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected(_)));
    }

    #[test]
    fn two_node_cycle_is_detected() {
        let err = build(&spec(vec![node("a", &["b"]), node("b", &["a"])]), "team_x").unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected(_)));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = build(&spec(vec![node("a", &["ghost"])]), "team_x").unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::UnknownDependency { dependency, .. } if dependency == "ghost"
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = build(&spec(vec![node("a", &[]), node("a", &[])]), "team_x").unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidNode(_)));
    }

    #[test]
    fn empty_dag_builds_with_no_groups() {
        let dag = build(&spec(vec![]), "team_x").unwrap();
        assert!(execution_order(&dag).unwrap().is_empty());
    }

    #[test]
    fn yaml_spec_round_trips() {
        let raw = r#"
name: delivery
fail_on_validation_error: false
nodes:
  - id: design
    kind: phase
    phase: design
  - id: validate_design
    kind: validator
    depends_on: [design]
    inputs:
      severity_threshold: high
"#;
        let parsed = WorkflowSpec::from_yaml(raw).unwrap();
        assert!(!parsed.fail_on_validation_error);
        assert_eq!(parsed.nodes.len(), 2);
        assert_eq!(parsed.nodes[1].kind, NodeKind::Validator);
        let dag = build(&parsed, "team_x").unwrap();
        assert_eq!(dag.nodes[1].inputs["severity_threshold"], "high");
    }
}
