//! Property tests over the scheduling partition.

use ensemble_core::model::NodeKind;
use ensemble_workflow::{build, execution_order, NodeSpec, WorkflowSpec};
use proptest::prelude::*;
use serde_json::Value;

fn node(id: String, deps: Vec<String>) -> NodeSpec {
    NodeSpec {
        id,
        kind: NodeKind::Action,
        name: None,
        depends_on: deps,
        inputs: Value::Null,
        max_duration_secs: None,
        phase: None,
        assigned_agent: None,
    }
}

/// Random acyclic specs: node `i` may only depend on nodes with lower index.
fn acyclic_spec() -> impl Strategy<Value = WorkflowSpec> {
    (2usize..12)
        .prop_flat_map(|count| {
            let edges = proptest::collection::vec(proptest::bool::ANY, count * (count - 1) / 2);
            (Just(count), edges)
        })
        .prop_map(|(count, edges)| {
            let mut nodes = Vec::with_capacity(count);
            let mut edge_index = 0usize;
            for i in 0..count {
                let mut deps = Vec::new();
                for j in 0..i {
                    if edges[edge_index] {
                        deps.push(format!("n{j}"));
                    }
                    edge_index += 1;
                }
                nodes.push(node(format!("n{i}"), deps));
            }
            WorkflowSpec {
                name: "generated".into(),
                fail_on_validation_error: true,
                nodes,
            }
        })
}

proptest! {
    #[test]
    fn order_partitions_nodes_and_edges_point_forward(spec in acyclic_spec()) {
        let dag = build(&spec, "team_prop").unwrap();
        let order = execution_order(&dag).unwrap();

        // Union of groups equals the node set, with no duplicates.
        let mut seen: Vec<&String> = order.iter().flatten().collect();
        seen.sort();
        seen.dedup();
        prop_assert_eq!(seen.len(), dag.nodes.len());
        let flat_count: usize = order.iter().map(Vec::len).sum();
        prop_assert_eq!(flat_count, dag.nodes.len());

        // Every edge crosses from an earlier group to a later one.
        let level = |id: &str| order.iter().position(|g| g.iter().any(|n| n == id)).unwrap();
        for node in &dag.nodes {
            for dep in &node.depends_on {
                prop_assert!(level(dep) < level(&node.id));
            }
        }
    }

    #[test]
    fn closing_a_chain_into_a_ring_is_always_a_cycle(len in 2usize..10) {
        let mut nodes = Vec::new();
        for i in 0..len {
            let deps = if i == 0 {
                vec![format!("n{}", len - 1)]
            } else {
                vec![format!("n{}", i - 1)]
            };
            nodes.push(node(format!("n{i}"), deps));
        }
        let spec = WorkflowSpec {
            name: "ring".into(),
            fail_on_validation_error: true,
            nodes,
        };
        prop_assert!(matches!(
            build(&spec, "team_prop"),
            Err(ensemble_workflow::WorkflowError::CycleDetected(_))
        ));
    }
}
