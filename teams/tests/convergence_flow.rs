//! Cross-component flow: membership, contracts, parallel streams and the
//! assumption-invalidation cascade wired through the event bus.

use std::sync::Arc;
use std::time::Duration;

use ensemble_core::model::{ArtifactRef, ConflictKind, ConflictStatus};
use ensemble_core::{AccessController, EventBus, StateStore};
use ensemble_teams::contracts::ContractRegistry;
use ensemble_teams::locks::TeamLocks;
use ensemble_teams::manager::{Actor, TeamManager};
use ensemble_teams::parallel::{Mvd, ParallelEngine, StreamSpec};

use ensemble_core::model::{ContractField, ContractSpec};

fn payment_spec() -> ContractSpec {
    ContractSpec {
        fields: vec![ContractField {
            name: "amount".into(),
            field_type: "number".into(),
            required: true,
        }],
        endpoints: Vec::new(),
        models: Vec::new(),
    }
}

#[tokio::test]
async fn assumption_invalidation_cascades_through_the_bus() {
    let store = Arc::new(StateStore::in_memory().unwrap());
    let bus = Arc::new(EventBus::new());
    let access = Arc::new(AccessController::permissive());
    let locks = TeamLocks::new();
    let manager = TeamManager::new(Arc::clone(&store), Arc::clone(&bus), Arc::clone(&access))
        .unwrap();
    let registry = ContractRegistry::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&access),
        locks.clone(),
    );
    let engine = Arc::new(ParallelEngine::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        locks,
        4,
    ));
    engine.wire_assumption_events();

    let actor = Actor::system();
    let team = manager
        .create_team("checkout", "web_service", None)
        .await
        .unwrap();
    manager.initialize_standard_roles(&team.id).await.unwrap();
    let (backend_agent, _) = manager
        .add_member_with_briefing(
            &team.id,
            "backend_developer",
            "implementation",
            Some("Backend Lead"),
            &actor,
            None,
        )
        .await
        .unwrap();

    let contract = registry
        .create_contract(
            &team.id,
            "PaymentGatewayAPI",
            "0.1.0",
            payment_spec(),
            "Backend Lead",
            &backend_agent,
            vec!["Frontend Lead".into()],
            &actor,
        )
        .await
        .unwrap();
    registry.activate_contract(&contract.id, &actor).await.unwrap();

    let mvd = Mvd::new(
        &team.id,
        "checkout-mvd",
        "payment definition",
        vec!["PaymentGatewayAPI".into()],
    );
    let streams = engine
        .start_parallel_work_streams(
            mvd,
            vec![StreamSpec {
                role: "Backend Lead".into(),
                agent_id: backend_agent.clone(),
                stream_type: "backend".into(),
                initial_task: "implement gateway".into(),
            }],
        )
        .await
        .unwrap();
    engine
        .record_stream_output(
            &streams[0].id,
            ArtifactRef::new("code", "gateway.rs"),
            "PaymentGatewayAPI",
            "0.1.0",
            3.0,
        )
        .await
        .unwrap();

    // Track an assumption whose dependent artifact the stream produced, then
    // invalidate it; the wired subscriber must open a conflict.
    let backend_actor = Actor::new(backend_agent.clone(), "Backend Lead");
    let assumption = registry
        .track_assumption(
            &team.id,
            "gateway keeps v1 auth",
            "api",
            None,
            vec![ArtifactRef::new("code", "gateway.rs")],
            &backend_actor,
        )
        .await
        .unwrap();
    registry
        .invalidate_assumption(&assumption.id, "agent_security", "vendor dropped v1 auth")
        .await
        .unwrap();

    // The cascade runs on a background task; poll briefly.
    let mut conflicts = Vec::new();
    for _ in 0..50 {
        conflicts = store.list_conflicts(&team.id, Some(ConflictStatus::Open)).unwrap();
        if !conflicts.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(conflicts.len(), 1, "expected the cascade to open a conflict");
    assert_eq!(conflicts[0].kind, ConflictKind::AssumptionInvalidation);
    assert_eq!(conflicts[0].affected_agents, vec![backend_agent.clone()]);

    // Reconcile through a convergence session; the conflict resolves and the
    // stream resumes.
    let session = engine
        .trigger_convergence(
            &team.id,
            "assumption_invalidation",
            "rework auth handling",
            vec![conflicts[0].id.clone()],
            vec![backend_agent.clone()],
        )
        .await
        .unwrap();
    assert!(engine.active_streams(&team.id).is_empty());
    engine
        .complete_convergence(
            &session.id,
            vec!["adopt v2 auth".into()],
            vec!["gateway.rs".into()],
            2.0,
        )
        .await
        .unwrap();
    assert_eq!(engine.active_streams(&team.id).len(), 1);
    assert_eq!(
        store.get_conflict(&conflicts[0].id).unwrap().status,
        ConflictStatus::Resolved
    );

    let metrics = engine.metrics(&team.id).unwrap();
    assert_eq!(metrics.total_conflicts, 1);
    assert_eq!(metrics.resolved_conflicts, 1);
    assert!((metrics.rework_efficiency - 0.6).abs() < 1e-9);
}
