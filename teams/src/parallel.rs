//! Parallel work streams over a shared minimum viable definition (MVD).
//!
//! Streams proceed speculatively against pinned contract versions. Breaking
//! contract changes and invalidated assumptions raise conflicts; convergence
//! sessions halt the affected streams, reconcile the rework and resume them.
//! Convergence sessions serialize per team and never nest.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::DateTime;
use ensemble_core::bus::team_topic;
use ensemble_core::model::{
    ArtifactRef, Conflict, ConflictKind, ConflictStatus, Contract, ConvergenceSession,
    ConvergenceStatus, Severity,
};
use ensemble_core::{ids, store, CoreError, EventBus, StateStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::contracts::diff_specs;
use crate::locks::TeamLocks;
use crate::{Result, TeamError};

/// Minimum viable definition: the smallest shared contract set that lets
/// streams proceed without waiting for full design.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mvd {
    pub id: String,
    pub team_id: String,
    pub name: String,
    pub description: String,
    /// Contract names whose active versions the streams pin at start.
    pub contract_names: Vec<String>,
}

impl Mvd {
    pub fn new(team_id: &str, name: &str, description: &str, contract_names: Vec<String>) -> Self {
        Self {
            id: ids::mvd_id(),
            team_id: team_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            contract_names,
        }
    }
}

/// Requested stream in a parallel session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSpec {
    pub role: String,
    pub agent_id: String,
    pub stream_type: String,
    pub initial_task: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// Waiting for a concurrency slot; never silently dropped.
    Queued,
    Active,
    Halted,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkStream {
    pub id: String,
    pub mvd_id: String,
    pub team_id: String,
    pub role: String,
    pub agent_id: String,
    pub stream_type: String,
    pub initial_task: String,
    /// (contract name, version) pinned when the stream started.
    pub contract_versions: Vec<(String, String)>,
    pub outputs: Vec<ArtifactRef>,
    pub status: StreamStatus,
}

/// Aggregate conflict/convergence metrics consumed by the scoring layer.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ConvergenceMetrics {
    pub total_conflicts: usize,
    pub resolved_conflicts: usize,
    pub total_convergences: usize,
    pub average_convergence_minutes: f64,
    pub rework_efficiency: f64,
}

pub struct ParallelEngine {
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    locks: TeamLocks,
    sessions: RwLock<HashMap<String, Mvd>>,
    streams: RwLock<HashMap<String, WorkStream>>,
    productive_hours: RwLock<HashMap<String, f64>>,
    max_streams_per_mvd: usize,
}

impl ParallelEngine {
    pub fn new(
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
        locks: TeamLocks,
        max_streams_per_mvd: usize,
    ) -> Self {
        Self {
            store,
            bus,
            locks,
            sessions: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
            productive_hours: RwLock::new(HashMap::new()),
            max_streams_per_mvd: max_streams_per_mvd.max(1),
        }
    }

    fn flush_events(&self) -> Result<()> {
        self.bus.flush_outbox(&self.store)?;
        Ok(())
    }

    // ---- streams ----

    /// Record an MVD session and start one stream per spec. Streams beyond
    /// the concurrency bound queue and activate as slots free up.
    pub async fn start_parallel_work_streams(
        &self,
        mvd: Mvd,
        specs: Vec<StreamSpec>,
    ) -> Result<Vec<WorkStream>> {
        if specs.is_empty() {
            return Err(CoreError::Validation("a parallel session needs at least one stream".into())
                .into());
        }
        let _guard = self.locks.lock(&mvd.team_id).await;
        let mut pinned = Vec::new();
        for name in &mvd.contract_names {
            let contract = self
                .store
                .active_contract(&mvd.team_id, name)?
                .ok_or_else(|| {
                    CoreError::NotFound(format!("active contract {name} for mvd {}", mvd.name))
                })?;
            pinned.push((contract.name, contract.version));
        }

        let mut created = Vec::with_capacity(specs.len());
        for (index, spec) in specs.into_iter().enumerate() {
            let stream = WorkStream {
                id: ids::stream_id(),
                mvd_id: mvd.id.clone(),
                team_id: mvd.team_id.clone(),
                role: spec.role,
                agent_id: spec.agent_id,
                stream_type: spec.stream_type,
                initial_task: spec.initial_task,
                contract_versions: pinned.clone(),
                outputs: Vec::new(),
                status: if index < self.max_streams_per_mvd {
                    StreamStatus::Active
                } else {
                    StreamStatus::Queued
                },
            };
            created.push(stream);
        }
        {
            let mut streams = self.streams.write().unwrap();
            for stream in &created {
                streams.insert(stream.id.clone(), stream.clone());
            }
        }
        self.sessions
            .write()
            .unwrap()
            .insert(mvd.id.clone(), mvd.clone());

        self.store.with_transaction(|tx| {
            store::enqueue_event(
                tx,
                &team_topic(&mvd.team_id, "stream", "session_started"),
                &json!({
                    "mvd_id": mvd.id,
                    "mvd": mvd.name,
                    "streams": created.iter().map(|s| json!({
                        "stream_id": s.id,
                        "role": s.role,
                        "agent_id": s.agent_id,
                        "status": s.status,
                    })).collect::<Vec<_>>(),
                }),
            )
        })?;
        self.flush_events()?;
        info!(mvd = mvd.name, streams = created.len(), "parallel session started");
        Ok(created)
    }

    pub fn stream(&self, stream_id: &str) -> Option<WorkStream> {
        self.streams.read().unwrap().get(stream_id).cloned()
    }

    pub fn session(&self, mvd_id: &str) -> Option<Mvd> {
        self.sessions.read().unwrap().get(mvd_id).cloned()
    }

    pub fn active_streams(&self, team_id: &str) -> Vec<WorkStream> {
        self.streams
            .read()
            .unwrap()
            .values()
            .filter(|s| s.team_id == team_id && s.status == StreamStatus::Active)
            .cloned()
            .collect()
    }

    /// Record an output produced by a stream. The referenced contract version
    /// must be the currently active one; referencing an archived version
    /// fails and automatically raises a contract-breach conflict.
    pub async fn record_stream_output(
        &self,
        stream_id: &str,
        artifact: ArtifactRef,
        contract_name: &str,
        contract_version: &str,
        hours_spent: f64,
    ) -> Result<()> {
        let stream = self
            .stream(stream_id)
            .ok_or_else(|| CoreError::NotFound(format!("stream {stream_id}")))?;
        match stream.status {
            StreamStatus::Active => {}
            StreamStatus::Halted => {
                return Err(CoreError::ConflictingState(format!(
                    "stream {stream_id} is halted pending convergence"
                ))
                .into())
            }
            other => {
                return Err(CoreError::ConflictingState(format!(
                    "stream {stream_id} is {other:?}"
                ))
                .into())
            }
        }

        let active = self
            .store
            .active_contract(&stream.team_id, contract_name)?
            .ok_or_else(|| CoreError::NotFound(format!("contract {contract_name}")))?;
        if active.version != contract_version {
            warn!(
                stream_id,
                contract_name, contract_version, "stale contract reference"
            );
            self.raise_conflict(
                &stream.team_id,
                ConflictKind::ContractBreach,
                Severity::High,
                format!(
                    "stream {} produced output against archived {} v{} (active is v{})",
                    stream_id, contract_name, contract_version, active.version
                ),
                vec![stream.agent_id.clone()],
                vec![format!("contract:{contract_name}@{contract_version}")],
            )
            .await?;
            return Err(TeamError::StaleContractReference {
                name: contract_name.to_string(),
                version: contract_version.to_string(),
            });
        }

        {
            let mut streams = self.streams.write().unwrap();
            if let Some(entry) = streams.get_mut(stream_id) {
                entry.outputs.push(artifact);
            }
        }
        *self
            .productive_hours
            .write()
            .unwrap()
            .entry(stream.team_id.clone())
            .or_insert(0.0) += hours_spent.max(0.0);
        Ok(())
    }

    /// Mark a stream finished and activate the oldest queued stream, if any.
    pub async fn complete_stream(&self, stream_id: &str) -> Result<()> {
        let mut streams = self.streams.write().unwrap();
        let stream = streams
            .get_mut(stream_id)
            .ok_or_else(|| CoreError::NotFound(format!("stream {stream_id}")))?;
        stream.status = StreamStatus::Completed;
        let mvd_id = stream.mvd_id.clone();
        if let Some(queued) = streams
            .values_mut()
            .filter(|s| s.mvd_id == mvd_id && s.status == StreamStatus::Queued)
            .min_by(|a, b| a.id.cmp(&b.id))
        {
            queued.status = StreamStatus::Active;
        }
        Ok(())
    }

    // ---- conflicts ----

    async fn raise_conflict(
        &self,
        team_id: &str,
        kind: ConflictKind,
        severity: Severity,
        description: String,
        affected_agents: Vec<String>,
        source_refs: Vec<String>,
    ) -> Result<Conflict> {
        let mut conflict = Conflict::open(
            ids::conflict_id(),
            team_id.to_string(),
            kind,
            severity,
            description,
        );
        conflict.affected_agents = affected_agents;
        conflict.source_refs = source_refs;
        self.store.with_transaction(|tx| {
            store::insert_conflict(tx, &conflict)?;
            store::enqueue_event(
                tx,
                &team_topic(team_id, "conflict", "opened"),
                &json!({
                    "conflict_id": conflict.id,
                    "kind": conflict.kind,
                    "severity": conflict.severity,
                    "affected_agents": conflict.affected_agents,
                }),
            )
        })?;
        self.flush_events()?;
        Ok(conflict)
    }

    /// Detect a contract breach: a breaking change to a contract some active
    /// stream still depends on. Returns the raised conflict, if any.
    pub async fn detect_contract_breach(
        &self,
        old_contract: &Contract,
        new_contract: &Contract,
    ) -> Result<Option<Conflict>> {
        let changes = diff_specs(&old_contract.specification, &new_contract.specification);
        if !changes.is_breaking() {
            return Ok(None);
        }
        let affected: Vec<String> = {
            let streams = self.streams.read().unwrap();
            streams
                .values()
                .filter(|s| {
                    s.team_id == old_contract.team_id
                        && s.status == StreamStatus::Active
                        && s.contract_versions
                            .iter()
                            .any(|(name, version)| {
                                name == &old_contract.name && version == &old_contract.version
                            })
                })
                .map(|s| s.agent_id.clone())
                .collect()
        };
        if affected.is_empty() {
            return Ok(None);
        }
        let conflict = self
            .raise_conflict(
                &old_contract.team_id,
                ConflictKind::ContractBreach,
                Severity::High,
                format!(
                    "breaking change {} v{} -> v{}: removed={:?} typechanged={:?} new_required={:?} signatures={:?}",
                    old_contract.name,
                    old_contract.version,
                    new_contract.version,
                    changes.removed_fields,
                    changes.typechanged_fields,
                    changes.new_required_params,
                    changes.endpoint_signature_changes,
                ),
                affected,
                vec![
                    format!("contract:{}@{}", old_contract.name, old_contract.version),
                    format!("contract:{}@{}", new_contract.name, new_contract.version),
                ],
            )
            .await?;
        Ok(Some(conflict))
    }

    /// React to an `assumption.invalidated` event: when any dependent
    /// artifact belongs to an active stream, open a conflict for it.
    pub async fn handle_assumption_invalidated(&self, payload: &Value) -> Result<Option<Conflict>> {
        let team_id = payload["team_id"].as_str().unwrap_or_default().to_string();
        let assumption_id = payload["assumption_id"].as_str().unwrap_or_default();
        let dependents: Vec<ArtifactRef> =
            serde_json::from_value(payload["dependent_artifacts"].clone()).unwrap_or_default();
        if team_id.is_empty() || dependents.is_empty() {
            return Ok(None);
        }
        let affected: Vec<String> = {
            let streams = self.streams.read().unwrap();
            streams
                .values()
                .filter(|s| {
                    s.team_id == team_id
                        && s.status == StreamStatus::Active
                        && dependents.iter().any(|d| {
                            s.outputs.iter().any(|o| o.id == d.id) || s.initial_task == d.id
                        })
                })
                .map(|s| s.agent_id.clone())
                .collect()
        };
        if affected.is_empty() {
            return Ok(None);
        }
        let conflict = self
            .raise_conflict(
                &team_id,
                ConflictKind::AssumptionInvalidation,
                Severity::High,
                format!("assumption {assumption_id} invalidated; dependent stream work is stale"),
                affected,
                vec![format!("assumption:{assumption_id}")],
            )
            .await?;
        Ok(Some(conflict))
    }

    /// Subscribe this engine to assumption invalidations on the bus. The
    /// subscriber task runs until the bus is dropped.
    pub fn wire_assumption_events(self: &Arc<Self>) {
        let mut subscription = self.bus.subscribe("team:*:events:assumption.invalidated");
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if let Err(err) = engine.handle_assumption_invalidated(&event.payload).await {
                    warn!(error = %err, "assumption invalidation handling failed");
                }
            }
        });
    }

    // ---- convergence ----

    /// Open a convergence session: halt affected streams, mark conflicts
    /// under convergence. Fails with `ConflictingState` while another session
    /// is open for the team (sessions never nest).
    pub async fn trigger_convergence(
        &self,
        team_id: &str,
        trigger_type: &str,
        description: &str,
        conflict_ids: Vec<String>,
        participants: Vec<String>,
    ) -> Result<ConvergenceSession> {
        let _guard = self.locks.lock(team_id).await;
        if self.store.open_convergence(team_id)?.is_some() {
            return Err(CoreError::ConflictingState(format!(
                "a convergence session is already open for team {team_id}"
            ))
            .into());
        }
        let mut affected_agents = Vec::new();
        for conflict_id in &conflict_ids {
            let conflict = self.store.get_conflict(conflict_id)?;
            affected_agents.extend(conflict.affected_agents);
        }
        affected_agents.sort();
        affected_agents.dedup();

        let session = ConvergenceSession {
            id: ids::convergence_id(),
            team_id: team_id.to_string(),
            trigger: trigger_type.to_string(),
            description: description.to_string(),
            participants,
            conflict_ids: conflict_ids.clone(),
            decisions: Vec::new(),
            artifacts_updated: Vec::new(),
            rework_hours_actual: 0.0,
            started_at: ids::now_iso(),
            ended_at: None,
            status: ConvergenceStatus::Open,
        };
        self.store.with_transaction(|tx| {
            store::insert_convergence(tx, &session)?;
            for conflict_id in &conflict_ids {
                store::update_conflict_status(tx, conflict_id, ConflictStatus::UnderConvergence)?;
            }
            store::enqueue_event(
                tx,
                &team_topic(team_id, "convergence", "started"),
                &json!({
                    "session_id": session.id,
                    "trigger": trigger_type,
                    "conflicts": conflict_ids,
                }),
            )
        })?;
        self.flush_events()?;

        // Halt every active stream owned by an affected agent.
        {
            let mut streams = self.streams.write().unwrap();
            for stream in streams.values_mut() {
                if stream.team_id == team_id
                    && stream.status == StreamStatus::Active
                    && affected_agents.contains(&stream.agent_id)
                {
                    stream.status = StreamStatus::Halted;
                }
            }
        }
        info!(team_id, session = session.id, "convergence started");
        Ok(session)
    }

    /// Close a convergence session: resolve its conflicts, record rework,
    /// resume the halted streams.
    pub async fn complete_convergence(
        &self,
        session_id: &str,
        decisions_made: Vec<String>,
        artifacts_updated: Vec<String>,
        rework_hours_actual: f64,
    ) -> Result<ConvergenceSession> {
        let mut session = self.store.get_convergence(session_id)?;
        if session.status != ConvergenceStatus::Open {
            return Err(CoreError::ConflictingState(format!(
                "convergence {session_id} is {}",
                session.status.name()
            ))
            .into());
        }
        let _guard = self.locks.lock(&session.team_id).await;
        session.decisions = decisions_made;
        session.artifacts_updated = artifacts_updated;
        session.rework_hours_actual = rework_hours_actual;
        session.ended_at = Some(ids::now_iso());
        session.status = ConvergenceStatus::Completed;

        let team_id = session.team_id.clone();
        self.store.with_transaction(|tx| {
            store::update_convergence(tx, &session)?;
            for conflict_id in &session.conflict_ids {
                store::update_conflict_status(tx, conflict_id, ConflictStatus::Resolved)?;
            }
            store::enqueue_event(
                tx,
                &team_topic(&team_id, "convergence", "completed"),
                &json!({
                    "session_id": session.id,
                    "rework_hours": rework_hours_actual,
                    "decisions": session.decisions,
                }),
            )
        })?;
        self.flush_events()?;

        {
            let mut streams = self.streams.write().unwrap();
            for stream in streams.values_mut() {
                if stream.team_id == team_id && stream.status == StreamStatus::Halted {
                    stream.status = StreamStatus::Active;
                }
            }
        }
        info!(team_id, session = session.id, "convergence completed");
        Ok(session)
    }

    // ---- metrics ----

    pub fn metrics(&self, team_id: &str) -> Result<ConvergenceMetrics> {
        let conflicts = self.store.list_conflicts(team_id, None)?;
        let resolved = conflicts
            .iter()
            .filter(|c| c.status == ConflictStatus::Resolved)
            .count();
        let sessions = self.store.list_convergences(team_id)?;
        let mut total_minutes = 0.0;
        let mut timed = 0usize;
        let mut rework_hours = 0.0;
        for session in &sessions {
            rework_hours += session.rework_hours_actual;
            if let Some(ended) = &session.ended_at {
                if let (Ok(start), Ok(end)) = (
                    DateTime::parse_from_rfc3339(&session.started_at),
                    DateTime::parse_from_rfc3339(ended),
                ) {
                    total_minutes += (end - start).num_seconds() as f64 / 60.0;
                    timed += 1;
                }
            }
        }
        let productive = *self
            .productive_hours
            .read()
            .unwrap()
            .get(team_id)
            .unwrap_or(&0.0);
        let rework_efficiency = if rework_hours + productive > 0.0 {
            1.0 - rework_hours / (rework_hours + productive)
        } else {
            1.0
        };
        Ok(ConvergenceMetrics {
            total_conflicts: conflicts.len(),
            resolved_conflicts: resolved,
            total_convergences: sessions.len(),
            average_convergence_minutes: if timed > 0 {
                total_minutes / timed as f64
            } else {
                0.0
            },
            rework_efficiency,
        })
    }
}
