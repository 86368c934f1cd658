//! Contract and assumption subsystem.
//!
//! Contracts are versioned, API-like specifications shared between work
//! streams. Exactly one version per `(team, name)` is active at a time;
//! activation archives the predecessor in the same transaction. The
//! breaking-change detector is a pure function over two specifications.

use std::sync::Arc;

use ensemble_core::bus::team_topic;
use ensemble_core::model::{
    Assumption, AssumptionStatus, Contract, ContractSpec, ContractStatus,
};
use ensemble_core::{ids, store, AccessController, Action, CoreError, EventBus, StateStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::locks::TeamLocks;
use crate::manager::Actor;
use crate::Result;

/// Differences between two versions of a contract specification.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ChangeSet {
    pub added_fields: Vec<String>,
    pub removed_fields: Vec<String>,
    pub typechanged_fields: Vec<String>,
    pub endpoint_signature_changes: Vec<String>,
    pub new_required_params: Vec<String>,
    pub model_restructurings: Vec<String>,
}

impl ChangeSet {
    /// Breaking iff the set contains removed fields, type changes, new
    /// required parameters, or endpoint signature changes.
    pub fn is_breaking(&self) -> bool {
        !self.removed_fields.is_empty()
            || !self.typechanged_fields.is_empty()
            || !self.new_required_params.is_empty()
            || !self.endpoint_signature_changes.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.added_fields.is_empty()
            && self.removed_fields.is_empty()
            && self.typechanged_fields.is_empty()
            && self.endpoint_signature_changes.is_empty()
            && self.new_required_params.is_empty()
            && self.model_restructurings.is_empty()
    }
}

/// Pure, deterministic diff between two specifications of the same contract.
pub fn diff_specs(old: &ContractSpec, new: &ContractSpec) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for field in &new.fields {
        match old.fields.iter().find(|f| f.name == field.name) {
            None => {
                changes.added_fields.push(field.name.clone());
                if field.required {
                    changes.new_required_params.push(field.name.clone());
                }
            }
            Some(prior) => {
                if prior.field_type != field.field_type {
                    changes.typechanged_fields.push(field.name.clone());
                }
                if field.required && !prior.required {
                    changes.new_required_params.push(field.name.clone());
                }
            }
        }
    }
    for field in &old.fields {
        if !new.fields.iter().any(|f| f.name == field.name) {
            changes.removed_fields.push(field.name.clone());
        }
    }

    for endpoint in &new.endpoints {
        if let Some(prior) = old.endpoints.iter().find(|e| e.name == endpoint.name) {
            if prior.signature != endpoint.signature {
                changes.endpoint_signature_changes.push(endpoint.name.clone());
            }
        }
    }
    for endpoint in &old.endpoints {
        if !new.endpoints.iter().any(|e| e.name == endpoint.name) {
            changes.endpoint_signature_changes.push(endpoint.name.clone());
        }
    }

    for model in &old.models {
        if !new.models.contains(model) {
            changes.model_restructurings.push(model.clone());
        }
    }

    changes
}

pub struct ContractRegistry {
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    access: Arc<AccessController>,
    locks: TeamLocks,
}

impl ContractRegistry {
    pub fn new(
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
        access: Arc<AccessController>,
        locks: TeamLocks,
    ) -> Self {
        Self {
            store,
            bus,
            access,
            locks,
        }
    }

    fn flush_events(&self) -> Result<()> {
        self.bus.flush_outbox(&self.store)?;
        Ok(())
    }

    // ---- contracts ----

    pub async fn create_contract(
        &self,
        team_id: &str,
        name: &str,
        version: &str,
        specification: ContractSpec,
        owner_role: &str,
        owner_agent: &str,
        consumers: Vec<String>,
        actor: &Actor,
    ) -> Result<Contract> {
        self.access
            .check(&actor.agent_id, &actor.role_id, Action::EvolveContract)?;
        if name.trim().is_empty() || version.trim().is_empty() {
            return Err(
                CoreError::Validation("contract name and version are required".into()).into(),
            );
        }
        let _guard = self.locks.lock(team_id).await;
        let contract = Contract {
            id: ids::contract_id(),
            team_id: team_id.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            status: ContractStatus::Draft,
            specification,
            owner_role: owner_role.to_string(),
            owner_agent: owner_agent.to_string(),
            consumers,
            previous_version_id: None,
        };
        self.store.with_transaction(|tx| {
            store::insert_contract(tx, &contract)?;
            store::enqueue_event(
                tx,
                &team_topic(team_id, "contract", "created"),
                &json!({"contract_id": contract.id, "name": name, "version": version}),
            )
        })?;
        self.flush_events()?;
        Ok(contract)
    }

    /// Activate a draft version, archiving the currently active version of the
    /// same `(team, name)` in the same transaction.
    pub async fn activate_contract(&self, contract_id: &str, actor: &Actor) -> Result<Contract> {
        self.access
            .check(&actor.agent_id, &actor.role_id, Action::ActivateContract)?;
        let contract = self.store.get_contract(contract_id)?;
        if contract.status != ContractStatus::Draft {
            return Err(CoreError::ConflictingState(format!(
                "contract {contract_id} is {} not draft",
                contract.status.name()
            ))
            .into());
        }
        let _guard = self.locks.lock(&contract.team_id).await;
        let team_id = contract.team_id.clone();
        let name = contract.name.clone();
        self.store.with_transaction(|tx| {
            if let Some(active) = store::active_contract(tx, &team_id, &name)? {
                store::set_contract_status(tx, &active.id, ContractStatus::Deprecated)?;
                store::enqueue_event(
                    tx,
                    &team_topic(&team_id, "contract", "archived"),
                    &json!({"contract_id": active.id, "name": name, "version": active.version}),
                )?;
            }
            store::set_contract_status(tx, contract_id, ContractStatus::Active)?;
            store::enqueue_event(
                tx,
                &team_topic(&team_id, "contract", "activated"),
                &json!({
                    "contract_id": contract_id,
                    "name": name,
                    "version": contract.version,
                }),
            )
        })?;
        self.flush_events()?;
        info!(team_id, name, version = contract.version, "contract activated");
        Ok(self.store.get_contract(contract_id)?)
    }

    /// Create and activate a new version linked to the prior active version.
    /// Returns the new contract together with the computed change set.
    #[allow(clippy::too_many_arguments)]
    pub async fn evolve_contract(
        &self,
        team_id: &str,
        name: &str,
        new_version: &str,
        new_specification: ContractSpec,
        changes_from_previous: Vec<String>,
        owner_agent: &str,
        actor: &Actor,
    ) -> Result<(Contract, ChangeSet)> {
        self.access
            .check(&actor.agent_id, &actor.role_id, Action::EvolveContract)?;
        if changes_from_previous.is_empty() {
            return Err(CoreError::Validation(
                "contract evolution requires a non-empty change description".into(),
            )
            .into());
        }
        let previous = self
            .store
            .active_contract(team_id, name)?
            .ok_or_else(|| CoreError::NotFound(format!("active contract {name} in {team_id}")))?;
        let change_set = diff_specs(&previous.specification, &new_specification);

        let _guard = self.locks.lock(team_id).await;
        let contract = Contract {
            id: ids::contract_id(),
            team_id: team_id.to_string(),
            name: name.to_string(),
            version: new_version.to_string(),
            status: ContractStatus::Draft,
            specification: new_specification,
            owner_role: previous.owner_role.clone(),
            owner_agent: owner_agent.to_string(),
            consumers: previous.consumers.clone(),
            previous_version_id: Some(previous.id.clone()),
        };
        self.store.with_transaction(|tx| {
            store::insert_contract(tx, &contract)?;
            store::set_contract_status(tx, &previous.id, ContractStatus::Deprecated)?;
            store::set_contract_status(tx, &contract.id, ContractStatus::Active)?;
            store::enqueue_event(
                tx,
                &team_topic(team_id, "contract", "archived"),
                &json!({"contract_id": previous.id, "name": name, "version": previous.version}),
            )?;
            store::enqueue_event(
                tx,
                &team_topic(team_id, "contract", "evolved"),
                &json!({
                    "contract_id": contract.id,
                    "name": name,
                    "version": new_version,
                    "previous_version": previous.version,
                    "breaking": change_set.is_breaking(),
                    "changes": changes_from_previous,
                }),
            )
        })?;
        self.flush_events()?;
        info!(
            team_id,
            name,
            version = new_version,
            breaking = change_set.is_breaking(),
            "contract evolved"
        );
        Ok((self.store.get_contract(&contract.id)?, change_set))
    }

    pub fn active_contract(&self, team_id: &str, name: &str) -> Result<Option<Contract>> {
        Ok(self.store.active_contract(team_id, name)?)
    }

    // ---- assumptions ----

    #[allow(clippy::too_many_arguments)]
    pub async fn track_assumption(
        &self,
        team_id: &str,
        text: &str,
        category: &str,
        related_artifact: Option<ensemble_core::model::ArtifactRef>,
        dependent_artifacts: Vec<ensemble_core::model::ArtifactRef>,
        actor: &Actor,
    ) -> Result<Assumption> {
        self.access
            .check(&actor.agent_id, &actor.role_id, Action::ShareKnowledge)?;
        let _guard = self.locks.lock(team_id).await;
        let mut assumption = Assumption::tentative(
            ids::assumption_id(),
            team_id.to_string(),
            actor.agent_id.clone(),
            actor.role_id.clone(),
            text.to_string(),
            category.to_string(),
        );
        assumption.related_artifact = related_artifact;
        assumption.dependent_artifacts = dependent_artifacts;
        self.store.with_transaction(|tx| {
            store::insert_assumption(tx, &assumption)?;
            store::enqueue_event(
                tx,
                &team_topic(team_id, "assumption", "tracked"),
                &json!({"assumption_id": assumption.id, "category": category}),
            )
        })?;
        self.flush_events()?;
        Ok(assumption)
    }

    pub async fn validate_assumption(
        &self,
        assumption_id: &str,
        validated_by: &str,
        _notes: &str,
    ) -> Result<Assumption> {
        let assumption = self.store.get_assumption(assumption_id)?;
        Self::check_transition(assumption.status, AssumptionStatus::Validated)?;
        let _guard = self.locks.lock(&assumption.team_id).await;
        self.store.with_transaction(|tx| {
            store::update_assumption_status(tx, assumption_id, AssumptionStatus::Validated, None)?;
            store::enqueue_event(
                tx,
                &team_topic(&assumption.team_id, "assumption", "validated"),
                &json!({"assumption_id": assumption_id, "validated_by": validated_by}),
            )
        })?;
        self.flush_events()?;
        Ok(self.store.get_assumption(assumption_id)?)
    }

    /// Invalidate an assumption and announce it; every dependent artifact is
    /// treated as potentially stale by subscribers.
    pub async fn invalidate_assumption(
        &self,
        assumption_id: &str,
        invalidated_by: &str,
        notes: &str,
    ) -> Result<Assumption> {
        let assumption = self.store.get_assumption(assumption_id)?;
        Self::check_transition(assumption.status, AssumptionStatus::Invalidated)?;
        let _guard = self.locks.lock(&assumption.team_id).await;
        self.store.with_transaction(|tx| {
            store::update_assumption_status(
                tx,
                assumption_id,
                AssumptionStatus::Invalidated,
                Some(notes),
            )?;
            store::enqueue_event(
                tx,
                &team_topic(&assumption.team_id, "assumption", "invalidated"),
                &json!({
                    "assumption_id": assumption_id,
                    "team_id": assumption.team_id,
                    "invalidated_by": invalidated_by,
                    "notes": notes,
                    "dependent_artifacts": assumption.dependent_artifacts,
                }),
            )
        })?;
        self.flush_events()?;
        info!(assumption_id, "assumption invalidated");
        Ok(self.store.get_assumption(assumption_id)?)
    }

    /// Monotone transition check; `Invalidated` is terminal.
    fn check_transition(from: AssumptionStatus, to: AssumptionStatus) -> Result<()> {
        let allowed = matches!(
            (from, to),
            (AssumptionStatus::Tentative, AssumptionStatus::Validated)
                | (AssumptionStatus::Tentative, AssumptionStatus::Invalidated)
                | (AssumptionStatus::Validated, AssumptionStatus::Invalidated)
        );
        if allowed {
            Ok(())
        } else {
            Err(CoreError::ConflictingState(format!(
                "assumption transition {} -> {} is not allowed",
                from.name(),
                to.name()
            ))
            .into())
        }
    }
}
