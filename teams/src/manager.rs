//! Team and role management.
//!
//! Tasks are assigned to roles, not agents: `required_role` resolves to the
//! agent currently filling the role at dispatch time, so a reassignment is a
//! seamless handoff that never rewrites tasks.

use std::sync::Arc;

use ensemble_core::bus::team_topic;
use ensemble_core::config::ScalingPlan;
use ensemble_core::model::{
    HandoffArtifact, MembershipState, PerformanceSummary, Role, Task, TaskStatus, Team, TeamState,
};
use ensemble_core::{ids, store, AccessController, Action, CoreError, EventBus, StateStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::locks::TeamLocks;
use crate::persona::PersonaDirectory;
use crate::roles::{standard_role, STANDARD_ROLES};
use crate::{Result, TeamError};

/// Identity on whose behalf a mutating operation runs.
#[derive(Debug, Clone)]
pub struct Actor {
    pub agent_id: String,
    pub role_id: String,
}

impl Actor {
    pub fn new(agent_id: impl Into<String>, role_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            role_id: role_id.into(),
        }
    }

    pub fn system() -> Self {
        Self::new("system", "system")
    }
}

/// Onboarding packet handed to a newly added member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Briefing {
    pub agent_id: String,
    pub persona: String,
    pub team_id: String,
    pub current_phase: String,
    /// (role id, currently bound agent) for every active role.
    pub role_assignments: Vec<(String, Option<String>)>,
    pub open_tasks: Vec<String>,
    pub active_contracts: Vec<String>,
}

/// Outcome of a phase-transition scaling pass.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScalingReport {
    pub from_phase: String,
    pub to_phase: String,
    /// (role id, agent id) pairs filled during the pass.
    pub added: Vec<(String, String)>,
    pub released_roles: Vec<String>,
    pub moved_to_standby: Vec<String>,
    pub unfilled: Vec<String>,
}

/// Summary view over a team's roles.
#[derive(Debug, Clone, Serialize)]
pub struct RoleSummary {
    pub team_id: String,
    pub total_roles: usize,
    pub filled_roles: usize,
    pub unfilled_roles: usize,
    pub required_unfilled: usize,
    pub roles: Vec<Role>,
}

pub struct TeamManager {
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    access: Arc<AccessController>,
    locks: TeamLocks,
    personas: Arc<PersonaDirectory>,
    scaling_plan: ScalingPlan,
    idempotency_window_secs: i64,
}

impl TeamManager {
    pub fn new(
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
        access: Arc<AccessController>,
    ) -> Result<Self> {
        Ok(Self {
            store,
            bus,
            access,
            locks: TeamLocks::new(),
            personas: Arc::new(PersonaDirectory::with_default_data()?),
            scaling_plan: ScalingPlan::standard(),
            idempotency_window_secs: 24 * 3600,
        })
    }

    pub fn with_scaling_plan(mut self, plan: ScalingPlan) -> Self {
        self.scaling_plan = plan;
        self
    }

    pub fn with_idempotency_window(mut self, secs: i64) -> Self {
        self.idempotency_window_secs = secs;
        self
    }

    pub fn personas(&self) -> Arc<PersonaDirectory> {
        Arc::clone(&self.personas)
    }

    pub fn locks(&self) -> TeamLocks {
        self.locks.clone()
    }

    fn flush_events(&self) -> Result<()> {
        self.bus.flush_outbox(&self.store).map_err(TeamError::from)?;
        Ok(())
    }

    // ---- team lifecycle ----

    pub async fn create_team(
        &self,
        name: &str,
        project_type: &str,
        idempotency_key: Option<&str>,
    ) -> Result<Team> {
        if let Some(key) = idempotency_key {
            if let Some(hit) = self
                .store
                .idempotency_lookup(key, self.idempotency_window_secs)?
            {
                return Ok(serde_json::from_value(hit).map_err(CoreError::from)?);
            }
        }
        if name.trim().is_empty() {
            return Err(CoreError::Validation("team name must not be empty".into()).into());
        }
        let team = Team::new(ids::team_id(), name.to_string(), project_type.to_string());
        self.store.with_transaction(|tx| {
            store::insert_team(tx, &team)?;
            store::enqueue_event(
                tx,
                &team_topic(&team.id, "team", "created"),
                &json!({"team_id": team.id, "name": team.name, "project_type": team.project_type}),
            )
        })?;
        self.flush_events()?;
        if let Some(key) = idempotency_key {
            self.store
                .idempotency_store(key, &serde_json::to_value(&team).map_err(CoreError::from)?)?;
        }
        info!(team_id = team.id, "created team");
        Ok(team)
    }

    pub async fn activate_team(&self, team_id: &str) -> Result<()> {
        let _guard = self.locks.lock(team_id).await;
        self.store.with_transaction(|tx| {
            store::update_team_state(tx, team_id, TeamState::Active)?;
            store::enqueue_event(
                tx,
                &team_topic(team_id, "team", "activated"),
                &json!({"team_id": team_id}),
            )
        })?;
        self.flush_events()
    }

    /// Seed the standard delivery role set for a team.
    pub async fn initialize_standard_roles(&self, team_id: &str) -> Result<Vec<Role>> {
        let _guard = self.locks.lock(team_id).await;
        self.store.get_team(team_id)?;
        let mut created = Vec::new();
        self.store.with_transaction(|tx| {
            for definition in STANDARD_ROLES {
                let role = Role {
                    role_id: definition.role_id.to_string(),
                    team_id: team_id.to_string(),
                    description: definition.description.to_string(),
                    is_required: definition.is_required,
                    priority: definition.priority,
                    is_active: true,
                    current_agent_id: None,
                    assignment_history: Vec::new(),
                };
                store::insert_role(tx, &role)?;
                created.push(role);
            }
            Ok(())
        })?;
        info!(team_id, count = created.len(), "initialized standard roles");
        Ok(created)
    }

    // ---- membership ----

    /// Add a member: pending membership transitions to active atomically, an
    /// onboarding briefing is produced, and the role is optionally bound.
    pub async fn add_member_with_briefing(
        &self,
        team_id: &str,
        persona_id: &str,
        current_phase: &str,
        role_id: Option<&str>,
        actor: &Actor,
        idempotency_key: Option<&str>,
    ) -> Result<(String, Briefing)> {
        self.access
            .check(&actor.agent_id, &actor.role_id, Action::AddMember)?;
        if let Some(key) = idempotency_key {
            if let Some(hit) = self
                .store
                .idempotency_lookup(key, self.idempotency_window_secs)?
            {
                return Ok(serde_json::from_value(hit).map_err(CoreError::from)?);
            }
        }
        let persona = self
            .personas
            .get(persona_id)
            .ok_or_else(|| CoreError::NotFound(format!("persona {persona_id}")))?;
        if let Some(role) = role_id {
            if !persona.suits_role(role) {
                return Err(CoreError::Validation(format!(
                    "persona {persona_id} does not suit role {role}"
                ))
                .into());
            }
        }

        let _guard = self.locks.lock(team_id).await;
        self.store.get_team(team_id)?;
        let agent_id = ids::agent_id(persona_id);
        let team = team_id.to_string();
        let agent = agent_id.clone();
        self.store.with_transaction(|tx| {
            let member = ensemble_core::model::TeamMember::pending(
                agent.clone(),
                persona_id.to_string(),
                team.clone(),
            );
            store::insert_member(tx, &member)?;
            store::update_member_state(tx, &agent, MembershipState::Active)?;
            store::enqueue_event(
                tx,
                &team_topic(&team, "membership", "added"),
                &json!({"team_id": team, "agent_id": agent, "persona_id": persona_id}),
            )?;
            if let Some(role) = role_id {
                let existing = store::get_role(tx, &team, role)?;
                if !existing.is_active {
                    return Err(CoreError::ConflictingState(format!(
                        "role {role} is inactive"
                    )));
                }
                if existing.current_agent_id.is_some() {
                    return Err(CoreError::ConflictingState(format!(
                        "role {role} is already filled"
                    )));
                }
                store::set_role_agent(tx, &team, role, Some(&agent), &actor.agent_id, "onboarding")?;
                store::enqueue_event(
                    tx,
                    &team_topic(&team, "role", "assigned"),
                    &json!({"team_id": team, "role_id": role, "agent_id": agent}),
                )?;
            }
            Ok(())
        })?;
        self.flush_events()?;

        let briefing = self.build_briefing(team_id, &agent_id, &persona.display_name, current_phase, role_id)?;
        let result = (agent_id.clone(), briefing);
        if let Some(key) = idempotency_key {
            self.store
                .idempotency_store(key, &serde_json::to_value(&result).map_err(CoreError::from)?)?;
        }
        info!(team_id, agent_id, "added member");
        Ok(result)
    }

    fn build_briefing(
        &self,
        team_id: &str,
        agent_id: &str,
        persona: &str,
        current_phase: &str,
        role_id: Option<&str>,
    ) -> Result<Briefing> {
        let roles = self.store.list_roles(team_id, true)?;
        let role_assignments = roles
            .iter()
            .map(|r| (r.role_id.clone(), r.current_agent_id.clone()))
            .collect();
        let open_tasks = self
            .store
            .list_tasks(team_id, Some(TaskStatus::Ready))?
            .into_iter()
            .filter(|t| match (role_id, &t.required_role) {
                (Some(role), Some(required)) => role == required,
                _ => true,
            })
            .map(|t| t.title)
            .collect();
        let active_contracts = self
            .store
            .list_contracts(team_id)?
            .into_iter()
            .filter(|c| c.status == ensemble_core::model::ContractStatus::Active)
            .map(|c| format!("{} v{}", c.name, c.version))
            .collect();
        Ok(Briefing {
            agent_id: agent_id.to_string(),
            persona: persona.to_string(),
            team_id: team_id.to_string(),
            current_phase: current_phase.to_string(),
            role_assignments,
            open_tasks,
            active_contracts,
        })
    }

    /// Retire a member, producing a handoff artifact and reassigning or
    /// releasing every role slot they held.
    pub async fn retire_member_with_handoff(
        &self,
        team_id: &str,
        agent_id: &str,
        successor_agent_id: Option<&str>,
        actor: &Actor,
    ) -> Result<HandoffArtifact> {
        self.access
            .check(&actor.agent_id, &actor.role_id, Action::RetireMember)?;
        let _guard = self.locks.lock(team_id).await;

        let member = self.store.get_member(agent_id)?;
        if member.team_id != team_id {
            return Err(CoreError::NotFound(format!(
                "member {agent_id} in team {team_id}"
            ))
            .into());
        }
        if member.state == MembershipState::Retired {
            return Err(CoreError::ConflictingState(format!(
                "member {agent_id} is already retired"
            ))
            .into());
        }
        if let Some(successor) = successor_agent_id {
            let s = self.store.get_member(successor)?;
            if s.team_id != team_id || s.state != MembershipState::Active {
                return Err(TeamError::RoleUnfilled(format!(
                    "successor {successor} is not an active member of {team_id}"
                )));
            }
        }

        let roles_held: Vec<String> = self
            .store
            .list_roles(team_id, true)?
            .into_iter()
            .filter(|r| r.current_agent_id.as_deref() == Some(agent_id))
            .map(|r| r.role_id)
            .collect();
        let open_tasks: Vec<String> = self
            .store
            .list_tasks(team_id, None)?
            .into_iter()
            .filter(|t| {
                t.assigned_to.as_deref() == Some(agent_id)
                    && matches!(t.status, TaskStatus::Ready | TaskStatus::Running | TaskStatus::Blocked)
            })
            .map(|t| t.id)
            .collect();
        let assumptions_authored: Vec<String> = self
            .store
            .list_assumptions(team_id)?
            .into_iter()
            .filter(|a| {
                a.made_by_agent == agent_id
                    && a.status == ensemble_core::model::AssumptionStatus::Tentative
            })
            .map(|a| a.id)
            .collect();
        let contracts_in_progress: Vec<String> = self
            .store
            .list_contracts(team_id)?
            .into_iter()
            .filter(|c| {
                c.owner_agent == agent_id
                    && c.status == ensemble_core::model::ContractStatus::Draft
            })
            .map(|c| c.id)
            .collect();

        let handoff = HandoffArtifact {
            retiring_agent: agent_id.to_string(),
            successor_agent: successor_agent_id.map(str::to_string),
            roles_released: roles_held.clone(),
            open_tasks,
            assumptions_authored,
            contracts_in_progress,
            notes: format!(
                "{} retired; {} role(s) handed over",
                agent_id,
                roles_held.len()
            ),
            generated_at: ids::now_iso(),
        };

        let team = team_id.to_string();
        let agent = agent_id.to_string();
        self.store.with_transaction(|tx| {
            for role in &roles_held {
                store::set_role_agent(
                    tx,
                    &team,
                    role,
                    successor_agent_id,
                    &actor.agent_id,
                    "retirement handoff",
                )?;
                let action = if successor_agent_id.is_some() {
                    "assigned"
                } else {
                    "unassigned"
                };
                store::enqueue_event(
                    tx,
                    &team_topic(&team, "role", action),
                    &json!({
                        "team_id": team,
                        "role_id": role,
                        "from": agent,
                        "to": successor_agent_id,
                    }),
                )?;
            }
            store::update_member_state(tx, &agent, MembershipState::Retired)?;
            store::enqueue_event(
                tx,
                &team_topic(&team, "membership", "retired"),
                &json!({"team_id": team, "agent_id": agent, "handoff": handoff}),
            )
        })?;
        self.flush_events()?;
        info!(team_id, agent_id, "retired member with handoff");
        Ok(handoff)
    }

    /// Apply the phase scaling plan so required roles for `to_phase` are
    /// filled. Members whose roles are no longer needed move to standby.
    pub async fn scale_for_phase_transition(
        &self,
        team_id: &str,
        from_phase: &str,
        to_phase: &str,
        actor: &Actor,
    ) -> Result<ScalingReport> {
        self.access
            .check(&actor.agent_id, &actor.role_id, Action::AddMember)?;
        let target = self
            .scaling_plan
            .roles_for(to_phase)
            .cloned()
            .ok_or_else(|| CoreError::Validation(format!("unknown phase {to_phase}")))?;
        let outgoing = self.scaling_plan.roles_for(from_phase).cloned();

        let mut report = ScalingReport {
            from_phase: from_phase.to_string(),
            to_phase: to_phase.to_string(),
            ..ScalingReport::default()
        };

        {
            let _guard = self.locks.lock(team_id).await;
            self.store
                .with_transaction(|tx| store::update_team_state(tx, team_id, TeamState::Scaling))?;
        }

        // Fill required roles for the incoming phase.
        for role_id in &target.required_roles {
            let role = match self.store.get_role(team_id, role_id) {
                Ok(role) => role,
                Err(_) => {
                    report.unfilled.push(role_id.clone());
                    continue;
                }
            };
            if role.current_agent_id.is_some() {
                continue;
            }
            match self.fill_role(team_id, role_id, actor).await {
                Ok(agent_id) => report.added.push((role_id.clone(), agent_id)),
                Err(TeamError::RoleUnfilled(_)) => report.unfilled.push(role_id.clone()),
                Err(other) => return Err(other),
            }
        }

        // Release roles the incoming phase no longer needs.
        if let Some(outgoing) = outgoing {
            let keep: Vec<&String> = target
                .required_roles
                .iter()
                .chain(target.optional_roles.iter())
                .collect();
            for role_id in outgoing
                .required_roles
                .iter()
                .chain(outgoing.optional_roles.iter())
            {
                if keep.iter().any(|k| *k == role_id) {
                    continue;
                }
                let Ok(role) = self.store.get_role(team_id, role_id) else {
                    continue;
                };
                let Some(agent_id) = role.current_agent_id else {
                    continue;
                };
                self.unassign_role(team_id, role_id, actor, "phase transition")
                    .await?;
                report.released_roles.push(role_id.clone());
                // Stand down members who hold no other role.
                let remaining = self.roles_for_agent(team_id, &agent_id)?;
                if remaining.is_empty() {
                    let _guard = self.locks.lock(team_id).await;
                    self.store.with_transaction(|tx| {
                        store::update_member_state(tx, &agent_id, MembershipState::OnStandby)?;
                        store::enqueue_event(
                            tx,
                            &team_topic(team_id, "membership", "standby"),
                            &json!({"team_id": team_id, "agent_id": agent_id}),
                        )
                    })?;
                    self.flush_events()?;
                    report.moved_to_standby.push(agent_id);
                }
            }
        }

        {
            let _guard = self.locks.lock(team_id).await;
            self.store
                .with_transaction(|tx| store::update_team_state(tx, team_id, TeamState::Active))?;
        }
        info!(
            team_id,
            from_phase,
            to_phase,
            added = report.added.len(),
            "phase scaling applied"
        );
        Ok(report)
    }

    /// Fill a role from standby members first, then the persona directory.
    async fn fill_role(&self, team_id: &str, role_id: &str, actor: &Actor) -> Result<String> {
        let definition = standard_role(role_id);
        // Prefer an existing standby member with a suitable persona.
        let standby = self
            .store
            .list_members(team_id, Some(MembershipState::OnStandby))?;
        for member in standby {
            let suits = self
                .personas
                .get(&member.persona_id)
                .map(|p| p.suits_role(role_id))
                .unwrap_or(false);
            if suits {
                let _guard = self.locks.lock(team_id).await;
                let agent_id = member.agent_id.clone();
                self.store.with_transaction(|tx| {
                    store::update_member_state(tx, &agent_id, MembershipState::Active)?;
                    store::set_role_agent(
                        tx,
                        team_id,
                        role_id,
                        Some(&agent_id),
                        &actor.agent_id,
                        "phase scaling (from standby)",
                    )?;
                    store::enqueue_event(
                        tx,
                        &team_topic(team_id, "role", "assigned"),
                        &json!({"team_id": team_id, "role_id": role_id, "agent_id": agent_id}),
                    )
                })?;
                self.flush_events()?;
                return Ok(member.agent_id);
            }
        }
        // Otherwise onboard a new member with the first suitable persona.
        let persona_id = definition
            .and_then(|d| d.suitable_personas.first().copied())
            .map(str::to_string)
            .or_else(|| {
                self.personas
                    .for_role(role_id)
                    .first()
                    .map(|p| p.persona_id.clone())
            })
            .ok_or_else(|| TeamError::RoleUnfilled(role_id.to_string()))?;
        let (agent_id, _briefing) = self
            .add_member_with_briefing(team_id, &persona_id, "scaling", Some(role_id), actor, None)
            .await?;
        Ok(agent_id)
    }

    // ---- role binding ----

    pub async fn assign_agent_to_role(
        &self,
        team_id: &str,
        role_id: &str,
        agent_id: &str,
        actor: &Actor,
        reason: &str,
    ) -> Result<Role> {
        self.access
            .check(&actor.agent_id, &actor.role_id, Action::AssignTask)?;
        let _guard = self.locks.lock(team_id).await;
        let member = self.store.get_member(agent_id)?;
        if member.team_id != team_id || member.state != MembershipState::Active {
            return Err(TeamError::RoleUnfilled(format!(
                "agent {agent_id} is not an active member of {team_id}"
            )));
        }
        self.store.with_transaction(|tx| {
            let role = store::get_role(tx, team_id, role_id)?;
            if !role.is_active {
                return Err(CoreError::ConflictingState(format!(
                    "role {role_id} is inactive"
                )));
            }
            store::set_role_agent(tx, team_id, role_id, Some(agent_id), &actor.agent_id, reason)?;
            store::enqueue_event(
                tx,
                &team_topic(team_id, "role", "assigned"),
                &json!({
                    "team_id": team_id,
                    "role_id": role_id,
                    "agent_id": agent_id,
                    "assigned_by": actor.agent_id,
                }),
            )
        })?;
        self.flush_events()?;
        Ok(self.store.get_role(team_id, role_id)?)
    }

    /// Seamless handoff: tasks keep routing to the role, now to the new agent.
    pub async fn reassign_role(
        &self,
        team_id: &str,
        role_id: &str,
        new_agent_id: &str,
        actor: &Actor,
        reason: &str,
    ) -> Result<Role> {
        let current = self.store.get_role(team_id, role_id)?;
        let previous = current.current_agent_id.clone();
        let role = self
            .assign_agent_to_role(team_id, role_id, new_agent_id, actor, reason)
            .await?;
        info!(
            team_id,
            role_id,
            from = previous.as_deref().unwrap_or("-"),
            to = new_agent_id,
            "role reassigned"
        );
        Ok(role)
    }

    pub async fn unassign_role(
        &self,
        team_id: &str,
        role_id: &str,
        actor: &Actor,
        reason: &str,
    ) -> Result<Role> {
        self.access
            .check(&actor.agent_id, &actor.role_id, Action::AssignTask)?;
        let _guard = self.locks.lock(team_id).await;
        self.store.with_transaction(|tx| {
            store::set_role_agent(tx, team_id, role_id, None, &actor.agent_id, reason)?;
            store::enqueue_event(
                tx,
                &team_topic(team_id, "role", "unassigned"),
                &json!({"team_id": team_id, "role_id": role_id}),
            )
        })?;
        self.flush_events()?;
        Ok(self.store.get_role(team_id, role_id)?)
    }

    pub fn agent_for_role(&self, team_id: &str, role_id: &str) -> Result<Option<String>> {
        Ok(self.store.get_role(team_id, role_id)?.current_agent_id)
    }

    pub fn roles_for_agent(&self, team_id: &str, agent_id: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .list_roles(team_id, true)?
            .into_iter()
            .filter(|r| r.current_agent_id.as_deref() == Some(agent_id))
            .map(|r| r.role_id)
            .collect())
    }

    pub fn unfilled_roles(&self, team_id: &str, required_only: bool) -> Result<Vec<Role>> {
        Ok(self
            .store
            .list_roles(team_id, true)?
            .into_iter()
            .filter(|r| r.current_agent_id.is_none() && (!required_only || r.is_required))
            .collect())
    }

    pub fn role_assignment_summary(&self, team_id: &str) -> Result<RoleSummary> {
        let roles = self.store.list_roles(team_id, true)?;
        let filled = roles.iter().filter(|r| r.current_agent_id.is_some()).count();
        let required_unfilled = roles
            .iter()
            .filter(|r| r.is_required && r.current_agent_id.is_none())
            .count();
        Ok(RoleSummary {
            team_id: team_id.to_string(),
            total_roles: roles.len(),
            filled_roles: filled,
            unfilled_roles: roles.len() - filled,
            required_unfilled,
            roles,
        })
    }

    // ---- tasks ----

    pub async fn create_task(
        &self,
        team_id: &str,
        title: &str,
        description: &str,
        required_role: Option<&str>,
        priority: u8,
        dependencies: Vec<String>,
        actor: &Actor,
    ) -> Result<Task> {
        self.create_task_idempotent(
            team_id,
            title,
            description,
            required_role,
            priority,
            dependencies,
            actor,
            None,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_task_idempotent(
        &self,
        team_id: &str,
        title: &str,
        description: &str,
        required_role: Option<&str>,
        priority: u8,
        dependencies: Vec<String>,
        actor: &Actor,
        idempotency_key: Option<&str>,
    ) -> Result<Task> {
        self.access
            .check(&actor.agent_id, &actor.role_id, Action::CreateTask)?;
        if let Some(key) = idempotency_key {
            if let Some(hit) = self
                .store
                .idempotency_lookup(key, self.idempotency_window_secs)?
            {
                return Ok(serde_json::from_value(hit).map_err(CoreError::from)?);
            }
        }
        let _guard = self.locks.lock(team_id).await;
        for dep in &dependencies {
            self.store.get_task(dep)?;
        }
        let deps_done = dependencies
            .iter()
            .all(|dep| matches!(self.store.get_task(dep).map(|t| t.status), Ok(TaskStatus::Completed)));
        let task = Task {
            id: ids::task_id(),
            team_id: team_id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            status: if deps_done {
                TaskStatus::Ready
            } else {
                TaskStatus::Blocked
            },
            required_role: required_role.map(str::to_string),
            priority,
            dependencies,
            created_by: actor.agent_id.clone(),
            assigned_to: None,
        };
        self.store.with_transaction(|tx| {
            store::insert_task(tx, &task)?;
            store::enqueue_event(
                tx,
                &team_topic(team_id, "task", "created"),
                &json!({"team_id": team_id, "task_id": task.id, "required_role": task.required_role}),
            )
        })?;
        self.flush_events()?;
        if let Some(key) = idempotency_key {
            self.store
                .idempotency_store(key, &serde_json::to_value(&task).map_err(CoreError::from)?)?;
        }
        Ok(task)
    }

    /// Route a ready task to the agent currently filling its required role.
    /// Resolution happens here, at dispatch time, never earlier.
    pub async fn dispatch_task(&self, task_id: &str) -> Result<(Task, String)> {
        let mut task = self.store.get_task(task_id)?;
        if task.status != TaskStatus::Ready {
            return Err(CoreError::ConflictingState(format!(
                "task {task_id} is {} not ready",
                task.status.name()
            ))
            .into());
        }
        let agent_id = match &task.required_role {
            Some(role) => self
                .agent_for_role(&task.team_id, role)?
                .ok_or_else(|| TeamError::RoleUnfilled(role.clone()))?,
            None => task
                .assigned_to
                .clone()
                .ok_or_else(|| CoreError::Validation(format!("task {task_id} has no route")))?,
        };
        let _guard = self.locks.lock(&task.team_id).await;
        task.status = TaskStatus::Running;
        task.assigned_to = Some(agent_id.clone());
        self.store.with_transaction(|tx| {
            store::update_task(tx, &task)?;
            store::enqueue_event(
                tx,
                &team_topic(&task.team_id, "task", "dispatched"),
                &json!({"task_id": task.id, "agent_id": agent_id}),
            )
        })?;
        self.flush_events()?;
        Ok((task, agent_id))
    }

    pub async fn complete_task(&self, task_id: &str, duration_hours: Option<f64>) -> Result<()> {
        self.finish_task(task_id, TaskStatus::Completed, duration_hours)
            .await
    }

    pub async fn fail_task(&self, task_id: &str) -> Result<()> {
        self.finish_task(task_id, TaskStatus::Failed, None).await
    }

    async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        duration_hours: Option<f64>,
    ) -> Result<()> {
        let mut task = self.store.get_task(task_id)?;
        if task.status != TaskStatus::Running {
            return Err(CoreError::ConflictingState(format!(
                "task {task_id} is {} not running",
                task.status.name()
            ))
            .into());
        }
        let team_id = task.team_id.clone();
        let _guard = self.locks.lock(&team_id).await;
        task.status = status;
        let action = status.name().to_string();
        self.store.with_transaction(|tx| {
            store::update_task(tx, &task)?;
            // Dependents whose dependencies are now all complete become ready.
            if status == TaskStatus::Completed {
                for mut blocked in store::list_tasks(tx, &team_id, Some(TaskStatus::Blocked))? {
                    let all_done = blocked.dependencies.iter().all(|dep| {
                        store::get_task(tx, dep)
                            .map(|t| t.status == TaskStatus::Completed)
                            .unwrap_or(false)
                    });
                    if all_done {
                        blocked.status = TaskStatus::Ready;
                        store::update_task(tx, &blocked)?;
                        store::enqueue_event(
                            tx,
                            &team_topic(&team_id, "task", "ready"),
                            &json!({"task_id": blocked.id}),
                        )?;
                    }
                }
            }
            store::enqueue_event(
                tx,
                &team_topic(&team_id, "task", &action),
                &json!({"task_id": task.id, "agent_id": task.assigned_to}),
            )
        })?;
        self.flush_events()?;

        if let Some(agent_id) = task.assigned_to.clone() {
            self.record_task_outcome(&agent_id, status, duration_hours)?;
        }
        Ok(())
    }

    fn record_task_outcome(
        &self,
        agent_id: &str,
        status: TaskStatus,
        duration_hours: Option<f64>,
    ) -> Result<()> {
        let member = self.store.get_member(agent_id)?;
        let mut perf: PerformanceSummary = member.performance;
        perf.total_tasks += 1;
        match status {
            TaskStatus::Completed => perf.completed_tasks += 1,
            TaskStatus::Failed => perf.failed_tasks += 1,
            _ => {}
        }
        if let Some(hours) = duration_hours {
            let prior = perf.average_task_duration_hours.unwrap_or(hours);
            let done = perf.completed_tasks.max(1) as f64;
            perf.average_task_duration_hours = Some(prior + (hours - prior) / done);
        }
        self.store.update_member_performance(agent_id, &perf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness() -> (TeamManager, Arc<StateStore>, Arc<EventBus>) {
        let store = Arc::new(StateStore::in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        let access = Arc::new(AccessController::standard());
        let manager = TeamManager::new(Arc::clone(&store), Arc::clone(&bus), access).unwrap();
        (manager, store, bus)
    }

    async fn team_with_roles(manager: &TeamManager) -> String {
        let team = manager
            .create_team("checkout", "web_service", None)
            .await
            .unwrap();
        manager.initialize_standard_roles(&team.id).await.unwrap();
        team.id
    }

    #[tokio::test]
    async fn add_member_binds_role_and_briefs() {
        let (manager, store, bus) = harness();
        let mut events = bus.subscribe("team:*:events:membership.*");
        let team_id = team_with_roles(&manager).await;
        let (agent_id, briefing) = manager
            .add_member_with_briefing(
                &team_id,
                "security_specialist",
                "testing",
                Some("Security Auditor"),
                &Actor::system(),
                None,
            )
            .await
            .unwrap();

        let member = store.get_member(&agent_id).unwrap();
        assert_eq!(member.state, MembershipState::Active);
        let role = store.get_role(&team_id, "Security Auditor").unwrap();
        assert_eq!(role.current_agent_id.as_deref(), Some(agent_id.as_str()));
        assert_eq!(briefing.current_phase, "testing");
        assert!(briefing
            .role_assignments
            .iter()
            .any(|(r, a)| r == "Security Auditor" && a.as_deref() == Some(agent_id.as_str())));
        let event = events.try_recv().expect("membership event");
        assert_eq!(event.action(), "membership.added");
    }

    #[tokio::test]
    async fn add_member_is_idempotent_under_same_key() {
        let (manager, store, _bus) = harness();
        let team_id = team_with_roles(&manager).await;
        let first = manager
            .add_member_with_briefing(
                &team_id,
                "qa_engineer",
                "testing",
                Some("QA Lead"),
                &Actor::system(),
                Some("add-qa-1"),
            )
            .await
            .unwrap();
        let second = manager
            .add_member_with_briefing(
                &team_id,
                "qa_engineer",
                "testing",
                Some("QA Lead"),
                &Actor::system(),
                Some("add-qa-1"),
            )
            .await
            .unwrap();
        assert_eq!(first.0, second.0);
        assert_eq!(store.list_members(&team_id, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reassignment_preserves_task_routing() {
        let (manager, _store, _bus) = harness();
        let team_id = team_with_roles(&manager).await;
        let actor = Actor::system();
        let (agent_a, _) = manager
            .add_member_with_briefing(
                &team_id,
                "security_specialist",
                "testing",
                Some("Security Auditor"),
                &actor,
                None,
            )
            .await
            .unwrap();
        let task = manager
            .create_task(
                &team_id,
                "audit auth flow",
                "review token handling",
                Some("Security Auditor"),
                8,
                Vec::new(),
                &actor,
            )
            .await
            .unwrap();

        // Bring in a replacement and hand the role over.
        let (agent_b, _) = manager
            .add_member_with_briefing(&team_id, "security_specialist", "testing", None, &actor, None)
            .await
            .unwrap();
        let role_before = manager
            .role_assignment_summary(&team_id)
            .unwrap()
            .roles
            .into_iter()
            .find(|r| r.role_id == "Security Auditor")
            .unwrap();
        manager
            .reassign_role(&team_id, "Security Auditor", &agent_b, &actor, "handoff")
            .await
            .unwrap();

        let (dispatched, routed_to) = manager.dispatch_task(&task.id).await.unwrap();
        assert_eq!(routed_to, agent_b);
        assert_eq!(dispatched.required_role.as_deref(), Some("Security Auditor"));

        let role_after = manager
            .role_assignment_summary(&team_id)
            .unwrap()
            .roles
            .into_iter()
            .find(|r| r.role_id == "Security Auditor")
            .unwrap();
        assert_eq!(
            role_after.assignment_history.len(),
            role_before.assignment_history.len() + 1
        );
        let last = role_after.assignment_history.last().unwrap();
        assert_eq!(last.from_agent.as_deref(), Some(agent_a.as_str()));
        assert_eq!(last.to_agent.as_deref(), Some(agent_b.as_str()));
    }

    #[tokio::test]
    async fn retirement_produces_handoff_and_reassigns() {
        let (manager, store, _bus) = harness();
        let team_id = team_with_roles(&manager).await;
        let actor = Actor::system();
        let (agent_a, _) = manager
            .add_member_with_briefing(
                &team_id,
                "backend_developer",
                "implementation",
                Some("Backend Lead"),
                &actor,
                None,
            )
            .await
            .unwrap();
        let (agent_b, _) = manager
            .add_member_with_briefing(
                &team_id,
                "backend_developer",
                "implementation",
                None,
                &actor,
                None,
            )
            .await
            .unwrap();

        let handoff = manager
            .retire_member_with_handoff(&team_id, &agent_a, Some(&agent_b), &actor)
            .await
            .unwrap();
        assert_eq!(handoff.roles_released, vec!["Backend Lead".to_string()]);
        assert_eq!(handoff.successor_agent.as_deref(), Some(agent_b.as_str()));

        let retired = store.get_member(&agent_a).unwrap();
        assert_eq!(retired.state, MembershipState::Retired);
        assert!(retired.retired_at.is_some());
        let role = store.get_role(&team_id, "Backend Lead").unwrap();
        assert_eq!(role.current_agent_id.as_deref(), Some(agent_b.as_str()));
    }

    #[tokio::test]
    async fn dispatch_fails_when_role_unfilled() {
        let (manager, _store, _bus) = harness();
        let team_id = team_with_roles(&manager).await;
        let task = manager
            .create_task(
                &team_id,
                "design schema",
                "",
                Some("DBA Specialist"),
                5,
                Vec::new(),
                &Actor::system(),
            )
            .await
            .unwrap();
        let err = manager.dispatch_task(&task.id).await.unwrap_err();
        assert!(matches!(err, TeamError::RoleUnfilled(_)));
    }

    #[tokio::test]
    async fn completing_dependency_unblocks_dependents() {
        let (manager, store, _bus) = harness();
        let team_id = team_with_roles(&manager).await;
        let actor = Actor::system();
        manager
            .add_member_with_briefing(
                &team_id,
                "backend_developer",
                "implementation",
                Some("Backend Lead"),
                &actor,
                None,
            )
            .await
            .unwrap();
        let first = manager
            .create_task(&team_id, "models", "", Some("Backend Lead"), 5, Vec::new(), &actor)
            .await
            .unwrap();
        let second = manager
            .create_task(
                &team_id,
                "api",
                "",
                Some("Backend Lead"),
                5,
                vec![first.id.clone()],
                &actor,
            )
            .await
            .unwrap();
        assert_eq!(second.status, TaskStatus::Blocked);

        manager.dispatch_task(&first.id).await.unwrap();
        manager.complete_task(&first.id, Some(2.0)).await.unwrap();

        let unblocked = store.get_task(&second.id).unwrap();
        assert_eq!(unblocked.status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn scaling_fills_required_roles_for_phase() {
        let (manager, store, _bus) = harness();
        let team_id = team_with_roles(&manager).await;
        let report = manager
            .scale_for_phase_transition(&team_id, "design", "deployment", &Actor::system())
            .await
            .unwrap();
        assert!(report
            .added
            .iter()
            .any(|(role, _)| role == "DevOps Engineer"));
        assert!(report
            .added
            .iter()
            .any(|(role, _)| role == "Deployment Specialist"));
        let devops = store.get_role(&team_id, "DevOps Engineer").unwrap();
        assert!(devops.current_agent_id.is_some());
    }

    #[tokio::test]
    async fn access_control_gates_membership_changes() {
        let (manager, _store, _bus) = harness();
        let team_id = team_with_roles(&manager).await;
        let unauthorized = Actor::new("agent_x", "QA Lead");
        let err = manager
            .add_member_with_briefing(&team_id, "qa_engineer", "testing", None, &unauthorized, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TeamError::Core(CoreError::Forbidden { .. })));
        assert!(manager.store.list_members(&team_id, None).unwrap().is_empty());
    }
}
