//! Durable relational state over SQLite.
//!
//! One table per entity, `created_at`/`updated_at` on every row, opaque string
//! primary keys. Mutations that touch several entities run inside a single
//! transaction via [`StateStore::with_transaction`]; events produced by a
//! mutation go through the `events_outbox` table in the same transaction and
//! only become observable after commit.
//!
//! Row-level operations are free functions over `&Connection` so they compose
//! inside transactions (`rusqlite::Transaction` derefs to `Connection`).

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::ids::now_iso;
use crate::model::{
    AssignmentRecord, Assumption, AssumptionStatus, AttemptOutcome, Conflict, ConflictStatus,
    Contract, ContractStatus, ConvergenceSession, ConvergenceStatus, ExecutionAttempt,
    MembershipState, PerformanceSummary, Role, Task, TaskStatus, Team, TeamMember, TeamState,
    WorkflowDag, WorkflowStatus,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS teams (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    project_type TEXT NOT NULL,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS members (
    agent_id TEXT PRIMARY KEY,
    persona_id TEXT NOT NULL,
    team_id TEXT NOT NULL,
    state TEXT NOT NULL,
    joined_at TEXT NOT NULL,
    retired_at TEXT,
    performance TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_members_team ON members(team_id);

CREATE TABLE IF NOT EXISTS roles (
    team_id TEXT NOT NULL,
    role_id TEXT NOT NULL,
    description TEXT NOT NULL,
    is_required INTEGER NOT NULL,
    priority INTEGER NOT NULL,
    is_active INTEGER NOT NULL,
    current_agent_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (team_id, role_id)
);

CREATE TABLE IF NOT EXISTS assignment_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id TEXT NOT NULL,
    role_id TEXT NOT NULL,
    from_agent TEXT,
    to_agent TEXT,
    assigned_by TEXT NOT NULL,
    reason TEXT NOT NULL,
    at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_assignment_role ON assignment_history(team_id, role_id);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    team_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    status TEXT NOT NULL,
    required_role TEXT,
    priority INTEGER NOT NULL,
    dependencies TEXT NOT NULL,
    created_by TEXT NOT NULL,
    assigned_to TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_team_status ON tasks(team_id, status);

CREATE TABLE IF NOT EXISTS contracts (
    id TEXT PRIMARY KEY,
    team_id TEXT NOT NULL,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    status TEXT NOT NULL,
    specification TEXT NOT NULL,
    owner_role TEXT NOT NULL,
    owner_agent TEXT NOT NULL,
    consumers TEXT NOT NULL,
    previous_version_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_contracts_team_name ON contracts(team_id, name);

CREATE TABLE IF NOT EXISTS assumptions (
    id TEXT PRIMARY KEY,
    team_id TEXT NOT NULL,
    made_by_agent TEXT NOT NULL,
    made_by_role TEXT NOT NULL,
    body TEXT NOT NULL,
    category TEXT NOT NULL,
    status TEXT NOT NULL,
    related_artifact TEXT,
    dependent_artifacts TEXT NOT NULL,
    validated_at TEXT,
    invalidated_at TEXT,
    invalidation_notes TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_assumptions_team ON assumptions(team_id);

CREATE TABLE IF NOT EXISTS conflicts (
    id TEXT PRIMARY KEY,
    team_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    severity TEXT NOT NULL,
    description TEXT NOT NULL,
    affected_agents TEXT NOT NULL,
    source_refs TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conflicts_team_status ON conflicts(team_id, status);

CREATE TABLE IF NOT EXISTS convergence_sessions (
    id TEXT PRIMARY KEY,
    team_id TEXT NOT NULL,
    trigger_type TEXT NOT NULL,
    description TEXT NOT NULL,
    participants TEXT NOT NULL,
    conflict_ids TEXT NOT NULL,
    decisions TEXT NOT NULL,
    artifacts_updated TEXT NOT NULL,
    rework_hours_actual REAL NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_convergence_team ON convergence_sessions(team_id, status);

CREATE TABLE IF NOT EXISTS workflows (
    id TEXT PRIMARY KEY,
    team_id TEXT NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    nodes TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_workflows_team ON workflows(team_id);

CREATE TABLE IF NOT EXISTS execution_attempts (
    id TEXT PRIMARY KEY,
    workflow_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    attempt_number INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    outcome TEXT NOT NULL,
    error_classification TEXT,
    evidence_refs TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attempts_node ON execution_attempts(workflow_id, node_id);

CREATE TABLE IF NOT EXISTS verdicts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id TEXT NOT NULL,
    workflow_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_verdicts_workflow ON verdicts(workflow_id);

CREATE TABLE IF NOT EXISTS events_outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    topic TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS idempotency_keys (
    key TEXT PRIMARY KEY,
    result TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

fn enum_to_str<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        Value::String(s) => Ok(s),
        other => Err(CoreError::Validation(format!(
            "expected string-serialized enum, got {other}"
        ))),
    }
}

fn enum_from_str<T: DeserializeOwned>(s: &str) -> Result<T> {
    Ok(serde_json::from_value(Value::String(s.to_string()))?)
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(s: &str) -> Result<T> {
    Ok(serde_json::from_str(s)?)
}

/// Handle over the SQLite database. Cheap to share behind an `Arc`; the inner
/// connection is serialized by a mutex, which also gives list/query calls a
/// consistent snapshot per call.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Fresh in-memory store, used by tests and disposable harnesses.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside a single transaction. Any error rolls back.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run `f` against the live connection outside a transaction.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    // ---- teams ----

    pub fn insert_team(&self, team: &Team) -> Result<()> {
        self.with_transaction(|tx| insert_team(tx, team))
    }

    pub fn get_team(&self, id: &str) -> Result<Team> {
        self.read(|conn| get_team(conn, id))
    }

    pub fn update_team_state(&self, id: &str, state: TeamState) -> Result<()> {
        self.with_transaction(|tx| update_team_state(tx, id, state))
    }

    // ---- members ----

    pub fn get_member(&self, agent_id: &str) -> Result<TeamMember> {
        self.read(|conn| get_member(conn, agent_id))
    }

    pub fn list_members(
        &self,
        team_id: &str,
        state: Option<MembershipState>,
    ) -> Result<Vec<TeamMember>> {
        self.read(|conn| list_members(conn, team_id, state))
    }

    pub fn update_member_performance(
        &self,
        agent_id: &str,
        performance: &PerformanceSummary,
    ) -> Result<()> {
        self.with_transaction(|tx| {
            let n = tx.execute(
                "UPDATE members SET performance = ?1, updated_at = ?2 WHERE agent_id = ?3",
                params![to_json(performance)?, now_iso(), agent_id],
            )?;
            if n == 0 {
                return Err(CoreError::NotFound(format!("member {agent_id}")));
            }
            Ok(())
        })
    }

    // ---- roles ----

    pub fn get_role(&self, team_id: &str, role_id: &str) -> Result<Role> {
        self.read(|conn| get_role(conn, team_id, role_id))
    }

    pub fn list_roles(&self, team_id: &str, active_only: bool) -> Result<Vec<Role>> {
        self.read(|conn| list_roles(conn, team_id, active_only))
    }

    // ---- tasks ----

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.read(|conn| get_task(conn, id))
    }

    pub fn list_tasks(&self, team_id: &str, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        self.read(|conn| list_tasks(conn, team_id, status))
    }

    // ---- contracts ----

    pub fn get_contract(&self, id: &str) -> Result<Contract> {
        self.read(|conn| get_contract(conn, id))
    }

    pub fn active_contract(&self, team_id: &str, name: &str) -> Result<Option<Contract>> {
        self.read(|conn| active_contract(conn, team_id, name))
    }

    pub fn list_contracts(&self, team_id: &str) -> Result<Vec<Contract>> {
        self.read(|conn| list_contracts(conn, team_id))
    }

    // ---- assumptions ----

    pub fn get_assumption(&self, id: &str) -> Result<Assumption> {
        self.read(|conn| get_assumption(conn, id))
    }

    pub fn list_assumptions(&self, team_id: &str) -> Result<Vec<Assumption>> {
        self.read(|conn| list_assumptions(conn, team_id))
    }

    // ---- conflicts ----

    pub fn get_conflict(&self, id: &str) -> Result<Conflict> {
        self.read(|conn| get_conflict(conn, id))
    }

    pub fn list_conflicts(
        &self,
        team_id: &str,
        status: Option<ConflictStatus>,
    ) -> Result<Vec<Conflict>> {
        self.read(|conn| list_conflicts(conn, team_id, status))
    }

    // ---- convergence ----

    pub fn get_convergence(&self, id: &str) -> Result<ConvergenceSession> {
        self.read(|conn| get_convergence(conn, id))
    }

    pub fn list_convergences(&self, team_id: &str) -> Result<Vec<ConvergenceSession>> {
        self.read(|conn| list_convergences(conn, team_id))
    }

    pub fn open_convergence(&self, team_id: &str) -> Result<Option<ConvergenceSession>> {
        self.read(|conn| {
            let mut sessions = list_convergences(conn, team_id)?;
            sessions.retain(|s| s.status == ConvergenceStatus::Open);
            Ok(sessions.into_iter().next())
        })
    }

    // ---- workflows ----

    pub fn upsert_workflow(&self, dag: &WorkflowDag) -> Result<()> {
        self.with_transaction(|tx| upsert_workflow(tx, dag))
    }

    pub fn get_workflow(&self, id: &str) -> Result<WorkflowDag> {
        self.read(|conn| get_workflow(conn, id))
    }

    pub fn insert_attempt(&self, attempt: &ExecutionAttempt) -> Result<()> {
        self.with_transaction(|tx| insert_attempt(tx, attempt))
    }

    pub fn attempts_for_node(
        &self,
        workflow_id: &str,
        node_id: &str,
    ) -> Result<Vec<ExecutionAttempt>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, workflow_id, node_id, attempt_number, started_at, ended_at, outcome,
                        error_classification, evidence_refs
                 FROM execution_attempts WHERE workflow_id = ?1 AND node_id = ?2
                 ORDER BY attempt_number",
            )?;
            let rows = stmt.query_map(params![workflow_id, node_id], attempt_from_row)?;
            collect(rows)
        })
    }

    // ---- verdicts ----

    pub fn insert_verdict(&self, team_id: &str, workflow_id: &str, payload: &Value) -> Result<()> {
        self.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO verdicts (team_id, workflow_id, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![team_id, workflow_id, to_json(payload)?, now_iso()],
            )?;
            Ok(())
        })
    }

    pub fn latest_verdict(&self, workflow_id: &str) -> Result<Option<Value>> {
        self.read(|conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM verdicts WHERE workflow_id = ?1
                     ORDER BY id DESC LIMIT 1",
                    params![workflow_id],
                    |row| row.get(0),
                )
                .optional()?;
            payload.map(|p| from_json(&p)).transpose()
        })
    }

    // ---- outbox ----

    /// Drain committed outbox rows in commit order.
    pub fn drain_outbox(&self) -> Result<Vec<(String, Value)>> {
        self.with_transaction(|tx| {
            let mut stmt =
                tx.prepare("SELECT id, topic, payload FROM events_outbox ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            let mut drained = Vec::new();
            let mut max_id = 0i64;
            for row in rows {
                let (id, topic, payload) = row?;
                max_id = max_id.max(id);
                drained.push((topic, from_json::<Value>(&payload)?));
            }
            drop(stmt);
            if max_id > 0 {
                tx.execute("DELETE FROM events_outbox WHERE id <= ?1", params![max_id])?;
            }
            Ok(drained)
        })
    }

    // ---- idempotency ----

    /// Fetch a stored result for `key` if one exists inside the window.
    pub fn idempotency_lookup(&self, key: &str, window_secs: i64) -> Result<Option<Value>> {
        self.with_transaction(|tx| {
            let cutoff = (chrono::Utc::now() - chrono::Duration::seconds(window_secs)).to_rfc3339();
            tx.execute(
                "DELETE FROM idempotency_keys WHERE created_at < ?1",
                params![cutoff],
            )?;
            let result: Option<String> = tx
                .query_row(
                    "SELECT result FROM idempotency_keys WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            result.map(|r| from_json(&r)).transpose()
        })
    }

    pub fn idempotency_store(&self, key: &str, result: &Value) -> Result<()> {
        self.with_transaction(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO idempotency_keys (key, result, created_at)
                 VALUES (?1, ?2, ?3)",
                params![key, to_json(result)?, now_iso()],
            )?;
            Ok(())
        })
    }
}

fn collect<T>(
    rows: impl Iterator<Item = std::result::Result<T, rusqlite::Error>>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// ---- row-level operations, composable inside transactions ----

pub fn insert_team(conn: &Connection, team: &Team) -> Result<()> {
    conn.execute(
        "INSERT INTO teams (id, name, project_type, state, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            team.id,
            team.name,
            team.project_type,
            enum_to_str(&team.state)?,
            team.created_at,
            team.updated_at
        ],
    )?;
    Ok(())
}

pub fn get_team(conn: &Connection, id: &str) -> Result<Team> {
    conn.query_row(
        "SELECT id, name, project_type, state, created_at, updated_at FROM teams WHERE id = ?1",
        params![id],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        },
    )
    .optional()?
    .map(|(id, name, project_type, state, created_at, updated_at)| {
        Ok(Team {
            id,
            name,
            project_type,
            state: enum_from_str(&state)?,
            created_at,
            updated_at,
        })
    })
    .unwrap_or_else(|| Err(CoreError::NotFound(format!("team {id}"))))
}

pub fn update_team_state(conn: &Connection, id: &str, state: TeamState) -> Result<()> {
    let n = conn.execute(
        "UPDATE teams SET state = ?1, updated_at = ?2 WHERE id = ?3",
        params![enum_to_str(&state)?, now_iso(), id],
    )?;
    if n == 0 {
        return Err(CoreError::NotFound(format!("team {id}")));
    }
    Ok(())
}

pub fn insert_member(conn: &Connection, member: &TeamMember) -> Result<()> {
    if member.state == MembershipState::Active {
        ensure_no_active_membership(conn, &member.team_id, &member.agent_id)?;
    }
    let now = now_iso();
    conn.execute(
        "INSERT INTO members (agent_id, persona_id, team_id, state, joined_at, retired_at,
                              performance, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            member.agent_id,
            member.persona_id,
            member.team_id,
            enum_to_str(&member.state)?,
            member.joined_at,
            member.retired_at,
            to_json(&member.performance)?,
            now,
            now
        ],
    )?;
    Ok(())
}

fn ensure_no_active_membership(conn: &Connection, team_id: &str, agent_id: &str) -> Result<()> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM members WHERE team_id = ?1 AND agent_id = ?2 AND state = 'active'",
        params![team_id, agent_id],
        |row| row.get(0),
    )?;
    if count > 0 {
        return Err(CoreError::ConflictingState(format!(
            "agent {agent_id} already has an active membership in team {team_id}"
        )));
    }
    Ok(())
}

pub fn update_member_state(
    conn: &Connection,
    agent_id: &str,
    state: MembershipState,
) -> Result<()> {
    let retired_at = if state == MembershipState::Retired {
        Some(now_iso())
    } else {
        None
    };
    let n = conn.execute(
        "UPDATE members SET state = ?1, retired_at = COALESCE(?2, retired_at), updated_at = ?3
         WHERE agent_id = ?4",
        params![enum_to_str(&state)?, retired_at, now_iso(), agent_id],
    )?;
    if n == 0 {
        return Err(CoreError::NotFound(format!("member {agent_id}")));
    }
    Ok(())
}

fn member_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<MemberRow, rusqlite::Error> {
    Ok(MemberRow {
        agent_id: row.get(0)?,
        persona_id: row.get(1)?,
        team_id: row.get(2)?,
        state: row.get(3)?,
        joined_at: row.get(4)?,
        retired_at: row.get(5)?,
        performance: row.get(6)?,
    })
}

struct MemberRow {
    agent_id: String,
    persona_id: String,
    team_id: String,
    state: String,
    joined_at: String,
    retired_at: Option<String>,
    performance: String,
}

impl MemberRow {
    fn into_member(self) -> Result<TeamMember> {
        Ok(TeamMember {
            agent_id: self.agent_id,
            persona_id: self.persona_id,
            team_id: self.team_id,
            state: enum_from_str(&self.state)?,
            joined_at: self.joined_at,
            retired_at: self.retired_at,
            performance: from_json(&self.performance)?,
        })
    }
}

pub fn get_member(conn: &Connection, agent_id: &str) -> Result<TeamMember> {
    let row = conn
        .query_row(
            "SELECT agent_id, persona_id, team_id, state, joined_at, retired_at, performance
             FROM members WHERE agent_id = ?1",
            params![agent_id],
            member_from_row,
        )
        .optional()?;
    row.map(MemberRow::into_member)
        .unwrap_or_else(|| Err(CoreError::NotFound(format!("member {agent_id}"))))
}

pub fn list_members(
    conn: &Connection,
    team_id: &str,
    state: Option<MembershipState>,
) -> Result<Vec<TeamMember>> {
    let mut out = Vec::new();
    match state {
        Some(state) => {
            let mut stmt = conn.prepare(
                "SELECT agent_id, persona_id, team_id, state, joined_at, retired_at, performance
                 FROM members WHERE team_id = ?1 AND state = ?2 ORDER BY joined_at",
            )?;
            let rows = stmt.query_map(params![team_id, enum_to_str(&state)?], member_from_row)?;
            for row in rows {
                out.push(row?.into_member()?);
            }
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT agent_id, persona_id, team_id, state, joined_at, retired_at, performance
                 FROM members WHERE team_id = ?1 ORDER BY joined_at",
            )?;
            let rows = stmt.query_map(params![team_id], member_from_row)?;
            for row in rows {
                out.push(row?.into_member()?);
            }
        }
    }
    Ok(out)
}

pub fn insert_role(conn: &Connection, role: &Role) -> Result<()> {
    let now = now_iso();
    conn.execute(
        "INSERT INTO roles (team_id, role_id, description, is_required, priority, is_active,
                            current_agent_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            role.team_id,
            role.role_id,
            role.description,
            role.is_required as i64,
            role.priority as i64,
            role.is_active as i64,
            role.current_agent_id,
            now,
            now
        ],
    )?;
    Ok(())
}

pub fn get_role(conn: &Connection, team_id: &str, role_id: &str) -> Result<Role> {
    let base = conn
        .query_row(
            "SELECT description, is_required, priority, is_active, current_agent_id
             FROM roles WHERE team_id = ?1 AND role_id = ?2",
            params![team_id, role_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()?;
    let Some((description, is_required, priority, is_active, current_agent_id)) = base else {
        return Err(CoreError::NotFound(format!(
            "role {role_id} in team {team_id}"
        )));
    };
    Ok(Role {
        role_id: role_id.to_string(),
        team_id: team_id.to_string(),
        description,
        is_required: is_required != 0,
        priority: priority as u8,
        is_active: is_active != 0,
        current_agent_id,
        assignment_history: assignment_history(conn, team_id, role_id)?,
    })
}

pub fn list_roles(conn: &Connection, team_id: &str, active_only: bool) -> Result<Vec<Role>> {
    let mut stmt = conn.prepare(
        "SELECT role_id FROM roles WHERE team_id = ?1 AND (is_active = 1 OR ?2 = 0)
         ORDER BY priority DESC, role_id",
    )?;
    let ids = stmt.query_map(params![team_id, active_only as i64], |row| {
        row.get::<_, String>(0)
    })?;
    let ids = collect(ids)?;
    ids.into_iter()
        .map(|role_id| get_role(conn, team_id, &role_id))
        .collect()
}

/// Bind (or unbind with `None`) an agent to a role, appending to the
/// assignment history in the same statement batch. Callers wrap this in a
/// transaction together with membership checks.
pub fn set_role_agent(
    conn: &Connection,
    team_id: &str,
    role_id: &str,
    agent_id: Option<&str>,
    assigned_by: &str,
    reason: &str,
) -> Result<AssignmentRecord> {
    let previous: Option<String> = conn
        .query_row(
            "SELECT current_agent_id FROM roles WHERE team_id = ?1 AND role_id = ?2",
            params![team_id, role_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| CoreError::NotFound(format!("role {role_id} in team {team_id}")))?;
    conn.execute(
        "UPDATE roles SET current_agent_id = ?1, updated_at = ?2
         WHERE team_id = ?3 AND role_id = ?4",
        params![agent_id, now_iso(), team_id, role_id],
    )?;
    let record = AssignmentRecord {
        from_agent: previous,
        to_agent: agent_id.map(str::to_string),
        assigned_by: assigned_by.to_string(),
        reason: reason.to_string(),
        at: now_iso(),
    };
    conn.execute(
        "INSERT INTO assignment_history (team_id, role_id, from_agent, to_agent, assigned_by,
                                         reason, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            team_id,
            role_id,
            record.from_agent,
            record.to_agent,
            record.assigned_by,
            record.reason,
            record.at
        ],
    )?;
    Ok(record)
}

pub fn set_role_active(conn: &Connection, team_id: &str, role_id: &str, active: bool) -> Result<()> {
    let n = conn.execute(
        "UPDATE roles SET is_active = ?1, updated_at = ?2 WHERE team_id = ?3 AND role_id = ?4",
        params![active as i64, now_iso(), team_id, role_id],
    )?;
    if n == 0 {
        return Err(CoreError::NotFound(format!(
            "role {role_id} in team {team_id}"
        )));
    }
    Ok(())
}

pub fn assignment_history(
    conn: &Connection,
    team_id: &str,
    role_id: &str,
) -> Result<Vec<AssignmentRecord>> {
    let mut stmt = conn.prepare(
        "SELECT from_agent, to_agent, assigned_by, reason, at FROM assignment_history
         WHERE team_id = ?1 AND role_id = ?2 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![team_id, role_id], |row| {
        Ok(AssignmentRecord {
            from_agent: row.get(0)?,
            to_agent: row.get(1)?,
            assigned_by: row.get(2)?,
            reason: row.get(3)?,
            at: row.get(4)?,
        })
    })?;
    collect(rows)
}

pub fn insert_task(conn: &Connection, task: &Task) -> Result<()> {
    let now = now_iso();
    conn.execute(
        "INSERT INTO tasks (id, team_id, title, description, status, required_role, priority,
                            dependencies, created_by, assigned_to, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            task.id,
            task.team_id,
            task.title,
            task.description,
            enum_to_str(&task.status)?,
            task.required_role,
            task.priority as i64,
            to_json(&task.dependencies)?,
            task.created_by,
            task.assigned_to,
            now,
            now
        ],
    )?;
    Ok(())
}

fn task_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<TaskRow, rusqlite::Error> {
    Ok(TaskRow {
        id: row.get(0)?,
        team_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        required_role: row.get(5)?,
        priority: row.get(6)?,
        dependencies: row.get(7)?,
        created_by: row.get(8)?,
        assigned_to: row.get(9)?,
    })
}

struct TaskRow {
    id: String,
    team_id: String,
    title: String,
    description: String,
    status: String,
    required_role: Option<String>,
    priority: i64,
    dependencies: String,
    created_by: String,
    assigned_to: Option<String>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: self.id,
            team_id: self.team_id,
            title: self.title,
            description: self.description,
            status: enum_from_str(&self.status)?,
            required_role: self.required_role,
            priority: self.priority as u8,
            dependencies: from_json(&self.dependencies)?,
            created_by: self.created_by,
            assigned_to: self.assigned_to,
        })
    }
}

const TASK_COLUMNS: &str = "id, team_id, title, description, status, required_role, priority,
                            dependencies, created_by, assigned_to";

pub fn get_task(conn: &Connection, id: &str) -> Result<Task> {
    let row = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
            task_from_row,
        )
        .optional()?;
    row.map(TaskRow::into_task)
        .unwrap_or_else(|| Err(CoreError::NotFound(format!("task {id}"))))
}

pub fn list_tasks(
    conn: &Connection,
    team_id: &str,
    status: Option<TaskStatus>,
) -> Result<Vec<Task>> {
    let mut out = Vec::new();
    match status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE team_id = ?1 AND status = ?2
                 ORDER BY priority DESC, created_at"
            ))?;
            let rows = stmt.query_map(params![team_id, enum_to_str(&status)?], task_from_row)?;
            for row in rows {
                out.push(row?.into_task()?);
            }
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE team_id = ?1
                 ORDER BY priority DESC, created_at"
            ))?;
            let rows = stmt.query_map(params![team_id], task_from_row)?;
            for row in rows {
                out.push(row?.into_task()?);
            }
        }
    }
    Ok(out)
}

pub fn update_task(conn: &Connection, task: &Task) -> Result<()> {
    let n = conn.execute(
        "UPDATE tasks SET status = ?1, assigned_to = ?2, updated_at = ?3 WHERE id = ?4",
        params![
            enum_to_str(&task.status)?,
            task.assigned_to,
            now_iso(),
            task.id
        ],
    )?;
    if n == 0 {
        return Err(CoreError::NotFound(format!("task {}", task.id)));
    }
    Ok(())
}

pub fn insert_contract(conn: &Connection, contract: &Contract) -> Result<()> {
    let now = now_iso();
    conn.execute(
        "INSERT INTO contracts (id, team_id, name, version, status, specification, owner_role,
                                owner_agent, consumers, previous_version_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            contract.id,
            contract.team_id,
            contract.name,
            contract.version,
            enum_to_str(&contract.status)?,
            to_json(&contract.specification)?,
            contract.owner_role,
            contract.owner_agent,
            to_json(&contract.consumers)?,
            contract.previous_version_id,
            now,
            now
        ],
    )?;
    Ok(())
}

fn contract_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<ContractRow, rusqlite::Error> {
    Ok(ContractRow {
        id: row.get(0)?,
        team_id: row.get(1)?,
        name: row.get(2)?,
        version: row.get(3)?,
        status: row.get(4)?,
        specification: row.get(5)?,
        owner_role: row.get(6)?,
        owner_agent: row.get(7)?,
        consumers: row.get(8)?,
        previous_version_id: row.get(9)?,
    })
}

struct ContractRow {
    id: String,
    team_id: String,
    name: String,
    version: String,
    status: String,
    specification: String,
    owner_role: String,
    owner_agent: String,
    consumers: String,
    previous_version_id: Option<String>,
}

impl ContractRow {
    fn into_contract(self) -> Result<Contract> {
        Ok(Contract {
            id: self.id,
            team_id: self.team_id,
            name: self.name,
            version: self.version,
            status: enum_from_str(&self.status)?,
            specification: from_json(&self.specification)?,
            owner_role: self.owner_role,
            owner_agent: self.owner_agent,
            consumers: from_json(&self.consumers)?,
            previous_version_id: self.previous_version_id,
        })
    }
}

const CONTRACT_COLUMNS: &str = "id, team_id, name, version, status, specification, owner_role,
                                owner_agent, consumers, previous_version_id";

pub fn get_contract(conn: &Connection, id: &str) -> Result<Contract> {
    let row = conn
        .query_row(
            &format!("SELECT {CONTRACT_COLUMNS} FROM contracts WHERE id = ?1"),
            params![id],
            contract_from_row,
        )
        .optional()?;
    row.map(ContractRow::into_contract)
        .unwrap_or_else(|| Err(CoreError::NotFound(format!("contract {id}"))))
}

pub fn active_contract(conn: &Connection, team_id: &str, name: &str) -> Result<Option<Contract>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {CONTRACT_COLUMNS} FROM contracts
                 WHERE team_id = ?1 AND name = ?2 AND status = 'active'"
            ),
            params![team_id, name],
            contract_from_row,
        )
        .optional()?;
    row.map(ContractRow::into_contract).transpose()
}

pub fn list_contracts(conn: &Connection, team_id: &str) -> Result<Vec<Contract>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONTRACT_COLUMNS} FROM contracts WHERE team_id = ?1 ORDER BY created_at"
    ))?;
    let rows = stmt.query_map(params![team_id], contract_from_row)?;
    let rows = collect(rows)?;
    rows.into_iter().map(ContractRow::into_contract).collect()
}

pub fn set_contract_status(conn: &Connection, id: &str, status: ContractStatus) -> Result<()> {
    let n = conn.execute(
        "UPDATE contracts SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![enum_to_str(&status)?, now_iso(), id],
    )?;
    if n == 0 {
        return Err(CoreError::NotFound(format!("contract {id}")));
    }
    Ok(())
}

pub fn insert_assumption(conn: &Connection, assumption: &Assumption) -> Result<()> {
    let now = now_iso();
    conn.execute(
        "INSERT INTO assumptions (id, team_id, made_by_agent, made_by_role, body, category,
                                  status, related_artifact, dependent_artifacts, validated_at,
                                  invalidated_at, invalidation_notes, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            assumption.id,
            assumption.team_id,
            assumption.made_by_agent,
            assumption.made_by_role,
            assumption.text,
            assumption.category,
            enum_to_str(&assumption.status)?,
            assumption
                .related_artifact
                .as_ref()
                .map(to_json)
                .transpose()?,
            to_json(&assumption.dependent_artifacts)?,
            assumption.validated_at,
            assumption.invalidated_at,
            assumption.invalidation_notes,
            now,
            now
        ],
    )?;
    Ok(())
}

fn assumption_from_row(
    row: &rusqlite::Row<'_>,
) -> std::result::Result<AssumptionRow, rusqlite::Error> {
    Ok(AssumptionRow {
        id: row.get(0)?,
        team_id: row.get(1)?,
        made_by_agent: row.get(2)?,
        made_by_role: row.get(3)?,
        text: row.get(4)?,
        category: row.get(5)?,
        status: row.get(6)?,
        related_artifact: row.get(7)?,
        dependent_artifacts: row.get(8)?,
        validated_at: row.get(9)?,
        invalidated_at: row.get(10)?,
        invalidation_notes: row.get(11)?,
        created_at: row.get(12)?,
    })
}

struct AssumptionRow {
    id: String,
    team_id: String,
    made_by_agent: String,
    made_by_role: String,
    text: String,
    category: String,
    status: String,
    related_artifact: Option<String>,
    dependent_artifacts: String,
    validated_at: Option<String>,
    invalidated_at: Option<String>,
    invalidation_notes: Option<String>,
    created_at: String,
}

impl AssumptionRow {
    fn into_assumption(self) -> Result<Assumption> {
        Ok(Assumption {
            id: self.id,
            team_id: self.team_id,
            made_by_agent: self.made_by_agent,
            made_by_role: self.made_by_role,
            text: self.text,
            category: self.category,
            status: enum_from_str(&self.status)?,
            related_artifact: self.related_artifact.as_deref().map(from_json).transpose()?,
            dependent_artifacts: from_json(&self.dependent_artifacts)?,
            created_at: self.created_at,
            validated_at: self.validated_at,
            invalidated_at: self.invalidated_at,
            invalidation_notes: self.invalidation_notes,
        })
    }
}

const ASSUMPTION_COLUMNS: &str = "id, team_id, made_by_agent, made_by_role, body, category,
                                  status, related_artifact, dependent_artifacts, validated_at,
                                  invalidated_at, invalidation_notes, created_at";

pub fn get_assumption(conn: &Connection, id: &str) -> Result<Assumption> {
    let row = conn
        .query_row(
            &format!("SELECT {ASSUMPTION_COLUMNS} FROM assumptions WHERE id = ?1"),
            params![id],
            assumption_from_row,
        )
        .optional()?;
    row.map(AssumptionRow::into_assumption)
        .unwrap_or_else(|| Err(CoreError::NotFound(format!("assumption {id}"))))
}

pub fn list_assumptions(conn: &Connection, team_id: &str) -> Result<Vec<Assumption>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ASSUMPTION_COLUMNS} FROM assumptions WHERE team_id = ?1 ORDER BY created_at"
    ))?;
    let rows = stmt.query_map(params![team_id], assumption_from_row)?;
    let rows = collect(rows)?;
    rows.into_iter()
        .map(AssumptionRow::into_assumption)
        .collect()
}

pub fn update_assumption_status(
    conn: &Connection,
    id: &str,
    status: AssumptionStatus,
    notes: Option<&str>,
) -> Result<()> {
    let now = now_iso();
    let (validated_at, invalidated_at) = match status {
        AssumptionStatus::Validated => (Some(now.clone()), None),
        AssumptionStatus::Invalidated => (None, Some(now.clone())),
        AssumptionStatus::Tentative => (None, None),
    };
    let n = conn.execute(
        "UPDATE assumptions
         SET status = ?1,
             validated_at = COALESCE(?2, validated_at),
             invalidated_at = COALESCE(?3, invalidated_at),
             invalidation_notes = COALESCE(?4, invalidation_notes),
             updated_at = ?5
         WHERE id = ?6",
        params![
            enum_to_str(&status)?,
            validated_at,
            invalidated_at,
            notes,
            now,
            id
        ],
    )?;
    if n == 0 {
        return Err(CoreError::NotFound(format!("assumption {id}")));
    }
    Ok(())
}

pub fn insert_conflict(conn: &Connection, conflict: &Conflict) -> Result<()> {
    let now = now_iso();
    conn.execute(
        "INSERT INTO conflicts (id, team_id, kind, severity, description, affected_agents,
                                source_refs, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            conflict.id,
            conflict.team_id,
            enum_to_str(&conflict.kind)?,
            enum_to_str(&conflict.severity)?,
            conflict.description,
            to_json(&conflict.affected_agents)?,
            to_json(&conflict.source_refs)?,
            enum_to_str(&conflict.status)?,
            conflict.created_at,
            now
        ],
    )?;
    Ok(())
}

fn conflict_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<ConflictRow, rusqlite::Error> {
    Ok(ConflictRow {
        id: row.get(0)?,
        team_id: row.get(1)?,
        kind: row.get(2)?,
        severity: row.get(3)?,
        description: row.get(4)?,
        affected_agents: row.get(5)?,
        source_refs: row.get(6)?,
        status: row.get(7)?,
        created_at: row.get(8)?,
    })
}

struct ConflictRow {
    id: String,
    team_id: String,
    kind: String,
    severity: String,
    description: String,
    affected_agents: String,
    source_refs: String,
    status: String,
    created_at: String,
}

impl ConflictRow {
    fn into_conflict(self) -> Result<Conflict> {
        Ok(Conflict {
            id: self.id,
            team_id: self.team_id,
            kind: enum_from_str(&self.kind)?,
            severity: enum_from_str(&self.severity)?,
            description: self.description,
            affected_agents: from_json(&self.affected_agents)?,
            source_refs: from_json(&self.source_refs)?,
            status: enum_from_str(&self.status)?,
            created_at: self.created_at,
        })
    }
}

const CONFLICT_COLUMNS: &str = "id, team_id, kind, severity, description, affected_agents,
                                source_refs, status, created_at";

pub fn get_conflict(conn: &Connection, id: &str) -> Result<Conflict> {
    let row = conn
        .query_row(
            &format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?1"),
            params![id],
            conflict_from_row,
        )
        .optional()?;
    row.map(ConflictRow::into_conflict)
        .unwrap_or_else(|| Err(CoreError::NotFound(format!("conflict {id}"))))
}

pub fn list_conflicts(
    conn: &Connection,
    team_id: &str,
    status: Option<ConflictStatus>,
) -> Result<Vec<Conflict>> {
    let mut out = Vec::new();
    match status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE team_id = ?1 AND status = ?2
                 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![team_id, enum_to_str(&status)?], conflict_from_row)?;
            for row in rows {
                out.push(row?.into_conflict()?);
            }
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE team_id = ?1 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![team_id], conflict_from_row)?;
            for row in rows {
                out.push(row?.into_conflict()?);
            }
        }
    }
    Ok(out)
}

pub fn update_conflict_status(conn: &Connection, id: &str, status: ConflictStatus) -> Result<()> {
    let n = conn.execute(
        "UPDATE conflicts SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![enum_to_str(&status)?, now_iso(), id],
    )?;
    if n == 0 {
        return Err(CoreError::NotFound(format!("conflict {id}")));
    }
    Ok(())
}

pub fn insert_convergence(conn: &Connection, session: &ConvergenceSession) -> Result<()> {
    let now = now_iso();
    conn.execute(
        "INSERT INTO convergence_sessions (id, team_id, trigger_type, description, participants,
                                           conflict_ids, decisions, artifacts_updated,
                                           rework_hours_actual, started_at, ended_at, status,
                                           created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            session.id,
            session.team_id,
            session.trigger,
            session.description,
            to_json(&session.participants)?,
            to_json(&session.conflict_ids)?,
            to_json(&session.decisions)?,
            to_json(&session.artifacts_updated)?,
            session.rework_hours_actual,
            session.started_at,
            session.ended_at,
            enum_to_str(&session.status)?,
            now,
            now
        ],
    )?;
    Ok(())
}

pub fn update_convergence(conn: &Connection, session: &ConvergenceSession) -> Result<()> {
    let n = conn.execute(
        "UPDATE convergence_sessions
         SET decisions = ?1, artifacts_updated = ?2, rework_hours_actual = ?3, ended_at = ?4,
             status = ?5, updated_at = ?6
         WHERE id = ?7",
        params![
            to_json(&session.decisions)?,
            to_json(&session.artifacts_updated)?,
            session.rework_hours_actual,
            session.ended_at,
            enum_to_str(&session.status)?,
            now_iso(),
            session.id
        ],
    )?;
    if n == 0 {
        return Err(CoreError::NotFound(format!("convergence {}", session.id)));
    }
    Ok(())
}

fn convergence_from_row(
    row: &rusqlite::Row<'_>,
) -> std::result::Result<ConvergenceRow, rusqlite::Error> {
    Ok(ConvergenceRow {
        id: row.get(0)?,
        team_id: row.get(1)?,
        trigger: row.get(2)?,
        description: row.get(3)?,
        participants: row.get(4)?,
        conflict_ids: row.get(5)?,
        decisions: row.get(6)?,
        artifacts_updated: row.get(7)?,
        rework_hours_actual: row.get(8)?,
        started_at: row.get(9)?,
        ended_at: row.get(10)?,
        status: row.get(11)?,
    })
}

struct ConvergenceRow {
    id: String,
    team_id: String,
    trigger: String,
    description: String,
    participants: String,
    conflict_ids: String,
    decisions: String,
    artifacts_updated: String,
    rework_hours_actual: f64,
    started_at: String,
    ended_at: Option<String>,
    status: String,
}

impl ConvergenceRow {
    fn into_session(self) -> Result<ConvergenceSession> {
        Ok(ConvergenceSession {
            id: self.id,
            team_id: self.team_id,
            trigger: self.trigger,
            description: self.description,
            participants: from_json(&self.participants)?,
            conflict_ids: from_json(&self.conflict_ids)?,
            decisions: from_json(&self.decisions)?,
            artifacts_updated: from_json(&self.artifacts_updated)?,
            rework_hours_actual: self.rework_hours_actual,
            started_at: self.started_at,
            ended_at: self.ended_at,
            status: enum_from_str(&self.status)?,
        })
    }
}

const CONVERGENCE_COLUMNS: &str = "id, team_id, trigger_type, description, participants,
                                   conflict_ids, decisions, artifacts_updated,
                                   rework_hours_actual, started_at, ended_at, status";

pub fn get_convergence(conn: &Connection, id: &str) -> Result<ConvergenceSession> {
    let row = conn
        .query_row(
            &format!("SELECT {CONVERGENCE_COLUMNS} FROM convergence_sessions WHERE id = ?1"),
            params![id],
            convergence_from_row,
        )
        .optional()?;
    row.map(ConvergenceRow::into_session)
        .unwrap_or_else(|| Err(CoreError::NotFound(format!("convergence {id}"))))
}

pub fn list_convergences(conn: &Connection, team_id: &str) -> Result<Vec<ConvergenceSession>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONVERGENCE_COLUMNS} FROM convergence_sessions WHERE team_id = ?1
         ORDER BY started_at"
    ))?;
    let rows = stmt.query_map(params![team_id], convergence_from_row)?;
    let rows = collect(rows)?;
    rows.into_iter().map(ConvergenceRow::into_session).collect()
}

pub fn upsert_workflow(conn: &Connection, dag: &WorkflowDag) -> Result<()> {
    let now = now_iso();
    conn.execute(
        "INSERT INTO workflows (id, team_id, name, status, nodes, started_at, completed_at,
                                created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
         ON CONFLICT(id) DO UPDATE SET
             status = excluded.status,
             nodes = excluded.nodes,
             started_at = excluded.started_at,
             completed_at = excluded.completed_at,
             updated_at = excluded.updated_at",
        params![
            dag.id,
            dag.team_id,
            dag.name,
            enum_to_str(&dag.status)?,
            to_json(&dag.nodes)?,
            dag.started_at,
            dag.completed_at,
            now
        ],
    )?;
    Ok(())
}

pub fn get_workflow(conn: &Connection, id: &str) -> Result<WorkflowDag> {
    let row = conn
        .query_row(
            "SELECT id, team_id, name, status, nodes, started_at, completed_at
             FROM workflows WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()?;
    let Some((id, team_id, name, status, nodes, started_at, completed_at)) = row else {
        return Err(CoreError::NotFound(format!("workflow {id}")));
    };
    Ok(WorkflowDag {
        id,
        team_id,
        name,
        status: enum_from_str::<WorkflowStatus>(&status)?,
        nodes: from_json(&nodes)?,
        started_at,
        completed_at,
    })
}

pub fn insert_attempt(conn: &Connection, attempt: &ExecutionAttempt) -> Result<()> {
    conn.execute(
        "INSERT INTO execution_attempts (id, workflow_id, node_id, attempt_number, started_at,
                                         ended_at, outcome, error_classification, evidence_refs,
                                         created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            attempt.id,
            attempt.workflow_id,
            attempt.node_id,
            attempt.attempt_number as i64,
            attempt.started_at,
            attempt.ended_at,
            enum_to_str(&attempt.outcome)?,
            attempt.error_classification,
            to_json(&attempt.evidence_refs)?,
            now_iso()
        ],
    )?;
    Ok(())
}

fn attempt_from_row(
    row: &rusqlite::Row<'_>,
) -> std::result::Result<ExecutionAttempt, rusqlite::Error> {
    let outcome: String = row.get(6)?;
    let evidence: String = row.get(8)?;
    Ok(ExecutionAttempt {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        node_id: row.get(2)?,
        attempt_number: row.get::<_, i64>(3)? as u32,
        started_at: row.get(4)?,
        ended_at: row.get(5)?,
        outcome: enum_from_str::<AttemptOutcome>(&outcome).unwrap_or(AttemptOutcome::Failure),
        error_classification: row.get(7)?,
        evidence_refs: serde_json::from_str(&evidence).unwrap_or_default(),
    })
}

/// Queue an event inside the caller's transaction; it becomes visible to the
/// bus only after the transaction commits and the outbox is flushed.
pub fn enqueue_event(conn: &Connection, topic: &str, payload: &Value) -> Result<()> {
    conn.execute(
        "INSERT INTO events_outbox (topic, payload, created_at) VALUES (?1, ?2, ?3)",
        params![topic, to_json(payload)?, now_iso()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids;
    use crate::model::ArtifactRef;
    use serde_json::json;

    fn store() -> StateStore {
        StateStore::in_memory().unwrap()
    }

    fn sample_team(store: &StateStore) -> Team {
        let team = Team::new(ids::team_id(), "payments".into(), "web_service".into());
        store.insert_team(&team).unwrap();
        team
    }

    #[test]
    fn team_round_trip_is_identity() {
        let store = store();
        let team = sample_team(&store);
        let loaded = store.get_team(&team.id).unwrap();
        assert_eq!(loaded.name, team.name);
        assert_eq!(loaded.state, TeamState::Forming);
    }

    #[test]
    fn second_active_membership_is_rejected() {
        let store = store();
        let team = sample_team(&store);
        let mut member = TeamMember::pending(
            ids::agent_id("backend_developer"),
            "backend_developer".into(),
            team.id.clone(),
        );
        member.state = MembershipState::Active;
        store
            .with_transaction(|tx| insert_member(tx, &member))
            .unwrap();

        let mut duplicate = member.clone();
        duplicate.joined_at = ids::now_iso();
        let err = store
            .with_transaction(|tx| insert_member(tx, &duplicate))
            .unwrap_err();
        assert!(matches!(err, CoreError::ConflictingState(_)));
    }

    #[test]
    fn role_reassignment_appends_history_atomically() {
        let store = store();
        let team = sample_team(&store);
        let role = Role {
            role_id: "Security Auditor".into(),
            team_id: team.id.clone(),
            description: "Security review".into(),
            is_required: true,
            priority: 9,
            is_active: true,
            current_agent_id: None,
            assignment_history: Vec::new(),
        };
        store.with_transaction(|tx| insert_role(tx, &role)).unwrap();

        store
            .with_transaction(|tx| {
                set_role_agent(tx, &team.id, "Security Auditor", Some("agent_a"), "system", "fill")
            })
            .unwrap();
        store
            .with_transaction(|tx| {
                set_role_agent(
                    tx,
                    &team.id,
                    "Security Auditor",
                    Some("agent_b"),
                    "tech_lead",
                    "handoff",
                )
            })
            .unwrap();

        let loaded = store.get_role(&team.id, "Security Auditor").unwrap();
        assert_eq!(loaded.current_agent_id.as_deref(), Some("agent_b"));
        assert_eq!(loaded.assignment_history.len(), 2);
        let last = loaded.assignment_history.last().unwrap();
        assert_eq!(last.from_agent.as_deref(), Some("agent_a"));
        assert_eq!(last.to_agent.as_deref(), Some("agent_b"));
    }

    #[test]
    fn outbox_events_survive_until_drained_in_order() {
        let store = store();
        store
            .with_transaction(|tx| {
                enqueue_event(tx, "team:t1:events:role.assigned", &json!({"n": 1}))?;
                enqueue_event(tx, "team:t1:events:role.assigned", &json!({"n": 2}))
            })
            .unwrap();

        let drained = store.drain_outbox().unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].1["n"], 1);
        assert_eq!(drained[1].1["n"], 2);
        assert!(store.drain_outbox().unwrap().is_empty());
    }

    #[test]
    fn failed_transaction_rolls_back_all_writes() {
        let store = store();
        let team = sample_team(&store);
        let result: Result<()> = store.with_transaction(|tx| {
            let task = Task {
                id: ids::task_id(),
                team_id: team.id.clone(),
                title: "t".into(),
                description: String::new(),
                status: TaskStatus::Ready,
                required_role: None,
                priority: 5,
                dependencies: Vec::new(),
                created_by: "system".into(),
                assigned_to: None,
            };
            insert_task(tx, &task)?;
            Err(CoreError::Validation("abort".into()))
        });
        assert!(result.is_err());
        assert!(store.list_tasks(&team.id, None).unwrap().is_empty());
    }

    #[test]
    fn assumption_serde_round_trip() {
        let store = store();
        let team = sample_team(&store);
        let mut assumption = Assumption::tentative(
            ids::assumption_id(),
            team.id.clone(),
            "agent_a".into(),
            "Backend Lead".into(),
            "payments api stays v1".into(),
            "api".into(),
        );
        assumption.dependent_artifacts = vec![ArtifactRef::new("code", "payments/client.rs")];
        store
            .with_transaction(|tx| insert_assumption(tx, &assumption))
            .unwrap();
        let loaded = store.get_assumption(&assumption.id).unwrap();
        assert_eq!(loaded.text, assumption.text);
        assert_eq!(loaded.dependent_artifacts, assumption.dependent_artifacts);
        assert_eq!(loaded.status, AssumptionStatus::Tentative);
    }

    #[test]
    fn idempotency_results_are_returned_within_window() {
        let store = store();
        assert!(store.idempotency_lookup("k1", 60).unwrap().is_none());
        store.idempotency_store("k1", &json!({"ok": true})).unwrap();
        let hit = store.idempotency_lookup("k1", 60).unwrap().unwrap();
        assert_eq!(hit["ok"], true);
        // An expired window misses and sweeps the key.
        assert!(store.idempotency_lookup("k1", -1).unwrap().is_none());
    }
}
