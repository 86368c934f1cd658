//! Role-based access control over state-mutating actions.
//!
//! The capability matrix maps role ids to the set of actions they may take.
//! Every mutating operation in the team, contract and workflow layers calls
//! [`AccessController::check`] before touching the store; denials are traced
//! for the audit log and surfaced as `Forbidden`.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CoreError, Result};

/// Closed set of mutating actions the matrix can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    PostMessage,
    ShareKnowledge,
    CreateTask,
    AssignTask,
    ProposeDecision,
    ActivateContract,
    EvolveContract,
    AddMember,
    RetireMember,
    EscalateApproval,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::PostMessage => "post_message",
            Action::ShareKnowledge => "share_knowledge",
            Action::CreateTask => "create_task",
            Action::AssignTask => "assign_task",
            Action::ProposeDecision => "propose_decision",
            Action::ActivateContract => "activate_contract",
            Action::EvolveContract => "evolve_contract",
            Action::AddMember => "add_member",
            Action::RetireMember => "retire_member",
            Action::EscalateApproval => "escalate_approval",
        }
    }

    pub const ALL: [Action; 10] = [
        Action::PostMessage,
        Action::ShareKnowledge,
        Action::CreateTask,
        Action::AssignTask,
        Action::ProposeDecision,
        Action::ActivateContract,
        Action::EvolveContract,
        Action::AddMember,
        Action::RetireMember,
        Action::EscalateApproval,
    ];
}

/// Serialized form of the matrix, loadable from a config file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccessMatrix {
    /// role id -> allowed actions. A role absent from the map gets the
    /// baseline (collaboration actions only).
    pub grants: HashMap<String, Vec<Action>>,
}

impl AccessMatrix {
    /// Matrix mirroring the standard role set. Leadership roles hold the
    /// structural actions; everyone active holds the collaboration actions.
    pub fn standard() -> Self {
        let mut grants: HashMap<String, Vec<Action>> = HashMap::new();
        grants.insert(
            "Product Owner".into(),
            vec![
                Action::PostMessage,
                Action::ShareKnowledge,
                Action::CreateTask,
                Action::AssignTask,
                Action::ProposeDecision,
                Action::AddMember,
                Action::RetireMember,
                Action::EscalateApproval,
            ],
        );
        grants.insert("Tech Lead".into(), Action::ALL.to_vec());
        grants.insert(
            "Security Auditor".into(),
            vec![
                Action::PostMessage,
                Action::ShareKnowledge,
                Action::ProposeDecision,
                Action::EscalateApproval,
            ],
        );
        for lead in ["Backend Lead", "Frontend Lead", "QA Lead", "DevOps Engineer"] {
            grants.insert(
                lead.into(),
                vec![
                    Action::PostMessage,
                    Action::ShareKnowledge,
                    Action::CreateTask,
                    Action::AssignTask,
                    Action::ProposeDecision,
                    Action::ActivateContract,
                    Action::EvolveContract,
                ],
            );
        }
        Self { grants }
    }

    fn baseline() -> HashSet<Action> {
        [Action::PostMessage, Action::ShareKnowledge]
            .into_iter()
            .collect()
    }
}

pub struct AccessController {
    matrix: RwLock<HashMap<String, HashSet<Action>>>,
}

impl AccessController {
    pub fn new(matrix: AccessMatrix) -> Self {
        Self {
            matrix: RwLock::new(Self::index(matrix)),
        }
    }

    pub fn standard() -> Self {
        Self::new(AccessMatrix::standard())
    }

    /// An all-permissive controller for disposable test harnesses.
    pub fn permissive() -> Self {
        let mut grants = HashMap::new();
        grants.insert("*".to_string(), Action::ALL.to_vec());
        Self::new(AccessMatrix { grants })
    }

    fn index(matrix: AccessMatrix) -> HashMap<String, HashSet<Action>> {
        matrix
            .grants
            .into_iter()
            .map(|(role, actions)| (role, actions.into_iter().collect()))
            .collect()
    }

    /// Swap in a new matrix at runtime.
    pub fn reload(&self, matrix: AccessMatrix) {
        *self.matrix.write().unwrap() = Self::index(matrix);
    }

    pub fn allows(&self, role_id: &str, action: Action) -> bool {
        // Internal orchestrator operations run as the system role.
        if role_id == "system" {
            return true;
        }
        let matrix = self.matrix.read().unwrap();
        if let Some(wildcard) = matrix.get("*") {
            if wildcard.contains(&action) {
                return true;
            }
        }
        match matrix.get(role_id) {
            Some(actions) => actions.contains(&action),
            None => AccessMatrix::baseline().contains(&action),
        }
    }

    /// Gate for mutating operations: returns or fails `Forbidden`.
    pub fn check(&self, agent_id: &str, role_id: &str, action: Action) -> Result<()> {
        if self.allows(role_id, action) {
            return Ok(());
        }
        warn!(
            agent = agent_id,
            role = role_id,
            action = action.name(),
            "access denied"
        );
        Err(CoreError::Forbidden {
            agent: agent_id.to_string(),
            role: role_id.to_string(),
            action: action.name().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_matrix_gates_structural_actions() {
        let access = AccessController::standard();
        assert!(access
            .check("agent_a", "Tech Lead", Action::ActivateContract)
            .is_ok());
        assert!(access
            .check("agent_b", "Security Auditor", Action::ActivateContract)
            .is_err());
        // Unknown roles fall back to collaboration-only.
        assert!(access
            .check("agent_c", "Intern", Action::PostMessage)
            .is_ok());
        assert!(access.check("agent_c", "Intern", Action::AddMember).is_err());
    }

    #[test]
    fn reload_replaces_grants() {
        let access = AccessController::standard();
        let mut grants = HashMap::new();
        grants.insert("Tech Lead".to_string(), vec![Action::PostMessage]);
        access.reload(AccessMatrix { grants });
        assert!(access
            .check("agent_a", "Tech Lead", Action::ActivateContract)
            .is_err());
    }
}
