//! Error taxonomy shared by every Ensemble crate.

use serde::{Deserialize, Serialize};

/// Errors surfaced by the core substrate.
///
/// Callers branch on the variant, never on message text. `Transient` and
/// `StorageUnavailable` are the only categories the self-healing loop is
/// allowed to retry on its own.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflicting state: {0}")]
    ConflictingState(String),
    #[error("forbidden: agent '{agent}' in role '{role}' may not perform '{action}'")]
    Forbidden {
        agent: String,
        role: String,
        action: String,
    },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("blocked by validation gate: {0}")]
    GateBlocked(String),
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },
}

impl CoreError {
    /// Whether a caller-side retry loop may re-attempt this failure.
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            CoreError::StorageUnavailable(_) | CoreError::Transient(_)
        )
    }

    /// Short machine-readable category used on event payloads and the CLI.
    pub fn category(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::NotFound(_) => "not_found",
            CoreError::ConflictingState(_) => "conflicting_state",
            CoreError::Forbidden { .. } => "forbidden",
            CoreError::StorageUnavailable(_) => "storage_unavailable",
            CoreError::Transient(_) => "transient",
            CoreError::Permanent(_) => "permanent",
            CoreError::GateBlocked(_) => "gate_blocked",
            CoreError::Cancelled { .. } => "cancelled",
        }
    }

    /// Structured, user-visible form of this failure.
    pub fn report(&self) -> FailureReport {
        let suggested_actions = match self {
            CoreError::Validation(_) => vec!["fix the request and resubmit".to_string()],
            CoreError::NotFound(_) => vec!["check the identifier".to_string()],
            CoreError::ConflictingState(_) => {
                vec!["refresh state and retry the transition".to_string()]
            }
            CoreError::Forbidden { .. } => vec!["request access or escalate".to_string()],
            CoreError::StorageUnavailable(_) | CoreError::Transient(_) => {
                vec!["retry with backoff".to_string()]
            }
            CoreError::Permanent(_) => vec!["escalate for manual intervention".to_string()],
            CoreError::GateBlocked(_) => {
                vec!["address the blocking validation findings".to_string()]
            }
            CoreError::Cancelled { .. } => vec!["restart the operation if still needed".to_string()],
        };
        FailureReport {
            category: self.category().to_string(),
            message: self.to_string(),
            evidence_refs: Vec::new(),
            suggested_actions,
            retriable: self.retriable(),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => CoreError::NotFound("row".to_string()),
            other => CoreError::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Validation(format!("serialization: {err}"))
    }
}

/// Structured failure handed to user-visible surfaces (CLI, events).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub category: String,
    pub message: String,
    pub evidence_refs: Vec<String>,
    pub suggested_actions: Vec<String>,
    pub retriable: bool,
}

pub type Result<T> = std::result::Result<T, CoreError>;
