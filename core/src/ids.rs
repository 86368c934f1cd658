//! Opaque identifier and timestamp helpers.
//!
//! Identifiers are prefix + UUID so operators can tell entity kinds apart in
//! logs; callers must never parse them.

use chrono::Utc;
use uuid::Uuid;

fn prefixed(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

pub fn team_id() -> String {
    prefixed("team")
}

/// Agent ids embed the persona so a handoff summary reads naturally.
pub fn agent_id(persona_id: &str) -> String {
    format!("{}_{}", persona_id, Uuid::new_v4().simple())
}

pub fn task_id() -> String {
    prefixed("task")
}

pub fn contract_id() -> String {
    prefixed("contract")
}

pub fn assumption_id() -> String {
    prefixed("assumption")
}

pub fn conflict_id() -> String {
    prefixed("conflict")
}

pub fn convergence_id() -> String {
    prefixed("conv")
}

pub fn workflow_id() -> String {
    prefixed("wf")
}

pub fn execution_id() -> String {
    prefixed("exec")
}

pub fn attempt_id() -> String {
    prefixed("attempt")
}

pub fn mvd_id() -> String {
    prefixed("mvd")
}

pub fn stream_id() -> String {
    prefixed("stream")
}

/// Current UTC time as RFC-3339, the on-the-wire timestamp format everywhere.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_prefixed() {
        let a = team_id();
        let b = team_id();
        assert_ne!(a, b);
        assert!(a.starts_with("team_"));
        assert!(agent_id("backend_developer").starts_with("backend_developer_"));
    }
}
