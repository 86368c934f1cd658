//! On-disk workflow artifacts.
//!
//! Artifacts produced during a run are grouped under the workflow working
//! directory: `contracts/`, `convergences/`, `validation/`, `history/`. Every
//! file is self-describing JSON carrying a `schema_version`.

use std::fs;
use std::path::{Path, PathBuf};

use ensemble_core::CoreError;
use serde::Serialize;
use serde_json::{json, Value};

use crate::Result;

const SCHEMA_VERSION: u32 = 1;

const CONTRACTS_DIR: &str = "contracts";
const CONVERGENCES_DIR: &str = "convergences";
const VALIDATION_DIR: &str = "validation";
const HISTORY_DIR: &str = "history";

/// Writer for a single workflow's working directory.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(workflow_dir: impl AsRef<Path>) -> Result<Self> {
        let root = workflow_dir.as_ref().to_path_buf();
        for dir in [CONTRACTS_DIR, CONVERGENCES_DIR, VALIDATION_DIR, HISTORY_DIR] {
            fs::create_dir_all(root.join(dir))
                .map_err(|err| CoreError::StorageUnavailable(format!("artifact dir: {err}")))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write(&self, dir: &str, name: &str, kind: &str, body: Value) -> Result<PathBuf> {
        let path = self.root.join(dir).join(format!("{name}.json"));
        let document = json!({
            "schema_version": SCHEMA_VERSION,
            "kind": kind,
            "written_at": ensemble_core::ids::now_iso(),
            "body": body,
        });
        let raw = serde_json::to_string_pretty(&document).map_err(CoreError::from)?;
        fs::write(&path, raw)
            .map_err(|err| CoreError::StorageUnavailable(format!("artifact write: {err}")))?;
        Ok(path)
    }

    pub fn write_contract<T: Serialize>(&self, name: &str, contract: &T) -> Result<PathBuf> {
        self.write(
            CONTRACTS_DIR,
            name,
            "contract",
            serde_json::to_value(contract).map_err(CoreError::from)?,
        )
    }

    pub fn write_convergence<T: Serialize>(&self, name: &str, session: &T) -> Result<PathBuf> {
        self.write(
            CONVERGENCES_DIR,
            name,
            "convergence_session",
            serde_json::to_value(session).map_err(CoreError::from)?,
        )
    }

    pub fn write_verdict<T: Serialize>(&self, name: &str, verdict: &T) -> Result<PathBuf> {
        self.write(
            VALIDATION_DIR,
            name,
            "trimodal_verdict",
            serde_json::to_value(verdict).map_err(CoreError::from)?,
        )
    }

    pub fn write_recovery<T: Serialize>(&self, name: &str, recovery: &T) -> Result<PathBuf> {
        self.write(
            VALIDATION_DIR,
            &format!("{name}_recovery"),
            "recovery_context",
            serde_json::to_value(recovery).map_err(CoreError::from)?,
        )
    }

    pub fn write_history<T: Serialize>(&self, name: &str, record: &T) -> Result<PathBuf> {
        self.write(
            HISTORY_DIR,
            name,
            "execution_history",
            serde_json::to_value(record).map_err(CoreError::from)?,
        )
    }
}
