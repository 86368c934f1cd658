//! Versioned contracts and tracked assumptions.

use serde::{Deserialize, Serialize};

use super::ArtifactRef;
use crate::ids::now_iso;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    #[default]
    Draft,
    Active,
    Deprecated,
}

impl ContractStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ContractStatus::Draft => "draft",
            ContractStatus::Active => "active",
            ContractStatus::Deprecated => "deprecated",
        }
    }
}

/// A named field in a contract specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractField {
    pub name: String,
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
}

/// An endpoint exposed by a contract; the signature string is compared
/// verbatim by the breaking-change detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub signature: String,
}

/// Structured API-like specification body of a contract version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContractSpec {
    #[serde(default)]
    pub fields: Vec<ContractField>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub models: Vec<String>,
}

/// One version of a named contract. At most one `Active` version exists per
/// `(team_id, name)`; activation archives the prior active version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub id: String,
    pub team_id: String,
    pub name: String,
    pub version: String,
    pub status: ContractStatus,
    pub specification: ContractSpec,
    pub owner_role: String,
    pub owner_agent: String,
    #[serde(default)]
    pub consumers: Vec<String>,
    pub previous_version_id: Option<String>,
}

/// Assumption status. Transitions are monotone: once `Invalidated`, an
/// assumption never returns to `Tentative`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssumptionStatus {
    #[default]
    Tentative,
    Validated,
    Invalidated,
}

impl AssumptionStatus {
    pub fn name(&self) -> &'static str {
        match self {
            AssumptionStatus::Tentative => "tentative",
            AssumptionStatus::Validated => "validated",
            AssumptionStatus::Invalidated => "invalidated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assumption {
    pub id: String,
    pub team_id: String,
    pub made_by_agent: String,
    pub made_by_role: String,
    pub text: String,
    pub category: String,
    pub status: AssumptionStatus,
    pub related_artifact: Option<ArtifactRef>,
    #[serde(default)]
    pub dependent_artifacts: Vec<ArtifactRef>,
    pub created_at: String,
    pub validated_at: Option<String>,
    pub invalidated_at: Option<String>,
    pub invalidation_notes: Option<String>,
}

impl Assumption {
    pub fn tentative(
        id: String,
        team_id: String,
        made_by_agent: String,
        made_by_role: String,
        text: String,
        category: String,
    ) -> Self {
        Self {
            id,
            team_id,
            made_by_agent,
            made_by_role,
            text,
            category,
            status: AssumptionStatus::Tentative,
            related_artifact: None,
            dependent_artifacts: Vec::new(),
            created_at: now_iso(),
            validated_at: None,
            invalidated_at: None,
            invalidation_notes: None,
        }
    }
}
