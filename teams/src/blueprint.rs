//! Blueprint scoring for team composition.
//!
//! Four deterministic dimensions: parallelizability match (lookup matrix),
//! expertise coverage (set overlap with partial matches), complexity
//! alignment (distance table) and historical success (pluggable store).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ensemble_core::config::BlueprintWeights;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parallelizability {
    FullyParallel,
    PartiallyParallel,
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
    VeryComplex,
}

impl Complexity {
    fn rank(&self) -> i32 {
        match self {
            Complexity::Simple => 0,
            Complexity::Moderate => 1,
            Complexity::Complex => 2,
            Complexity::VeryComplex => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

/// Classified requirement handed to the composer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequirementClassification {
    pub parallelizability: Parallelizability,
    pub complexity: Complexity,
    pub required_expertise: Vec<String>,
}

/// Template describing a team's execution mode, capabilities and target
/// complexity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blueprint {
    pub id: String,
    pub name: String,
    pub execution_mode: ExecutionMode,
    pub capabilities: Vec<String>,
    pub target_complexity: Complexity,
}

/// Per-dimension score breakdown.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoreBreakdown {
    pub overall: f64,
    pub parallelizability: f64,
    pub expertise_coverage: f64,
    pub complexity_alignment: f64,
    pub historical_success: f64,
}

/// Source of blueprint success history; the execution-history logger
/// implements this in the workflow layer.
pub trait HistoryStore: Send + Sync {
    fn success_rate(&self, blueprint_id: &str) -> Option<f64>;
}

/// Default in-memory history with a neutral-positive baseline and an
/// exponential moving average on recorded executions.
pub struct InMemoryHistoryStore {
    rates: Mutex<HashMap<String, f64>>,
    default_rate: f64,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self {
            rates: Mutex::new(HashMap::new()),
            default_rate: 0.7,
        }
    }

    pub fn record_execution(&self, blueprint_id: &str, success: bool) {
        let mut rates = self.rates.lock().unwrap();
        let current = *rates.get(blueprint_id).unwrap_or(&self.default_rate);
        let alpha = 0.3;
        let observed = if success { 1.0 } else { 0.0 };
        rates.insert(
            blueprint_id.to_string(),
            alpha * observed + (1.0 - alpha) * current,
        );
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn success_rate(&self, blueprint_id: &str) -> Option<f64> {
        Some(
            *self
                .rates
                .lock()
                .unwrap()
                .get(blueprint_id)
                .unwrap_or(&self.default_rate),
        )
    }
}

pub struct BlueprintScorer {
    weights: BlueprintWeights,
    history: Arc<dyn HistoryStore>,
}

impl BlueprintScorer {
    pub fn new(weights: BlueprintWeights, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            weights: weights.normalized(),
            history,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            BlueprintWeights::default(),
            Arc::new(InMemoryHistoryStore::new()),
        )
    }

    pub fn score(
        &self,
        classification: &RequirementClassification,
        blueprint: &Blueprint,
    ) -> f64 {
        self.score_with_breakdown(classification, blueprint).overall
    }

    pub fn score_with_breakdown(
        &self,
        classification: &RequirementClassification,
        blueprint: &Blueprint,
    ) -> ScoreBreakdown {
        let parallelizability =
            parallelizability_score(classification.parallelizability, blueprint.execution_mode);
        let expertise_coverage =
            expertise_coverage(&classification.required_expertise, &blueprint.capabilities);
        let complexity_alignment =
            complexity_alignment(classification.complexity, blueprint.target_complexity);
        let historical_success = self.history.success_rate(&blueprint.id).unwrap_or(0.7);

        let overall = self.weights.parallelizability * parallelizability
            + self.weights.expertise_coverage * expertise_coverage
            + self.weights.complexity_alignment * complexity_alignment
            + self.weights.historical_success * historical_success;

        let breakdown = ScoreBreakdown {
            overall,
            parallelizability,
            expertise_coverage,
            complexity_alignment,
            historical_success,
        };
        debug!(blueprint = blueprint.name, overall, "blueprint scored");
        breakdown
    }

    /// Score every candidate and return them ranked best-first.
    pub fn select_blueprint<'a>(
        &self,
        classification: &RequirementClassification,
        candidates: &'a [Blueprint],
    ) -> Vec<(&'a Blueprint, ScoreBreakdown)> {
        let mut ranked: Vec<(&Blueprint, ScoreBreakdown)> = candidates
            .iter()
            .map(|b| (b, self.score_with_breakdown(classification, b)))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.overall
                .partial_cmp(&a.1.overall)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked
    }
}

/// Parallelizability lookup matrix.
fn parallelizability_score(requirement: Parallelizability, mode: ExecutionMode) -> f64 {
    let parallel = mode == ExecutionMode::Parallel;
    match requirement {
        Parallelizability::FullyParallel => {
            if parallel {
                1.0
            } else {
                0.3
            }
        }
        Parallelizability::PartiallyParallel => {
            if parallel {
                0.8
            } else {
                0.6
            }
        }
        Parallelizability::Sequential => {
            if parallel {
                0.7
            } else {
                1.0
            }
        }
    }
}

/// Fraction of required skills covered by the blueprint, counting substring
/// matches in either direction as partial coverage.
fn expertise_coverage(required: &[String], capabilities: &[String]) -> f64 {
    if required.is_empty() {
        return 0.7;
    }
    if capabilities.is_empty() {
        return 0.5;
    }
    let capabilities: Vec<String> = capabilities.iter().map(|c| c.to_lowercase()).collect();
    let mut matched = 0usize;
    for requirement in required {
        let requirement = requirement.to_lowercase();
        if capabilities
            .iter()
            .any(|cap| cap.contains(&requirement) || requirement.contains(cap.as_str()))
        {
            matched += 1;
        }
    }
    (matched as f64 / required.len() as f64).min(1.0)
}

/// Distance table: exact 1.0, one level 0.7, two 0.4, three+ 0.2.
fn complexity_alignment(requirement: Complexity, target: Complexity) -> f64 {
    match (requirement.rank() - target.rank()).abs() {
        0 => 1.0,
        1 => 0.7,
        2 => 0.4,
        _ => 0.2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classification() -> RequirementClassification {
        RequirementClassification {
            parallelizability: Parallelizability::FullyParallel,
            complexity: Complexity::Complex,
            required_expertise: vec!["backend".into(), "frontend".into(), "security".into()],
        }
    }

    fn blueprint(mode: ExecutionMode, complexity: Complexity, caps: &[&str]) -> Blueprint {
        Blueprint {
            id: format!("bp_{mode:?}_{complexity:?}"),
            name: "candidate".into(),
            execution_mode: mode,
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            target_complexity: complexity,
        }
    }

    #[test]
    fn matrix_rewards_matching_execution_mode() {
        assert_eq!(
            parallelizability_score(Parallelizability::FullyParallel, ExecutionMode::Parallel),
            1.0
        );
        assert_eq!(
            parallelizability_score(Parallelizability::FullyParallel, ExecutionMode::Sequential),
            0.3
        );
        assert_eq!(
            parallelizability_score(Parallelizability::Sequential, ExecutionMode::Parallel),
            0.7
        );
    }

    #[test]
    fn expertise_overlap_counts_partial_matches() {
        let covered = expertise_coverage(
            &["backend".into(), "security".into()],
            &["backend development".into(), "security auditing".into()],
        );
        assert_eq!(covered, 1.0);
        let half = expertise_coverage(
            &["backend".into(), "mobile".into()],
            &["backend development".into()],
        );
        assert_eq!(half, 0.5);
        assert_eq!(expertise_coverage(&[], &["anything".into()]), 0.7);
    }

    #[test]
    fn complexity_distance_table() {
        assert_eq!(complexity_alignment(Complexity::Complex, Complexity::Complex), 1.0);
        assert_eq!(complexity_alignment(Complexity::Simple, Complexity::Moderate), 0.7);
        assert_eq!(complexity_alignment(Complexity::Simple, Complexity::Complex), 0.4);
        assert_eq!(
            complexity_alignment(Complexity::Simple, Complexity::VeryComplex),
            0.2
        );
    }

    #[test]
    fn ranking_prefers_aligned_parallel_blueprint() {
        let scorer = BlueprintScorer::with_defaults();
        let candidates = vec![
            blueprint(
                ExecutionMode::Parallel,
                Complexity::Complex,
                &["backend", "frontend", "security"],
            ),
            blueprint(ExecutionMode::Sequential, Complexity::Simple, &["docs"]),
        ];
        let ranked = scorer.select_blueprint(&classification(), &candidates);
        assert_eq!(ranked[0].0.execution_mode, ExecutionMode::Parallel);
        assert!(ranked[0].1.overall > ranked[1].1.overall);
        // Perfect match on three dimensions with the 0.7 history baseline.
        assert!((ranked[0].1.overall - (0.3 + 0.3 + 0.2 + 0.2 * 0.7)).abs() < 1e-9);
    }

    #[test]
    fn history_moves_with_recorded_executions() {
        let history = Arc::new(InMemoryHistoryStore::new());
        assert_eq!(history.success_rate("bp"), Some(0.7));
        history.record_execution("bp", false);
        let degraded = history.success_rate("bp").unwrap();
        assert!(degraded < 0.7);
        for _ in 0..10 {
            history.record_execution("bp", true);
        }
        assert!(history.success_rate("bp").unwrap() > 0.9);
    }
}
