//! Self-healing execution loop.
//!
//! On failure the analyzer classifies the error; transient classifications
//! retry with exponential backoff and deterministic jitter up to the
//! pattern's recommended retries, everything else escalates. Every finalized
//! execution lands in the history logger, recovered or not.

pub mod analyzer;
pub mod history;
pub mod verifier;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ensemble_core::config::SchedulerConfig;
use ensemble_core::ids::now_iso;
use ensemble_core::model::AttemptOutcome;
use ensemble_core::CoreError;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use analyzer::{
    default_patterns, ErrorAnalysis, ErrorCategory, ErrorPattern, ErrorPatternAnalyzer,
    RecoverySuggestion,
};
pub use history::{
    record_now, AggregatedMetrics, ExecutionHistoryLogger, ExecutionInsight, ExecutionRecord,
    ExecutionStatus, InsightTrend,
};
pub use verifier::{
    CommandTestRunner, FixVerificationLoop, TestKind, TestResult, TestRunner, VerificationConfig,
    VerificationResult, VerificationStatus,
};

/// Trace of one attempt, persisted as an `ExecutionAttempt` by the engine.
#[derive(Debug, Clone)]
pub struct AttemptTrace {
    pub attempt_number: u32,
    pub started_at: String,
    pub ended_at: String,
    pub outcome: AttemptOutcome,
    pub error_classification: Option<String>,
    pub error_message: Option<String>,
}

/// Final outcome of a healed execution.
pub struct HealingOutcome {
    pub result: Result<Value, CoreError>,
    pub attempts: Vec<AttemptTrace>,
    pub classification: Option<ErrorAnalysis>,
    pub recovered: bool,
}

pub struct HealingLoop {
    analyzer: ErrorPatternAnalyzer,
    history: Arc<ExecutionHistoryLogger>,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl HealingLoop {
    pub fn new(history: Arc<ExecutionHistoryLogger>, config: &SchedulerConfig) -> Self {
        Self {
            analyzer: ErrorPatternAnalyzer::new(),
            history,
            backoff_base: Duration::from_millis(config.retry_backoff_base_ms),
            backoff_cap: Duration::from_millis(config.retry_backoff_cap_ms),
        }
    }

    pub fn analyzer(&self) -> &ErrorPatternAnalyzer {
        &self.analyzer
    }

    pub fn history(&self) -> Arc<ExecutionHistoryLogger> {
        Arc::clone(&self.history)
    }

    /// Exponential backoff with a deterministic jitter derived from the task
    /// name and attempt number, capped by configuration.
    fn backoff_for(&self, task_name: &str, attempt: u32) -> Duration {
        let exp = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.backoff_cap);
        let mut hasher = Sha256::new();
        hasher.update(format!("{task_name}:{attempt}"));
        let digest = hasher.finalize();
        let jitter_pct = (digest[0] as u64 % 25) + 1;
        capped + Duration::from_millis(capped.as_millis() as u64 * jitter_pct / 100)
    }

    /// Run `operation` with retry-on-transient semantics. The cancellation
    /// token aborts between attempts and during backoff; cancellation is a
    /// terminal, non-retriable outcome.
    pub async fn run<F, Fut>(
        &self,
        execution_id: &str,
        task_name: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> HealingOutcome
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<Value, CoreError>>,
    {
        let started = std::time::Instant::now();
        let mut attempts: Vec<AttemptTrace> = Vec::new();
        let mut classification: Option<ErrorAnalysis> = None;
        let mut attempt: u32 = 0;

        let outcome = loop {
            attempt += 1;
            let attempt_started = now_iso();
            if cancel.is_cancelled() {
                break Err(CoreError::Cancelled {
                    reason: "cancelled before attempt".into(),
                });
            }
            let result = operation(attempt).await;
            match result {
                Ok(value) => {
                    attempts.push(AttemptTrace {
                        attempt_number: attempt,
                        started_at: attempt_started,
                        ended_at: now_iso(),
                        outcome: if attempt > 1 {
                            AttemptOutcome::Recovered
                        } else {
                            AttemptOutcome::Success
                        },
                        error_classification: None,
                        error_message: None,
                    });
                    break Ok(value);
                }
                Err(err) => {
                    let analysis = self.analyzer.analyze(err.category(), &err.to_string());
                    attempts.push(AttemptTrace {
                        attempt_number: attempt,
                        started_at: attempt_started,
                        ended_at: now_iso(),
                        outcome: AttemptOutcome::Failure,
                        error_classification: Some(analysis.category.name().to_string()),
                        error_message: Some(err.to_string()),
                    });

                    let cancelled = matches!(err, CoreError::Cancelled { .. });
                    let retriable = !cancelled && (analysis.is_transient || err.retriable());
                    let budget = analysis.recommended_retries.max(u32::from(err.retriable()));
                    classification = Some(analysis);

                    if !retriable || attempt > budget {
                        if retriable {
                            warn!(task_name, attempt, "retry budget exhausted, escalating");
                        }
                        break Err(err);
                    }
                    let backoff = self.backoff_for(task_name, attempt);
                    info!(task_name, attempt, backoff_ms = backoff.as_millis() as u64, "retrying after transient failure");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => {
                            break Err(CoreError::Cancelled { reason: "cancelled during backoff".into() });
                        }
                    }
                }
            }
        };

        let recovered = outcome.is_ok() && attempt > 1;
        let status = match (&outcome, recovered) {
            (Ok(_), true) => ExecutionStatus::Recovered,
            (Ok(_), false) => ExecutionStatus::Success,
            (Err(_), _) => ExecutionStatus::Failed,
        };
        let (error_type, error_message) = match &outcome {
            Err(err) => (
                Some(
                    classification
                        .as_ref()
                        .map(|c| c.category.name().to_string())
                        .unwrap_or_else(|| err.category().to_string()),
                ),
                Some(err.to_string()),
            ),
            Ok(_) => (None, None),
        };
        if let Err(err) = self.history.log(&record_now(
            execution_id,
            task_name,
            status,
            attempt,
            started.elapsed().as_secs_f64(),
            error_type,
            error_message,
            recovered,
        )) {
            warn!(error = %err, "failed to record execution history");
        }

        HealingOutcome {
            result: outcome,
            attempts,
            classification,
            recovered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn healing() -> HealingLoop {
        let config = SchedulerConfig {
            retry_backoff_base_ms: 1,
            retry_backoff_cap_ms: 5,
            ..SchedulerConfig::default()
        };
        HealingLoop::new(Arc::new(ExecutionHistoryLogger::in_memory().unwrap()), &config)
    }

    #[tokio::test]
    async fn transient_timeout_recovers_on_retry() {
        let healing = healing();
        let calls = AtomicU32::new(0);
        let outcome = healing
            .run("exec_1", "deploy", &CancellationToken::new(), |_attempt| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(CoreError::Transient("request timed out".into()))
                    } else {
                        Ok(json!({"ok": true}))
                    }
                }
            })
            .await;

        assert!(outcome.result.is_ok());
        assert!(outcome.recovered);
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::Failure);
        assert_eq!(outcome.attempts[1].outcome, AttemptOutcome::Recovered);
        let analysis = outcome.classification.unwrap();
        assert_eq!(analysis.category, ErrorCategory::Timeout);
        assert!(analysis.is_transient);

        let record = healing.history().get_record("exec_1").unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Recovered);
        assert_eq!(record.attempt_count, 2);
        assert!(record.recovery_applied);
    }

    #[tokio::test]
    async fn validation_errors_never_retry() {
        let healing = healing();
        let calls = AtomicU32::new(0);
        let outcome = healing
            .run("exec_2", "deploy", &CancellationToken::new(), |_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CoreError::Validation("schema validation failed".into())) }
            })
            .await;
        assert!(outcome.result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let record = healing.history().get_record("exec_2").unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(!record.recovery_applied);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded_by_classification() {
        let healing = healing();
        let calls = AtomicU32::new(0);
        let outcome = healing
            .run("exec_3", "deploy", &CancellationToken::new(), |_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CoreError::Transient("request timed out".into())) }
            })
            .await;
        assert!(outcome.result.is_err());
        // Timeout pattern recommends 3 retries: 1 initial + 3 retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let healing = healing();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = healing
            .run("exec_4", "deploy", &cancel, |_attempt| async {
                Ok(json!({"unreachable": true}))
            })
            .await;
        assert!(matches!(outcome.result, Err(CoreError::Cancelled { .. })));
    }
}
