//! Fix verification loop.
//!
//! Runs targeted tests, the regression suite and smoke tests for a submitted
//! fix, detects regressions against a baseline of prior results, and grades
//! the fix. Test execution is pluggable through [`TestRunner`] and bounded by
//! a semaphore.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Partial,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    Unit,
    Integration,
    Regression,
    Smoke,
    All,
}

/// Result of one test target execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub test_name: String,
    pub kind: TestKind,
    pub status: VerificationStatus,
    pub duration_seconds: f64,
    pub output: String,
    pub error_message: Option<String>,
}

/// Aggregated verification outcome for one fix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verification_id: String,
    pub fix_description: String,
    pub status: VerificationStatus,
    pub test_results: Vec<TestResult>,
    pub total_tests: usize,
    pub passed_tests: usize,
    pub failed_tests: usize,
    pub skipped_tests: usize,
    pub total_duration_seconds: f64,
    pub regressions_detected: Vec<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

impl VerificationResult {
    pub fn pass_rate(&self) -> f64 {
        if self.total_tests == 0 {
            return 0.0;
        }
        (self.passed_tests as f64 / self.total_tests as f64) * 100.0
    }

    pub fn has_regressions(&self) -> bool {
        !self.regressions_detected.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct VerificationConfig {
    pub test_directory: String,
    pub test_timeout: Duration,
    pub run_regression_tests: bool,
    pub run_smoke_tests: bool,
    pub min_pass_rate: f64,
    pub max_parallel: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            test_directory: "tests".to_string(),
            test_timeout: Duration::from_secs(300),
            run_regression_tests: true,
            run_smoke_tests: true,
            min_pass_rate: 95.0,
            max_parallel: 4,
        }
    }
}

/// Executes one test target; process-backed in production, closures in tests.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, target: &str, kind: TestKind) -> TestResult;
}

/// Runs `command <target>` and grades by exit status.
pub struct CommandTestRunner {
    pub command: String,
    pub args: Vec<String>,
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run(&self, target: &str, kind: TestKind) -> TestResult {
        let started = std::time::Instant::now();
        let output = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .arg(target)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;
        let duration = started.elapsed().as_secs_f64();
        match output {
            Ok(output) => {
                let text = format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                TestResult {
                    test_name: target.to_string(),
                    kind,
                    status: if output.status.success() {
                        VerificationStatus::Passed
                    } else {
                        VerificationStatus::Failed
                    },
                    duration_seconds: duration,
                    output: text.chars().take(2000).collect(),
                    error_message: if output.status.success() {
                        None
                    } else {
                        Some(format!("exit status {:?}", output.status.code()))
                    },
                }
            }
            Err(err) => TestResult {
                test_name: target.to_string(),
                kind,
                status: VerificationStatus::Failed,
                duration_seconds: duration,
                output: String::new(),
                error_message: Some(err.to_string()),
            },
        }
    }
}

pub struct FixVerificationLoop {
    config: VerificationConfig,
    runner: Arc<dyn TestRunner>,
    baseline: Mutex<HashMap<String, VerificationStatus>>,
    history: Mutex<Vec<VerificationResult>>,
}

impl FixVerificationLoop {
    pub fn new(config: VerificationConfig, runner: Arc<dyn TestRunner>) -> Self {
        Self {
            config,
            runner,
            baseline: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Verify a fix: run the relevant targets, compare against the baseline
    /// and grade. `Passed` requires zero failures, zero regressions and a
    /// pass rate at or above `min_pass_rate`.
    pub async fn verify_fix(
        &self,
        fix_id: &str,
        fix_description: &str,
        affected_modules: &[String],
        specific_tests: &[String],
    ) -> VerificationResult {
        let started = std::time::Instant::now();
        let mut result = VerificationResult {
            verification_id: fix_id.to_string(),
            fix_description: fix_description.to_string(),
            status: VerificationStatus::Running,
            test_results: Vec::new(),
            total_tests: 0,
            passed_tests: 0,
            failed_tests: 0,
            skipped_tests: 0,
            total_duration_seconds: 0.0,
            regressions_detected: Vec::new(),
            started_at: ensemble_core::ids::now_iso(),
            completed_at: None,
        };

        let mut targets: Vec<(String, TestKind)> = Vec::new();
        if !specific_tests.is_empty() {
            for test in specific_tests {
                targets.push((test.clone(), TestKind::Unit));
            }
        } else {
            for module in affected_modules {
                let stem = module
                    .rsplit('/')
                    .next()
                    .unwrap_or(module)
                    .trim_end_matches(".rs");
                targets.push((
                    format!("{}/test_{stem}", self.config.test_directory),
                    TestKind::Unit,
                ));
            }
        }
        if self.config.run_regression_tests {
            targets.push((
                format!("{}/regression", self.config.test_directory),
                TestKind::Regression,
            ));
        }
        if self.config.run_smoke_tests {
            targets.push((
                format!("{}/smoke", self.config.test_directory),
                TestKind::Smoke,
            ));
        }
        if targets.is_empty() {
            targets.push((self.config.test_directory.clone(), TestKind::All));
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut handles = Vec::with_capacity(targets.len());
        for (target, kind) in targets {
            let permit_source = Arc::clone(&semaphore);
            let runner = Arc::clone(&self.runner);
            let timeout = self.config.test_timeout;
            handles.push(tokio::spawn(async move {
                let _permit = permit_source.acquire_owned().await.expect("semaphore open");
                match tokio::time::timeout(timeout, runner.run(&target, kind)).await {
                    Ok(result) => result,
                    Err(_) => TestResult {
                        test_name: target,
                        kind,
                        status: VerificationStatus::Failed,
                        duration_seconds: timeout.as_secs_f64(),
                        output: String::new(),
                        error_message: Some(format!(
                            "test timed out after {}s",
                            timeout.as_secs()
                        )),
                    },
                }
            }));
        }
        for handle in handles {
            if let Ok(test_result) = handle.await {
                result.test_results.push(test_result);
            }
        }

        result.total_tests = result.test_results.len();
        result.passed_tests = result
            .test_results
            .iter()
            .filter(|t| t.status == VerificationStatus::Passed)
            .count();
        result.failed_tests = result
            .test_results
            .iter()
            .filter(|t| t.status == VerificationStatus::Failed)
            .count();
        result.skipped_tests = result
            .test_results
            .iter()
            .filter(|t| t.status == VerificationStatus::Skipped)
            .count();
        result.regressions_detected = self.detect_regressions(&result.test_results);

        result.status = if result.failed_tests > 0 || result.has_regressions() {
            VerificationStatus::Failed
        } else if result.pass_rate() >= self.config.min_pass_rate {
            VerificationStatus::Passed
        } else {
            VerificationStatus::Partial
        };

        {
            let mut baseline = self.baseline.lock().unwrap();
            for test in &result.test_results {
                baseline.insert(test.test_name.clone(), test.status);
            }
        }

        result.completed_at = Some(ensemble_core::ids::now_iso());
        result.total_duration_seconds = started.elapsed().as_secs_f64();
        self.history.lock().unwrap().push(result.clone());
        info!(
            fix_id,
            status = ?result.status,
            passed = result.passed_tests,
            total = result.total_tests,
            "fix verification completed"
        );
        result
    }

    /// A regression is any test that passed in the baseline and fails now.
    fn detect_regressions(&self, current: &[TestResult]) -> Vec<String> {
        let baseline = self.baseline.lock().unwrap();
        current
            .iter()
            .filter(|test| {
                baseline.get(&test.test_name) == Some(&VerificationStatus::Passed)
                    && test.status == VerificationStatus::Failed
            })
            .map(|test| format!("REGRESSION: {} (was passing, now failing)", test.test_name))
            .collect()
    }

    pub async fn run_regression_suite(&self) -> VerificationResult {
        self.verify_fix(
            &format!("regression_{}", ensemble_core::ids::now_iso()),
            "Full regression test suite",
            &[],
            &[format!("{}/regression", self.config.test_directory)],
        )
        .await
    }

    pub fn history(&self) -> Vec<VerificationResult> {
        self.history.lock().unwrap().clone()
    }

    pub fn clear_baseline(&self) {
        self.baseline.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Runner whose targets fail when listed in `failing`.
    struct TableRunner {
        failing: Mutex<HashSet<String>>,
    }

    impl TableRunner {
        fn new(failing: &[&str]) -> Self {
            Self {
                failing: Mutex::new(failing.iter().map(|s| s.to_string()).collect()),
            }
        }

        fn set_failing(&self, failing: &[&str]) {
            *self.failing.lock().unwrap() = failing.iter().map(|s| s.to_string()).collect();
        }
    }

    #[async_trait]
    impl TestRunner for TableRunner {
        async fn run(&self, target: &str, kind: TestKind) -> TestResult {
            let fails = self.failing.lock().unwrap().contains(target);
            TestResult {
                test_name: target.to_string(),
                kind,
                status: if fails {
                    VerificationStatus::Failed
                } else {
                    VerificationStatus::Passed
                },
                duration_seconds: 0.01,
                output: String::new(),
                error_message: fails.then(|| "assertion failed".to_string()),
            }
        }
    }

    fn verifier(runner: Arc<TableRunner>) -> FixVerificationLoop {
        FixVerificationLoop::new(
            VerificationConfig {
                run_regression_tests: true,
                run_smoke_tests: false,
                ..VerificationConfig::default()
            },
            runner,
        )
    }

    #[tokio::test]
    async fn clean_run_passes() {
        let runner = Arc::new(TableRunner::new(&[]));
        let verifier = verifier(Arc::clone(&runner));
        let result = verifier
            .verify_fix("FIX-1", "fixed timeout handling", &["execution.rs".into()], &[])
            .await;
        assert_eq!(result.status, VerificationStatus::Passed);
        assert_eq!(result.failed_tests, 0);
        assert!(!result.has_regressions());
        assert_eq!(result.pass_rate(), 100.0);
    }

    #[tokio::test]
    async fn failure_fails_the_verification() {
        let runner = Arc::new(TableRunner::new(&["tests/test_execution"]));
        let verifier = verifier(Arc::clone(&runner));
        let result = verifier
            .verify_fix("FIX-2", "attempt", &["execution.rs".into()], &[])
            .await;
        assert_eq!(result.status, VerificationStatus::Failed);
        assert_eq!(result.failed_tests, 1);
    }

    #[tokio::test]
    async fn regression_detected_against_baseline() {
        let runner = Arc::new(TableRunner::new(&[]));
        let verifier = verifier(Arc::clone(&runner));
        // First run establishes the baseline with everything passing.
        let first = verifier
            .verify_fix("FIX-3", "baseline", &["retry.rs".into()], &[])
            .await;
        assert_eq!(first.status, VerificationStatus::Passed);

        // The regression suite starts failing afterwards.
        runner.set_failing(&["tests/regression"]);
        let second = verifier
            .verify_fix("FIX-4", "breaks regression", &["retry.rs".into()], &[])
            .await;
        assert_eq!(second.status, VerificationStatus::Failed);
        assert_eq!(second.regressions_detected.len(), 1);
        assert!(second.regressions_detected[0].contains("tests/regression"));
    }

    #[tokio::test]
    async fn specific_tests_override_module_discovery() {
        let runner = Arc::new(TableRunner::new(&[]));
        let verifier = verifier(Arc::clone(&runner));
        let result = verifier
            .verify_fix("FIX-5", "targeted", &[], &["tests/test_auth".into()])
            .await;
        assert!(result
            .test_results
            .iter()
            .any(|t| t.test_name == "tests/test_auth"));
        assert_eq!(verifier.history().len(), 1);
    }
}
