//! Error pattern analyzer.
//!
//! Classifies error strings against a registry of known patterns, suggests
//! recovery actions, and tracks recent-hour frequency of normalized messages
//! for deduplication. Unknown errors default to one cautious retry.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use ensemble_core::model::Severity;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    Authentication,
    Authorization,
    Resource,
    Validation,
    Configuration,
    Dependency,
    Transient,
    Permanent,
    Unknown,
}

impl ErrorCategory {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Dependency => "dependency",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoverySuggestion {
    RetryImmediately,
    RetryWithBackoff,
    RefreshCredentials,
    CheckConfiguration,
    InstallDependency,
    IncreaseTimeout,
    ScaleResources,
    ManualIntervention,
    SkipAndContinue,
    Escalate,
}

/// One registry entry matched against error text.
#[derive(Debug)]
pub struct ErrorPattern {
    pub pattern_id: &'static str,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub regexes: Vec<Regex>,
    pub keywords: Vec<&'static str>,
    pub suggestions: Vec<RecoverySuggestion>,
    pub is_transient: bool,
    pub max_retries_effective: u32,
}

fn pattern(
    pattern_id: &'static str,
    category: ErrorCategory,
    severity: Severity,
    regexes: &[&str],
    keywords: &[&'static str],
    suggestions: &[RecoverySuggestion],
    is_transient: bool,
    max_retries_effective: u32,
) -> ErrorPattern {
    ErrorPattern {
        pattern_id,
        category,
        severity,
        regexes: regexes
            .iter()
            .map(|r| Regex::new(&format!("(?i){r}")).expect("invalid builtin error pattern"))
            .collect(),
        keywords: keywords.to_vec(),
        suggestions: suggestions.to_vec(),
        is_transient,
        max_retries_effective,
    }
}

/// The built-in registry: network, timeout, auth, permission, resource,
/// validation, dependency, rate-limit and 5xx server errors.
pub fn default_patterns() -> Vec<ErrorPattern> {
    use RecoverySuggestion::*;
    vec![
        pattern(
            "network_connection",
            ErrorCategory::Network,
            Severity::Medium,
            &[
                r"connection\s*(refused|reset|timed?\s*out)",
                r"network\s*(is\s+)?unreachable",
                r"no\s+route\s+to\s+host",
                r"name\s+or\s+service\s+not\s+known",
            ],
            &["ConnectionError", "ConnectionRefused", "NetworkError", "socket"],
            &[RetryWithBackoff, CheckConfiguration],
            true,
            5,
        ),
        pattern(
            "timeout",
            ErrorCategory::Timeout,
            Severity::Medium,
            &[
                r"timed?\s*out",
                r"deadline\s+exceeded",
                r"operation\s+took\s+too\s+long",
                r"request\s+timeout",
            ],
            &["TimeoutError", "ReadTimeout", "ConnectTimeout"],
            &[RetryWithBackoff, IncreaseTimeout],
            true,
            3,
        ),
        pattern(
            "auth_failure",
            ErrorCategory::Authentication,
            Severity::High,
            &[
                r"401\s*unauthorized",
                r"authentication\s+(failed|required)",
                r"invalid\s+(token|credentials|api\s*key)",
                r"expired\s+(token|session)",
            ],
            &["AuthenticationError", "Unauthorized", "401", "InvalidToken"],
            &[RefreshCredentials, CheckConfiguration],
            false,
            1,
        ),
        pattern(
            "permission_denied",
            ErrorCategory::Authorization,
            Severity::High,
            &[
                r"403\s*forbidden",
                r"permission\s+denied",
                r"access\s+denied",
                r"not\s+authorized",
            ],
            &["PermissionError", "Forbidden", "403", "AccessDenied"],
            &[ManualIntervention, Escalate],
            false,
            0,
        ),
        pattern(
            "resource_exhaustion",
            ErrorCategory::Resource,
            Severity::High,
            &[
                r"out\s+of\s+memory",
                r"memory\s+(error|limit|exceeded)",
                r"disk\s+(full|space)",
                r"too\s+many\s+(open\s+)?files",
                r"resource\s+(limit|quota)\s+exceeded",
            ],
            &["MemoryError", "ResourceExhausted", "QuotaExceeded"],
            &[ScaleResources, Escalate],
            false,
            0,
        ),
        pattern(
            "validation_error",
            ErrorCategory::Validation,
            Severity::Medium,
            &[
                r"validation\s+(error|failed)",
                r"invalid\s+(input|value|format|type)",
                r"missing\s+required\s+(field|parameter)",
                r"schema\s+validation\s+failed",
            ],
            &["ValidationError", "InvalidInput"],
            &[CheckConfiguration, ManualIntervention],
            false,
            0,
        ),
        pattern(
            "dependency_missing",
            ErrorCategory::Dependency,
            Severity::High,
            &[
                r"module\s+not\s+found",
                r"no\s+module\s+named",
                r"package\s+not\s+installed",
                r"command\s+not\s+found",
                r"cannot\s+find\s+crate",
            ],
            &["ModuleNotFoundError", "ImportError", "PackageNotFound"],
            &[InstallDependency, CheckConfiguration],
            false,
            0,
        ),
        pattern(
            "rate_limit",
            ErrorCategory::Transient,
            Severity::Low,
            &[
                r"429\s*too\s+many\s+requests",
                r"rate\s+limit\s+(exceeded|reached)",
                r"throttl(ed|ing)",
            ],
            &["RateLimitError", "TooManyRequests", "429", "Throttled"],
            &[RetryWithBackoff],
            true,
            5,
        ),
        pattern(
            "server_error",
            ErrorCategory::Transient,
            Severity::Medium,
            &[
                r"500\s*internal\s+server\s+error",
                r"502\s*bad\s+gateway",
                r"503\s*service\s+unavailable",
                r"504\s*gateway\s+timeout",
            ],
            &["ServerError", "InternalServerError", "502", "503", "504"],
            &[RetryWithBackoff, Escalate],
            true,
            3,
        ),
    ]
}

/// Classification result for one analyzed error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub error_hash: String,
    pub error_type: String,
    pub error_message: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub recovery_suggestions: Vec<RecoverySuggestion>,
    pub matched_pattern: Option<String>,
    pub is_transient: bool,
    pub recommended_retries: u32,
    pub similar_errors_count: usize,
    pub confidence: f64,
    pub analyzed_at: String,
}

pub struct ErrorPatternAnalyzer {
    patterns: Vec<ErrorPattern>,
    enable_learning: bool,
    history: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
    match_counts: Mutex<HashMap<String, u64>>,
}

impl ErrorPatternAnalyzer {
    pub fn new() -> Self {
        Self::with_patterns(default_patterns())
    }

    pub fn with_patterns(patterns: Vec<ErrorPattern>) -> Self {
        Self {
            patterns,
            enable_learning: true,
            history: Mutex::new(HashMap::new()),
            match_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn without_learning(mut self) -> Self {
        self.enable_learning = false;
        self
    }

    pub fn add_pattern(&mut self, pattern: ErrorPattern) {
        self.patterns.push(pattern);
    }

    /// Normalize volatile tokens so equivalent errors hash identically:
    /// digits collapse to `N`, hex addresses to `ADDR`, uuids to `UUID`.
    fn error_hash(error_type: &str, message: &str) -> String {
        let lowered = message.to_lowercase();
        let uuid_re = Regex::new(
            r"[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}",
        )
        .unwrap();
        let normalized = uuid_re.replace_all(&lowered, "UUID");
        let addr_re = Regex::new(r"0x[0-9a-f]+").unwrap();
        let normalized = addr_re.replace_all(&normalized, "ADDR");
        let digit_re = Regex::new(r"\d+").unwrap();
        let normalized = digit_re.replace_all(&normalized, "N");
        let mut hasher = Sha256::new();
        hasher.update(format!("{error_type}:{normalized}"));
        let digest = hasher.finalize();
        hex_prefix(&digest, 16)
    }

    fn best_match(&self, haystack: &str, error_type: &str) -> (Option<&ErrorPattern>, f64) {
        let mut best: Option<&ErrorPattern> = None;
        let mut best_score = 0.0f64;
        let lowered = haystack.to_lowercase();
        for pattern in &self.patterns {
            let mut score = 0.0f64;
            for regex in &pattern.regexes {
                if regex.is_match(haystack) {
                    score += 0.3;
                }
            }
            for keyword in &pattern.keywords {
                if lowered.contains(&keyword.to_lowercase()) {
                    score += 0.2;
                }
            }
            if pattern.keywords.contains(&error_type) {
                score += 0.5;
            }
            let score = score.min(1.0);
            if score > best_score {
                best_score = score;
                best = Some(pattern);
            }
        }
        (best, best_score)
    }

    fn similar_recent(&self, hash: &str) -> usize {
        if !self.enable_learning {
            return 0;
        }
        let history = self.history.lock().unwrap();
        let cutoff = Utc::now() - Duration::hours(1);
        history
            .get(hash)
            .map(|seen| seen.iter().filter(|at| **at > cutoff).count())
            .unwrap_or(0)
    }

    fn record(&self, hash: &str) {
        if !self.enable_learning {
            return;
        }
        let mut history = self.history.lock().unwrap();
        let entry = history.entry(hash.to_string()).or_default();
        entry.push(Utc::now());
        if entry.len() > 100 {
            let excess = entry.len() - 100;
            entry.drain(..excess);
        }
    }

    /// Classify an error string into a category with recovery suggestions.
    pub fn analyze(&self, error_type: &str, error_message: &str) -> ErrorAnalysis {
        let hash = Self::error_hash(error_type, error_message);
        let haystack = format!("{error_type} {error_message}");
        let (matched, confidence) = self.best_match(&haystack, error_type);
        let similar = self.similar_recent(&hash);
        self.record(&hash);

        let analysis = match matched {
            Some(pattern) if confidence > 0.0 => {
                *self
                    .match_counts
                    .lock()
                    .unwrap()
                    .entry(pattern.pattern_id.to_string())
                    .or_insert(0) += 1;
                ErrorAnalysis {
                    error_hash: hash,
                    error_type: error_type.to_string(),
                    error_message: truncate(error_message, 200),
                    category: pattern.category,
                    severity: pattern.severity,
                    recovery_suggestions: pattern.suggestions.clone(),
                    matched_pattern: Some(pattern.pattern_id.to_string()),
                    is_transient: pattern.is_transient,
                    recommended_retries: pattern.max_retries_effective,
                    similar_errors_count: similar,
                    confidence,
                    analyzed_at: ensemble_core::ids::now_iso(),
                }
            }
            _ => ErrorAnalysis {
                error_hash: hash,
                error_type: error_type.to_string(),
                error_message: truncate(error_message, 200),
                category: ErrorCategory::Unknown,
                severity: Severity::Medium,
                recovery_suggestions: vec![
                    RecoverySuggestion::RetryWithBackoff,
                    RecoverySuggestion::Escalate,
                ],
                matched_pattern: None,
                is_transient: false,
                recommended_retries: 1,
                similar_errors_count: similar,
                confidence: 0.0,
                analyzed_at: ensemble_core::ids::now_iso(),
            },
        };
        debug!(
            category = analysis.category.name(),
            confidence = analysis.confidence,
            "error analyzed"
        );
        analysis
    }

    pub fn statistics(&self) -> AnalyzerStatistics {
        AnalyzerStatistics {
            patterns_count: self.patterns.len(),
            unique_errors_seen: self.history.lock().unwrap().len(),
            pattern_match_counts: self.match_counts.lock().unwrap().clone(),
            learning_enabled: self.enable_learning,
        }
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap().clear();
        self.match_counts.lock().unwrap().clear();
    }
}

impl Default for ErrorPatternAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerStatistics {
    pub patterns_count: usize,
    pub unique_errors_seen: usize,
    pub pattern_match_counts: HashMap<String, u64>,
    pub learning_enabled: bool,
}

fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}
