//! Execution history logger.
//!
//! Append-only SQLite store of finalized executions. Feeds aggregate metrics,
//! textual insights and the blueprint scorer's historical-success dimension.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{Duration, Utc};
use ensemble_core::config::HistoryConfig;
use ensemble_core::{CoreError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use ensemble_teams::blueprint::HistoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Recovered,
}

impl ExecutionStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Recovered => "recovered",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "success" => ExecutionStatus::Success,
            "recovered" => ExecutionStatus::Recovered,
            _ => ExecutionStatus::Failed,
        }
    }
}

/// One finalized execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub task_name: String,
    pub status: ExecutionStatus,
    pub attempt_count: u32,
    pub duration_seconds: f64,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub recovery_applied: bool,
    pub metadata: Value,
    pub created_at: String,
}

/// Aggregates over a trailing window.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AggregatedMetrics {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub recovered_executions: u64,
    pub total_retries: u64,
    pub average_duration_seconds: f64,
    pub error_types: HashMap<String, u64>,
    pub period_start: Option<String>,
    pub period_end: Option<String>,
}

impl AggregatedMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            return 0.0;
        }
        (self.successful_executions as f64 / self.total_executions as f64) * 100.0
    }

    pub fn recovery_rate(&self) -> f64 {
        let failed_before_recovery = self.failed_executions + self.recovered_executions;
        if failed_before_recovery == 0 {
            return 0.0;
        }
        (self.recovered_executions as f64 / failed_before_recovery as f64) * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightTrend {
    Improving,
    Stable,
    Degrading,
}

/// Textual insight derived from metrics thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionInsight {
    pub insight_type: String,
    pub title: String,
    pub description: String,
    pub metric_value: f64,
    pub trend: InsightTrend,
    pub recommendations: Vec<String>,
}

pub struct ExecutionHistoryLogger {
    conn: Mutex<Connection>,
    config: HistoryConfig,
}

impl ExecutionHistoryLogger {
    pub fn open(config: HistoryConfig) -> Result<Self> {
        let conn = Connection::open(Path::new(&config.storage_path))?;
        Self::from_connection(conn, config)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, HistoryConfig::default())
    }

    fn from_connection(conn: Connection, config: HistoryConfig) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS execution_records (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 execution_id TEXT UNIQUE NOT NULL,
                 task_name TEXT NOT NULL,
                 status TEXT NOT NULL,
                 attempt_count INTEGER NOT NULL DEFAULT 1,
                 duration_seconds REAL NOT NULL DEFAULT 0,
                 error_type TEXT,
                 error_message TEXT,
                 recovery_applied INTEGER NOT NULL DEFAULT 0,
                 metadata TEXT NOT NULL,
                 created_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_history_task ON execution_records(task_name);
             CREATE INDEX IF NOT EXISTS idx_history_created ON execution_records(created_at);
             CREATE INDEX IF NOT EXISTS idx_history_status ON execution_records(status);",
        )?;
        info!(path = config.storage_path, "execution history logger ready");
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    /// Append one finalized execution. `INSERT OR REPLACE` keyed by
    /// execution id keeps re-logging after a resume idempotent.
    pub fn log(&self, record: &ExecutionRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO execution_records
                 (execution_id, task_name, status, attempt_count, duration_seconds,
                  error_type, error_message, recovery_applied, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.execution_id,
                record.task_name,
                record.status.name(),
                record.attempt_count as i64,
                record.duration_seconds,
                record.error_type,
                record
                    .error_message
                    .as_ref()
                    .map(|m| m.chars().take(1000).collect::<String>()),
                record.recovery_applied as i64,
                serde_json::to_string(&record.metadata).map_err(CoreError::from)?,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_record(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT execution_id, task_name, status, attempt_count, duration_seconds,
                        error_type, error_message, recovery_applied, metadata, created_at
                 FROM execution_records WHERE execution_id = ?1",
                params![execution_id],
                row_to_record,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_records(
        &self,
        task_name: Option<&str>,
        status: Option<ExecutionStatus>,
        days: i64,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn.lock().unwrap();
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let mut sql = String::from(
            "SELECT execution_id, task_name, status, attempt_count, duration_seconds,
                    error_type, error_message, recovery_applied, metadata, created_at
             FROM execution_records WHERE created_at > ?1",
        );
        let mut args: Vec<String> = vec![cutoff];
        if let Some(task) = task_name {
            sql.push_str(" AND task_name = ?2");
            args.push(task.to_string());
        }
        if let Some(status) = status {
            sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
            args.push(status.name().to_string());
        }
        sql.push_str(&format!(" ORDER BY created_at DESC LIMIT {limit}"));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_metrics(&self, task_name: Option<&str>, days: i64) -> Result<AggregatedMetrics> {
        let records = self.get_records(task_name, None, days, usize::MAX >> 1)?;
        let mut metrics = AggregatedMetrics {
            period_start: Some((Utc::now() - Duration::days(days)).to_rfc3339()),
            period_end: Some(Utc::now().to_rfc3339()),
            ..AggregatedMetrics::default()
        };
        let mut duration_total = 0.0;
        for record in &records {
            metrics.total_executions += 1;
            match record.status {
                ExecutionStatus::Success | ExecutionStatus::Recovered => {
                    metrics.successful_executions += 1
                }
                ExecutionStatus::Failed => metrics.failed_executions += 1,
            }
            if record.recovery_applied {
                metrics.recovered_executions += 1;
            }
            metrics.total_retries += record.attempt_count as u64;
            duration_total += record.duration_seconds;
            if let Some(error_type) = &record.error_type {
                *metrics.error_types.entry(error_type.clone()).or_insert(0) += 1;
            }
        }
        if metrics.total_executions > 0 {
            metrics.average_duration_seconds = duration_total / metrics.total_executions as f64;
        }
        Ok(metrics)
    }

    /// Derive insights from the trailing window: overall success rate, the
    /// most frequent error, and the auto-recovery rate.
    pub fn generate_insights(&self, days: i64) -> Result<Vec<ExecutionInsight>> {
        if !self.config.enable_insights {
            return Ok(Vec::new());
        }
        let metrics = self.get_metrics(None, days)?;
        let mut insights = Vec::new();

        if metrics.total_executions > 0 {
            let success_rate = metrics.success_rate();
            let trend = if success_rate < 90.0 {
                InsightTrend::Degrading
            } else if success_rate > 98.0 {
                InsightTrend::Improving
            } else {
                InsightTrend::Stable
            };
            insights.push(ExecutionInsight {
                insight_type: "success_rate".into(),
                title: "Execution Success Rate".into(),
                description: format!("Overall success rate is {success_rate:.1}%"),
                metric_value: success_rate,
                trend,
                recommendations: if success_rate < 95.0 {
                    vec!["Review failing tasks for common patterns".into()]
                } else {
                    Vec::new()
                },
            });
        }

        if let Some((top_error, count)) = metrics
            .error_types
            .iter()
            .max_by_key(|(name, count)| (**count, std::cmp::Reverse(name.as_str())))
        {
            insights.push(ExecutionInsight {
                insight_type: "error_frequency".into(),
                title: "Most Common Error".into(),
                description: format!("{top_error} occurred {count} times"),
                metric_value: *count as f64,
                trend: InsightTrend::Stable,
                recommendations: vec![
                    format!("Investigate root cause of {top_error}"),
                    "Consider adding specific error handling".into(),
                ],
            });
        }

        if metrics.failed_executions + metrics.recovered_executions > 0 {
            let recovery_rate = metrics.recovery_rate();
            insights.push(ExecutionInsight {
                insight_type: "recovery_rate".into(),
                title: "Auto-Recovery Rate".into(),
                description: format!("Recovery rate is {recovery_rate:.1}%"),
                metric_value: recovery_rate,
                trend: InsightTrend::Stable,
                recommendations: if recovery_rate < 50.0 {
                    vec!["Review recovery strategies".into()]
                } else {
                    Vec::new()
                },
            });
        }

        Ok(insights)
    }

    /// Remove records older than the configured retention window.
    pub fn cleanup_old_records(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let cutoff = (Utc::now() - Duration::days(self.config.retention_days)).to_rfc3339();
        let deleted = conn.execute(
            "DELETE FROM execution_records WHERE created_at < ?1",
            params![cutoff],
        )?;
        info!(deleted, "cleaned up old execution records");
        Ok(deleted)
    }
}

/// The blueprint scorer reads blueprint success history keyed by task name.
impl HistoryStore for ExecutionHistoryLogger {
    fn success_rate(&self, blueprint_id: &str) -> Option<f64> {
        let metrics = self.get_metrics(Some(blueprint_id), 90).ok()?;
        if metrics.total_executions == 0 {
            return None;
        }
        Some(metrics.success_rate() / 100.0)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> std::result::Result<ExecutionRecord, rusqlite::Error> {
    let status: String = row.get(2)?;
    let metadata: String = row.get(8)?;
    Ok(ExecutionRecord {
        execution_id: row.get(0)?,
        task_name: row.get(1)?,
        status: ExecutionStatus::parse(&status),
        attempt_count: row.get::<_, i64>(3)? as u32,
        duration_seconds: row.get(4)?,
        error_type: row.get(5)?,
        error_message: row.get(6)?,
        recovery_applied: row.get::<_, i64>(7)? != 0,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        created_at: row.get(9)?,
    })
}

/// Helper for loggers that stamp records at finalization time.
pub fn record_now(
    execution_id: &str,
    task_name: &str,
    status: ExecutionStatus,
    attempt_count: u32,
    duration_seconds: f64,
    error_type: Option<String>,
    error_message: Option<String>,
    recovery_applied: bool,
) -> ExecutionRecord {
    ExecutionRecord {
        execution_id: execution_id.to_string(),
        task_name: task_name.to_string(),
        status,
        attempt_count,
        duration_seconds,
        error_type,
        error_message,
        recovery_applied,
        metadata: Value::Null,
        created_at: Utc::now().to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(logger: &ExecutionHistoryLogger, id: &str, task: &str, status: ExecutionStatus) {
        logger
            .log(&record_now(
                id,
                task,
                status,
                if status == ExecutionStatus::Recovered { 2 } else { 1 },
                1.5,
                (status == ExecutionStatus::Failed).then(|| "TimeoutError".to_string()),
                (status == ExecutionStatus::Failed).then(|| "timed out".to_string()),
                status == ExecutionStatus::Recovered,
            ))
            .unwrap();
    }

    #[test]
    fn metrics_aggregate_counts_and_rates() {
        let logger = ExecutionHistoryLogger::in_memory().unwrap();
        seed(&logger, "e1", "deploy", ExecutionStatus::Success);
        seed(&logger, "e2", "deploy", ExecutionStatus::Failed);
        seed(&logger, "e3", "deploy", ExecutionStatus::Recovered);
        seed(&logger, "e4", "review", ExecutionStatus::Success);

        let metrics = logger.get_metrics(Some("deploy"), 7).unwrap();
        assert_eq!(metrics.total_executions, 3);
        assert_eq!(metrics.successful_executions, 2);
        assert_eq!(metrics.failed_executions, 1);
        assert_eq!(metrics.recovered_executions, 1);
        assert!((metrics.success_rate() - 66.66).abs() < 0.1);
        assert_eq!(metrics.recovery_rate(), 50.0);
        assert_eq!(metrics.error_types["TimeoutError"], 1);
    }

    #[test]
    fn relogging_same_execution_is_idempotent() {
        let logger = ExecutionHistoryLogger::in_memory().unwrap();
        seed(&logger, "e1", "deploy", ExecutionStatus::Failed);
        seed(&logger, "e1", "deploy", ExecutionStatus::Recovered);
        let metrics = logger.get_metrics(Some("deploy"), 7).unwrap();
        assert_eq!(metrics.total_executions, 1);
        let record = logger.get_record("e1").unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Recovered);
        assert!(record.recovery_applied);
    }

    #[test]
    fn insights_flag_low_success_rate() {
        let logger = ExecutionHistoryLogger::in_memory().unwrap();
        for i in 0..6 {
            seed(&logger, &format!("s{i}"), "deploy", ExecutionStatus::Success);
        }
        for i in 0..4 {
            seed(&logger, &format!("f{i}"), "deploy", ExecutionStatus::Failed);
        }
        let insights = logger.generate_insights(7).unwrap();
        let success = insights
            .iter()
            .find(|i| i.insight_type == "success_rate")
            .unwrap();
        assert_eq!(success.trend, InsightTrend::Degrading);
        assert!(!success.recommendations.is_empty());
        assert!(insights.iter().any(|i| i.insight_type == "error_frequency"));
        assert!(insights.iter().any(|i| i.insight_type == "recovery_rate"));
    }

    #[test]
    fn retention_sweep_removes_old_records() {
        let logger = ExecutionHistoryLogger::in_memory().unwrap();
        let mut stale = record_now(
            "old",
            "deploy",
            ExecutionStatus::Success,
            1,
            1.0,
            None,
            None,
            false,
        );
        stale.created_at = (Utc::now() - Duration::days(400)).to_rfc3339();
        logger.log(&stale).unwrap();
        seed(&logger, "fresh", "deploy", ExecutionStatus::Success);

        let deleted = logger.cleanup_old_records().unwrap();
        assert_eq!(deleted, 1);
        assert!(logger.get_record("old").unwrap().is_none());
        assert!(logger.get_record("fresh").unwrap().is_some());
    }

    #[test]
    fn blueprint_history_reads_success_rate() {
        let logger = ExecutionHistoryLogger::in_memory().unwrap();
        assert!(logger.success_rate("bp_parallel").is_none());
        seed(&logger, "b1", "bp_parallel", ExecutionStatus::Success);
        seed(&logger, "b2", "bp_parallel", ExecutionStatus::Failed);
        let rate = logger.success_rate("bp_parallel").unwrap();
        assert!((rate - 0.5).abs() < 1e-9);
    }
}
