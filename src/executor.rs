//! Executor collaborator: schema introspection, plans, and query
//! execution. Concrete adapters (DuckDB, Postgres, ...) are out of scope --
//! this module defines the trait plus an in-memory fake used by validation
//! and strategy tests.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Settings passed through to the executor for one call (session
/// variables, planner hints). Stored as a `BTreeMap` so two equivalent
/// settings sets always serialize identically for cache-key hashing.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionSettings(pub BTreeMap<String, String>);

impl ExecutionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }
}

/// A table/column the executor knows about, used by the static gate's bind
/// check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<String>,
}

/// The target database's current object inventory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableSchema>,
}

impl SchemaSnapshot {
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.iter().any(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Whether any known table carries a column with this name. Qualified
    /// references are reduced to their column segment before reaching this
    /// check, so binding doesn't attempt alias resolution -- the same
    /// simplification `has_table` already makes for table references.
    pub fn has_column(&self, name: &str) -> bool {
        self.tables
            .iter()
            .any(|t| t.columns.iter().any(|c| c.eq_ignore_ascii_case(name)))
    }
}

/// A query plan as returned by `EXPLAIN` or `EXPLAIN ANALYZE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainPlan {
    pub raw: String,
    /// Populated only for `EXPLAIN ANALYZE`: the executor's own measured
    /// wall-clock time for the plan, independent of our own timing.
    pub measured_ms: Option<f64>,
}

/// Result of a completed `execute`/`sample_execute` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub execution_id: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub wall_time: Duration,
}

/// Executes statements and inspects the target engine's schema and plans.
/// Every `execute`/`explain*` call is tagged with an `execution_id` chosen
/// by the caller so a losing side of a perf-gate race can be cancelled by
/// ID even though its future may still be in flight on another task.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn schema_snapshot(&self) -> Result<SchemaSnapshot>;

    async fn explain(&self, execution_id: &str, sql: &str, dialect: &str) -> Result<ExplainPlan>;

    async fn explain_analyze(
        &self,
        execution_id: &str,
        sql: &str,
        dialect: &str,
    ) -> Result<ExplainPlan>;

    /// `timeout` is a per-query ceiling: an execution whose wall time would
    /// exceed it returns `Error::Timeout` rather than completing.
    async fn execute(
        &self,
        execution_id: &str,
        sql: &str,
        dialect: &str,
        settings: &ExecutionSettings,
        timeout: Duration,
    ) -> Result<ExecutionOutcome>;

    /// Executes with a row cap, for the semantic gate's representative
    /// sampling when full comparison would be too expensive.
    async fn sample_execute(
        &self,
        execution_id: &str,
        sql: &str,
        dialect: &str,
        sample_rows: usize,
        settings: &ExecutionSettings,
    ) -> Result<ExecutionOutcome>;

    /// Best-effort cancellation of an in-flight execution by ID. Never
    /// errors: a cancel racing a just-completed execution is a normal,
    /// expected outcome, not a failure.
    async fn cancel(&self, execution_id: &str);

    /// Stable identity for this executor instance (connection target +
    /// engine version), used as part of the verdict cache key so a verdict
    /// computed against one database is never reused against another.
    fn fingerprint(&self) -> String;
}

/// In-memory [`Executor`] fake: statements are matched against a
/// preconfigured table of results, and execution time is synthetic rather
/// than measured. Used by strategy/validation tests so gate logic is
/// testable without a real database.
pub struct InMemoryExecutor {
    schema: SchemaSnapshot,
    fixtures: std::collections::HashMap<String, ExecutionOutcome>,
    default_wall_time: Duration,
    cancelled: Mutex<Vec<String>>,
    call_count: std::sync::atomic::AtomicUsize,
}

impl InMemoryExecutor {
    pub fn new(schema: SchemaSnapshot) -> Self {
        Self {
            schema,
            fixtures: std::collections::HashMap::new(),
            default_wall_time: Duration::from_millis(10),
            cancelled: Mutex::new(Vec::new()),
            call_count: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Number of `execute`/`sample_execute` calls observed so far. Tests use
    /// this to assert a verdict cache hit never touches the executor at all.
    pub fn call_count(&self) -> usize {
        self.call_count.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Registers a canned result for a specific SQL string (matched
    /// verbatim, so callers should key fixtures off canonical SQL).
    pub fn with_fixture(mut self, sql: impl Into<String>, outcome: ExecutionOutcome) -> Self {
        self.fixtures.insert(sql.into(), outcome);
        self
    }

    pub fn with_default_wall_time(mut self, wall_time: Duration) -> Self {
        self.default_wall_time = wall_time;
        self
    }

    pub async fn cancelled_ids(&self) -> Vec<String> {
        self.cancelled.lock().await.clone()
    }

    fn outcome_for(&self, execution_id: &str, sql: &str) -> ExecutionOutcome {
        self.fixtures.get(sql).cloned().unwrap_or_else(|| ExecutionOutcome {
            execution_id: execution_id.to_string(),
            columns: vec![],
            rows: vec![],
            row_count: 0,
            wall_time: self.default_wall_time,
        })
    }
}

#[async_trait]
impl Executor for InMemoryExecutor {
    async fn schema_snapshot(&self) -> Result<SchemaSnapshot> {
        Ok(self.schema.clone())
    }

    async fn explain(&self, _execution_id: &str, sql: &str, _dialect: &str) -> Result<ExplainPlan> {
        Ok(ExplainPlan {
            raw: format!("Seq Scan (fake plan for: {sql})"),
            measured_ms: None,
        })
    }

    async fn explain_analyze(
        &self,
        execution_id: &str,
        sql: &str,
        _dialect: &str,
    ) -> Result<ExplainPlan> {
        let outcome = self.outcome_for(execution_id, sql);
        Ok(ExplainPlan {
            raw: format!("Seq Scan (actual time for: {sql})"),
            measured_ms: Some(outcome.wall_time.as_secs_f64() * 1000.0),
        })
    }

    async fn execute(
        &self,
        execution_id: &str,
        sql: &str,
        _dialect: &str,
        _settings: &ExecutionSettings,
        timeout: Duration,
    ) -> Result<ExecutionOutcome> {
        if sql.trim().is_empty() {
            return Err(Error::execution("empty statement"));
        }
        let mut outcome = self.outcome_for(execution_id, sql);
        outcome.execution_id = execution_id.to_string();
        if outcome.wall_time > timeout {
            tokio::time::sleep(timeout).await;
            return Err(Error::timeout(timeout.as_millis() as u64));
        }
        self.call_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(outcome.wall_time).await;
        Ok(outcome)
    }

    async fn sample_execute(
        &self,
        execution_id: &str,
        sql: &str,
        dialect: &str,
        sample_rows: usize,
        settings: &ExecutionSettings,
    ) -> Result<ExecutionOutcome> {
        // Sampling is a representativeness check, not a perf measurement, so
        // it gets a generous internal ceiling rather than the policy's
        // per-query timeout.
        const SAMPLE_EXECUTE_TIMEOUT: Duration = Duration::from_secs(300);
        let mut outcome = self
            .execute(execution_id, sql, dialect, settings, SAMPLE_EXECUTE_TIMEOUT)
            .await?;
        outcome.rows.truncate(sample_rows);
        outcome.row_count = outcome.row_count.min(sample_rows);
        Ok(outcome)
    }

    async fn cancel(&self, execution_id: &str) {
        self.cancelled.lock().await.push(execution_id.to_string());
    }

    fn fingerprint(&self) -> String {
        "in-memory-executor".to_string()
    }
}
