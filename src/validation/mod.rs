//! Layer V: the validation harness. Wires the verdict cache, the four-gate
//! pipeline, and the performance racer into the orchestration spec describes
//! as "Static -> Semantic -> Perf -> Verdict, short-circuiting on the first
//! gate that fails, with a cache check ahead of all four and a cache write
//! after."

pub mod cache;
pub mod gates;
pub mod race;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};

use crate::candidate::Candidate;
use crate::error::Result;
use crate::executor::{ExecutionSettings, Executor, SchemaSnapshot};
use crate::sql::SqlDialectParser;

pub use cache::{InMemoryVerdictCache, KeyedLocks, VerdictCache};
#[cfg(feature = "sqlite-store")]
pub use cache::SqliteVerdictCache;
pub use gates::{build_status, perf_gate, semantic_gate, static_gate};
pub use race::{PerfMeasurement, RaceMethod, RacePolicy};
pub use types::{
    CacheKey, FeedbackPack, GateName, GateOutcome, GateRejection, SemanticConfidence,
    SpeedupThresholds, Status, ValidationPolicy, ValidationVerdict,
};

/// Owns the collaborators a validation run needs and exposes the single
/// `validate` entry point a search strategy's candidates are fed through.
pub struct ValidationHarness {
    executor: Arc<dyn Executor>,
    parser: Arc<dyn SqlDialectParser>,
    cache: Arc<dyn VerdictCache>,
    locks: KeyedLocks,
    schema: SchemaSnapshot,
    policy: ValidationPolicy,
    /// Whether the executor supports content checksums for the semantic
    /// gate's HIGH-confidence path. `InMemoryExecutor` and most SQL engines
    /// without a native row-hash function do not.
    checksums_supported: bool,
    /// Bounds how many candidates run static+semantic concurrently.
    semaphore: Semaphore,
    /// Perf measurement touches the same executor's resources on both
    /// sides of the race, so only one candidate's perf gate runs at a time
    /// per harness.
    perf_mutex: Mutex<()>,
}

impl ValidationHarness {
    pub fn new(
        executor: Arc<dyn Executor>,
        parser: Arc<dyn SqlDialectParser>,
        cache: Arc<dyn VerdictCache>,
        schema: SchemaSnapshot,
        policy: ValidationPolicy,
    ) -> Self {
        let permits = policy.max_parallel_validations.max(1);
        Self {
            executor,
            parser,
            cache,
            locks: KeyedLocks::new(),
            schema,
            policy,
            checksums_supported: false,
            semaphore: Semaphore::new(permits),
            perf_mutex: Mutex::new(()),
        }
    }

    pub fn with_checksums_supported(mut self, supported: bool) -> Self {
        self.checksums_supported = supported;
        self
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Validates one candidate against `original_sql`, consulting the
    /// verdict cache first and persisting the freshly computed verdict
    /// afterward. Concurrent calls for the same `(candidate_id,
    /// run_fingerprint, validation_settings)` triple serialize on the
    /// per-key lock so only one of them actually runs the gate pipeline.
    #[tracing::instrument(skip(self, original_sql, forbidden_constructs), fields(candidate_id = %candidate.candidate_id))]
    pub async fn validate(
        &self,
        query_id: &str,
        original_sql: &str,
        candidate: &Candidate,
        run_fingerprint: &str,
        forbidden_constructs: &[String],
    ) -> Result<ValidationVerdict> {
        let key = CacheKey::new(
            candidate.candidate_id.clone(),
            run_fingerprint.to_string(),
            &self.policy,
            &self.executor.fingerprint(),
        );
        let lock = self.locks.handle(&key);
        let _guard = lock.lock().await;

        if let Some(mut cached) = self.cache.get(&key).await? {
            cached.from_cache = true;
            tracing::info!("verdict cache hit");
            return Ok(cached);
        }

        let verdict = self
            .run_pipeline(query_id, original_sql, candidate, run_fingerprint, forbidden_constructs)
            .await?;
        self.cache.put(&key, &verdict).await?;
        Ok(verdict)
    }

    async fn run_pipeline(
        &self,
        query_id: &str,
        original_sql: &str,
        candidate: &Candidate,
        run_fingerprint: &str,
        forbidden_constructs: &[String],
    ) -> Result<ValidationVerdict> {
        let mut gate_outcomes = Vec::with_capacity(3);
        let execution_id_prefix = format!("{query_id}-{}", candidate.candidate_id);

        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("validation semaphore is never closed");

        if !candidate.parse_ok {
            gate_outcomes.push(GateOutcome::fail(
                GateName::Static,
                "candidate failed to parse under its declared dialect",
            ));
            return Ok(self.assemble(candidate, query_id, run_fingerprint, gate_outcomes, None, None, None, None));
        }

        let parsed = self.parser.parse(&candidate.sql, &candidate.dialect)?;
        let original_parsed = self.parser.parse(original_sql, &candidate.dialect)?;
        let static_outcome = static_gate(
            candidate,
            &parsed,
            &original_parsed,
            self.parser.as_ref(),
            &self.schema,
            forbidden_constructs,
        );
        let static_passed = static_outcome.passed;
        gate_outcomes.push(static_outcome);
        if !static_passed {
            return Ok(self.assemble(candidate, query_id, run_fingerprint, gate_outcomes, None, None, None, None));
        }

        let settings = self.policy.whitelist(&to_execution_settings(&candidate.settings));

        let baseline_sample = self
            .executor
            .sample_execute(
                &format!("{execution_id_prefix}-semantic-baseline"),
                original_sql,
                &candidate.dialect,
                self.policy.sample_rows,
                &settings,
            )
            .await;
        let candidate_sample = self
            .executor
            .sample_execute(
                &format!("{execution_id_prefix}-semantic-candidate"),
                &candidate.sql,
                &candidate.dialect,
                self.policy.sample_rows,
                &settings,
            )
            .await;

        let (baseline_sample, candidate_sample) = match (baseline_sample, candidate_sample) {
            (Ok(b), Ok(c)) => (b, c),
            (Err(e), _) | (_, Err(e)) => {
                gate_outcomes.push(GateOutcome::fail(
                    GateName::Semantic,
                    format!("execution error while sampling for comparison: {e}"),
                ));
                return Ok(self.assemble(candidate, query_id, run_fingerprint, gate_outcomes, None, None, None, None));
            }
        };

        let (semantic_outcome, semantic_confidence) = semantic_gate(
            &baseline_sample,
            &candidate_sample,
            self.policy.relative_epsilon,
            self.checksums_supported,
        );
        let semantic_passed = semantic_outcome.passed;
        gate_outcomes.push(semantic_outcome);
        if !semantic_passed {
            return Ok(self.assemble(
                candidate,
                query_id,
                run_fingerprint,
                gate_outcomes,
                None,
                Some(semantic_confidence),
                None,
                None,
            ));
        }

        // Static and semantic checks can run alongside other candidates'; the
        // perf gate races the executor against itself and must not.
        drop(permit);
        let _perf_guard = self.perf_mutex.lock().await;
        let perf_result = perf_gate(
            self.executor.as_ref(),
            original_sql,
            &candidate.sql,
            &candidate.dialect,
            &settings,
            &self.policy.race_policy,
            self.policy.timeout,
            &execution_id_prefix,
        )
        .await;
        drop(_perf_guard);

        let perf = match perf_result {
            Ok(perf) => perf,
            Err(e) => {
                gate_outcomes.push(GateOutcome::fail(GateName::Perf, format!("perf measurement failed: {e}")));
                return Ok(self.assemble(
                    candidate,
                    query_id,
                    run_fingerprint,
                    gate_outcomes,
                    None,
                    Some(semantic_confidence),
                    None,
                    None,
                ));
            }
        };
        gate_outcomes.push(GateOutcome::pass(
            GateName::Perf,
            format!("measured via {:?}: {:.2}ms -> {:.2}ms", perf.method, perf.baseline_ms, perf.candidate_ms),
        ));

        let (baseline_explain, candidate_explain) = self
            .capture_explains(&execution_id_prefix, original_sql, &candidate.sql, &candidate.dialect)
            .await;

        Ok(self.assemble(
            candidate,
            query_id,
            run_fingerprint,
            gate_outcomes,
            Some(perf),
            Some(semantic_confidence),
            baseline_explain,
            candidate_explain,
        ))
    }

    /// Best-effort `EXPLAIN` capture for the feedback pack. Failures here
    /// never fail the verdict -- they only mean a retry prompt has less to
    /// work with.
    async fn capture_explains(
        &self,
        execution_id_prefix: &str,
        original_sql: &str,
        candidate_sql: &str,
        dialect: &str,
    ) -> (Option<String>, Option<String>) {
        const EXPLAIN_TRUNCATE_CHARS: usize = 2_000;
        let baseline = self
            .executor
            .explain(&format!("{execution_id_prefix}-explain-baseline"), original_sql, dialect)
            .await
            .ok()
            .map(|plan| truncate(&plan.raw, EXPLAIN_TRUNCATE_CHARS));
        let candidate = self
            .executor
            .explain(&format!("{execution_id_prefix}-explain-candidate"), candidate_sql, dialect)
            .await
            .ok()
            .map(|plan| truncate(&plan.raw, EXPLAIN_TRUNCATE_CHARS));
        (baseline, candidate)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        candidate: &Candidate,
        query_id: &str,
        run_fingerprint: &str,
        gate_outcomes: Vec<GateOutcome>,
        perf: Option<PerfMeasurement>,
        semantic_confidence: Option<SemanticConfidence>,
        baseline_explain: Option<String>,
        candidate_explain: Option<String>,
    ) -> ValidationVerdict {
        let (status, gate_failed) = build_status(&gate_outcomes, perf.as_ref(), &self.policy);
        let speedup = perf.as_ref().map(|p| p.speedup());
        let reason = match &gate_failed {
            Some(rejection) => format!("{:?} gate rejected candidate: {}", rejection.gate, rejection.reason),
            None => format!(
                "candidate classified {:?} at {:.3}x speedup",
                status,
                speedup.unwrap_or(1.0)
            ),
        };

        ValidationVerdict {
            candidate_id: candidate.candidate_id.clone(),
            query_id: query_id.to_string(),
            run_fingerprint: run_fingerprint.to_string(),
            status,
            speedup,
            gate_outcomes,
            gate_failed,
            semantic_confidence,
            perf,
            baseline_explain,
            candidate_explain,
            reason,
            computed_at: Utc::now(),
            from_cache: false,
        }
    }
}

fn to_execution_settings(settings: &HashMap<String, String>) -> ExecutionSettings {
    let mut es = ExecutionSettings::new();
    for (key, value) in settings {
        es = es.with(key.clone(), value.clone());
    }
    es
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut truncated: String = text.chars().take(max_chars).collect();
        truncated.push_str("...(truncated)");
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{normalize, RawCandidate};
    use crate::executor::{ExecutionOutcome, InMemoryExecutor, TableSchema};
    use crate::llm::TokenUsage;
    use crate::sql::{FeatureVector, SqlparserDialectParser};
    use std::time::Duration;

    fn schema() -> SchemaSnapshot {
        SchemaSnapshot {
            tables: vec![TableSchema {
                name: "orders".into(),
                columns: vec!["id".into(), "total".into()],
            }],
        }
    }

    fn harness(executor: InMemoryExecutor) -> ValidationHarness {
        ValidationHarness::new(
            Arc::new(executor),
            Arc::new(SqlparserDialectParser::new()),
            Arc::new(InMemoryVerdictCache::new()),
            schema(),
            ValidationPolicy::default(),
        )
    }

    fn candidate(sql: &str) -> Candidate {
        let parser = SqlparserDialectParser::new();
        let raw = RawCandidate {
            sql: sql.to_string(),
            dialect: "generic".to_string(),
            source: "test".to_string(),
            worker_id: Some("worker-1".to_string()),
            declared_transforms: vec![],
            examples_used: vec![],
            settings: HashMap::new(),
            token_usage: TokenUsage::default(),
        };
        normalize(raw, &FeatureVector::default(), &parser)
    }

    fn rows_outcome(row_count: usize, wall_time: Duration) -> ExecutionOutcome {
        ExecutionOutcome {
            execution_id: String::new(),
            columns: vec!["id".into()],
            rows: (0..row_count).map(|i| vec![serde_json::Value::from(i as i64)]).collect(),
            row_count,
            wall_time,
        }
    }

    #[tokio::test]
    async fn candidate_that_fails_to_parse_is_rejected_at_static_gate() {
        let executor = InMemoryExecutor::new(schema());
        let harness = harness(executor);
        let bad = candidate("SELEC GARBAGE");
        let verdict = harness
            .validate("q1", "SELECT id FROM orders", &bad, "run-1", &[])
            .await
            .unwrap();
        assert!(verdict.status.is_fail());
        assert_eq!(verdict.gate_failed.unwrap().gate, GateName::Static);
    }

    #[tokio::test]
    async fn candidate_referencing_unknown_table_is_rejected() {
        let executor = InMemoryExecutor::new(schema());
        let harness = harness(executor);
        let bad = candidate("SELECT id FROM ghost_table");
        let verdict = harness
            .validate("q1", "SELECT id FROM orders", &bad, "run-1", &[])
            .await
            .unwrap();
        assert!(verdict.status.is_fail());
        assert_eq!(verdict.gate_failed.unwrap().gate, GateName::Static);
    }

    #[tokio::test]
    async fn faster_candidate_with_matching_results_wins() {
        let original = "SELECT id FROM orders";
        let rewrite = "SELECT id FROM orders WHERE id > 0";
        let executor = InMemoryExecutor::new(schema())
            .with_fixture(original, rows_outcome(2, Duration::from_millis(100)))
            .with_fixture(rewrite, rows_outcome(2, Duration::from_millis(20)));
        let harness = harness(executor);
        let fast = candidate(rewrite);
        let verdict = harness.validate("q1", original, &fast, "run-1", &[]).await.unwrap();
        assert!(verdict.status.is_improvement(), "expected an improvement, got {:?}", verdict.status);
        assert!(verdict.speedup.unwrap() > 1.0);
    }

    #[tokio::test]
    async fn verdict_is_served_from_cache_on_second_call() {
        let original = "SELECT id FROM orders";
        let rewrite = "SELECT id FROM orders WHERE id > 0";
        let executor = InMemoryExecutor::new(schema())
            .with_fixture(original, rows_outcome(2, Duration::from_millis(100)))
            .with_fixture(rewrite, rows_outcome(2, Duration::from_millis(20)));
        let harness = harness(executor);
        let fast = candidate(rewrite);
        let first = harness.validate("q1", original, &fast, "run-1", &[]).await.unwrap();
        assert!(!first.from_cache);
        let second = harness.validate("q1", original, &fast, "run-1", &[]).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(first.status, second.status);
    }

    #[tokio::test]
    async fn mismatched_result_sets_fail_at_semantic_gate() {
        let original = "SELECT id FROM orders";
        let rewrite = "SELECT id FROM orders WHERE id > 0";
        let executor = InMemoryExecutor::new(schema())
            .with_fixture(original, rows_outcome(5, Duration::from_millis(50)))
            .with_fixture(rewrite, rows_outcome(2, Duration::from_millis(20)));
        let harness = harness(executor);
        let candidate = candidate(rewrite);
        let verdict = harness.validate("q1", original, &candidate, "run-1", &[]).await.unwrap();
        assert!(verdict.status.is_fail());
        assert_eq!(verdict.gate_failed.unwrap().gate, GateName::Semantic);
    }
}
