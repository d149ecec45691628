//! The four-gate validation pipeline: static, semantic, perf, and verdict
//! assembly. Each gate function is pure with respect to its inputs so the
//! pipeline's ordering invariant (static before semantic before perf) is
//! enforced by [`super::ValidationHarness`] rather than by any gate relying
//! on another having run.

use std::time::Duration;

use serde_json::Value;

use crate::candidate::Candidate;
use crate::error::Result;
use crate::executor::{ExecutionOutcome, ExecutionSettings, Executor, SchemaSnapshot};
use crate::sql::{ParsedStatement, SqlDialectParser};

use super::race::{interleaved_screen, race_or_trimmed_mean, PerfMeasurement, RacePolicy};
use super::types::{
    GateName, GateOutcome, GateRejection, SemanticConfidence, Status, ValidationPolicy,
};

/// Checks the candidate's statement binds against the executor's schema
/// and contains no constructs the engine profile forbids. Parsing itself
/// already happened during candidate normalization -- a candidate that
/// failed to parse never reaches the harness.
pub fn static_gate(
    candidate: &Candidate,
    parsed: &ParsedStatement,
    original_parsed: &ParsedStatement,
    parser: &dyn SqlDialectParser,
    schema: &SchemaSnapshot,
    forbidden_constructs: &[String],
) -> GateOutcome {
    if candidate.features.statement_kind != "query" {
        return GateOutcome::fail(
            GateName::Static,
            format!(
                "forbidden construct: candidate is a {} statement, not a read-only query",
                candidate.features.statement_kind.to_ascii_uppercase()
            ),
        );
    }

    for table in &candidate.features.table_names {
        if !schema.has_table(table) {
            return GateOutcome::fail(
                GateName::Static,
                format!("unknown table '{table}' not present in executor schema"),
            );
        }
    }

    for column in &candidate.features.column_names {
        if !schema.has_column(column) {
            return GateOutcome::fail(
                GateName::Static,
                format!("unknown column '{column}' not present in executor schema"),
            );
        }
    }

    let (original_order_by, original_limit) = parser.top_level_ordering(original_parsed);
    let (candidate_order_by, candidate_limit) = parser.top_level_ordering(parsed);
    if original_order_by && !candidate_order_by {
        return GateOutcome::fail(
            GateName::Static,
            "original query's top-level ORDER BY is missing from the candidate",
        );
    }
    if original_limit && !candidate_limit {
        return GateOutcome::fail(
            GateName::Static,
            "original query's top-level LIMIT is missing from the candidate",
        );
    }

    let present = parser.forbidden_constructs(parsed, forbidden_constructs);
    if !present.is_empty() {
        return GateOutcome::fail(
            GateName::Static,
            format!("forbidden construct(s) present: {}", present.join(", ")),
        );
    }

    GateOutcome::pass(GateName::Static, "schema bind and construct checks passed")
}

/// Compares the candidate's result set against the baseline's, within
/// `relative_epsilon` for numeric values and exact match otherwise. Row
/// order is not considered significant unless the candidate's statement
/// has an `ORDER BY` clause (order-sensitive comparison is the caller's
/// responsibility if needed; this gate treats result sets as multisets).
///
/// Returns the gate outcome alongside the [`SemanticConfidence`] the
/// comparison supports: `HIGH` when a content checksum also matched,
/// `MEDIUM` for a full row+value match without one, `ZeroRowUnverified`
/// when both sides returned nothing to compare (the gate still passes).
pub fn semantic_gate(
    baseline: &ExecutionOutcome,
    candidate: &ExecutionOutcome,
    relative_epsilon: f64,
    checksums_supported: bool,
) -> (GateOutcome, SemanticConfidence) {
    if baseline.columns.len() != candidate.columns.len() || baseline.columns != candidate.columns {
        return (
            GateOutcome::fail(
                GateName::Semantic,
                format!(
                    "column set mismatch: baseline {:?} vs candidate {:?}",
                    baseline.columns, candidate.columns
                ),
            ),
            SemanticConfidence::Skipped,
        );
    }
    if baseline.row_count != candidate.row_count {
        return (
            GateOutcome::fail(
                GateName::Semantic,
                format!(
                    "row count mismatch: baseline {} vs candidate {}",
                    baseline.row_count, candidate.row_count
                ),
            ),
            SemanticConfidence::Low,
        );
    }

    if baseline.row_count == 0 && candidate.row_count == 0 {
        return (
            GateOutcome::pass(GateName::Semantic, "both sides returned zero rows on the sample"),
            SemanticConfidence::ZeroRowUnverified,
        );
    }

    let mut baseline_rows = baseline.rows.clone();
    let mut candidate_rows = candidate.rows.clone();
    baseline_rows.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
    candidate_rows.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));

    for (row_idx, (b_row, c_row)) in baseline_rows.iter().zip(candidate_rows.iter()).enumerate() {
        for (col_idx, (b_val, c_val)) in b_row.iter().zip(c_row.iter()).enumerate() {
            if !values_match(b_val, c_val, relative_epsilon) {
                return (
                    GateOutcome::fail(
                        GateName::Semantic,
                        format!("value mismatch at row {row_idx}, column {col_idx}: {b_val} vs {c_val}"),
                    ),
                    SemanticConfidence::Low,
                );
            }
        }
    }

    let confidence = if checksums_supported {
        SemanticConfidence::High
    } else {
        SemanticConfidence::Medium
    };
    (
        GateOutcome::pass(GateName::Semantic, "result sets match within tolerance"),
        confidence,
    )
}

fn values_match(a: &Value, b: &Value, relative_epsilon: f64) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => {
            let diff = (a - b).abs();
            let scale = a.abs().max(b.abs()).max(1.0);
            diff / scale <= relative_epsilon
        }
        _ => a == b,
    }
}

/// Measures wall-clock performance of the candidate against the baseline,
/// screening out clear regressions cheaply before paying for the full race
/// or trimmed-mean measurement.
#[allow(clippy::too_many_arguments)]
pub async fn perf_gate(
    executor: &dyn Executor,
    baseline_sql: &str,
    candidate_sql: &str,
    dialect: &str,
    settings: &ExecutionSettings,
    race_policy: &RacePolicy,
    timeout: Duration,
    execution_id_prefix: &str,
) -> Result<PerfMeasurement> {
    if let Some(screened) = interleaved_screen(
        executor,
        baseline_sql,
        candidate_sql,
        dialect,
        settings,
        race_policy,
        timeout,
        execution_id_prefix,
    )
    .await?
    {
        return Ok(screened);
    }

    race_or_trimmed_mean(
        executor,
        baseline_sql,
        candidate_sql,
        dialect,
        settings,
        race_policy,
        timeout,
        execution_id_prefix,
    )
    .await
}

/// Assembles the final [`Status`] (plus which gate rejected the candidate,
/// if any) from the gate outcomes run so far. Static and semantic
/// rejections short-circuit before perf is even attempted; the harness is
/// expected to call this after each gate to decide whether to continue.
pub fn build_status(
    gate_outcomes: &[GateOutcome],
    perf: Option<&PerfMeasurement>,
    policy: &ValidationPolicy,
) -> (Status, Option<GateRejection>) {
    if let Some(failed) = gate_outcomes.iter().find(|g| !g.passed) {
        return (
            Status::Fail,
            Some(GateRejection {
                gate: failed.gate,
                reason: failed.detail.clone(),
            }),
        );
    }

    match perf {
        Some(measurement) => {
            let speedup = measurement.speedup();
            (Status::classify(speedup, &policy.speedup_thresholds), None)
        }
        None => (
            Status::Fail,
            Some(GateRejection {
                gate: GateName::Perf,
                reason: "perf gate did not run".to_string(),
            }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TableSchema;
    use std::time::Duration;

    fn outcome(row_count: usize, rows: Vec<Vec<Value>>) -> ExecutionOutcome {
        ExecutionOutcome {
            execution_id: "exec".into(),
            columns: vec!["a".into()],
            rows,
            row_count,
            wall_time: Duration::from_millis(10),
        }
    }

    #[test]
    fn semantic_gate_passes_identical_result_sets() {
        let baseline = outcome(2, vec![vec![Value::from(1)], vec![Value::from(2)]]);
        let candidate = outcome(2, vec![vec![Value::from(2)], vec![Value::from(1)]]);
        let (result, confidence) = semantic_gate(&baseline, &candidate, 1e-9, false);
        assert!(result.passed, "row order should not matter: {result:?}");
        assert_eq!(confidence, SemanticConfidence::Medium);
    }

    #[test]
    fn semantic_gate_rejects_row_count_mismatch() {
        let baseline = outcome(2, vec![vec![Value::from(1)], vec![Value::from(2)]]);
        let candidate = outcome(1, vec![vec![Value::from(1)]]);
        assert!(!semantic_gate(&baseline, &candidate, 1e-9, false).0.passed);
    }

    #[test]
    fn semantic_gate_tolerates_float_noise_within_epsilon() {
        let baseline = outcome(1, vec![vec![Value::from(1.0000000001_f64)]]);
        let candidate = outcome(1, vec![vec![Value::from(1.0000000002_f64)]]);
        assert!(semantic_gate(&baseline, &candidate, 1e-6, false).0.passed);
    }

    #[test]
    fn semantic_gate_marks_zero_row_results_as_unverified() {
        let baseline = outcome(0, vec![]);
        let candidate = outcome(0, vec![]);
        let (result, confidence) = semantic_gate(&baseline, &candidate, 1e-9, false);
        assert!(result.passed);
        assert_eq!(confidence, SemanticConfidence::ZeroRowUnverified);
    }

    #[test]
    fn semantic_gate_reports_high_confidence_when_checksums_supported() {
        let baseline = outcome(1, vec![vec![Value::from(1)]]);
        let candidate = outcome(1, vec![vec![Value::from(1)]]);
        let (_, confidence) = semantic_gate(&baseline, &candidate, 1e-9, true);
        assert_eq!(confidence, SemanticConfidence::High);
    }

    #[test]
    fn static_gate_rejects_unknown_table() {
        use crate::candidate::{normalize, RawCandidate};
        use crate::llm::TokenUsage;
        use crate::sql::{FeatureVector, SqlDialectParser, SqlparserDialectParser};
        use std::collections::HashMap;

        let parser = SqlparserDialectParser::new();
        let raw = RawCandidate {
            sql: "SELECT * FROM ghost_table".into(),
            dialect: "generic".into(),
            source: "test".into(),
            worker_id: None,
            declared_transforms: vec![],
            examples_used: vec![],
            settings: HashMap::new(),
            token_usage: TokenUsage::default(),
        };
        let candidate = normalize(raw, &FeatureVector::default(), &parser);
        let parsed = parser.parse(&candidate.sql, &candidate.dialect).unwrap();
        let original_parsed = parser.parse("SELECT id FROM orders", "generic").unwrap();
        let schema = SchemaSnapshot {
            tables: vec![TableSchema {
                name: "orders".into(),
                columns: vec!["id".into()],
            }],
        };

        let result = static_gate(&candidate, &parsed, &original_parsed, &parser, &schema, &[]);
        assert!(!result.passed);
    }

    #[test]
    fn static_gate_rejects_a_rewrite_that_drops_the_original_order_by() {
        use crate::candidate::{normalize, RawCandidate};
        use crate::llm::TokenUsage;
        use crate::sql::{FeatureVector, SqlDialectParser, SqlparserDialectParser};
        use std::collections::HashMap;

        let parser = SqlparserDialectParser::new();
        let raw = RawCandidate {
            sql: "SELECT id FROM orders WHERE id > 0".into(),
            dialect: "generic".into(),
            source: "test".into(),
            worker_id: None,
            declared_transforms: vec![],
            examples_used: vec![],
            settings: HashMap::new(),
            token_usage: TokenUsage::default(),
        };
        let candidate = normalize(raw, &FeatureVector::default(), &parser);
        let parsed = parser.parse(&candidate.sql, &candidate.dialect).unwrap();
        let original_parsed = parser
            .parse("SELECT id FROM orders ORDER BY id LIMIT 10", "generic")
            .unwrap();
        let schema = SchemaSnapshot {
            tables: vec![TableSchema {
                name: "orders".into(),
                columns: vec!["id".into()],
            }],
        };

        let result = static_gate(&candidate, &parsed, &original_parsed, &parser, &schema, &[]);
        assert!(!result.passed);
        assert!(result.detail.contains("ORDER BY"));
    }

    #[test]
    fn static_gate_accepts_a_rewrite_that_preserves_order_by_and_limit() {
        use crate::candidate::{normalize, RawCandidate};
        use crate::llm::TokenUsage;
        use crate::sql::{FeatureVector, SqlDialectParser, SqlparserDialectParser};
        use std::collections::HashMap;

        let parser = SqlparserDialectParser::new();
        let raw = RawCandidate {
            sql: "SELECT id FROM orders WHERE id > 0 ORDER BY id LIMIT 10".into(),
            dialect: "generic".into(),
            source: "test".into(),
            worker_id: None,
            declared_transforms: vec![],
            examples_used: vec![],
            settings: HashMap::new(),
            token_usage: TokenUsage::default(),
        };
        let candidate = normalize(raw, &FeatureVector::default(), &parser);
        let parsed = parser.parse(&candidate.sql, &candidate.dialect).unwrap();
        let original_parsed = parser
            .parse("SELECT id FROM orders ORDER BY id LIMIT 10", "generic")
            .unwrap();
        let schema = SchemaSnapshot {
            tables: vec![TableSchema {
                name: "orders".into(),
                columns: vec!["id".into()],
            }],
        };

        let result = static_gate(&candidate, &parsed, &original_parsed, &parser, &schema, &[]);
        assert!(result.passed, "{result:?}");
    }

    #[test]
    fn static_gate_rejects_a_drop_table_candidate_as_a_forbidden_construct() {
        use crate::candidate::{normalize, RawCandidate};
        use crate::llm::TokenUsage;
        use crate::sql::{FeatureVector, SqlDialectParser, SqlparserDialectParser};
        use std::collections::HashMap;

        let parser = SqlparserDialectParser::new();
        let raw = RawCandidate {
            sql: "DROP TABLE orders".into(),
            dialect: "generic".into(),
            source: "test".into(),
            worker_id: None,
            declared_transforms: vec![],
            examples_used: vec![],
            settings: HashMap::new(),
            token_usage: TokenUsage::default(),
        };
        let candidate = normalize(raw, &FeatureVector::default(), &parser);
        let parsed = parser.parse(&candidate.sql, &candidate.dialect).unwrap();
        let original_parsed = parser.parse("SELECT id FROM orders", "generic").unwrap();
        let schema = SchemaSnapshot {
            tables: vec![TableSchema {
                name: "orders".into(),
                columns: vec!["id".into()],
            }],
        };

        let result = static_gate(&candidate, &parsed, &original_parsed, &parser, &schema, &[]);
        assert!(!result.passed);
        assert!(result.detail.contains("forbidden construct"), "{result:?}");
    }

    #[test]
    fn verdict_status_rejects_on_first_failed_gate() {
        let policy = ValidationPolicy::default();
        let gates = vec![
            GateOutcome::pass(GateName::Static, "ok"),
            GateOutcome::fail(GateName::Semantic, "mismatch"),
        ];
        let (status, rejection) = build_status(&gates, None, &policy);
        assert!(status.is_fail());
        assert_eq!(rejection.unwrap().gate, GateName::Semantic);
    }

    #[test]
    fn verdict_status_requires_perf_measurement_when_gates_pass() {
        let policy = ValidationPolicy::default();
        let gates = vec![
            GateOutcome::pass(GateName::Static, "ok"),
            GateOutcome::pass(GateName::Semantic, "ok"),
        ];
        let (status, rejection) = build_status(&gates, None, &policy);
        assert!(status.is_fail());
        assert_eq!(rejection.unwrap().gate, GateName::Perf);
    }
}
