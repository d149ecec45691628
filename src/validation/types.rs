//! Validation harness data model: policy, gate outcomes, and the verdict
//! status classification.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::executor::ExecutionSettings;

use super::race::{PerfMeasurement, RacePolicy};

/// Which gate produced a [`GateOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateName {
    Static,
    Semantic,
    Perf,
}

/// The pass/fail result and human-readable detail from one gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateOutcome {
    pub gate: GateName,
    pub passed: bool,
    pub detail: String,
}

impl GateOutcome {
    pub fn pass(gate: GateName, detail: impl Into<String>) -> Self {
        Self {
            gate,
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn fail(gate: GateName, detail: impl Into<String>) -> Self {
        Self {
            gate,
            passed: false,
            detail: detail.into(),
        }
    }
}

/// Speedup-ratio boundaries (`baseline_ms / candidate_ms`) used to classify
/// a candidate that survived the static and semantic gates. Defaults match
/// the status classification table: WIN at >= 1.10x, IMPROVED at >= 1.05x,
/// NEUTRAL at >= 0.95x, REGRESSION below that.
#[derive(Debug, Clone)]
pub struct SpeedupThresholds {
    /// Below this ratio the candidate is a regression.
    pub regression_below: f64,
    /// At or above this ratio (but below `win_at`) the candidate is a
    /// minor win; below it (but at/above `regression_below`) it's neutral.
    pub improved_at: f64,
    /// At or above this ratio the candidate is a clear win.
    pub win_at: f64,
}

impl Default for SpeedupThresholds {
    fn default() -> Self {
        Self {
            regression_below: 0.95,
            improved_at: 1.05,
            win_at: 1.10,
        }
    }
}

/// Final classification of a candidate, per spec's status table. `Fail`
/// covers both gate rejections and perf-gate errors (timeout, execution
/// failure); the other four apply only once perf measurement succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Status {
    Win,
    Improved,
    Neutral,
    Regression,
    Fail,
}

impl Status {
    /// Classifies a successful perf measurement's speedup ratio.
    pub fn classify(speedup: f64, thresholds: &SpeedupThresholds) -> Self {
        if speedup >= thresholds.win_at {
            Self::Win
        } else if speedup >= thresholds.improved_at {
            Self::Improved
        } else if speedup >= thresholds.regression_below {
            Self::Neutral
        } else {
            Self::Regression
        }
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, Self::Fail)
    }

    /// Whether this candidate is a net improvement worth surfacing to the
    /// caller as a viable rewrite.
    pub fn is_improvement(&self) -> bool {
        matches!(self, Self::Win | Self::Improved)
    }
}

/// Which gate (if any) rejected a candidate, and why. `None` when the
/// candidate survived every gate and received a perf-based [`Status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRejection {
    pub gate: GateName,
    pub reason: String,
}

/// Policy knobs for the validation harness.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    pub max_parallel_validations: usize,
    /// Relative tolerance for numeric value comparison in the semantic
    /// gate.
    pub relative_epsilon: f64,
    /// Row cap for sampled semantic comparison on large result sets.
    pub sample_rows: usize,
    pub race_policy: RacePolicy,
    pub speedup_thresholds: SpeedupThresholds,
    /// Executor settings candidates are permitted to request; anything
    /// else is stripped before `execute` is called.
    pub allowed_settings: Vec<String>,
    /// Per-query ceiling passed to the perf gate's `Executor::execute`
    /// calls. An execution that would exceed it fails with a timeout error,
    /// which the harness surfaces as a `Fail` at the perf gate.
    pub timeout: Duration,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            max_parallel_validations: 4,
            relative_epsilon: 1e-9,
            sample_rows: 10_000,
            race_policy: RacePolicy::default(),
            speedup_thresholds: SpeedupThresholds::default(),
            allowed_settings: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl ValidationPolicy {
    /// Filters `requested` down to the settings this policy allows.
    pub fn whitelist(&self, requested: &ExecutionSettings) -> ExecutionSettings {
        let mut allowed = std::collections::BTreeMap::new();
        for (key, value) in &requested.0 {
            if self.allowed_settings.iter().any(|a| a == key) {
                allowed.insert(key.clone(), value.clone());
            }
        }
        ExecutionSettings(allowed)
    }
}

/// Identifies one verdict in the cache: the candidate, the run it was
/// produced under (pins the original query + knowledge version), and a
/// hash of the validation settings that could change the outcome (epsilon,
/// sample size, executor fingerprint).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub candidate_id: String,
    pub run_fingerprint: String,
    pub validation_settings_hash: String,
}

impl CacheKey {
    pub fn new(candidate_id: impl Into<String>, run_fingerprint: impl Into<String>, policy: &ValidationPolicy, executor_fingerprint: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(policy.relative_epsilon.to_bits().to_le_bytes());
        hasher.update(policy.sample_rows.to_le_bytes());
        hasher.update(policy.timeout.as_millis().to_le_bytes());
        hasher.update(executor_fingerprint.as_bytes());
        let validation_settings_hash = format!("{:x}", hasher.finalize());

        Self {
            candidate_id: candidate_id.into(),
            run_fingerprint: run_fingerprint.into(),
            validation_settings_hash,
        }
    }
}

/// How confident the semantic gate is that a candidate's result set matches
/// the original's. Only HIGH requires a content checksum match; MEDIUM and
/// LOW progressively relax what was compared, and the dialect/policy
/// decides which is attainable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SemanticConfidence {
    High,
    Medium,
    Low,
    Skipped,
    /// Both sides returned zero rows on the sample -- the gate passes, but
    /// nothing about row/value equivalence was actually exercised.
    ZeroRowUnverified,
}

/// Structured diagnostics attached to a verdict, primarily to seed a beam
/// snipe refinement prompt or a strike retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackPack {
    pub candidate_id: String,
    pub status: Status,
    pub gate_outcomes: Vec<GateOutcome>,
    pub semantic_diagnostics: Option<String>,
    pub baseline_explain: Option<String>,
    pub candidate_explain: Option<String>,
    pub race_timings: Option<PerfMeasurement>,
    pub message: String,
}

/// The harness's final, cacheable verdict for one candidate. Fields mirror
/// spec's `ValidationVerdict`: gate pass flags are read off `gate_outcomes`
/// rather than duplicated, since a gate only ever runs once per verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub candidate_id: String,
    pub query_id: String,
    pub run_fingerprint: String,
    pub status: Status,
    /// `None` only when `status == Fail` and the perf gate never ran.
    pub speedup: Option<f64>,
    pub gate_outcomes: Vec<GateOutcome>,
    /// Which gate rejected the candidate, if any.
    pub gate_failed: Option<GateRejection>,
    pub semantic_confidence: Option<SemanticConfidence>,
    pub perf: Option<PerfMeasurement>,
    /// Truncated `EXPLAIN` output for the original query, captured
    /// best-effort when the perf gate runs. Absent if the candidate never
    /// reached perf or the executor's `explain` call failed.
    pub baseline_explain: Option<String>,
    pub candidate_explain: Option<String>,
    pub reason: String,
    pub computed_at: DateTime<Utc>,
    /// Set when this verdict was served from the verdict cache rather than
    /// freshly computed. Never persisted as `true` -- a cache hit returns a
    /// copy of the stored record with this flipped on.
    #[serde(default)]
    pub from_cache: bool,
}

impl ValidationVerdict {
    pub fn static_passed(&self) -> bool {
        self.gate_outcome(GateName::Static).map(|g| g.passed).unwrap_or(false)
    }

    pub fn semantic_passed(&self) -> bool {
        self.gate_outcome(GateName::Semantic).map(|g| g.passed).unwrap_or(false)
    }

    pub fn perf_passed(&self) -> bool {
        self.gate_outcome(GateName::Perf).map(|g| g.passed).unwrap_or(false)
    }

    fn gate_outcome(&self, gate: GateName) -> Option<&GateOutcome> {
        self.gate_outcomes.iter().find(|g| g.gate == gate)
    }

    pub fn feedback(&self) -> FeedbackPack {
        let semantic_diagnostics = self
            .gate_outcome(GateName::Semantic)
            .filter(|g| !g.passed)
            .map(|g| g.detail.clone());
        FeedbackPack {
            candidate_id: self.candidate_id.clone(),
            status: self.status,
            gate_outcomes: self.gate_outcomes.clone(),
            semantic_diagnostics,
            baseline_explain: self.baseline_explain.clone(),
            candidate_explain: self.candidate_explain.clone(),
            race_timings: self.perf.clone(),
            message: self.reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_matches_the_spec_table() {
        let thresholds = SpeedupThresholds::default();
        assert_eq!(Status::classify(0.83, &thresholds), Status::Regression);
        assert_eq!(Status::classify(0.94, &thresholds), Status::Regression);
        assert_eq!(Status::classify(0.95, &thresholds), Status::Neutral);
        assert_eq!(Status::classify(1.0, &thresholds), Status::Neutral);
        assert_eq!(Status::classify(1.04, &thresholds), Status::Neutral);
        assert_eq!(Status::classify(1.05, &thresholds), Status::Improved);
        assert_eq!(Status::classify(1.09, &thresholds), Status::Improved);
        assert_eq!(Status::classify(1.10, &thresholds), Status::Win);
        assert_eq!(Status::classify(2.0, &thresholds), Status::Win);
    }

    #[test]
    fn cache_key_is_stable_for_identical_inputs() {
        let policy = ValidationPolicy::default();
        let a = CacheKey::new("cand-1", "run-1", &policy, "duckdb-v1");
        let b = CacheKey::new("cand-1", "run-1", &policy, "duckdb-v1");
        assert_eq!(a, b);
    }

    #[test]
    fn cache_key_differs_when_executor_fingerprint_differs() {
        let policy = ValidationPolicy::default();
        let a = CacheKey::new("cand-1", "run-1", &policy, "duckdb-v1");
        let b = CacheKey::new("cand-1", "run-1", &policy, "duckdb-v2");
        assert_ne!(a.validation_settings_hash, b.validation_settings_hash);
    }

    #[test]
    fn whitelist_drops_unapproved_settings() {
        let mut policy = ValidationPolicy::default();
        policy.allowed_settings = vec!["work_mem".to_string()];
        let requested = ExecutionSettings::new()
            .with("work_mem", "64MB")
            .with("statement_timeout", "0");
        let filtered = policy.whitelist(&requested);
        assert_eq!(filtered.0.len(), 1);
        assert!(filtered.0.contains_key("work_mem"));
    }
}
