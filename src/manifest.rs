//! The run manifest: written once at invocation start, immutable
//! thereafter, and the other half (with `candidate_id`-keyed caching) of
//! the crate's reproducibility contract -- two runs with identical
//! manifests validating identical candidates must yield identical
//! verdicts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::strategy::StrategyPolicy;
use crate::validation::ValidationPolicy;

/// A stable identifier for the engine + environment + dataset a run
/// executed against. Verdicts computed under different fingerprints are
/// incomparable and never share a verdict-cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEnvironment {
    pub engine_name: String,
    pub engine_version: String,
    pub dataset_id: String,
    pub scale_factor: f64,
    /// Engine-specific environment knobs that affect perf measurement --
    /// buffer sizes, parallelism, memory limits -- serialized in whatever
    /// shape the executor adapter reports them.
    pub settings: serde_json::Value,
}

impl EngineEnvironment {
    /// A stable hash over every field, forming the bulk of the run
    /// fingerprint the verdict cache keys on.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.engine_name.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.engine_version.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.dataset_id.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.scale_factor.to_bits().to_le_bytes());
        if let Ok(bytes) = serde_json::to_vec(&self.settings) {
            hasher.update(&bytes);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Transform allow/block lists and the forbidden-construct set a run's
/// candidates are held to. Consumed by the static gate and by strategies
/// deciding whether detected transforms are in scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformPolicy {
    pub allowed_transforms: Option<Vec<String>>,
    pub blocked_transforms: Vec<String>,
    pub forbidden_constructs: Vec<String>,
}

impl TransformPolicy {
    /// Whether `transform_id` is permitted: a non-empty allowlist makes
    /// everything else implicitly blocked; otherwise only the blocklist is
    /// consulted.
    pub fn permits(&self, transform_id: &str) -> bool {
        if self.blocked_transforms.iter().any(|t| t == transform_id) {
            return false;
        }
        match &self.allowed_transforms {
            Some(allowed) => allowed.iter().any(|t| t == transform_id),
            None => true,
        }
    }
}

/// Git/version lineage recorded for provenance, best-effort: the core
/// never shells out to discover these itself (that belongs to the CLI/
/// front-end collaborator), so a caller supplies what it knows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lineage {
    pub git_sha: Option<String>,
    pub version: Option<String>,
}

/// Written exactly once at invocation start, before any candidate
/// generation begins, and never modified thereafter. Any consumer
/// comparing verdicts across runs must check that both manifests'
/// `environment.fingerprint()` match; otherwise the results are
/// incomparable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    /// Timestamped, unique per invocation -- e.g. `run-20260315T120000Z-<uuid>`.
    pub run_id: String,
    pub benchmark_id: String,
    pub environment: EngineEnvironment,
    pub strategy_policy: StrategyPolicySummary,
    pub validation_policy: ValidationPolicySummary,
    pub transform_policy: TransformPolicy,
    pub lineage: Lineage,
    pub knowledge_version: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A manifest-friendly snapshot of [`StrategyPolicy`]'s fields that affect
/// reproducibility -- mode/worker-count/model rather than transient
/// runtime handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyPolicySummary {
    pub mode: String,
    pub worker_count: usize,
    pub snipe_enabled: bool,
    pub target_speedup: f64,
}

impl StrategyPolicySummary {
    pub fn new(mode: impl Into<String>, policy: &StrategyPolicy) -> Self {
        Self {
            mode: mode.into(),
            worker_count: policy.worker_count,
            snipe_enabled: policy.snipe_enabled,
            target_speedup: policy.target_speedup,
        }
    }
}

/// A manifest-friendly snapshot of [`ValidationPolicy`]'s fields that
/// affect reproducibility -- method/thresholds/timeouts/sample percentage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationPolicySummary {
    pub relative_epsilon: f64,
    pub sample_rows: usize,
    pub regression_below: f64,
    pub improved_at: f64,
    pub win_at: f64,
    pub grace_period: f64,
    pub trimmed_mean_runs: usize,
    /// Baseline duration, in milliseconds, at or above which the perf gate
    /// races rather than falling back to sequential trimmed-mean timing.
    pub race_threshold_ms: f64,
    pub timeout_ms: u64,
}

impl ValidationPolicySummary {
    pub fn new(policy: &ValidationPolicy) -> Self {
        Self {
            relative_epsilon: policy.relative_epsilon,
            sample_rows: policy.sample_rows,
            regression_below: policy.speedup_thresholds.regression_below,
            improved_at: policy.speedup_thresholds.improved_at,
            win_at: policy.speedup_thresholds.win_at,
            grace_period: policy.race_policy.grace_period,
            trimmed_mean_runs: policy.race_policy.trimmed_mean_runs,
            race_threshold_ms: policy.race_policy.race_threshold_ms,
            timeout_ms: policy.timeout.as_millis() as u64,
        }
    }
}

impl RunManifest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: impl Into<String>,
        benchmark_id: impl Into<String>,
        environment: EngineEnvironment,
        mode: impl Into<String>,
        strategy_policy: &StrategyPolicy,
        validation_policy: &ValidationPolicy,
        transform_policy: TransformPolicy,
        lineage: Lineage,
        knowledge_version: impl Into<String>,
        created_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            benchmark_id: benchmark_id.into(),
            environment,
            strategy_policy: StrategyPolicySummary::new(mode, strategy_policy),
            validation_policy: ValidationPolicySummary::new(validation_policy),
            transform_policy,
            lineage,
            knowledge_version: knowledge_version.into(),
            created_at,
        }
    }

    /// The run fingerprint used as part of the verdict cache key: the
    /// environment's fingerprint alone, since dataset/scale/engine version
    /// are exactly the dimensions a cached verdict must not cross.
    pub fn run_fingerprint(&self) -> String {
        self.environment.fingerprint()
    }

    /// Whether `other`'s verdicts are directly comparable to this run's.
    pub fn comparable_to(&self, other: &RunManifest) -> bool {
        self.run_fingerprint() == other.run_fingerprint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environment() -> EngineEnvironment {
        EngineEnvironment {
            engine_name: "duckdb".into(),
            engine_version: "1.1.0".into(),
            dataset_id: "tpch".into(),
            scale_factor: 10.0,
            settings: serde_json::json!({"threads": 4}),
        }
    }

    #[test]
    fn fingerprint_is_stable_for_identical_environments() {
        let a = environment().fingerprint();
        let b = environment().fingerprint();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_changes_with_scale_factor() {
        let mut env = environment();
        let a = env.fingerprint();
        env.scale_factor = 100.0;
        let b = env.fingerprint();
        assert_ne!(a, b);
    }

    #[test]
    fn manifests_with_matching_fingerprints_are_comparable() {
        let manifest_a = RunManifest::new(
            "run-1",
            "bench-1",
            environment(),
            "beam",
            &StrategyPolicy::default(),
            &ValidationPolicy::default(),
            TransformPolicy::default(),
            Lineage::default(),
            "kv-1",
            chrono::Utc::now(),
        );
        let manifest_b = RunManifest::new(
            "run-2",
            "bench-1",
            environment(),
            "beam",
            &StrategyPolicy::default(),
            &ValidationPolicy::default(),
            TransformPolicy::default(),
            Lineage::default(),
            "kv-1",
            chrono::Utc::now(),
        );
        assert!(manifest_a.comparable_to(&manifest_b));
    }

    #[test]
    fn manifests_with_different_environments_are_not_comparable() {
        let mut env_b = environment();
        env_b.scale_factor = 1.0;
        let manifest_a = RunManifest::new(
            "run-1",
            "bench-1",
            environment(),
            "beam",
            &StrategyPolicy::default(),
            &ValidationPolicy::default(),
            TransformPolicy::default(),
            Lineage::default(),
            "kv-1",
            chrono::Utc::now(),
        );
        let manifest_b = RunManifest::new(
            "run-2",
            "bench-1",
            env_b,
            "beam",
            &StrategyPolicy::default(),
            &ValidationPolicy::default(),
            TransformPolicy::default(),
            Lineage::default(),
            "kv-1",
            chrono::Utc::now(),
        );
        assert!(!manifest_a.comparable_to(&manifest_b));
    }

    #[test]
    fn transform_policy_allowlist_is_exclusive() {
        let policy = TransformPolicy {
            allowed_transforms: Some(vec!["cte_extraction".into()]),
            blocked_transforms: vec![],
            forbidden_constructs: vec![],
        };
        assert!(policy.permits("cte_extraction"));
        assert!(!policy.permits("predicate_pushdown"));
    }

    #[test]
    fn transform_policy_blocklist_overrides_allowlist() {
        let policy = TransformPolicy {
            allowed_transforms: Some(vec!["cte_extraction".into()]),
            blocked_transforms: vec!["cte_extraction".into()],
            forbidden_constructs: vec![],
        };
        assert!(!policy.permits("cte_extraction"));
    }

    #[test]
    fn no_allowlist_means_only_blocklist_is_enforced() {
        let policy = TransformPolicy {
            allowed_transforms: None,
            blocked_transforms: vec!["drop_cascade".into()],
            forbidden_constructs: vec![],
        };
        assert!(policy.permits("predicate_pushdown"));
        assert!(!policy.permits("drop_cascade"));
    }
}
