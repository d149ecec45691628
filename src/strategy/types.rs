//! Data model for Layer S: the analyst's briefing, per-worker assignments,
//! and the strike path's transform targeting.

use serde::{Deserialize, Serialize};

use crate::sql::TransformId;
use crate::validation::FeedbackPack;

/// Which angle a beam worker was assigned to pursue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    /// Apply a transform already demonstrated to work on this engine.
    ProvenCompound,
    /// Try a structurally different but conservative rewrite.
    StructuralAlt,
    /// Push further than the gold examples suggest, accepting more risk.
    Aggressive,
    /// Free-form: no assigned gap family, no example injection.
    Exploration,
}

impl WorkerRole {
    /// Tag used as the `worker_role` metadata entry on LLM requests so a
    /// `RoutedLlmClient` can pick a model tier for this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProvenCompound => "proven_compound",
            Self::StructuralAlt => "structural_alt",
            Self::Aggressive => "aggressive",
            Self::Exploration => "exploration",
        }
    }
}

/// One worker's brief within a beam run: which gap family to target, which
/// gold examples to show it, and free-text guidance from the analyst.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub worker_id: String,
    pub role: WorkerRole,
    pub primary_gap_family: Option<String>,
    pub example_ids: Vec<String>,
    pub hints: String,
}

/// The analyst phase's output: a read of the query's bottleneck plus the
/// worker assignments that drive fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalystBriefing {
    pub bottleneck_hypothesis: String,
    pub key_signals: Vec<String>,
    pub matched_gaps: Vec<String>,
    pub worker_assignments: Vec<WorkerAssignment>,
}

/// How strongly a strike request's transform hint constrains the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintMode {
    /// Prefer the named transform but allow others.
    Bias,
    /// The named transform must appear among the detected transforms.
    Constrain,
    /// The worker's declared transforms must be exactly this one transform.
    Only,
}

/// User-directed targeting for a `strike` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformHint {
    pub text: String,
    pub transform_id: Option<TransformId>,
    pub target_subquery: Option<String>,
    pub constraint_mode: ConstraintMode,
}

impl TransformHint {
    pub fn freeform(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            transform_id: None,
            target_subquery: None,
            constraint_mode: ConstraintMode::Bias,
        }
    }
}

/// Policy knobs shared by both strategies.
#[derive(Debug, Clone)]
pub struct StrategyPolicy {
    /// Number of concurrent beam workers (N). Ignored by strike, which is
    /// always a single worker.
    pub worker_count: usize,
    pub snipe_enabled: bool,
    /// Speedup ratio a beam run tries to clear before skipping the snipe
    /// refinement call.
    pub target_speedup: f64,
    pub max_tokens_per_worker: u32,
}

impl Default for StrategyPolicy {
    fn default() -> Self {
        Self {
            worker_count: 4,
            snipe_enabled: true,
            target_speedup: 1.10,
            max_tokens_per_worker: 2048,
        }
    }
}

/// Everything a strategy needs to produce candidates for one query. Borrowed
/// rather than owned since the caller (the run-level control flow) retains
/// all of these across the K -> S -> V pipeline.
pub struct GenerationContext<'a> {
    pub query_id: &'a str,
    pub run_fingerprint: &'a str,
    pub original_sql: &'a str,
    pub dialect: &'a str,
    pub knowledge: &'a crate::knowledge::KnowledgeResponse,
    pub history: &'a [FeedbackPack],
    pub policy: &'a StrategyPolicy,
    pub forbidden_constructs: &'a [String],
    /// User-directed targeting for a `strike` request. Ignored by `beam`,
    /// which never looks at this field -- kept on the shared context
    /// rather than threaded through a second `generate` signature so both
    /// strategies emit candidates through one contract.
    pub strike_hint: Option<&'a TransformHint>,
}
