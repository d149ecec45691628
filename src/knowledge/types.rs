//! Data model for the knowledge retrieval layer.

use serde::{Deserialize, Serialize};

use crate::sql::{FeatureVector, TransformId};

/// A boolean condition over a statement's [`FeatureVector`], used by gaps,
/// strengths, and tuning rules to describe when they apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstructPredicate {
    Has(String),
    Not(Box<ConstructPredicate>),
    All(Vec<ConstructPredicate>),
    Any(Vec<ConstructPredicate>),
}

impl ConstructPredicate {
    pub fn has(construct: impl Into<String>) -> Self {
        Self::Has(construct.into())
    }

    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }

    pub fn evaluate(&self, features: &FeatureVector) -> bool {
        match self {
            Self::Has(construct) => features.has_construct(construct),
            Self::Not(inner) => !inner.evaluate(features),
            Self::All(preds) => preds.iter().all(|p| p.evaluate(features)),
            Self::Any(preds) => preds.iter().any(|p| p.evaluate(features)),
        }
    }
}

/// How urgently a gap should be exploited relative to its peers, surfaced
/// to the analyst so worker assignment can favor higher-priority gaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPriority {
    Low,
    Medium,
    High,
}

impl Default for GapPriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// How strongly a fired gap should be trusted, elevated/lowered from the
/// default by the gap's own `high_when`/`low_when` predicates rather than
/// fixed at authoring time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapConfidence {
    Low,
    Normal,
    High,
}

/// Positive and negative field evidence backing a gap, recorded as free
/// text query references rather than structured IDs -- the engine profile
/// is a human-authored document and this is where its authors' judgment
/// calls live.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Query references where exploiting this gap measurably helped.
    #[serde(default)]
    pub what_worked: Vec<String>,
    /// Query references where attempting to exploit this gap backfired or
    /// made no difference.
    #[serde(default)]
    pub what_didnt_work: Vec<String>,
    /// Free-text observations that don't fit either bucket.
    #[serde(default)]
    pub field_notes: Vec<String>,
}

impl Evidence {
    /// A gap is only actionable once someone has actually seen it help;
    /// retrieval excludes gaps lacking this even when their `predicate`
    /// fires.
    pub fn has_positive_evidence(&self) -> bool {
        !self.what_worked.is_empty()
    }
}

/// A known weakness of the target engine for a given construct, e.g.
/// "planner doesn't push predicates through this kind of correlated
/// subquery."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub priority: GapPriority,
    /// The gap fires when this predicate evaluates true and no `skip`
    /// predicate fires.
    #[serde(rename = "match")]
    pub predicate: ConstructPredicate,
    /// Suppresses an otherwise-firing gap, e.g. a construct that looks
    /// exploitable but is already handled by a known rewrite elsewhere.
    #[serde(default)]
    pub skip: Option<ConstructPredicate>,
    /// When this fires on top of `predicate`, the gap's confidence is
    /// elevated to [`GapConfidence::High`].
    #[serde(default)]
    pub high_when: Option<ConstructPredicate>,
    /// When this fires on top of `predicate`, the gap's confidence is
    /// lowered to [`GapConfidence::Low`]. Evaluated after `high_when`; a
    /// gap where both fire is `High` -- `high_when` is the author's stronger
    /// claim and wins the tie.
    #[serde(default)]
    pub low_when: Option<ConstructPredicate>,
    #[serde(default)]
    pub evidence: Evidence,
    /// IDs of [`GoldExample`]s that demonstrate working around this gap.
    /// May reference example IDs absent from the loaded corpus; that is a
    /// non-fatal integrity warning, not a load error.
    #[serde(default)]
    pub demonstrates_via: Vec<String>,
}

impl Gap {
    /// Evaluates this gap against `features`, returning the confidence it
    /// fired at, or `None` if it didn't fire (predicate false, a `skip`
    /// predicate fired, or it lacks the positive evidence retrieval
    /// requires of every surfaced gap).
    pub fn fires(&self, features: &FeatureVector) -> Option<GapConfidence> {
        if !self.predicate.evaluate(features) {
            return None;
        }
        if let Some(skip) = &self.skip {
            if skip.evaluate(features) {
                return None;
            }
        }
        if !self.evidence.has_positive_evidence() {
            return None;
        }
        let high = self.high_when.as_ref().map(|p| p.evaluate(features)).unwrap_or(false);
        let low = self.low_when.as_ref().map(|p| p.evaluate(features)).unwrap_or(false);
        Some(if high {
            GapConfidence::High
        } else if low {
            GapConfidence::Low
        } else {
            GapConfidence::Normal
        })
    }
}

/// A gap that fired for a specific query, paired with the confidence that
/// firing earned -- the shape [`KnowledgeResponse::applicable_gaps`]
/// actually surfaces, since "did this gap apply" and "how much should a
/// worker trust it" are both per-query facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicableGap {
    pub gap: Gap,
    pub confidence: GapConfidence,
}

/// A known strength of the target engine -- the search strategy should
/// avoid rewriting constructs the engine already handles well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strength {
    pub id: String,
    pub description: String,
    pub predicate: ConstructPredicate,
}

/// Engine-specific tuning guidance surfaced to the analyst/worker prompts
/// when its predicate matches the query under optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningRule {
    pub id: String,
    pub applies_when: ConstructPredicate,
    pub guidance: String,
}

/// A construct the target engine profile forbids outright (not merely
/// discouraged -- attempting it fails the static gate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: String,
    pub forbidden_construct: String,
    pub reason: String,
}

/// The four-part explanation every gold example carries, rendered
/// verbatim into worker prompts so a worker sees not just "what changed"
/// but the judgment calls behind it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub what_transformed: String,
    pub why_it_helps: String,
    pub when_to_apply: String,
    pub when_not_to_apply: String,
}

/// A demonstrated rewrite: an original query, its engine-appropriate
/// rewritten form, and the transforms that relate them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldExample {
    pub id: String,
    pub dialect: String,
    pub original_sql: String,
    pub rewritten_sql: String,
    #[serde(default)]
    pub explanation: Explanation,
    /// Whether this example's speedup was validated against a real
    /// dataset at production scale rather than a toy benchmark.
    #[serde(default)]
    pub validated_at_scale: bool,
    /// Measured speedup (candidate-over-original) the example was
    /// validated with. Used to break ranking ties among otherwise
    /// equally-relevant matches -- a higher validated win is preferred.
    #[serde(default = "default_outcome_speedup")]
    pub outcome_speedup: f64,
    #[serde(default)]
    pub transform_ids: Vec<TransformId>,
    /// Gap IDs this example demonstrates a workaround for. May be dangling;
    /// see [`Gap::demonstrates_via`].
    #[serde(default)]
    pub demonstrates_gaps: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_outcome_speedup() -> f64 {
    1.0
}

/// Everything known about one target engine/dialect combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineProfile {
    pub engine_name: String,
    pub dialect: String,
    pub version: Option<String>,
    #[serde(default)]
    pub gaps: Vec<Gap>,
    #[serde(default)]
    pub strengths: Vec<Strength>,
    #[serde(default)]
    pub tuning_rules: Vec<TuningRule>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl EngineProfile {
    pub fn forbidden_constructs(&self) -> Vec<String> {
        self.constraints
            .iter()
            .map(|c| c.forbidden_construct.clone())
            .collect()
    }
}

/// What the knowledge layer hands to the search strategy for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeResponse {
    /// Content hash of the engine profile + corpus this response was
    /// derived from, so a `RunManifest` can pin the exact knowledge state
    /// a run used.
    pub knowledge_version: String,
    pub engine_profile: EngineProfile,
    pub matched_examples: Vec<GoldExample>,
    pub applicable_gaps: Vec<ApplicableGap>,
    pub applicable_strengths: Vec<Strength>,
    pub applicable_tuning_rules: Vec<TuningRule>,
}
