//! Candidate representation and the normalization pipeline that turns raw
//! worker output into deduplicated, comparable candidates.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::llm::TokenUsage;
use crate::sql::{self, FeatureVector, SqlDialectParser, TransformId};

/// A rewritten query produced by a search strategy worker, normalized so
/// that two workers arriving at the same rewrite collapse to one entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// SHA-256 hex digest of `canonical_sql || "\0" || dialect`. Stable
    /// across workers and runs: the same rewrite always gets the same ID.
    /// Candidates that failed to parse hash the raw SQL instead, since they
    /// have no canonical form -- they are never deduplicated against a
    /// parseable candidate as a result.
    pub candidate_id: String,
    pub sql: String,
    /// Empty when `parse_ok` is false.
    pub canonical_sql: String,
    pub dialect: String,
    /// Which strategy/worker produced this candidate, e.g.
    /// `"beam:worker-2"` or `"strike"`. Purely descriptive -- dedup never
    /// considers source.
    pub source: String,
    /// Identity of the individual worker within its strategy, when one
    /// exists (absent for `strike`, which has a single worker).
    pub worker_id: Option<String>,
    pub declared_transforms: Vec<TransformId>,
    pub detected_transforms: Vec<TransformId>,
    /// Gold example IDs the worker was shown when producing this rewrite.
    /// On dedup, the union across every worker that produced this candidate.
    pub examples_used: Vec<String>,
    /// Executor settings this candidate requires (whitelisted against the
    /// engine profile by the validation harness, not here).
    pub settings: HashMap<String, String>,
    pub token_usage: TokenUsage,
    pub features: FeatureVector,
    /// Whether the candidate's SQL parsed under its declared dialect. A
    /// parse failure is recorded here, not dropped -- the static gate is
    /// the authority that rejects it, with a proper reason attached.
    pub parse_ok: bool,
    /// Whether the candidate's output column set matches the original's.
    /// `false` when either side failed to parse.
    pub column_set_match: bool,
    /// 0.0 (identical) to 1.0 (maximally different) structural distance
    /// from the original, used to order candidates for downstream
    /// iteration and as a tie-breaker in ranking.
    pub structural_diff_score: f64,
    /// Index into the dedup group this candidate was collapsed from,
    /// i.e. how many distinct workers produced a canonically identical
    /// rewrite. `0` for candidates no other worker matched.
    pub dedup_group_size: usize,
}

/// Inputs needed to normalize one worker's raw output into a [`Candidate`].
pub struct RawCandidate {
    pub sql: String,
    pub dialect: String,
    pub source: String,
    pub worker_id: Option<String>,
    pub declared_transforms: Vec<TransformId>,
    pub examples_used: Vec<String>,
    pub settings: HashMap<String, String>,
    pub token_usage: TokenUsage,
}

/// Parses, canonicalizes, and computes the detected transforms and
/// structural features for one raw candidate. Never fails: a candidate
/// that cannot be parsed is still emitted, with `parse_ok = false` and an
/// empty `canonical_sql`/`features`, so the static gate -- not
/// normalization -- is the one that produces a `ParseError`-flavored
/// rejection with a proper reason.
pub fn normalize(
    raw: RawCandidate,
    original_features: &FeatureVector,
    parser: &dyn SqlDialectParser,
) -> Candidate {
    match parser.parse(&raw.sql, &raw.dialect) {
        Ok(parsed) => {
            let canonical_sql = parser.canonicalize(&parsed);
            let features = parser.features(&parsed);
            let detected_transforms = sql::diff_transforms(original_features, &features);
            let candidate_id = compute_candidate_id(&canonical_sql, &raw.dialect);
            let column_set_match = features.table_names == original_features.table_names
                || original_features.table_names.is_empty();
            let structural_diff_score = 1.0 - original_features.construct_overlap(&features);

            Candidate {
                candidate_id,
                sql: raw.sql,
                canonical_sql,
                dialect: raw.dialect,
                source: raw.source,
                worker_id: raw.worker_id,
                declared_transforms: raw.declared_transforms,
                detected_transforms,
                examples_used: raw.examples_used,
                settings: raw.settings,
                token_usage: raw.token_usage,
                features,
                parse_ok: true,
                column_set_match,
                structural_diff_score,
                dedup_group_size: 0,
            }
        }
        Err(err) => {
            tracing::debug!(source = %raw.source, error = %err, "candidate failed to parse during normalization; carrying parse-fail feature forward to the static gate");
            let candidate_id = compute_candidate_id(&raw.sql, &raw.dialect);
            Candidate {
                candidate_id,
                sql: raw.sql,
                canonical_sql: String::new(),
                dialect: raw.dialect,
                source: raw.source,
                worker_id: raw.worker_id,
                declared_transforms: raw.declared_transforms,
                detected_transforms: Vec::new(),
                examples_used: raw.examples_used,
                settings: raw.settings,
                token_usage: raw.token_usage,
                features: FeatureVector::default(),
                parse_ok: false,
                column_set_match: false,
                structural_diff_score: 1.0,
                dedup_group_size: 0,
            }
        }
    }
}

fn compute_candidate_id(canonical_sql: &str, dialect: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_sql.as_bytes());
    hasher.update(b"\0");
    hasher.update(dialect.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Collapses candidates sharing a `candidate_id` into one entry, keeping
/// the earliest worker's provenance (`source`, `worker_id`) and the union
/// of every contributing worker's `examples_used`. Order-independent on
/// the *set* of surviving IDs and their merged `examples_used`; only which
/// worker's `source`/`worker_id` is kept for a shared ID depends on call
/// order.
pub fn dedup(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut order: Vec<String> = Vec::with_capacity(candidates.len());
    let mut merged: HashMap<String, Candidate> = HashMap::with_capacity(candidates.len());

    for candidate in candidates {
        match merged.get_mut(&candidate.candidate_id) {
            Some(existing) => {
                existing.dedup_group_size += 1;
                for example_id in candidate.examples_used {
                    if !existing.examples_used.contains(&example_id) {
                        existing.examples_used.push(example_id);
                    }
                }
            }
            None => {
                order.push(candidate.candidate_id.clone());
                merged.insert(candidate.candidate_id.clone(), candidate);
            }
        }
    }

    order
        .into_iter()
        .map(|id| merged.remove(&id).expect("id was just inserted"))
        .collect()
}

/// Produces a deterministic presentation order over deduplicated
/// candidates, independent of worker completion order: stable-sorted by
/// `structural_diff_score` descending, then `worker_id` ascending (empty
/// last), per the search strategy's ordering guarantee.
pub fn rank(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.structural_diff_score
            .partial_cmp(&a.structural_diff_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.worker_id.cmp(&b.worker_id))
            .then_with(|| a.candidate_id.cmp(&b.candidate_id))
    });
    candidates
}

/// Runs the full normalize -> dedup -> rank pipeline over a batch of raw
/// worker output. Normalization never fails (see [`normalize`]), so every
/// raw candidate is represented in the output, parseable or not.
pub fn normalize_all(
    raw_candidates: Vec<RawCandidate>,
    original_features: &FeatureVector,
    parser: &dyn SqlDialectParser,
) -> Vec<Candidate> {
    let normalized: Vec<Candidate> = raw_candidates
        .into_iter()
        .map(|raw| normalize(raw, original_features, parser))
        .collect();
    rank(dedup(normalized))
}
