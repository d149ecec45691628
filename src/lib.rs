//! # sqlrewrite-core
//!
//! The candidate search, validation, and verdict pipeline for an
//! LLM-driven SQL query optimization engine: given an original query
//! against a known physical database, generate candidate rewrites via a
//! pluggable search strategy, validate each for semantic equivalence and
//! measured speedup through an escalating gate pipeline, and emit a
//! verdict with full provenance.
//!
//! The crate is organized around three layers:
//!
//! - [`knowledge`] (Layer K) assembles per-query guidance from an
//!   engine profile and gold-example corpus.
//! - [`strategy`] (Layer S) turns that guidance into candidate rewrites
//!   via beam (automated fan-out) or strike (user-directed) search.
//! - [`validation`] (Layer V) is the sole authority on candidate outcomes:
//!   a four-gate pipeline (static, semantic, perf, verdict) backed by a
//!   persistent, per-key-locked verdict cache.
//!
//! [`Engine`] wires the three layers together behind a single `run` entry
//! point, writing a [`RunManifest`] once per invocation for
//! reproducibility.
//!
//! LLM provider clients, database executors, and the SQL parser are
//! external collaborators reached through the narrow traits in [`llm`],
//! [`executor`], and [`sql`] respectively -- this crate supplies a default
//! SQL parser backed by `sqlparser`, and in-memory/mock fakes for the
//! other two used in its own tests, but ships no concrete provider or
//! database adapter.

pub mod candidate;
pub mod error;
pub mod executor;
pub mod knowledge;
pub mod llm;
pub mod manifest;
pub mod sql;
pub mod store;
pub mod strategy;
pub mod validation;

pub use candidate::Candidate;
pub use error::{Error, Result};
pub use executor::{Executor, ExplainPlan, SchemaSnapshot};
pub use knowledge::{DefaultKnowledgeRetriever, KnowledgePolicy, KnowledgeRetriever, KnowledgeResponse};
pub use manifest::{EngineEnvironment, Lineage, RunManifest, TransformPolicy};
pub use store::{FileSystemRunStore, RunStore};
pub use strategy::{BeamStrategy, GenerationContext, SearchStrategy, StrategyPolicy, StrikeStrategy, TransformHint};
pub use validation::{Status, ValidationHarness, ValidationPolicy, ValidationVerdict, VerdictCache};

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

/// The outcome of one [`Engine::run`] invocation: the manifest pinning
/// down exactly how it was produced, every candidate the strategy emitted
/// (post-normalization), the verdict computed for each, and whichever
/// verdict the caller should act on.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub manifest: RunManifest,
    pub candidates: Vec<Candidate>,
    pub verdicts: Vec<ValidationVerdict>,
    /// The first candidate (in the strategy's stable emission order) whose
    /// verdict is a win or improvement, if any survived; otherwise the
    /// highest-speedup verdict among those that passed every gate, so a
    /// caller always has something to inspect even when nothing cleared
    /// the bar. `None` only when `verdicts` is empty.
    pub best: Option<ValidationVerdict>,
}

impl RunOutcome {
    /// Writes this outcome's manifest, candidates, and verdicts through
    /// `store`, under the manifest's own `run_id`. Optional: a caller that
    /// only wants the in-memory [`RunOutcome`] never needs to touch a
    /// [`store::RunStore`] at all.
    pub async fn persist(&self, store: &dyn store::RunStore, query_id: &str) -> Result<()> {
        store.save_manifest(&self.manifest).await?;
        for candidate in &self.candidates {
            store.save_candidate(query_id, &self.manifest.run_id, candidate).await?;
        }
        for verdict in &self.verdicts {
            store.save_verdict(query_id, &self.manifest.run_id, verdict).await?;
        }
        Ok(())
    }
}

fn pick_best(verdicts: &[ValidationVerdict]) -> Option<ValidationVerdict> {
    if let Some(first_win) = verdicts.iter().find(|v| v.status.is_improvement()) {
        return Some(first_win.clone());
    }
    verdicts
        .iter()
        .filter(|v| !v.status.is_fail())
        .max_by(|a, b| {
            a.speedup
                .unwrap_or(0.0)
                .partial_cmp(&b.speedup.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .cloned()
        .or_else(|| verdicts.first().cloned())
}

/// Wires Layer K, Layer S, and Layer V behind a single entry point: for
/// each query, knowledge is retrieved, the strategy generates candidates
/// from it, and the validation harness decides every candidate's fate.
/// One `Engine` is built per target dialect/executor; the same instance
/// serves many `run` calls.
pub struct Engine {
    knowledge: Arc<dyn KnowledgeRetriever>,
    strategy: Arc<dyn SearchStrategy>,
    validator: Arc<ValidationHarness>,
    strategy_policy: StrategyPolicy,
    transform_policy: TransformPolicy,
    environment: EngineEnvironment,
    benchmark_id: String,
    lineage: Lineage,
}

impl Engine {
    pub fn new(
        knowledge: Arc<dyn KnowledgeRetriever>,
        strategy: Arc<dyn SearchStrategy>,
        validator: Arc<ValidationHarness>,
        strategy_policy: StrategyPolicy,
        transform_policy: TransformPolicy,
        environment: EngineEnvironment,
        benchmark_id: impl Into<String>,
    ) -> Self {
        Self {
            knowledge,
            strategy,
            validator,
            strategy_policy,
            transform_policy,
            environment,
            benchmark_id: benchmark_id.into(),
            lineage: Lineage::default(),
        }
    }

    pub fn with_lineage(mut self, lineage: Lineage) -> Self {
        self.lineage = lineage;
        self
    }

    /// Runs the full knowledge -> strategy -> validation pipeline for one
    /// query. `strike_hint` is `None` for a beam-configured engine and
    /// `Some` for a strike one; [`strategy::StrikeStrategy`] errors if
    /// asked to generate without one.
    #[instrument(skip(self, sql, history, strike_hint), fields(query_id = %query_id, dialect = %dialect))]
    pub async fn run(
        &self,
        query_id: &str,
        sql: &str,
        dialect: &str,
        history: &[validation::FeedbackPack],
        strike_hint: Option<&TransformHint>,
    ) -> Result<RunOutcome> {
        let run_id = format!(
            "run-{}-{}",
            Utc::now().format("%Y%m%dT%H%M%SZ"),
            &query_id[..query_id.len().min(8)]
        );

        let knowledge = self.knowledge.retrieve(sql, dialect).await?;
        info!(
            run_id = %run_id,
            matched_examples = knowledge.matched_examples.len(),
            applicable_gaps = knowledge.applicable_gaps.len(),
            "knowledge retrieved"
        );

        let mut forbidden_constructs = knowledge.engine_profile.forbidden_constructs();
        forbidden_constructs.extend(self.transform_policy.forbidden_constructs.iter().cloned());

        let manifest = RunManifest::new(
            run_id.clone(),
            self.benchmark_id.clone(),
            self.environment.clone(),
            self.strategy.name(),
            &self.strategy_policy,
            self.validator.policy(),
            self.transform_policy.clone(),
            self.lineage.clone(),
            knowledge.knowledge_version.clone(),
            Utc::now(),
        );
        let run_fingerprint = manifest.run_fingerprint();

        let ctx = GenerationContext {
            query_id,
            run_fingerprint: &run_fingerprint,
            original_sql: sql,
            dialect,
            knowledge: &knowledge,
            history,
            policy: &self.strategy_policy,
            forbidden_constructs: &forbidden_constructs,
            strike_hint,
        };

        let candidates = self.strategy.generate(&ctx).await?;
        info!(run_id = %run_id, candidate_count = candidates.len(), "candidates generated");

        let mut verdicts = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            let verdict = self
                .validator
                .validate(query_id, sql, candidate, &run_fingerprint, &forbidden_constructs)
                .await?;
            verdicts.push(verdict);
        }

        let best = pick_best(&verdicts);
        Ok(RunOutcome {
            manifest,
            candidates,
            verdicts,
            best,
        })
    }
}
