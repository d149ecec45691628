//! The beam strategy: an analyst phase picks N worker assignments, workers
//! fan out concurrently, and an optional snipe phase refines the best
//! candidate if it didn't clear the target speedup.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::candidate::{self, Candidate, RawCandidate};
use crate::error::Result;
use crate::llm::{ChatMessage, CompletionRequest, LlmClient};
use crate::sql::SqlDialectParser;
use crate::validation::ValidationHarness;

use super::prompt::{extract_rewrite, render_example};
use super::types::{AnalystBriefing, GenerationContext, WorkerAssignment, WorkerRole};
use super::SearchStrategy;

/// Raw shape the analyst is asked to return as JSON. Kept distinct from
/// [`AnalystBriefing`] only insofar as worker IDs are assigned after
/// parsing, not by the analyst itself.
#[derive(Debug, Deserialize, Serialize)]
struct AnalystResponse {
    bottleneck_hypothesis: String,
    #[serde(default)]
    key_signals: Vec<String>,
    #[serde(default)]
    matched_gaps: Vec<String>,
    worker_roles: Vec<WorkerRoleAssignment>,
}

#[derive(Debug, Deserialize, Serialize)]
struct WorkerRoleAssignment {
    role: WorkerRole,
    #[serde(default)]
    primary_gap_family: Option<String>,
    #[serde(default)]
    example_ids: Vec<String>,
    #[serde(default)]
    hints: String,
}

pub struct BeamStrategy {
    llm: Arc<dyn LlmClient>,
    parser: Arc<dyn SqlDialectParser>,
    /// Present when the beam run should snipe-refine a below-target best
    /// candidate; absent runs never attempt the snipe phase even if
    /// `policy.snipe_enabled` is set (e.g. a caller without an executor
    /// wired up yet).
    validator: Option<Arc<ValidationHarness>>,
}

impl BeamStrategy {
    pub fn new(llm: Arc<dyn LlmClient>, parser: Arc<dyn SqlDialectParser>) -> Self {
        Self {
            llm,
            parser,
            validator: None,
        }
    }

    pub fn with_validator(mut self, validator: Arc<ValidationHarness>) -> Self {
        self.validator = Some(validator);
        self
    }

    #[instrument(skip(self, ctx), fields(query_id = %ctx.query_id))]
    async fn run_analyst(&self, ctx: &GenerationContext<'_>) -> AnalystBriefing {
        let prompt = self.build_analyst_prompt(ctx);
        let request = CompletionRequest::new()
            .with_system(ANALYST_SYSTEM_PROMPT)
            .with_message(ChatMessage::user(prompt))
            .with_temperature(0.2)
            .with_metadata(crate::llm::WORKER_ROLE_METADATA_KEY, "analyst");

        let completion = match self.llm.complete(request).await {
            Ok(completion) => completion,
            Err(err) => {
                warn!(error = %err, "analyst call failed, falling back to exploration-only assignment");
                return self.fallback_briefing(ctx);
            }
        };

        match serde_json::from_str::<AnalystResponse>(strip_code_fence(&completion.content)) {
            Ok(parsed) => {
                let worker_assignments = parsed
                    .worker_roles
                    .into_iter()
                    .take(ctx.policy.worker_count)
                    .enumerate()
                    .map(|(idx, assignment)| WorkerAssignment {
                        worker_id: format!("beam:worker-{idx}"),
                        role: assignment.role,
                        primary_gap_family: assignment.primary_gap_family,
                        example_ids: assignment.example_ids,
                        hints: assignment.hints,
                    })
                    .collect();
                AnalystBriefing {
                    bottleneck_hypothesis: parsed.bottleneck_hypothesis,
                    key_signals: parsed.key_signals,
                    matched_gaps: parsed.matched_gaps,
                    worker_assignments,
                }
            }
            Err(err) => {
                warn!(error = %err, "analyst response was not well-formed briefing JSON, falling back");
                self.fallback_briefing(ctx)
            }
        }
    }

    /// Every worker gets an exploration assignment when the analyst call
    /// fails or returns something unparseable -- degraded but non-fatal,
    /// since exploration workers need no gap family or examples.
    fn fallback_briefing(&self, ctx: &GenerationContext<'_>) -> AnalystBriefing {
        let worker_assignments = (0..ctx.policy.worker_count)
            .map(|idx| WorkerAssignment {
                worker_id: format!("beam:worker-{idx}"),
                role: WorkerRole::Exploration,
                primary_gap_family: None,
                example_ids: Vec::new(),
                hints: String::new(),
            })
            .collect();
        AnalystBriefing {
            bottleneck_hypothesis: "analyst unavailable; exploring without guidance".to_string(),
            key_signals: Vec::new(),
            matched_gaps: Vec::new(),
            worker_assignments,
        }
    }

    fn build_analyst_prompt(&self, ctx: &GenerationContext<'_>) -> String {
        let mut prompt = String::new();
        prompt.push_str(&format!("Original SQL ({}):\n{}\n\n", ctx.dialect, ctx.original_sql));
        prompt.push_str(&format!(
            "Engine: {} ({})\n",
            ctx.knowledge.engine_profile.engine_name, ctx.knowledge.engine_profile.dialect
        ));
        if !ctx.knowledge.applicable_gaps.is_empty() {
            prompt.push_str("Known gaps:\n");
            for applicable in &ctx.knowledge.applicable_gaps {
                prompt.push_str(&format!(
                    "- {} [{:?} priority, {:?} confidence]: {}\n",
                    applicable.gap.id, applicable.gap.priority, applicable.confidence, applicable.gap.description
                ));
            }
        }
        if !ctx.knowledge.applicable_strengths.is_empty() {
            prompt.push_str("Known strengths (do NOT intervene here):\n");
            for strength in &ctx.knowledge.applicable_strengths {
                prompt.push_str(&format!("- {}: {}\n", strength.id, strength.description));
            }
        }
        if !ctx.history.is_empty() {
            prompt.push_str("\nPrior attempts:\n");
            for feedback in ctx.history {
                prompt.push_str(&format!("- {:?}: {}\n", feedback.status, feedback.message));
            }
        }
        prompt.push_str(&format!(
            "\nAssign {} workers (roles: proven_compound, structural_alt, aggressive, exploration).",
            ctx.policy.worker_count
        ));
        prompt
    }

    #[instrument(skip(self, ctx, assignment))]
    async fn run_worker(
        &self,
        ctx: &GenerationContext<'_>,
        briefing: &AnalystBriefing,
        assignment: WorkerAssignment,
    ) -> Option<RawCandidate> {
        let examples: Vec<_> = assignment
            .example_ids
            .iter()
            .filter_map(|id| ctx.knowledge.matched_examples.iter().find(|e| &e.id == id))
            .collect();

        let mut prompt = format!(
            "Role: {:?}\nBottleneck hypothesis: {}\nHints: {}\n\nOriginal SQL:\n{}\n",
            assignment.role, briefing.bottleneck_hypothesis, assignment.hints, ctx.original_sql
        );
        for example in &examples {
            prompt.push_str(&render_example(example));
        }
        prompt.push_str("\nReturn the rewritten SQL. Exploration workers may answer with raw SQL; other roles should wrap the SQL in a ```sql fenced block.");

        let request = CompletionRequest::new()
            .with_system(WORKER_SYSTEM_PROMPT)
            .with_message(ChatMessage::user(prompt))
            .with_max_tokens(ctx.policy.max_tokens_per_worker)
            .with_temperature(worker_temperature(assignment.role))
            .with_metadata(crate::llm::WORKER_ROLE_METADATA_KEY, assignment.role.as_str());

        let completion = match self.llm.complete(request).await {
            Ok(completion) => completion,
            Err(err) => {
                warn!(worker_id = %assignment.worker_id, error = %err, "beam worker failed");
                return None;
            }
        };

        let rewrite = extract_rewrite(&completion.content);
        if rewrite.sql.trim().is_empty() {
            warn!(worker_id = %assignment.worker_id, "beam worker returned an empty rewrite");
            return None;
        }

        Some(RawCandidate {
            sql: rewrite.sql,
            dialect: ctx.dialect.to_string(),
            source: format!("beam:{}", assignment.worker_id),
            worker_id: Some(assignment.worker_id),
            declared_transforms: rewrite.declared_transforms,
            examples_used: assignment.example_ids,
            settings: Default::default(),
            token_usage: completion.usage,
        })
    }

    #[instrument(skip(self, ctx, best))]
    async fn run_snipe(
        &self,
        ctx: &GenerationContext<'_>,
        best: &Candidate,
        verdict_reason: &str,
    ) -> Option<RawCandidate> {
        let prompt = format!(
            "The previous best rewrite did not reach the target speedup of {:.2}x.\n\nOriginal SQL:\n{}\n\nBest candidate so far:\n{}\n\nValidation feedback:\n{}\n\nPropose one further refinement.",
            ctx.policy.target_speedup, ctx.original_sql, best.sql, verdict_reason
        );
        let request = CompletionRequest::new()
            .with_system(WORKER_SYSTEM_PROMPT)
            .with_message(ChatMessage::user(prompt))
            .with_max_tokens(ctx.policy.max_tokens_per_worker)
            .with_temperature(0.3)
            .with_metadata(crate::llm::WORKER_ROLE_METADATA_KEY, "snipe");

        let completion = match self.llm.complete(request).await {
            Ok(completion) => completion,
            Err(err) => {
                warn!(error = %err, "snipe refinement call failed");
                return None;
            }
        };
        let rewrite = extract_rewrite(&completion.content);
        if rewrite.sql.trim().is_empty() {
            return None;
        }
        Some(RawCandidate {
            sql: rewrite.sql,
            dialect: ctx.dialect.to_string(),
            source: "beam:snipe".to_string(),
            worker_id: Some("snipe".to_string()),
            declared_transforms: rewrite.declared_transforms,
            examples_used: vec![best.candidate_id.clone()],
            settings: Default::default(),
            token_usage: completion.usage,
        })
    }
}

#[async_trait]
impl SearchStrategy for BeamStrategy {
    fn name(&self) -> &'static str {
        "beam"
    }

    #[instrument(skip(self, ctx), fields(query_id = %ctx.query_id, worker_count = ctx.policy.worker_count))]
    async fn generate(&self, ctx: &GenerationContext<'_>) -> Result<Vec<Candidate>> {
        let original_parsed = self.parser.parse(ctx.original_sql, ctx.dialect)?;
        let original_features = self.parser.features(&original_parsed);

        let briefing = self.run_analyst(ctx).await;
        info!(
            worker_count = briefing.worker_assignments.len(),
            hypothesis = %briefing.bottleneck_hypothesis,
            "analyst briefing produced"
        );

        let tasks: Vec<_> = briefing
            .worker_assignments
            .iter()
            .cloned()
            .map(|assignment| {
                let ctx_ref = ctx;
                let briefing_ref = &briefing;
                async move { self.run_worker(ctx_ref, briefing_ref, assignment).await }
            })
            .collect();
        let worker_results: Vec<Option<RawCandidate>> = join_all(tasks).await;
        let raw_candidates: Vec<RawCandidate> = worker_results.into_iter().flatten().collect();
        debug!(produced = raw_candidates.len(), "beam fan-out complete");

        let mut candidates = candidate::normalize_all(raw_candidates, &original_features, self.parser.as_ref());

        if ctx.policy.snipe_enabled {
            if let (Some(validator), Some(best)) = (&self.validator, candidates.first().cloned()) {
                let verdict = validator
                    .validate(ctx.query_id, ctx.original_sql, &best, ctx.run_fingerprint, ctx.forbidden_constructs)
                    .await?;
                let cleared_target = verdict.speedup.map(|s| s >= ctx.policy.target_speedup).unwrap_or(false);
                if !cleared_target {
                    info!(candidate_id = %best.candidate_id, "best beam candidate missed target speedup, running snipe");
                    if let Some(raw) = self.run_snipe(ctx, &best, &verdict.reason).await {
                        let snipe_candidate = candidate::normalize(raw, &original_features, self.parser.as_ref());
                        candidates.push(snipe_candidate);
                        candidates = candidate::rank(candidate::dedup(candidates));
                    }
                }
            }
        }

        Ok(candidates)
    }
}

fn worker_temperature(role: WorkerRole) -> f64 {
    match role {
        WorkerRole::ProvenCompound => 0.0,
        WorkerRole::StructuralAlt => 0.2,
        WorkerRole::Aggressive => 0.4,
        WorkerRole::Exploration => 0.7,
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.strip_suffix("```").unwrap_or(s))
        .unwrap_or(trimmed)
        .trim()
}

const ANALYST_SYSTEM_PROMPT: &str = "You are a query optimization analyst. Respond only with JSON matching: {\"bottleneck_hypothesis\": string, \"key_signals\": [string], \"matched_gaps\": [string], \"worker_roles\": [{\"role\": \"proven_compound\"|\"structural_alt\"|\"aggressive\"|\"exploration\", \"primary_gap_family\": string|null, \"example_ids\": [string], \"hints\": string}]}.";

const WORKER_SYSTEM_PROMPT: &str = "You rewrite SQL queries to be semantically equivalent but faster on the target engine. Never change what rows a query returns.";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SchemaSnapshot;
    use crate::knowledge::{EngineProfile, KnowledgeResponse};
    use crate::llm::MockLlmClient;
    use crate::sql::SqlparserDialectParser;
    use crate::strategy::types::StrategyPolicy;
    use crate::validation::{InMemoryVerdictCache, ValidationPolicy};

    fn knowledge() -> KnowledgeResponse {
        KnowledgeResponse {
            knowledge_version: "v1".into(),
            engine_profile: EngineProfile {
                engine_name: "duckdb".into(),
                dialect: "generic".into(),
                version: None,
                gaps: vec![],
                strengths: vec![],
                tuning_rules: vec![],
                constraints: vec![],
            },
            matched_examples: vec![],
            applicable_gaps: vec![],
            applicable_strengths: vec![],
            applicable_tuning_rules: vec![],
        }
    }

    #[tokio::test]
    async fn fallback_briefing_runs_every_worker_as_exploration() {
        let llm = Arc::new(MockLlmClient::fixed("not json"));
        let parser = Arc::new(SqlparserDialectParser::new());
        let strategy = BeamStrategy::new(llm, parser);
        let knowledge = knowledge();
        let policy = StrategyPolicy {
            worker_count: 2,
            snipe_enabled: false,
            ..Default::default()
        };
        let ctx = GenerationContext {
            query_id: "q1",
            run_fingerprint: "run-1",
            original_sql: "SELECT id FROM orders",
            dialect: "generic",
            knowledge: &knowledge,
            history: &[],
            policy: &policy,
            forbidden_constructs: &[],
            strike_hint: None,
        };
        let candidates = strategy.generate(&ctx).await.unwrap();
        assert!(!candidates.is_empty());
    }

    #[tokio::test]
    async fn worker_responses_are_deduplicated_across_the_beam() {
        let llm = Arc::new(MockLlmClient::scripted(vec![
            "not json".to_string(),
            "```sql\nSELECT id FROM orders WHERE id > 0\n```".to_string(),
            "```sql\nselect id from orders where id>0\n```".to_string(),
        ]));
        let parser = Arc::new(SqlparserDialectParser::new());
        let strategy = BeamStrategy::new(llm, parser);
        let knowledge = knowledge();
        let policy = StrategyPolicy {
            worker_count: 2,
            snipe_enabled: false,
            ..Default::default()
        };
        let ctx = GenerationContext {
            query_id: "q1",
            run_fingerprint: "run-1",
            original_sql: "SELECT id FROM orders",
            dialect: "generic",
            knowledge: &knowledge,
            history: &[],
            policy: &policy,
            forbidden_constructs: &[],
            strike_hint: None,
        };
        let candidates = strategy.generate(&ctx).await.unwrap();
        assert_eq!(candidates.len(), 1, "canonically identical worker rewrites should dedup");
    }

    #[tokio::test]
    async fn snipe_runs_when_best_candidate_misses_target() {
        let llm = Arc::new(MockLlmClient::scripted(vec![
            "not json".to_string(),
            "```sql\nSELECT id FROM orders WHERE id > 0\n```".to_string(),
            "```sql\nSELECT id FROM orders WHERE id > 1\n```".to_string(),
        ]));
        let parser: Arc<dyn SqlDialectParser> = Arc::new(SqlparserDialectParser::new());
        let executor = Arc::new(crate::executor::InMemoryExecutor::new(SchemaSnapshot::default()));
        let validator = Arc::new(ValidationHarness::new(
            executor,
            parser.clone(),
            Arc::new(InMemoryVerdictCache::new()),
            SchemaSnapshot::default(),
            ValidationPolicy::default(),
        ));
        let strategy = BeamStrategy::new(llm, parser).with_validator(validator);
        let knowledge = knowledge();
        let policy = StrategyPolicy {
            worker_count: 1,
            snipe_enabled: true,
            target_speedup: 100.0,
            ..Default::default()
        };
        let ctx = GenerationContext {
            query_id: "q1",
            run_fingerprint: "run-1",
            original_sql: "SELECT id FROM orders",
            dialect: "generic",
            knowledge: &knowledge,
            history: &[],
            policy: &policy,
            forbidden_constructs: &[],
            strike_hint: None,
        };
        let candidates = strategy.generate(&ctx).await.unwrap();
        assert!(candidates.iter().any(|c| c.source == "beam:snipe"));
    }
}
