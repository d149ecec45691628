//! The strike strategy: a single, user-directed worker guided by a
//! [`TransformHint`] rather than an analyst briefing. No analyst call, no
//! snipe refinement -- unlike beam, strike never schedules a refinement
//! pass over its own output.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{instrument, warn};

use crate::candidate::{self, Candidate, RawCandidate};
use crate::error::{Error, Result};
use crate::llm::{ChatMessage, CompletionRequest, LlmClient};
use crate::sql::SqlDialectParser;

use super::prompt::{extract_rewrite, render_example};
use super::types::{ConstraintMode, GenerationContext};
use super::SearchStrategy;

const WORKER_SYSTEM_PROMPT: &str = "You rewrite SQL queries to be semantically equivalent but faster on the target engine, following the user's explicit targeting. Never change what rows a query returns.";

pub struct StrikeStrategy {
    llm: Arc<dyn LlmClient>,
    parser: Arc<dyn SqlDialectParser>,
}

impl StrikeStrategy {
    pub fn new(llm: Arc<dyn LlmClient>, parser: Arc<dyn SqlDialectParser>) -> Self {
        Self { llm, parser }
    }

    fn build_prompt(&self, ctx: &GenerationContext<'_>) -> String {
        let hint = ctx
            .strike_hint
            .expect("strike strategy requires ctx.strike_hint to be set");

        let mut prompt = format!("Original SQL ({}):\n{}\n\n", ctx.dialect, ctx.original_sql);
        prompt.push_str(&format!("User instruction: {}\n", hint.text));
        if let Some(transform_id) = &hint.transform_id {
            let constraint = match hint.constraint_mode {
                ConstraintMode::Bias => "prefer this transform but others are fine too",
                ConstraintMode::Constrain => "this transform must be present among the changes",
                ConstraintMode::Only => "apply only this transform and nothing else",
            };
            prompt.push_str(&format!(
                "Targeted transform: {transform_id} ({constraint})\n"
            ));
        }
        if let Some(target) = &hint.target_subquery {
            prompt.push_str(&format!("Target subquery/fragment: {target}\n"));
        }
        if !ctx.knowledge.matched_examples.is_empty() {
            prompt.push_str("\nRelevant examples:\n");
            for example in &ctx.knowledge.matched_examples {
                prompt.push_str(&render_example(example));
            }
        }
        prompt.push_str("\nReturn the rewritten SQL wrapped in a ```sql fenced block, with an optional leading `-- transforms: id1, id2` comment declaring which transforms you applied.");
        prompt
    }

    /// Checks a produced candidate against the hint's constraint mode.
    /// Never rejects the candidate itself -- a violation is surfaced as an
    /// advisory string appended to the candidate's `source`, while whether
    /// the candidate survives is still the validation harness's call.
    fn check_constraint(&self, candidate: &Candidate, ctx: &GenerationContext<'_>) -> Option<String> {
        let hint = ctx.strike_hint?;
        let transform_id = hint.transform_id.as_ref()?;
        match hint.constraint_mode {
            ConstraintMode::Bias => None,
            ConstraintMode::Constrain => {
                if candidate.detected_transforms.contains(transform_id) {
                    None
                } else {
                    Some(format!(
                        "constrain mode requested '{transform_id}' but it was not detected among {:?}",
                        candidate.detected_transforms
                    ))
                }
            }
            ConstraintMode::Only => {
                let others: Vec<_> = candidate
                    .detected_transforms
                    .iter()
                    .filter(|t| *t != transform_id)
                    .collect();
                if others.is_empty() {
                    None
                } else {
                    Some(format!(
                        "only mode requested solely '{transform_id}' but detected transforms also include {others:?}"
                    ))
                }
            }
        }
    }
}

#[async_trait]
impl SearchStrategy for StrikeStrategy {
    fn name(&self) -> &'static str {
        "strike"
    }

    #[instrument(skip(self, ctx), fields(query_id = %ctx.query_id))]
    async fn generate(&self, ctx: &GenerationContext<'_>) -> Result<Vec<Candidate>> {
        if ctx.strike_hint.is_none() {
            return Err(Error::internal(
                "strike strategy invoked without a transform hint on the generation context",
            ));
        }

        let original_parsed = self.parser.parse(ctx.original_sql, ctx.dialect)?;
        let original_features = self.parser.features(&original_parsed);

        let prompt = self.build_prompt(ctx);
        let request = CompletionRequest::new()
            .with_system(WORKER_SYSTEM_PROMPT)
            .with_message(ChatMessage::user(prompt))
            .with_max_tokens(ctx.policy.max_tokens_per_worker)
            .with_temperature(0.0)
            .with_metadata(crate::llm::WORKER_ROLE_METADATA_KEY, "structural_alt");

        let completion = match self.llm.complete(request).await {
            Ok(completion) => completion,
            Err(err) => {
                warn!(error = %err, "strike worker failed");
                return Ok(Vec::new());
            }
        };

        let rewrite = extract_rewrite(&completion.content);
        if rewrite.sql.trim().is_empty() {
            warn!("strike worker returned an empty rewrite");
            return Ok(Vec::new());
        }

        let hint = ctx.strike_hint.expect("checked above");
        let declared_transforms = if hint.constraint_mode == ConstraintMode::Only {
            hint.transform_id.clone().into_iter().collect()
        } else {
            rewrite.declared_transforms
        };

        let raw = RawCandidate {
            sql: rewrite.sql,
            dialect: ctx.dialect.to_string(),
            source: "strike".to_string(),
            worker_id: None,
            declared_transforms,
            examples_used: ctx
                .knowledge
                .matched_examples
                .iter()
                .map(|e| e.id.clone())
                .collect(),
            settings: Default::default(),
            token_usage: completion.usage,
        };

        let mut candidate = candidate::normalize(raw, &original_features, self.parser.as_ref());
        if let Some(violation) = self.check_constraint(&candidate, ctx) {
            warn!(candidate_id = %candidate.candidate_id, %violation, "strike constraint violation");
            candidate.source = format!("{} (constraint advisory: {violation})", candidate.source);
        }

        Ok(vec![candidate])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{EngineProfile, KnowledgeResponse};
    use crate::llm::MockLlmClient;
    use crate::sql::{SqlDialectParser, SqlparserDialectParser, TransformId};
    use crate::strategy::types::{StrategyPolicy, TransformHint};

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
    async fn strike_produces_a_single_candidate() {
        let llm = Arc::new(MockLlmClient::fixed("```sql\nSELECT id FROM orders WHERE id > 0\n```"));
        let parser: Arc<dyn SqlDialectParser> = Arc::new(SqlparserDialectParser::new());
        let strategy = StrikeStrategy::new(llm, parser);
        let knowledge = knowledge();
        let policy = StrategyPolicy::default();
        let hint = TransformHint::freeform("push the predicate down");
        let ctx = GenerationContext {
            query_id: "q1",
            run_fingerprint: "run-1",
            original_sql: "SELECT id FROM orders",
            dialect: "generic",
            knowledge: &knowledge,
            history: &[],
            policy: &policy,
            forbidden_constructs: &[],
            strike_hint: Some(&hint),
        };
        let candidates = strategy.generate(&ctx).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].source, "strike");
    }

    #[tokio::test]
    async fn only_mode_restricts_declared_transforms_to_the_named_one() {
        let llm = Arc::new(MockLlmClient::fixed(
            "```sql\n-- transforms: decorrelate, predicate_pushdown\nSELECT id FROM orders WHERE id > 0\n```",
        ));
        let parser: Arc<dyn SqlDialectParser> = Arc::new(SqlparserDialectParser::new());
        let strategy = StrikeStrategy::new(llm, parser);
        let knowledge = knowledge();
        let policy = StrategyPolicy::default();
        let mut hint = TransformHint::freeform("only decorrelate");
        hint.transform_id = Some(TransformId::new("decorrelate"));
        hint.constraint_mode = ConstraintMode::Only;
        let ctx = GenerationContext {
            query_id: "q1",
            run_fingerprint: "run-1",
            original_sql: "SELECT id FROM orders",
            dialect: "generic",
            knowledge: &knowledge,
            history: &[],
            policy: &policy,
            forbidden_constructs: &[],
            strike_hint: Some(&hint),
        };
        let candidates = strategy.generate(&ctx).await.unwrap();
        assert_eq!(candidates[0].declared_transforms, vec![TransformId::new("decorrelate")]);
    }

    #[tokio::test]
    async fn missing_hint_is_an_internal_error() {
        let llm = Arc::new(MockLlmClient::fixed("SELECT 1"));
        let parser: Arc<dyn SqlDialectParser> = Arc::new(SqlparserDialectParser::new());
        let strategy = StrikeStrategy::new(llm, parser);
        let knowledge = knowledge();
        let policy = StrategyPolicy::default();
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
        assert!(strategy.generate(&ctx).await.is_err());
    }
}
