//! Knowledge retrieval: building the in-memory corpus graph and answering
//! per-query retrieval requests against it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{instrument, warn};

use crate::error::Result;
use crate::sql::{FeatureVector, SqlDialectParser};

use super::filtering::{applicable_gaps, applicable_strengths, applicable_tuning_rules};
use super::matching::top_matches;
use super::types::{EngineProfile, GoldExample, KnowledgeResponse};

/// Policy knobs for retrieval.
#[derive(Debug, Clone)]
pub struct KnowledgePolicy {
    /// Maximum number of gold examples returned per retrieval.
    pub max_examples: usize,
    /// Relevance floor (construct-overlap + gap-boost score) an example
    /// must clear to be returned at all, independent of `max_examples`.
    /// An empty match is not an error -- a query with nothing above the
    /// floor simply gets zero examples.
    pub min_match_score: f64,
}

impl Default for KnowledgePolicy {
    fn default() -> Self {
        Self {
            max_examples: 5,
            min_match_score: 0.1,
        }
    }
}

/// Answers retrieval requests for one query against a target engine's
/// profile and gold-example corpus.
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    async fn retrieve(&self, sql: &str, dialect: &str) -> Result<KnowledgeResponse>;
}

/// Arena-and-index graph over engine profiles and gold examples: examples
/// live in a flat `Vec` (the arena); profiles and cross-references index
/// into it by position rather than holding owned copies or `Rc` cycles, so
/// the cyclic gold-example <-> gap references are representable without
/// interior mutability.
struct KnowledgeGraph {
    profiles_by_dialect: HashMap<String, EngineProfile>,
    examples: Vec<GoldExample>,
    example_features: Vec<FeatureVector>,
    example_index_by_id: HashMap<String, usize>,
    knowledge_version: String,
}

impl KnowledgeGraph {
    fn build(
        profiles: Vec<EngineProfile>,
        examples: Vec<GoldExample>,
        parser: &dyn SqlDialectParser,
    ) -> Self {
        let knowledge_version = compute_knowledge_version(&profiles, &examples);

        let mut profiles_by_dialect = HashMap::with_capacity(profiles.len());
        for profile in profiles {
            profiles_by_dialect.insert(profile.dialect.clone(), profile);
        }

        let mut example_index_by_id = HashMap::with_capacity(examples.len());
        let mut example_features = Vec::with_capacity(examples.len());
        for (idx, example) in examples.iter().enumerate() {
            example_index_by_id.insert(example.id.clone(), idx);
            let features = parser
                .parse(&example.original_sql, &example.dialect)
                .map(|parsed| parser.features(&parsed))
                .unwrap_or_else(|err| {
                    warn!(example_id = %example.id, error = %err, "gold example failed to parse, using empty feature vector");
                    FeatureVector::default()
                });
            example_features.push(features);
        }

        for profile in profiles_by_dialect.values() {
            for gap in &profile.gaps {
                for example_id in &gap.demonstrates_via {
                    if !example_index_by_id.contains_key(example_id) {
                        warn!(
                            gap_id = %gap.id,
                            example_id = %example_id,
                            "gap references a gold example not present in the loaded corpus"
                        );
                    }
                }
            }
        }
        for example in &examples {
            for gap_id in &example.demonstrates_gaps {
                let known = profiles_by_dialect
                    .get(&example.dialect)
                    .map(|p| p.gaps.iter().any(|g| &g.id == gap_id))
                    .unwrap_or(false);
                if !known {
                    warn!(
                        example_id = %example.id,
                        gap_id = %gap_id,
                        "gold example references a gap not present in its engine profile"
                    );
                }
            }
        }

        Self {
            profiles_by_dialect,
            examples,
            example_features,
            example_index_by_id,
            knowledge_version,
        }
    }
}

/// Content hash over the sorted engine-profile and corpus data, stable
/// across process restarts as long as the corpus itself hasn't changed --
/// cheaper than a git SHA and doesn't require an external version oracle at
/// retrieval time.
fn compute_knowledge_version(profiles: &[EngineProfile], examples: &[GoldExample]) -> String {
    let mut profiles = profiles.to_vec();
    profiles.sort_by(|a, b| a.dialect.cmp(&b.dialect));
    let mut examples = examples.to_vec();
    examples.sort_by(|a, b| a.id.cmp(&b.id));

    let mut hasher = Sha256::new();
    if let Ok(bytes) = serde_json::to_vec(&profiles) {
        hasher.update(&bytes);
    }
    if let Ok(bytes) = serde_json::to_vec(&examples) {
        hasher.update(&bytes);
    }
    format!("{:x}", hasher.finalize())
}

/// Default [`KnowledgeRetriever`], built once from a static corpus and
/// shared read-only across concurrent retrievals via `Arc`.
pub struct DefaultKnowledgeRetriever {
    graph: Arc<KnowledgeGraph>,
    parser: Arc<dyn SqlDialectParser>,
    policy: KnowledgePolicy,
}

impl DefaultKnowledgeRetriever {
    pub fn new(
        profiles: Vec<EngineProfile>,
        examples: Vec<GoldExample>,
        parser: Arc<dyn SqlDialectParser>,
        policy: KnowledgePolicy,
    ) -> Self {
        let graph = KnowledgeGraph::build(profiles, examples, parser.as_ref());
        Self {
            graph: Arc::new(graph),
            parser,
            policy,
        }
    }

    /// Index of a gold example by its ID, if still present in the corpus.
    /// Exposed for strategies that want to walk the gap -> example
    /// reference without re-scanning the corpus.
    pub fn example_by_id(&self, id: &str) -> Option<&GoldExample> {
        self.graph
            .example_index_by_id
            .get(id)
            .map(|&idx| &self.graph.examples[idx])
    }
}

#[async_trait]
impl KnowledgeRetriever for DefaultKnowledgeRetriever {
    #[instrument(skip(self, sql), fields(dialect = %dialect))]
    async fn retrieve(&self, sql: &str, dialect: &str) -> Result<KnowledgeResponse> {
        let profile = self
            .graph
            .profiles_by_dialect
            .get(dialect)
            .cloned()
            .ok_or_else(|| {
                crate::error::Error::knowledge_unavailable(format!(
                    "no engine profile loaded for dialect '{dialect}'"
                ))
            })?;

        let parsed = self.parser.parse(sql, dialect)?;
        let features = self.parser.features(&parsed);

        let applicable_gaps = applicable_gaps(&features, &profile.gaps);
        let applicable_strengths = applicable_strengths(&features, &profile.strengths);
        let applicable_tuning_rules = applicable_tuning_rules(&features, &profile.tuning_rules);

        let gap_ids: Vec<String> = applicable_gaps.iter().map(|g| g.gap.id.clone()).collect();
        let same_dialect_examples: Vec<&GoldExample> = self
            .graph
            .examples
            .iter()
            .filter(|e| e.dialect == dialect)
            .collect();
        let same_dialect_features: Vec<FeatureVector> = same_dialect_examples
            .iter()
            .map(|e| self.graph.example_features[self.graph.example_index_by_id[&e.id]].clone())
            .collect();
        let owned_examples: Vec<GoldExample> =
            same_dialect_examples.into_iter().cloned().collect();

        let matched_examples = top_matches(
            &features,
            &owned_examples,
            &same_dialect_features,
            &gap_ids,
            self.policy.max_examples,
            self.policy.min_match_score,
        );

        Ok(KnowledgeResponse {
            knowledge_version: self.graph.knowledge_version.clone(),
            engine_profile: profile,
            matched_examples,
            applicable_gaps,
            applicable_strengths,
            applicable_tuning_rules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::types::{ConstructPredicate, Evidence, Gap, GapPriority};
    use crate::sql::SqlparserDialectParser;

    fn profile() -> EngineProfile {
        EngineProfile {
            engine_name: "duckdb".into(),
            dialect: "generic".into(),
            version: None,
            gaps: vec![Gap {
                id: "gap-cross-join".into(),
                description: "doesn't reorder cross joins".into(),
                priority: GapPriority::High,
                predicate: ConstructPredicate::has("cross_join"),
                skip: None,
                high_when: None,
                low_when: None,
                evidence: Evidence {
                    what_worked: vec!["ex-1".into()],
                    what_didnt_work: vec![],
                    field_notes: vec![],
                },
                demonstrates_via: vec!["ex-1".into()],
            }],
            strengths: vec![],
            tuning_rules: vec![],
            constraints: vec![],
        }
    }

    fn example() -> GoldExample {
        GoldExample {
            id: "ex-1".into(),
            dialect: "generic".into(),
            original_sql: "SELECT * FROM a CROSS JOIN b".into(),
            rewritten_sql: "SELECT * FROM a INNER JOIN b ON a.id = b.a_id".into(),
            explanation: Default::default(),
            validated_at_scale: true,
            outcome_speedup: 1.4,
            transform_ids: vec![],
            demonstrates_gaps: vec!["gap-cross-join".into()],
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn retrieves_applicable_gap_for_matching_query() {
        let parser: Arc<dyn SqlDialectParser> = Arc::new(SqlparserDialectParser::new());
        let retriever = DefaultKnowledgeRetriever::new(
            vec![profile()],
            vec![example()],
            parser,
            KnowledgePolicy::default(),
        );

        let response = retriever
            .retrieve("SELECT * FROM x CROSS JOIN y", "generic")
            .await
            .unwrap();

        assert_eq!(response.applicable_gaps.len(), 1);
        assert_eq!(response.matched_examples.len(), 1);
        assert_eq!(response.matched_examples[0].id, "ex-1");
    }

    #[tokio::test]
    async fn unknown_dialect_is_knowledge_unavailable() {
        let parser: Arc<dyn SqlDialectParser> = Arc::new(SqlparserDialectParser::new());
        let retriever = DefaultKnowledgeRetriever::new(
            vec![profile()],
            vec![example()],
            parser,
            KnowledgePolicy::default(),
        );

        let err = retriever
            .retrieve("SELECT 1", "postgres")
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::KnowledgeUnavailable { .. }));
    }

    #[test]
    fn knowledge_version_is_stable_for_same_corpus() {
        let a = compute_knowledge_version(&[profile()], &[example()]);
        let b = compute_knowledge_version(&[profile()], &[example()]);
        assert_eq!(a, b);
    }
}
