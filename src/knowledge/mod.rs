//! Knowledge retrieval layer: the target engine's profile (gaps,
//! strengths, tuning rules, constraints) and a gold-example corpus, indexed
//! once and queried per candidate-search invocation.

mod filtering;
mod matching;
mod retrieval;
mod types;

pub use retrieval::{DefaultKnowledgeRetriever, KnowledgePolicy, KnowledgeRetriever};
pub use types::{
    ApplicableGap, ConstructPredicate, Constraint, EngineProfile, Evidence, Explanation, Gap,
    GapConfidence, GapPriority, GoldExample, KnowledgeResponse, Strength, TuningRule,
};
