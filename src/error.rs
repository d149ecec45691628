//! Error types for sqlrewrite-core.

use thiserror::Error;

/// Result type alias using sqlrewrite-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the knowledge, strategy, and validation
/// layers.
#[derive(Error, Debug)]
pub enum Error {
    /// A candidate's SQL text did not parse under the declared dialect.
    #[error("parse error in {dialect} SQL: {message}")]
    Parse { dialect: String, message: String },

    /// A candidate parsed but referenced objects the executor's schema
    /// snapshot does not know about (unknown table/column, arity mismatch).
    #[error("bind error: {message}")]
    Bind { message: String },

    /// A candidate used a construct the engine profile or transform policy
    /// forbids (e.g. a disallowed hint, an out-of-scope transform ID).
    #[error("forbidden construct: {construct} ({reason})")]
    ForbiddenConstruct { construct: String, reason: String },

    /// The semantic gate found the candidate's result set diverges from the
    /// baseline beyond tolerance.
    #[error("semantic mismatch: {message}")]
    SemanticMismatch { message: String },

    /// The executor collaborator returned a failure unrelated to parsing or
    /// semantics (connection drop, statement error, resource limit).
    #[error("execution error: {message}")]
    Execution { message: String },

    /// An operation exceeded its allotted wall-clock budget.
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// The perf gate's race or trimmed-mean comparison found the candidate
    /// slower than the baseline outside the tolerated grace period.
    #[error("regression: candidate {candidate_id} slower than baseline by {ratio:.3}x")]
    Regression { candidate_id: String, ratio: f64 },

    /// The knowledge layer could not produce a response at all (corrupt or
    /// missing engine profile, empty corpus where one is required). Layer
    /// fatal, per the validation/search control flow.
    #[error("knowledge unavailable: {message}")]
    KnowledgeUnavailable { message: String },

    /// A single search worker failed (LLM call, panic, malformed
    /// completion). Confined to that worker; never layer fatal.
    #[error("worker {worker_id} failed: {message}")]
    WorkerFailure { worker_id: String, message: String },

    /// The verdict cache could not be read or written.
    #[error("cache error: {message}")]
    Cache { message: String },

    /// An LLM provider collaborator returned an error.
    #[error("LLM error ({provider}): {message}")]
    Llm { provider: String, message: String },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error (invalid policy values, conflicting settings).
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal invariant violation; indicates a bug rather than bad input.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn parse(dialect: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            dialect: dialect.into(),
            message: message.into(),
        }
    }

    pub fn bind(message: impl Into<String>) -> Self {
        Self::Bind {
            message: message.into(),
        }
    }

    pub fn forbidden_construct(construct: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ForbiddenConstruct {
            construct: construct.into(),
            reason: reason.into(),
        }
    }

    pub fn semantic_mismatch(message: impl Into<String>) -> Self {
        Self::SemanticMismatch {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    pub fn regression(candidate_id: impl Into<String>, ratio: f64) -> Self {
        Self::Regression {
            candidate_id: candidate_id.into(),
            ratio,
        }
    }

    pub fn knowledge_unavailable(message: impl Into<String>) -> Self {
        Self::KnowledgeUnavailable {
            message: message.into(),
        }
    }

    pub fn worker_failure(worker_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WorkerFailure {
            worker_id: worker_id.into(),
            message: message.into(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    pub fn llm(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Llm {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether this error is confined to a single candidate/worker, or must
    /// abort the owning layer entirely.
    pub fn is_layer_fatal(&self) -> bool {
        matches!(
            self,
            Self::KnowledgeUnavailable { .. } | Self::Execution { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_fatal_classification() {
        assert!(Error::knowledge_unavailable("empty corpus").is_layer_fatal());
        assert!(Error::execution("connection dropped").is_layer_fatal());
        assert!(!Error::worker_failure("w1", "bad completion").is_layer_fatal());
        assert!(!Error::parse("postgres", "unexpected token").is_layer_fatal());
    }

    #[test]
    fn display_messages_are_informative() {
        let err = Error::regression("abc123", 1.42);
        assert!(err.to_string().contains("abc123"));
        assert!(err.to_string().contains("1.42"));
    }
}
