//! LLM client abstraction.
//!
//! This module defines the narrow contract the search strategy and
//! knowledge layers need from an LLM collaborator, plus a provider-agnostic
//! cost-tracking decorator that composes around any implementation.
//! Concrete provider clients are out of scope; callers bring their own
//! [`LlmClient`] and wrap it in [`TrackedClient`] if they want usage
//! accounted for.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlrewrite_core::llm::{LlmClient, MockLlmClient, CompletionRequest, ChatMessage};
//!
//! let client = MockLlmClient::fixed("SELECT 1");
//! let request = CompletionRequest::new().with_message(ChatMessage::user("optimize this query"));
//! let response = client.complete(request).await?;
//! ```

mod client;
mod router;
mod types;

pub use client::{LlmClient, LlmCompletion, MockLlmClient, TrackedClient};
pub use router::{RoutedLlmClient, TierDefaults, WORKER_ROLE_METADATA_KEY};
pub use types::{
    CacheControl, ChatMessage, ChatRole, CompletionRequest, CompletionResponse, CostTracker,
    EmbeddingRequest, EmbeddingResponse, ModelCosts, ModelSpec, ModelTier, Provider, StopReason,
    TokenUsage,
};
