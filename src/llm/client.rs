//! LLM client trait and provider-agnostic decorators.
//!
//! Concrete provider clients (Anthropic, OpenAI, ...) are deliberately not
//! shipped here: callers supply their own [`LlmClient`] implementation that
//! talks to whatever provider they've authorized, and this module limits
//! itself to the trait plus the cross-cutting wrapper every caller needs
//! regardless of provider (cost tracking) and a test double for exercising
//! the search layer without a network.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Result;

use super::types::{
    CompletionRequest, CompletionResponse, CostTracker, EmbeddingRequest, EmbeddingResponse,
    ModelSpec, Provider, StopReason, TokenUsage,
};

/// A completion produced by an LLM collaborator.
///
/// Alias kept distinct from [`CompletionResponse`] at the call sites that
/// care about the external contract (search strategies, knowledge
/// retrieval) versus the internal request/response pair LLM-side code
/// shares with the router and cost tracker.
pub type LlmCompletion = CompletionResponse;

/// Minimal contract a search strategy or knowledge retriever needs from an
/// LLM provider: complete a prompt, optionally embed text, and describe
/// what it can do.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete a prompt.
    async fn complete(&self, request: CompletionRequest) -> Result<LlmCompletion>;

    /// Create embeddings for texts. Default implementation reports the
    /// capability as unsupported; most search-layer callers never embed.
    async fn embed(&self, _request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        Err(crate::error::Error::llm(
            self.provider().to_string(),
            "embeddings not supported by this client",
        ))
    }

    /// Provider identity, used for cost attribution.
    fn provider(&self) -> Provider;

    /// Models this client can serve.
    fn available_models(&self) -> Vec<ModelSpec>;
}

#[async_trait]
impl<T: LlmClient + ?Sized> LlmClient for Arc<T> {
    async fn complete(&self, request: CompletionRequest) -> Result<LlmCompletion> {
        (**self).complete(request).await
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        (**self).embed(request).await
    }

    fn provider(&self) -> Provider {
        (**self).provider()
    }

    fn available_models(&self) -> Vec<ModelSpec> {
        (**self).available_models()
    }
}

/// Wraps any [`LlmClient`] and records token/cost usage for every
/// completion that passes through it.
pub struct TrackedClient<C> {
    inner: C,
    costs: Arc<RwLock<CostTracker>>,
}

impl<C: LlmClient> TrackedClient<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            costs: Arc::new(RwLock::new(CostTracker::new())),
        }
    }

    pub async fn complete(&self, request: CompletionRequest) -> Result<LlmCompletion> {
        let response = self.inner.complete(request).await?;
        let mut costs = self.costs.write().await;
        costs.record(&response.model, &response.usage, response.cost);
        Ok(response)
    }

    pub async fn get_costs(&self) -> CostTracker {
        self.costs.read().await.clone()
    }

    pub async fn reset_costs(&self) {
        *self.costs.write().await = CostTracker::new();
    }
}

/// In-memory test double that returns a fixed or scripted completion
/// without making a network call. Used by strategy and validation tests.
pub struct MockLlmClient {
    provider: Provider,
    models: Vec<ModelSpec>,
    responses: RwLock<Vec<String>>,
    calls: AtomicUsize,
}

impl MockLlmClient {
    /// A client that always returns the same completion text.
    pub fn fixed(content: impl Into<String>) -> Self {
        Self {
            provider: Provider::Anthropic,
            models: vec![ModelSpec::claude_sonnet()],
            responses: RwLock::new(vec![content.into()]),
            calls: AtomicUsize::new(0),
        }
    }

    /// A client that returns `responses` in call order, one per call,
    /// looping once exhausted. Useful for scripting a multi-worker beam
    /// where each worker should receive a distinct candidate. Order is
    /// tracked by a call counter rather than by request shape, since every
    /// caller in this crate sends a single user message per request.
    pub fn scripted(responses: Vec<String>) -> Self {
        assert!(!responses.is_empty(), "scripted responses must be non-empty");
        Self {
            provider: Provider::Anthropic,
            models: vec![ModelSpec::claude_sonnet()],
            responses: RwLock::new(responses),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<LlmCompletion> {
        let responses = self.responses.read().await;
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let idx = call % responses.len();
        let content = responses[idx].clone();
        Ok(CompletionResponse {
            id: format!("mock-{idx}"),
            model: request
                .model
                .unwrap_or_else(|| self.models[0].id.clone()),
            content,
            stop_reason: Some(StopReason::EndTurn),
            usage: TokenUsage::default(),
            timestamp: chrono::Utc::now(),
            cost: Some(0.0),
        })
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        Ok(EmbeddingResponse {
            model: self.models[0].id.clone(),
            embeddings: request.texts.iter().map(|_| vec![0.0_f32; 8]).collect(),
            usage: TokenUsage::default(),
        })
    }

    fn provider(&self) -> Provider {
        self.provider
    }

    fn available_models(&self) -> Vec<ModelSpec> {
        self.models.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_client_returns_fixed_content() {
        let client = MockLlmClient::fixed("SELECT 1");
        let response = client.complete(CompletionRequest::new()).await.unwrap();
        assert_eq!(response.content, "SELECT 1");
    }

    #[tokio::test]
    async fn tracked_client_accumulates_costs() {
        let tracked = TrackedClient::new(MockLlmClient::fixed("SELECT 1"));
        tracked.complete(CompletionRequest::new()).await.unwrap();
        tracked.complete(CompletionRequest::new()).await.unwrap();
        let costs = tracked.get_costs().await;
        assert_eq!(costs.request_count, 2);
    }
}
