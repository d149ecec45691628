//! Query-aware model selection.
//!
//! Unlike the teacher's router, which classifies free-text queries into an
//! architecture/debugging/extraction taxonomy via regex, the only routing
//! signal a beam run has is which role it already assigned a worker
//! (`proven_compound`, `structural_alt`, `aggressive`, `exploration`) --
//! that's a stronger, cheaper-to-read signal than re-deriving intent from
//! prompt text, so the classifier here keys off the `worker_role` metadata
//! entry callers attach to a [`CompletionRequest`] instead.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;

use super::client::{LlmClient, LlmCompletion};
use super::types::{
    CompletionRequest, EmbeddingRequest, EmbeddingResponse, ModelSpec, ModelTier, Provider,
};

/// Metadata key a caller sets on a [`CompletionRequest`] to hint which
/// model tier it wants routed. Unrecognized or absent values route to
/// [`ModelTier::Balanced`].
pub const WORKER_ROLE_METADATA_KEY: &str = "worker_role";

/// Default model for each tier.
#[derive(Debug, Clone)]
pub struct TierDefaults {
    pub flagship: ModelSpec,
    pub balanced: ModelSpec,
    pub fast: ModelSpec,
}

impl Default for TierDefaults {
    fn default() -> Self {
        Self {
            flagship: ModelSpec::claude_opus(),
            balanced: ModelSpec::claude_sonnet(),
            fast: ModelSpec::claude_haiku(),
        }
    }
}

/// Maps a worker-role tag to the tier that role should run at. Exploration
/// gets the most capable model since it has no gap family or examples to
/// lean on; a proven-compound worker is just applying a demonstrated
/// transform and runs fine on the cheapest tier. The analyst and snipe
/// phases aren't per-worker roles but route through the same table.
fn tier_for_role(role: &str) -> ModelTier {
    match role {
        "proven_compound" => ModelTier::Fast,
        "structural_alt" | "aggressive" | "snipe" => ModelTier::Balanced,
        "exploration" | "analyst" => ModelTier::Flagship,
        _ => ModelTier::Balanced,
    }
}

/// Wraps an [`LlmClient`] and picks a model per request by worker role
/// instead of requiring every caller to hardcode a model ID. An explicit
/// `request.model` always wins -- routing only fills in a gap.
pub struct RoutedLlmClient {
    inner: Arc<dyn LlmClient>,
    models: Vec<ModelSpec>,
    tier_defaults: TierDefaults,
}

impl RoutedLlmClient {
    /// Wrap `inner`, routing across the default Anthropic/OpenAI model set.
    pub fn new(inner: Arc<dyn LlmClient>) -> Self {
        Self {
            inner,
            models: vec![
                ModelSpec::claude_opus(),
                ModelSpec::claude_sonnet(),
                ModelSpec::claude_haiku(),
                ModelSpec::gpt4o(),
                ModelSpec::gpt4o_mini(),
            ],
            tier_defaults: TierDefaults::default(),
        }
    }

    /// Wrap `inner`, routing across a caller-supplied model set. Per-tier
    /// defaults fall back to the cheapest model declared for that tier.
    pub fn with_models(inner: Arc<dyn LlmClient>, models: Vec<ModelSpec>) -> Self {
        let cheapest = |tier: ModelTier, fallback: fn() -> ModelSpec| {
            models
                .iter()
                .filter(|m| m.tier == tier)
                .min_by(|a, b| a.input_cost_per_m.partial_cmp(&b.input_cost_per_m).unwrap())
                .cloned()
                .unwrap_or_else(fallback)
        };
        let tier_defaults = TierDefaults {
            flagship: cheapest(ModelTier::Flagship, ModelSpec::claude_opus),
            balanced: cheapest(ModelTier::Balanced, ModelSpec::claude_sonnet),
            fast: cheapest(ModelTier::Fast, ModelSpec::claude_haiku),
        };
        Self {
            inner,
            models,
            tier_defaults,
        }
    }

    fn select_model(&self, tier: ModelTier) -> ModelSpec {
        self.models
            .iter()
            .filter(|m| m.tier == tier)
            .min_by(|a, b| a.input_cost_per_m.partial_cmp(&b.input_cost_per_m).unwrap())
            .cloned()
            .unwrap_or_else(|| self.tier_default(tier))
    }

    fn tier_default(&self, tier: ModelTier) -> ModelSpec {
        match tier {
            ModelTier::Flagship => self.tier_defaults.flagship.clone(),
            ModelTier::Balanced => self.tier_defaults.balanced.clone(),
            ModelTier::Fast => self.tier_defaults.fast.clone(),
        }
    }
}

#[async_trait]
impl LlmClient for RoutedLlmClient {
    async fn complete(&self, mut request: CompletionRequest) -> Result<LlmCompletion> {
        if request.model.is_none() {
            let tier = request
                .metadata
                .as_ref()
                .and_then(|m| m.get(WORKER_ROLE_METADATA_KEY))
                .map(|role| tier_for_role(role))
                .unwrap_or(ModelTier::Balanced);
            request.model = Some(self.select_model(tier).id);
        }
        self.inner.complete(request).await
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        self.inner.embed(request).await
    }

    fn provider(&self) -> Provider {
        self.inner.provider()
    }

    fn available_models(&self) -> Vec<ModelSpec> {
        self.models.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[tokio::test]
    async fn routes_exploration_to_flagship_tier() {
        let mock = Arc::new(MockLlmClient::fixed("ok"));
        let router = RoutedLlmClient::new(mock);
        let request = CompletionRequest::new().with_metadata(WORKER_ROLE_METADATA_KEY, "exploration");
        let expected = router.select_model(ModelTier::Flagship).id;
        let response = router.complete(request).await.unwrap();
        assert_eq!(response.model, expected);
    }

    #[tokio::test]
    async fn routes_proven_compound_to_fast_tier() {
        let mock = Arc::new(MockLlmClient::fixed("ok"));
        let router = RoutedLlmClient::new(mock);
        let request =
            CompletionRequest::new().with_metadata(WORKER_ROLE_METADATA_KEY, "proven_compound");
        let expected = router.select_model(ModelTier::Fast).id;
        let response = router.complete(request).await.unwrap();
        assert_eq!(response.model, expected);
    }

    #[tokio::test]
    async fn explicit_model_overrides_routing() {
        let mock = Arc::new(MockLlmClient::fixed("ok"));
        let router = RoutedLlmClient::new(mock);
        let request = CompletionRequest::new()
            .with_model("pinned-model")
            .with_metadata(WORKER_ROLE_METADATA_KEY, "exploration");
        let response = router.complete(request).await.unwrap();
        assert_eq!(response.model, "pinned-model");
    }
}
