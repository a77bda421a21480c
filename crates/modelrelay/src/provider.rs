//! Model provider trait
//!
//! Defines the narrow call contract against the hosted model-serving
//! endpoint. The orchestrator depends only on this trait; the endpoint's
//! internals (HTTP transport, auth, request shaping) are opaque.

use crate::types::{GenerationConfig, GroundingSource, RelayError, RelayResult};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Streaming response type: a finite, non-restartable sequence of text
/// deltas. Ordering is guaranteed by the underlying stream.
pub type TextStream = Pin<Box<dyn Stream<Item = RelayResult<String>> + Send>>;

/// A single model invocation.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Model identifier to invoke. Taken from the fallback candidate, not
    /// from `config.model`, so the sequencer can redirect a request to an
    /// alternate tier without rewriting the config.
    pub model: String,
    /// Sanitized prompt text
    pub prompt: String,
    /// Generation parameters
    pub config: GenerationConfig,
}

/// A completed model invocation.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    /// Raw response text (sanitized by the orchestrator before it reaches
    /// the caller)
    pub text: String,
    /// Web-search citations, when the provider returned grounding metadata
    pub grounding: Option<Vec<GroundingSource>>,
    /// Prompt token count as reported by the provider, if available
    pub input_tokens: Option<u64>,
    /// Completion token count as reported by the provider, if available
    pub output_tokens: Option<u64>,
}

impl ProviderResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Model provider trait.
///
/// The single seam between the orchestration layer and the model-serving
/// API. Implementations may call a hosted endpoint, a local runtime, or a
/// test double.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name, used in logs and usage records
    fn name(&self) -> &str;

    /// Execute one non-streaming generation. May fail with any
    /// [`RelayError`]; the retry executor classifies the failure.
    async fn generate(&self, request: ProviderRequest) -> RelayResult<ProviderResponse>;

    /// Execute one streaming generation.
    ///
    /// Default implementation: streaming unsupported.
    async fn generate_stream(&self, _request: ProviderRequest) -> RelayResult<TextStream> {
        Err(RelayError::StreamingNotSupported(self.name().to_string()))
    }
}
