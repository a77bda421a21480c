//! Model-tier fallback sequencing
//!
//! Tries an ordered, de-duplicated list of model tiers: the requested
//! model first, then the configured fallback chain. Each candidate gets a
//! full retry budget via [`RetryExecutor`]; a fatal error from any
//! candidate aborts the whole sequence, because fatal errors are
//! request-level and no other tier will accept the request either.

use std::sync::Arc;

use tracing::{info, warn};

use crate::provider::{ModelProvider, ProviderRequest, ProviderResponse};
use crate::retry::RetryExecutor;
use crate::types::{CancellationToken, GenerationConfig, RelayError, RelayResult, RetryPolicy};

/// Sequences retry-wrapped attempts across model tiers.
pub struct FallbackSequencer {
    executor: RetryExecutor,
    fallback_chain: Vec<String>,
}

/// A successful generation, tagged with the tier that actually answered.
#[derive(Debug, Clone)]
pub struct FallbackOutcome {
    pub response: ProviderResponse,
    pub model_used: String,
}

impl FallbackSequencer {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        policy: RetryPolicy,
        fallback_chain: Vec<String>,
    ) -> Self {
        Self {
            executor: RetryExecutor::new(provider, policy),
            fallback_chain,
        }
    }

    /// The underlying provider handle, for call paths that bypass retry
    /// and fallback (streaming).
    pub fn provider(&self) -> &Arc<dyn ModelProvider> {
        self.executor.provider()
    }

    /// The ordered candidate list for a requested model: the model itself,
    /// then the configured chain, first-seen order, no duplicates.
    pub fn candidates(&self, requested: &str) -> Vec<String> {
        let mut candidates: Vec<String> = vec![requested.to_string()];
        for model in &self.fallback_chain {
            if !candidates.iter().any(|c| c == model) {
                candidates.push(model.clone());
            }
        }
        candidates
    }

    /// Run the sequence for one request.
    ///
    /// Retry-exhaustion on a candidate moves on to the next tier; success
    /// returns immediately with `model_used` set to the answering tier;
    /// any fatal error (including cancellation) propagates unchanged. When
    /// every tier is exhausted the error carries the full candidate list
    /// and the last underlying failure.
    pub async fn execute(
        &self,
        config: &GenerationConfig,
        prompt: &str,
        cancellation: &CancellationToken,
    ) -> RelayResult<FallbackOutcome> {
        let candidates = self.candidates(&config.model);
        let mut last_error: Option<RelayError> = None;

        for model in &candidates {
            let request = ProviderRequest {
                model: model.clone(),
                prompt: prompt.to_string(),
                config: config.clone(),
            };

            match self.executor.execute(request, cancellation).await {
                Ok(response) => {
                    if model != &config.model {
                        info!(requested = %config.model, model_used = %model, "fallback tier answered");
                    }
                    return Ok(FallbackOutcome {
                        response,
                        model_used: model.clone(),
                    });
                }
                Err(error @ RelayError::RetriesExhausted { .. }) => {
                    warn!(model = %model, error = %error, "tier exhausted, trying next");
                    last_error = Some(error);
                }
                // Fatal errors are request-level: trying another tier is
                // pointless and wasteful.
                Err(error) => return Err(error),
            }
        }

        Err(RelayError::FallbackExhausted {
            tried: candidates,
            source: Box::new(
                last_error.unwrap_or_else(|| RelayError::Other("no candidates attempted".into())),
            ),
        })
    }
}
