//! Retry executor for model calls
//!
//! Wraps a single provider invocation with classified retry and
//! exponential backoff. Per invocation the state machine is:
//! attempt → success, or attempt → classify → retry (with backoff) /
//! fatal (stop) / exhausted (stop with the last cause).

use std::sync::Arc;

use tracing::Instrument;
use tracing::{debug, info, warn};

use crate::provider::{ModelProvider, ProviderRequest, ProviderResponse};
use crate::types::{CancellationToken, RelayError, RelayResult, RetryPolicy};

/// Retry executor for model calls.
///
/// Stateless between invocations; holds only the provider handle and the
/// policy. Backoff delays suspend the calling task only; concurrent calls
/// through the same executor proceed unaffected.
pub struct RetryExecutor {
    provider: Arc<dyn ModelProvider>,
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(provider: Arc<dyn ModelProvider>, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn provider(&self) -> &Arc<dyn ModelProvider> {
        &self.provider
    }

    /// Execute one generation with retry.
    ///
    /// The cancellation token is checked before every attempt, including
    /// the first, so an abandoned request stops before it spends another
    /// provider call. Fatal errors surface immediately; retryable errors
    /// are retried up to the attempt budget, then wrapped in
    /// [`RelayError::RetriesExhausted`] with the last cause attached.
    pub async fn execute(
        &self,
        request: ProviderRequest,
        cancellation: &CancellationToken,
    ) -> RelayResult<ProviderResponse> {
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 0..max_attempts {
            if cancellation.is_cancelled() {
                debug!(model = %request.model, attempt, "request cancelled before attempt");
                return Err(RelayError::Cancelled);
            }

            let attempt_span =
                tracing::info_span!("relay.attempt", model = %request.model, attempt, max_attempts);

            if attempt > 0 {
                let delay = self.policy.delay(attempt - 1);
                debug!(
                    model = %request.model,
                    "retry attempt {}/{} after {}ms",
                    attempt + 1,
                    max_attempts,
                    delay.as_millis()
                );
                tokio::time::sleep(delay)
                    .instrument(attempt_span.clone())
                    .await;
            }

            match self
                .provider
                .generate(request.clone())
                .instrument(attempt_span)
                .await
            {
                Ok(response) => {
                    if attempt > 0 {
                        info!(model = %request.model, "request succeeded on attempt {}", attempt + 1);
                    }
                    return Ok(response);
                }
                Err(error) => {
                    if error.is_fatal() {
                        warn!(model = %request.model, error = %error, "fatal error, not retrying");
                        return Err(error);
                    }
                    if attempt + 1 < max_attempts {
                        warn!(
                            model = %request.model,
                            error = %error,
                            "request failed (attempt {}), retrying",
                            attempt + 1
                        );
                        continue;
                    }
                    warn!(
                        model = %request.model,
                        error = %error,
                        "request failed after {} attempts",
                        attempt + 1
                    );
                    return Err(RelayError::RetriesExhausted {
                        attempts: max_attempts,
                        source: Box::new(error),
                    });
                }
            }
        }

        // max_attempts >= 1 means the loop always returns
        Err(RelayError::Other("retry loop completed without result".into()))
    }
}
