//! Core data model: generation config, results, errors, and retry policy.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Generation config and results
// ============================================================================

/// Per-call generation configuration.
///
/// Serialized (with lexicographically sorted keys) into the cache key, so
/// two semantically identical configs always fingerprint identically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationConfig {
    /// Model identifier (e.g., `"gemini-2.5-flash"`)
    pub model: String,
    /// Sampling temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling cutoff
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Maximum output tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    /// Token allowance for the model's extended-reasoning step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
    /// System instruction prepended by the provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    /// Request web-search grounding from the provider
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub use_search: bool,
}

impl GenerationConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            top_p: None,
            max_output_tokens: None,
            thinking_budget: None,
            system_instruction: None,
            use_search: false,
        }
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    pub fn thinking_budget(mut self, tokens: u32) -> Self {
        self.thinking_budget = Some(tokens);
        self
    }

    pub fn system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_search(mut self) -> Self {
        self.use_search = true;
        self
    }

    /// Effective output-token cap for this request.
    ///
    /// When a thinking budget was requested without an explicit output cap,
    /// reserve `thinking_budget * factor` output tokens so the final answer
    /// is not starved by the reasoning step. The factor is configurable via
    /// [`crate::orchestrator::OrchestratorConfig::thinking_output_factor`].
    pub fn effective_max_output_tokens(&self, thinking_output_factor: f64) -> Option<u32> {
        match (self.max_output_tokens, self.thinking_budget) {
            (Some(cap), _) => Some(cap),
            (None, Some(budget)) => Some((budget as f64 * thinking_output_factor).round() as u32),
            (None, None) => None,
        }
    }
}

/// A citation attached to a grounded (web-search-augmented) response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroundingSource {
    pub title: String,
    pub uri: String,
}

/// The outcome of a completed `generate` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Sanitized response text
    pub text: String,
    /// Web-search citations, when grounding was requested and returned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grounding: Option<Vec<GroundingSource>>,
    /// Wall-clock latency of the call in milliseconds
    pub latency_ms: u64,
    /// The model tier that actually answered (may differ from the requested
    /// model when fallback kicked in)
    pub model_used: String,
    /// Whether the result was served from cache
    pub cached: bool,
    /// Sanitizer diagnostics for patterns that were auto-redacted from the
    /// prompt. Non-empty flags do not fail the call; they are surfaced for
    /// audit logging.
    pub security_flags: Vec<String>,
}

// ============================================================================
// Error types
// ============================================================================

/// Relay error taxonomy.
///
/// Classification (retryable vs fatal) drives the retry executor and the
/// fallback sequencer; see [`RelayError::classify`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    /// Malformed, empty, or over-length input. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),
    /// Connection or read timeout
    #[error("Request timeout: {0}")]
    Timeout(String),
    /// Connection reset, DNS failure, or other transport error
    #[error("Network error: {0}")]
    Network(String),
    /// HTTP 429
    #[error("Rate limited: {0}")]
    RateLimited(String),
    /// HTTP 500/503
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    /// Provider API error with an optional status code
    #[error("API error: {message} (code: {code:?})")]
    Api {
        code: Option<String>,
        message: String,
    },
    /// Content-safety block from the provider. Request-level: no other
    /// model tier will accept it either.
    #[error("Blocked by safety filter: {0}")]
    SafetyBlocked(String),
    /// Geographic/region restriction
    #[error("Region restricted: {0}")]
    RegionRestricted(String),
    /// Permission or credential failure
    #[error("Authentication failed: {0}")]
    Auth(String),
    /// Malformed request arguments
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// Retry budget exhausted; carries the last observed cause
    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<RelayError>,
    },
    /// Every candidate model tier failed with retryable errors
    #[error("All fallback models exhausted (tried: {tried:?}): {source}")]
    FallbackExhausted {
        tried: Vec<String>,
        #[source]
        source: Box<RelayError>,
    },
    /// The caller abandoned the request
    #[error("Request cancelled")]
    Cancelled,
    /// Streaming was requested but the provider does not support it
    #[error("Streaming not supported by provider: {0}")]
    StreamingNotSupported(String),
    /// Anything the provider surfaced that we could not classify
    #[error("Relay error: {0}")]
    Other(String),
}

/// Relay result type
pub type RelayResult<T> = Result<T, RelayError>;

/// Whether an error is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: retry with backoff, then fall back to the next model tier
    Retryable,
    /// Request-level: abort immediately, no retry, no fallback
    Fatal,
}

impl RelayError {
    /// Classify this error for the retry executor and fallback sequencer.
    ///
    /// Transport failures, rate limits, and 5xx are retryable. Safety
    /// blocks, region restrictions, credential and argument errors are
    /// fatal. Unclassified provider errors default to retryable so the
    /// attempt limit decides.
    pub fn classify(&self) -> ErrorClass {
        match self {
            RelayError::Timeout(_)
            | RelayError::Network(_)
            | RelayError::RateLimited(_)
            | RelayError::ServiceUnavailable(_) => ErrorClass::Retryable,
            RelayError::Api { code, .. } => match code.as_deref() {
                Some("429") => ErrorClass::Retryable,
                Some(c) if c.starts_with('5') => ErrorClass::Retryable,
                Some(_) => ErrorClass::Fatal,
                // No status code: treat as transport-layer noise
                None => ErrorClass::Retryable,
            },
            RelayError::Validation(_)
            | RelayError::SafetyBlocked(_)
            | RelayError::RegionRestricted(_)
            | RelayError::Auth(_)
            | RelayError::InvalidArgument(_)
            | RelayError::RetriesExhausted { .. }
            | RelayError::FallbackExhausted { .. }
            | RelayError::Cancelled
            | RelayError::StreamingNotSupported(_) => ErrorClass::Fatal,
            RelayError::Other(_) => ErrorClass::Retryable,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.classify() == ErrorClass::Fatal
    }
}

// ============================================================================
// Retry policy
// ============================================================================

/// Retry policy: attempt budget plus exponential backoff with jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (>= 1)
    pub max_attempts: u32,
    /// Base delay before the first retry
    pub base_delay_ms: u64,
    /// Uniform jitter as a fraction of the computed delay (0.0–1.0)
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Create a policy that fails on the first error.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            jitter_ratio: 0.0,
        }
    }

    pub fn with_max_attempts(max: u32) -> Self {
        Self {
            max_attempts: max.max(1),
            ..Default::default()
        }
    }

    pub fn with_base_delay_ms(mut self, delay_ms: u64) -> Self {
        self.base_delay_ms = delay_ms;
        self
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (0-indexed: `retry = 0` is the
    /// delay between the first and second attempt).
    ///
    /// Base schedule is `base_delay_ms * 2^retry`, perturbed by a uniformly
    /// random factor within `1 ± jitter_ratio` so concurrent callers do not
    /// retry in lockstep.
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay_ms.saturating_mul(2u64.pow(retry.min(10)));
        let jitter = self.jitter_ratio.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            use rand::Rng;
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::from_millis((base as f64 * factor).round().max(0.0) as u64)
    }

    /// Check if an error should trigger another attempt.
    pub fn should_retry(&self, error: &RelayError) -> bool {
        error.classify() == ErrorClass::Retryable
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation token.
///
/// Clones share the underlying flag. The retry executor checks it before
/// each attempt and the orchestrator checks it before the cache-store step,
/// so an abandoned request never pollutes the cache.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancel: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}
