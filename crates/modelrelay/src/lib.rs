//! modelrelay: an orchestration layer between application code and a hosted
//! LLM endpoint.
//!
//! The crate wraps every model call in one fixed pipeline: prompt validation
//! and sanitization, a bounded LRU+TTL response cache, classified retry with
//! exponential backoff, model-tier fallback, output sanitization, and usage
//! metering. The model endpoint itself stays behind the [`ModelProvider`]
//! trait; the orchestrator never speaks HTTP.
//!
//! ```no_run
//! use std::sync::Arc;
//! use modelrelay::{
//!     CacheConfig, GenerateOptions, GenerationConfig, Orchestrator,
//!     OrchestratorConfig, ResponseCache, UsageTracker,
//! };
//! # use modelrelay::testing::MockProvider;
//!
//! # async fn run() -> modelrelay::RelayResult<()> {
//! let provider = Arc::new(MockProvider::new("mock"));
//! let orchestrator = Orchestrator::new(
//!     provider,
//!     Arc::new(ResponseCache::new(CacheConfig::default())),
//!     Arc::new(UsageTracker::new()),
//!     OrchestratorConfig::default(),
//! );
//!
//! let config = GenerationConfig::new("gemini-2.5-flash").temperature(0.7);
//! let result = orchestrator
//!     .generate(&config, "Summarize this document.", GenerateOptions::default())
//!     .await?;
//! println!("{} (from {})", result.text, result.model_used);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod fallback;
pub mod orchestrator;
pub mod provider;
pub mod retry;
pub mod sanitize;
pub mod testing;
pub mod types;
pub mod usage;

pub use cache::{CacheConfig, CacheMetrics, ResponseCache};
pub use fallback::{FallbackOutcome, FallbackSequencer};
pub use orchestrator::{GenerateOptions, Orchestrator, OrchestratorConfig};
pub use provider::{ModelProvider, ProviderRequest, ProviderResponse, TextStream};
pub use retry::RetryExecutor;
pub use sanitize::{SanitizationResult, ValidationOptions};
pub use types::{
    CancellationToken, ErrorClass, GenerationConfig, GenerationResult, GroundingSource,
    RelayError, RelayResult, RetryPolicy,
};
pub use usage::{CallUsage, ModelUsage, UsageMetrics, UsageRecord, UsageTracker};
