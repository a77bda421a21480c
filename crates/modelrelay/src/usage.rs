//! Usage and cost metering
//!
//! Records token counts, estimated cost, and latency per completed (or
//! cache-served) call, and folds them into running aggregates. Costs are
//! observability estimates from a static price table, not billing data.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

/// Heuristic used when the provider did not report token counts:
/// roughly four characters per token for English text.
pub const CHARS_PER_TOKEN: usize = 4;

/// Per-model prices in USD per million tokens.
#[derive(Debug, Clone, Copy)]
struct ModelPricing {
    input_per_million: f64,
    output_per_million: f64,
}

static PRICE_TABLE: Lazy<HashMap<&'static str, ModelPricing>> = Lazy::new(|| {
    HashMap::from([
        (
            "gemini-2.5-pro",
            ModelPricing {
                input_per_million: 1.25,
                output_per_million: 10.0,
            },
        ),
        (
            "gemini-2.5-flash",
            ModelPricing {
                input_per_million: 0.30,
                output_per_million: 2.50,
            },
        ),
        (
            "gemini-2.5-flash-lite",
            ModelPricing {
                input_per_million: 0.10,
                output_per_million: 0.40,
            },
        ),
        (
            "gemini-2.0-flash",
            ModelPricing {
                input_per_million: 0.10,
                output_per_million: 0.40,
            },
        ),
    ])
});

/// Raw facts about one completed call, as known to the orchestrator.
///
/// Token counts are optional; absent counts are estimated from the prompt
/// and response character lengths.
#[derive(Debug, Clone, Default)]
pub struct CallUsage {
    pub model: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub prompt_chars: usize,
    pub response_chars: usize,
    pub latency_ms: u64,
    pub cached: bool,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
}

/// An immutable record of one metered call.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub latency_ms: u64,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Per-model aggregate slice.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ModelUsage {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

/// Read-only aggregate snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct UsageMetrics {
    pub total_calls: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost: f64,
    pub average_latency_ms: f64,
    pub cache_hit_rate: f64,
    pub by_model: HashMap<String, ModelUsage>,
}

#[derive(Debug, Default)]
struct Aggregates {
    total_calls: u64,
    cached_calls: u64,
    total_input_tokens: u64,
    total_output_tokens: u64,
    total_cost: f64,
    total_latency_ms: u64,
    by_model: HashMap<String, ModelUsage>,
}

/// Shared usage tracker.
///
/// One instance is injected into the orchestrator; aggregate increments run
/// under a write lock so overlapping calls never lose updates. Records are
/// retained only in aggregate form; there is no unbounded log.
#[derive(Debug, Default)]
pub struct UsageTracker {
    aggregates: RwLock<Aggregates>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Estimate a token count from a character length.
    pub fn estimate_tokens(chars: usize) -> u64 {
        (chars / CHARS_PER_TOKEN) as u64
    }

    /// Cost of a call in USD, from the static price table. Unknown models
    /// meter at zero cost.
    fn cost_for(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        match PRICE_TABLE.get(model) {
            Some(pricing) => {
                (input_tokens as f64 / 1_000_000.0) * pricing.input_per_million
                    + (output_tokens as f64 / 1_000_000.0) * pricing.output_per_million
            }
            None => {
                debug!(model = %model, "model not in price table, metering zero cost");
                0.0
            }
        }
    }

    /// Meter one call. Never fails; a malformed record (e.g., unknown
    /// model) is counted with zeroed cost rather than dropped.
    pub async fn track(&self, usage: CallUsage) -> UsageRecord {
        let input_tokens = usage
            .input_tokens
            .unwrap_or_else(|| Self::estimate_tokens(usage.prompt_chars));
        let output_tokens = usage
            .output_tokens
            .unwrap_or_else(|| Self::estimate_tokens(usage.response_chars));
        let cost = Self::cost_for(&usage.model, input_tokens, output_tokens);

        let record = UsageRecord {
            model: usage.model,
            input_tokens,
            output_tokens,
            cost,
            latency_ms: usage.latency_ms,
            cached: usage.cached,
            session_id: usage.session_id,
            agent_id: usage.agent_id,
            timestamp: Utc::now(),
        };

        let mut agg = self.aggregates.write().await;
        agg.total_calls += 1;
        if record.cached {
            agg.cached_calls += 1;
        }
        agg.total_input_tokens += record.input_tokens;
        agg.total_output_tokens += record.output_tokens;
        agg.total_cost += record.cost;
        agg.total_latency_ms += record.latency_ms;

        let entry = agg.by_model.entry(record.model.clone()).or_default();
        entry.calls += 1;
        entry.input_tokens += record.input_tokens;
        entry.output_tokens += record.output_tokens;
        entry.cost += record.cost;

        record
    }

    /// Read-only aggregate snapshot.
    pub async fn metrics(&self) -> UsageMetrics {
        let agg = self.aggregates.read().await;
        let average_latency_ms = if agg.total_calls == 0 {
            0.0
        } else {
            agg.total_latency_ms as f64 / agg.total_calls as f64
        };
        let cache_hit_rate = if agg.total_calls == 0 {
            0.0
        } else {
            agg.cached_calls as f64 / agg.total_calls as f64
        };

        UsageMetrics {
            total_calls: agg.total_calls,
            total_input_tokens: agg.total_input_tokens,
            total_output_tokens: agg.total_output_tokens,
            total_cost: agg.total_cost,
            average_latency_ms,
            cache_hit_rate,
            by_model: agg.by_model.clone(),
        }
    }

    /// The aggregate snapshot in a serialization-friendly shape for
    /// external reporting.
    pub async fn export(&self) -> serde_json::Value {
        serde_json::to_value(self.metrics().await).unwrap_or(serde_json::Value::Null)
    }

    /// Zero every aggregate.
    pub async fn reset(&self) {
        let mut agg = self.aggregates.write().await;
        *agg = Aggregates::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(model: &str, input: u64, output: u64, latency: u64, cached: bool) -> CallUsage {
        CallUsage {
            model: model.to_string(),
            input_tokens: Some(input),
            output_tokens: Some(output),
            latency_ms: latency,
            cached,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_totals_match_sum_of_costs() {
        let tracker = UsageTracker::new();
        // gemini-2.5-flash: 0.30 in / 2.50 out per million
        tracker
            .track(call("gemini-2.5-flash", 1_000_000, 0, 100, false))
            .await;
        tracker
            .track(call("gemini-2.5-flash", 0, 1_000_000, 300, false))
            .await;

        let metrics = tracker.metrics().await;
        assert_eq!(metrics.total_calls, 2);
        assert_eq!(metrics.total_input_tokens, 1_000_000);
        assert_eq!(metrics.total_output_tokens, 1_000_000);
        assert!((metrics.total_cost - 2.80).abs() < 1e-9);
        assert!((metrics.average_latency_ms - 200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_token_estimation_from_char_lengths() {
        let tracker = UsageTracker::new();
        let record = tracker
            .track(CallUsage {
                model: "gemini-2.5-flash".to_string(),
                prompt_chars: 400,
                response_chars: 80,
                latency_ms: 50,
                ..Default::default()
            })
            .await;

        assert_eq!(record.input_tokens, 100);
        assert_eq!(record.output_tokens, 20);
    }

    #[tokio::test]
    async fn test_explicit_counts_beat_estimation() {
        let tracker = UsageTracker::new();
        let record = tracker
            .track(CallUsage {
                model: "gemini-2.5-flash".to_string(),
                input_tokens: Some(7),
                prompt_chars: 4000,
                ..Default::default()
            })
            .await;
        assert_eq!(record.input_tokens, 7);
    }

    #[tokio::test]
    async fn test_unknown_model_meters_zero_cost() {
        let tracker = UsageTracker::new();
        let record = tracker
            .track(call("not-a-model", 1_000_000, 1_000_000, 10, false))
            .await;
        assert_eq!(record.cost, 0.0);
        assert_eq!(tracker.metrics().await.total_calls, 1);
    }

    #[tokio::test]
    async fn test_cache_hit_rate() {
        let tracker = UsageTracker::new();
        tracker.track(call("gemini-2.5-flash", 1, 1, 1, true)).await;
        tracker.track(call("gemini-2.5-flash", 1, 1, 1, false)).await;
        tracker.track(call("gemini-2.5-flash", 1, 1, 1, true)).await;
        tracker.track(call("gemini-2.5-flash", 1, 1, 1, true)).await;

        let metrics = tracker.metrics().await;
        assert!((metrics.cache_hit_rate - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_per_model_breakdown() {
        let tracker = UsageTracker::new();
        tracker
            .track(call("gemini-2.5-pro", 100, 200, 10, false))
            .await;
        tracker
            .track(call("gemini-2.5-flash", 300, 400, 10, false))
            .await;
        tracker
            .track(call("gemini-2.5-pro", 50, 50, 10, false))
            .await;

        let metrics = tracker.metrics().await;
        assert_eq!(metrics.by_model.len(), 2);
        let pro = &metrics.by_model["gemini-2.5-pro"];
        assert_eq!(pro.calls, 2);
        assert_eq!(pro.input_tokens, 150);
        assert_eq!(pro.output_tokens, 250);
    }

    #[tokio::test]
    async fn test_export_shape() {
        let tracker = UsageTracker::new();
        tracker.track(call("gemini-2.5-flash", 10, 10, 5, false)).await;

        let exported = tracker.export().await;
        assert_eq!(exported["total_calls"], 1);
        assert!(exported["by_model"]["gemini-2.5-flash"].is_object());
    }

    #[tokio::test]
    async fn test_reset_zeroes_aggregates() {
        let tracker = UsageTracker::new();
        tracker.track(call("gemini-2.5-flash", 10, 10, 5, false)).await;
        tracker.reset().await;

        let metrics = tracker.metrics().await;
        assert_eq!(metrics.total_calls, 0);
        assert_eq!(metrics.total_cost, 0.0);
        assert!(metrics.by_model.is_empty());
    }
}
