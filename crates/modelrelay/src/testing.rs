//! Test support: a scripted mock provider.
//!
//! Useful for exercising the retry/fallback/orchestration pipeline without
//! a live endpoint. Also used throughout this crate's own tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::provider::{ModelProvider, ProviderRequest, ProviderResponse, TextStream};
use crate::types::RelayResult;

/// A provider that replays scripted outcomes in order.
///
/// Outcomes are consumed per model when a per-model script exists, else
/// from the shared queue. Once a queue is drained the default response is
/// returned. Every call is counted, per model and in total.
pub struct MockProvider {
    name: String,
    script: Mutex<Vec<RelayResult<ProviderResponse>>>,
    per_model: Mutex<HashMap<String, Vec<RelayResult<ProviderResponse>>>>,
    default_response: String,
    call_count: AtomicUsize,
    model_calls: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(Vec::new()),
            per_model: Mutex::new(HashMap::new()),
            default_response: "This is a mock response.".to_string(),
            call_count: AtomicUsize::new(0),
            model_calls: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default_response(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    /// Queue an outcome on the shared script (returned in order).
    pub async fn push(&self, outcome: RelayResult<ProviderResponse>) {
        self.script.lock().await.push(outcome);
    }

    /// Queue an outcome for one specific model.
    pub async fn push_for_model(&self, model: &str, outcome: RelayResult<ProviderResponse>) {
        self.per_model
            .lock()
            .await
            .entry(model.to_string())
            .or_default()
            .push(outcome);
    }

    /// Total number of `generate` invocations.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// The most recent request seen by `generate`.
    pub async fn last_request(&self) -> Option<ProviderRequest> {
        self.requests.lock().await.last().cloned()
    }

    /// Number of `generate` invocations for one model.
    pub async fn calls_for_model(&self, model: &str) -> usize {
        self.model_calls
            .lock()
            .await
            .get(model)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: ProviderRequest) -> RelayResult<ProviderResponse> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        *self
            .model_calls
            .lock()
            .await
            .entry(request.model.clone())
            .or_insert(0) += 1;
        self.requests.lock().await.push(request.clone());

        {
            let mut per_model = self.per_model.lock().await;
            if let Some(queue) = per_model.get_mut(&request.model) {
                if !queue.is_empty() {
                    return queue.remove(0);
                }
            }
        }

        let mut script = self.script.lock().await;
        if script.is_empty() {
            Ok(ProviderResponse::text(self.default_response.clone()))
        } else {
            script.remove(0)
        }
    }

    async fn generate_stream(&self, request: ProviderRequest) -> RelayResult<TextStream> {
        let response = self.generate(request).await?;
        let chunks: Vec<RelayResult<String>> = response
            .text
            .split_inclusive(' ')
            .map(|s| Ok(s.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new("mock")
    }
}
