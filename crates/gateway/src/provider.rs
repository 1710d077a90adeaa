//! Provider abstraction — invocation trait, HTTP client, and registry.
//!
//! The gateway treats a provider as a black box with the contract
//! `invoke(request) -> (content, usage) | error`. A concrete
//! OpenAI-compatible HTTP client ships as the default implementation;
//! tests register in-process fakes through the same trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::ProviderEndpoint;
use crate::request::{Message, Usage};

/// Identity of a configured provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProviderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Input to a single provider invocation.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationRequest {
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Output of a successful provider invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderOutput {
    pub content: String,
    pub usage: Usage,
}

/// Error from a provider invocation. The coordinator maps these onto the
/// gateway error taxonomy and the circuit breaker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvokeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider returned error: {0}")]
    Api(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

/// An invocable text-generation provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn invoke(&self, request: &InvocationRequest) -> Result<ProviderOutput, InvokeError>;
}

/// OpenAI-compatible chat-completions client over HTTP.
pub struct HttpProviderClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpProviderClient {
    /// Build a client from an endpoint description. The API key is read
    /// from the environment variable named in the endpoint, when set.
    pub fn from_endpoint(endpoint: &ProviderEndpoint) -> Result<Self, InvokeError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| InvokeError::Transport(e.to_string()))?;

        let api_key = endpoint
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());

        Ok(Self {
            http,
            base_url: endpoint.url.trim_end_matches('/').to_string(),
            model: endpoint.model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn invoke(&self, request: &InvocationRequest) -> Result<ProviderOutput, InvokeError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let mut builder = self.http.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| InvokeError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(InvokeError::Api(format!("{status}: {detail}")));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| InvokeError::Malformed(e.to_string()))?;

        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| InvokeError::Malformed("missing choices[0].message.content".into()))?
            .to_string();

        let usage = Usage {
            prompt_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: value["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        };

        Ok(ProviderOutput { content, usage })
    }
}

/// Rolling per-provider call statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderStats {
    pub success_count: u64,
    pub error_count: u64,
    /// Rolling average latency over successful calls, in milliseconds.
    pub avg_latency_ms: u64,
}

impl ProviderStats {
    pub fn success_rate(&self) -> f32 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f32 / total as f32
        }
    }

    fn record_success(&mut self, latency_ms: u64) {
        self.avg_latency_ms = (self.avg_latency_ms * self.success_count + latency_ms)
            / (self.success_count + 1);
        self.success_count += 1;
    }

    fn record_failure(&mut self) {
        self.error_count += 1;
    }
}

/// Per-provider stats snapshot for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatsSnapshot {
    pub provider: ProviderId,
    pub success_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: u64,
    pub success_rate: f32,
}

/// Registry of invocable providers plus live call statistics.
#[derive(Default)]
pub struct ProviderRegistry {
    clients: HashMap<ProviderId, Arc<dyn ProviderClient>>,
    stats: Mutex<HashMap<ProviderId, ProviderStats>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under a provider id, replacing any previous one.
    pub fn register(&mut self, id: ProviderId, client: Arc<dyn ProviderClient>) {
        self.clients.insert(id, client);
    }

    pub fn client(&self, id: &ProviderId) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(id).cloned()
    }

    pub fn contains(&self, id: &ProviderId) -> bool {
        self.clients.contains_key(id)
    }

    pub fn record_success(&self, id: &ProviderId, latency_ms: u64) {
        let mut stats = self.stats.lock().expect("provider stats lock");
        stats.entry(id.clone()).or_default().record_success(latency_ms);
    }

    pub fn record_failure(&self, id: &ProviderId) {
        let mut stats = self.stats.lock().expect("provider stats lock");
        stats.entry(id.clone()).or_default().record_failure();
    }

    /// Rolling average latency for a provider, `None` until it has
    /// completed at least one successful call.
    pub fn avg_latency_ms(&self, id: &ProviderId) -> Option<u64> {
        let stats = self.stats.lock().expect("provider stats lock");
        stats
            .get(id)
            .filter(|s| s.success_count > 0)
            .map(|s| s.avg_latency_ms)
    }

    pub fn stats_snapshot(&self) -> Vec<ProviderStatsSnapshot> {
        let stats = self.stats.lock().expect("provider stats lock");
        let mut out: Vec<ProviderStatsSnapshot> = stats
            .iter()
            .map(|(id, s)| ProviderStatsSnapshot {
                provider: id.clone(),
                success_count: s.success_count,
                error_count: s.error_count,
                avg_latency_ms: s.avg_latency_ms,
                success_rate: s.success_rate(),
            })
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoProvider;

    #[async_trait]
    impl ProviderClient for EchoProvider {
        async fn invoke(
            &self,
            request: &InvocationRequest,
        ) -> Result<ProviderOutput, InvokeError> {
            Ok(ProviderOutput {
                content: request
                    .messages
                    .last()
                    .map(|m| m.content.clone())
                    .unwrap_or_default(),
                usage: Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                },
            })
        }
    }

    #[tokio::test]
    async fn test_registry_lookup_and_invoke() {
        let mut registry = ProviderRegistry::new();
        registry.register(ProviderId::from("echo"), Arc::new(EchoProvider));

        let client = registry.client(&ProviderId::from("echo")).unwrap();
        let output = client
            .invoke(&InvocationRequest {
                messages: vec![Message::user("hi")],
                temperature: 0.2,
                max_tokens: 64,
            })
            .await
            .unwrap();

        assert_eq!(output.content, "hi");
        assert!(registry.client(&ProviderId::from("missing")).is_none());
    }

    #[test]
    fn test_stats_rolling_average() {
        let registry = ProviderRegistry::new();
        let id = ProviderId::from("p");

        registry.record_success(&id, 100);
        registry.record_success(&id, 300);
        assert_eq!(registry.avg_latency_ms(&id), Some(200));

        registry.record_failure(&id);
        let snapshot = registry.stats_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].success_count, 2);
        assert_eq!(snapshot[0].error_count, 1);
        assert!((snapshot[0].success_rate - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_provider_has_no_latency() {
        let registry = ProviderRegistry::new();
        assert_eq!(registry.avg_latency_ms(&ProviderId::from("cold")), None);

        registry.record_failure(&ProviderId::from("cold"));
        // Failures alone never establish a latency estimate.
        assert_eq!(registry.avg_latency_ms(&ProviderId::from("cold")), None);
    }
}
