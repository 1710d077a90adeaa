//! Request and response data model.
//!
//! A [`Request`] is immutable once submitted: the builder methods consume
//! and return the value, and the coordinator only ever reads from it.

use serde::{Deserialize, Serialize};

use crate::classifier::{TaskCategory, Technique};
use crate::events::CorrelationId;
use crate::provider::ProviderId;

/// Role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// How the coordinator executes a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Single top-ranked provider, no fallback. Lowest latency.
    Fast,
    /// Ordered fallback chain until one provider succeeds. The default.
    #[default]
    Balanced,
    /// All eligible providers concurrently, winner picked by scoring.
    RoundTable,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Balanced => write!(f, "balanced"),
            Self::RoundTable => write!(f, "round_table"),
        }
    }
}

/// A completion request submitted to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Ordered conversation turns.
    pub messages: Vec<Message>,
    /// Optional free-text description of the task, used as a
    /// classification hint.
    pub task_hint: Option<String>,
    /// Skip routing and use this provider (breaker state still applies).
    pub forced_provider: Option<ProviderId>,
    /// Override the technique recommended by classification.
    pub forced_technique: Option<Technique>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum output size in tokens.
    pub max_tokens: u32,
    /// Execution mode selector.
    pub mode: ExecutionMode,
    /// Caller identity, used for rate-limit keying.
    pub caller: String,
    /// Caller-supplied correlation id; generated at entry when absent.
    pub correlation_id: Option<CorrelationId>,
}

impl Request {
    /// Create a request with default sampling settings.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            task_hint: None,
            forced_provider: None,
            forced_technique: None,
            temperature: 0.7,
            max_tokens: 1024,
            mode: ExecutionMode::default(),
            caller: "anonymous".to_string(),
            correlation_id: None,
        }
    }

    pub fn with_task_hint(mut self, hint: impl Into<String>) -> Self {
        self.task_hint = Some(hint.into());
        self
    }

    pub fn with_provider(mut self, provider: ProviderId) -> Self {
        self.forced_provider = Some(provider);
        self
    }

    pub fn with_technique(mut self, technique: Technique) -> Self {
        self.forced_technique = Some(technique);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = caller.into();
        self
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Concatenated text used for classification: the task hint when
    /// present, otherwise the user-visible conversation content.
    pub fn classification_text(&self) -> String {
        if let Some(ref hint) = self.task_hint {
            return hint.clone();
        }
        self.messages
            .iter()
            .filter(|m| m.role != Role::Assistant)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Token accounting for a single provider invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Per-stage latency breakdown for a completed request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StageLatency {
    pub classification_ms: u64,
    pub routing_ms: u64,
    pub execution_ms: u64,
}

impl StageLatency {
    pub fn total_ms(&self) -> u64 {
        self.classification_ms + self.routing_ms + self.execution_ms
    }
}

/// Final response returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Output content from the winning provider.
    pub content: String,
    /// Provider actually used.
    pub provider: ProviderId,
    /// Technique actually applied.
    pub technique: Technique,
    /// Task category the request was classified as.
    pub category: TaskCategory,
    /// Per-stage latency breakdown.
    pub latency: StageLatency,
    /// Token accounting.
    pub usage: Usage,
    /// Estimated cost in USD, from the provider's configured pricing.
    pub estimated_cost_usd: f64,
    /// Correlation id for this call.
    pub correlation_id: CorrelationId,
    /// True when this response was shared from a concurrent identical
    /// request or served from the deduplication result cache.
    pub deduplicated: bool,
}
