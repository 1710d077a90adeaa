//! Request-orchestration gateway for interchangeable text-generation
//! providers.
//!
//! The gateway sits in front of a configured set of providers and, per
//! request:
//! - assigns a correlation id and emits structured events end to end
//! - enforces per-caller token-bucket rate limits
//! - collapses concurrent identical requests into one execution
//! - classifies the task and recommends a prompting technique
//! - routes around failing providers via per-provider circuit breakers
//! - executes under one of three modes: `fast` (single candidate),
//!   `balanced` (ordered fallback chain), or `round_table` (concurrent
//!   fan-out with scored consensus and an optional judged pass)
//!
//! # Usage
//!
//! ```rust,ignore
//! use llm_gateway::{Gateway, GatewayConfig, Message, Request};
//!
//! let config = GatewayConfig::from_toml_file("gateway.toml")?;
//! let gateway = Gateway::from_config(config)?;
//!
//! let response = gateway
//!     .submit(Request::new(vec![Message::user("Explain borrow checking")])
//!         .with_caller("docs-agent"))
//!     .await?;
//!
//! println!("{} via {}", response.content, response.provider);
//! ```
//!
//! All gateway state (breakers, buckets, caches) is process-lifetime and
//! rebuilt from configuration on restart; nothing is persisted.

pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod events;
pub mod health;
pub mod limiter;
pub mod provider;
pub mod request;
pub mod router;

pub use classifier::{
    ClassifierBackend, ClassifierCacheStats, ClassifierError, KeywordClassifier, TaskCategory,
    TaskClassification, TaskClassifier, Technique, TechniqueMap,
};
pub use config::{
    BreakerConfig, ClassifierConfig, DedupConfig, GatewayConfig, LimiterConfig,
    ProviderDescriptor, ProviderEndpoint, RoundTableConfig, ScoreWeights, TieBreak,
};
pub use coordinator::round_table::{
    JudgeVerdict, ResponseScores, RoundTableEntry, RoundTableResult,
};
pub use coordinator::Gateway;
pub use dedup::{canonical_key, DedupSource, DedupStats, Deduplicator};
pub use error::{GatewayError, GatewayResult};
pub use events::{init_tracing, CorrelationId, EventBus, GatewayEvent, SharedEventBus};
pub use health::HealthSnapshot;
pub use limiter::{BucketStats, RateDecision, RateLimiter};
pub use provider::{
    HttpProviderClient, InvocationRequest, InvokeError, ProviderClient, ProviderId,
    ProviderOutput, ProviderRegistry,
};
pub use request::{CompletionResponse, ExecutionMode, Message, Request, Role, StageLatency, Usage};
pub use router::{
    BreakerSnapshot, CircuitBreaker, CircuitState, ProviderRouter, SelectionStrategy,
};
