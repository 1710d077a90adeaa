//! Gateway error taxonomy.
//!
//! Terminal failures carry the information a caller needs (retry hints,
//! which providers were attempted) and a stable `reason_code` for log
//! correlation. Provider-internal detail (stack traces, secrets) never
//! crosses this boundary.
//!
//! Variants are `Clone` so a deduplicated outcome can be fanned out to
//! every waiter attached to the same in-flight request.

/// Error type for gateway operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("rate limit exceeded, retry after {retry_after_seconds:.3}s")]
    RateLimitExceeded { retry_after_seconds: f64 },

    #[error("no eligible provider: {detail}")]
    ProviderUnavailable { detail: String },

    #[error("provider {provider} timed out after {timeout_ms}ms")]
    ProviderTimeout { provider: String, timeout_ms: u64 },

    #[error("provider {provider} failed: {message}")]
    ProviderError { provider: String, message: String },

    #[error("all {attempted} candidate provider(s) failed")]
    AllProvidersExhausted { attempted: usize },

    #[error("round table received {received} response(s), {required} required")]
    RoundTableInsufficientResponses { received: usize, required: usize },

    #[error("deduplicated request failed: {source}")]
    DeduplicationPropagated {
        #[source]
        source: Box<GatewayError>,
    },

    #[error("originating request of deduplicated group was canceled")]
    DeduplicationCanceled,

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Stable, machine-readable reason code for log events and callers.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::ProviderTimeout { .. } => "provider_timeout",
            Self::ProviderError { .. } => "provider_error",
            Self::AllProvidersExhausted { .. } => "all_providers_exhausted",
            Self::RoundTableInsufficientResponses { .. } => "round_table_insufficient_responses",
            Self::DeduplicationPropagated { .. } => "deduplication_propagated",
            Self::DeduplicationCanceled => "deduplication_canceled",
            Self::InvalidRequest { .. } => "invalid_request",
        }
    }

    /// Whether this failure is scoped to a single provider attempt
    /// (and therefore recoverable by trying the next candidate).
    pub fn is_provider_scoped(&self) -> bool {
        matches!(
            self,
            Self::ProviderTimeout { .. } | Self::ProviderError { .. }
        )
    }

    /// Wrap an error outcome shared from another caller's execution,
    /// so receivers can tell the failure was not unique to their call.
    pub fn propagated(self) -> Self {
        match self {
            already @ Self::DeduplicationPropagated { .. } => already,
            other => Self::DeduplicationPropagated {
                source: Box::new(other),
            },
        }
    }
}
