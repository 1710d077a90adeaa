//! Execution coordinator — the gateway's single entry point.
//!
//! Orchestrates the per-request pipeline: admission (rate limit) →
//! deduplication → classification → routing → execution, under one of
//! three modes (fast, balanced, round table). Every stage publishes a
//! structured event carrying the request's correlation id and feeds the
//! per-stage latency breakdown on the response.

pub mod round_table;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::broadcast;

use crate::classifier::{
    ClassifierBackend, KeywordClassifier, TaskCategory, TaskClassifier, Technique,
};
use crate::config::GatewayConfig;
use crate::dedup::{canonical_key, DedupSource, Deduplicator};
use crate::error::{GatewayError, GatewayResult};
use crate::events::{CorrelationId, EventBus, GatewayEvent, SharedEventBus};
use crate::health::HealthSnapshot;
use crate::limiter::RateLimiter;
use crate::provider::{
    HttpProviderClient, InvocationRequest, ProviderId, ProviderOutput, ProviderRegistry,
};
use crate::request::{CompletionResponse, ExecutionMode, Message, Request, StageLatency, Usage};
use crate::router::{CircuitBreaker, CircuitTransition, ProviderRouter};

use round_table::{
    judge_prompt, parse_judge_verdict, rank_entries, scored_confidence, tie_break_swaps,
    ResponseScorer, RoundTableEntry, RoundTableHistory, RoundTableResult,
};

/// Request-orchestration gateway over a set of interchangeable providers.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<ProviderRegistry>,
    breaker: Arc<CircuitBreaker>,
    router: ProviderRouter,
    limiter: RateLimiter,
    dedup: Deduplicator<CompletionResponse>,
    classifier: TaskClassifier,
    events: SharedEventBus,
    history: RoundTableHistory,
}

impl Gateway {
    /// Build a gateway over a pre-populated provider registry, using the
    /// default keyword classification backend.
    pub fn new(config: GatewayConfig, registry: ProviderRegistry) -> Self {
        Self::with_classifier_backend(config, registry, Arc::new(KeywordClassifier))
    }

    /// Build a gateway with a custom classification backend.
    pub fn with_classifier_backend(
        config: GatewayConfig,
        registry: ProviderRegistry,
        backend: Arc<dyn ClassifierBackend>,
    ) -> Self {
        let registry = Arc::new(registry);
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let router = ProviderRouter::new(
            config.providers.clone(),
            breaker.clone(),
            registry.clone(),
        );
        let limiter = RateLimiter::new(config.limiter.clone());
        let dedup = Deduplicator::new(config.dedup.clone());
        let classifier = TaskClassifier::new(
            backend,
            config.techniques.clone(),
            config.classifier.clone(),
        );
        let history = RoundTableHistory::new(config.round_table.history_limit);

        Self {
            config,
            registry,
            breaker,
            router,
            limiter,
            dedup,
            classifier,
            events: EventBus::new().shared(),
            history,
        }
    }

    /// Build a gateway from configuration alone, constructing the
    /// built-in HTTP client for every descriptor that carries an
    /// endpoint.
    pub fn from_config(config: GatewayConfig) -> anyhow::Result<Self> {
        let mut registry = ProviderRegistry::new();
        for descriptor in &config.providers {
            if let Some(ref endpoint) = descriptor.endpoint {
                let client = HttpProviderClient::from_endpoint(endpoint).with_context(|| {
                    format!("failed to build client for provider {}", descriptor.name)
                })?;
                registry.register(descriptor.name.clone(), Arc::new(client));
            }
        }
        Ok(Self::new(config, registry))
    }

    /// Subscribe to the gateway's structured event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Submit a request and drive it to completion or terminal failure.
    pub async fn submit(&self, request: Request) -> GatewayResult<CompletionResponse> {
        let correlation_id = request.correlation_id.clone().unwrap_or_default();

        self.events.publish(GatewayEvent::RequestReceived {
            correlation_id: correlation_id.clone(),
            caller: request.caller.clone(),
            mode: request.mode,
            timestamp: Utc::now(),
        });

        if request.messages.is_empty() {
            return self.fail(
                &correlation_id,
                GatewayError::InvalidRequest {
                    reason: "request has no messages".into(),
                },
            );
        }

        // Admission control runs first: a rejected caller consumes no
        // classifier or dedup work, and the denial is never retried here.
        let rate_key = format!("{}:completions", request.caller);
        let decision = self.limiter.consume(&rate_key, 1.0);
        self.events.publish(GatewayEvent::RateLimitDecision {
            correlation_id: correlation_id.clone(),
            key: rate_key,
            allowed: decision.allowed,
            retry_after_seconds: decision.retry_after_seconds,
            timestamp: Utc::now(),
        });
        if !decision.allowed {
            return self.fail(
                &correlation_id,
                GatewayError::RateLimitExceeded {
                    retry_after_seconds: decision.retry_after_seconds,
                },
            );
        }

        let dedup_key = canonical_key(&request);
        let (outcome, source) = self
            .dedup
            .execute_once(&dedup_key, self.execute(&request, &correlation_id))
            .await;

        self.events.publish(GatewayEvent::DedupLookup {
            correlation_id: correlation_id.clone(),
            hit: source != DedupSource::Executed,
            timestamp: Utc::now(),
        });

        match outcome {
            Ok(mut response) => {
                if source != DedupSource::Executed {
                    response.deduplicated = true;
                    response.correlation_id = correlation_id.clone();
                }
                self.events.publish(GatewayEvent::RequestCompleted {
                    correlation_id,
                    provider: response.provider.clone(),
                    total_latency_ms: response.latency.total_ms(),
                    timestamp: Utc::now(),
                });
                Ok(response)
            }
            Err(err) => self.fail(&correlation_id, err),
        }
    }

    /// Diagnostics snapshot: breaker states, bucket utilization,
    /// deduplication entries, classifier cache performance.
    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            breakers: self.breaker.snapshot(),
            rate_limits: self.limiter.stats(),
            dedup: self.dedup.stats(),
            classifier_cache: self.classifier.cache_stats(),
            providers: self.registry.stats_snapshot(),
            generated_at: Utc::now(),
        }
    }

    /// Recent round-table results, newest last.
    pub fn round_table_history(&self, limit: usize) -> Vec<RoundTableResult> {
        self.history.recent(limit)
    }

    /// Round-table win counts per provider across retained history.
    pub fn round_table_wins(&self) -> HashMap<ProviderId, u32> {
        self.history.provider_wins()
    }

    /// Manually reset a provider's circuit to closed (ops recovery).
    pub fn reset_breaker(&self, provider: &ProviderId) {
        self.breaker.reset(provider);
    }

    /// Reset rate-limit state for one key, or all keys when `None`.
    pub fn reset_rate_limits(&self, key: Option<&str>) {
        match key {
            Some(key) => self.limiter.reset(key),
            None => self.limiter.reset_all(),
        }
    }

    /// Estimated cost of a call against a provider's configured pricing.
    pub fn estimate_cost(&self, provider: &ProviderId, usage: &Usage) -> f64 {
        self.router
            .descriptor(provider)
            .map(|d| d.estimate_cost(usage))
            .unwrap_or(0.0)
    }

    // =========================================================================
    // Pipeline
    // =========================================================================

    async fn execute(
        &self,
        request: &Request,
        correlation_id: &CorrelationId,
    ) -> GatewayResult<CompletionResponse> {
        // CLASSIFY — degraded classification never fails the request.
        let classification = self.classifier.classify(request).await;
        self.events.publish(GatewayEvent::ClassificationCompleted {
            correlation_id: correlation_id.clone(),
            category: classification.category,
            technique: classification.technique,
            confidence: classification.confidence,
            cached: classification.cached,
            latency_ms: classification.latency_ms,
            timestamp: Utc::now(),
        });
        let category = classification.category;
        let technique = request.forced_technique.unwrap_or(classification.technique);

        // ROUTE
        let routing_started = Instant::now();
        let candidates = match request.forced_provider {
            Some(ref provider) => self.router.forced(provider)?,
            None => self
                .router
                .candidates(category, self.config.default_strategy),
        };
        let routing_ms = routing_started.elapsed().as_millis() as u64;
        self.events.publish(GatewayEvent::ProvidersSelected {
            correlation_id: correlation_id.clone(),
            strategy: self.config.default_strategy,
            candidates: candidates.clone(),
            timestamp: Utc::now(),
        });

        // EXECUTE
        let invocation = InvocationRequest {
            messages: apply_technique(&request.messages, technique),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };
        let execution_started = Instant::now();
        let (provider, output) = match request.mode {
            ExecutionMode::Fast => {
                self.execute_fast(&candidates, &invocation, correlation_id, category)
                    .await?
            }
            ExecutionMode::Balanced => {
                self.execute_balanced(&candidates, &invocation, correlation_id, category)
                    .await?
            }
            ExecutionMode::RoundTable => {
                self.execute_round_table(request, &candidates, &invocation, correlation_id, category)
                    .await?
            }
        };

        let latency = StageLatency {
            classification_ms: classification.latency_ms,
            routing_ms,
            execution_ms: execution_started.elapsed().as_millis() as u64,
        };

        Ok(CompletionResponse {
            estimated_cost_usd: self.estimate_cost(&provider, &output.usage),
            content: output.content,
            provider,
            technique,
            category,
            latency,
            usage: output.usage,
            correlation_id: correlation_id.clone(),
            deduplicated: false,
        })
    }

    /// Fast mode: single top-ranked candidate, no fallback.
    async fn execute_fast(
        &self,
        candidates: &[ProviderId],
        invocation: &InvocationRequest,
        correlation_id: &CorrelationId,
        category: TaskCategory,
    ) -> GatewayResult<(ProviderId, ProviderOutput)> {
        let provider = candidates.first().ok_or_else(|| no_eligible(category))?;
        match self
            .invoke_candidate(provider, invocation, correlation_id, None)
            .await
        {
            Ok((output, _)) => Ok((provider.clone(), output)),
            Err(_) => Err(GatewayError::AllProvidersExhausted { attempted: 1 }),
        }
    }

    /// Balanced mode: walk the fallback chain until one provider succeeds.
    async fn execute_balanced(
        &self,
        candidates: &[ProviderId],
        invocation: &InvocationRequest,
        correlation_id: &CorrelationId,
        category: TaskCategory,
    ) -> GatewayResult<(ProviderId, ProviderOutput)> {
        if candidates.is_empty() {
            return Err(no_eligible(category));
        }
        for provider in candidates {
            match self
                .invoke_candidate(provider, invocation, correlation_id, None)
                .await
            {
                Ok((output, _)) => return Ok((provider.clone(), output)),
                Err(_) => continue,
            }
        }
        Err(GatewayError::AllProvidersExhausted {
            attempted: candidates.len(),
        })
    }

    /// Round-table mode: fan out, score, optionally judge, pick a winner.
    async fn execute_round_table(
        &self,
        request: &Request,
        candidates: &[ProviderId],
        invocation: &InvocationRequest,
        correlation_id: &CorrelationId,
        category: TaskCategory,
    ) -> GatewayResult<(ProviderId, ProviderOutput)> {
        let rt = &self.config.round_table;

        let mut participants = candidates.to_vec();
        if rt.max_participants > 0 && participants.len() > rt.max_participants {
            participants.truncate(rt.max_participants);
        }
        if participants.is_empty() {
            return Err(GatewayError::RoundTableInsufficientResponses {
                received: 0,
                required: rt.min_responses,
            });
        }

        let started = Instant::now();
        let mode_timeout = Duration::from_millis(rt.timeout_ms);
        let prompt_text = request.classification_text();

        let calls = participants.iter().map(|provider| async move {
            let outcome = self
                .invoke_candidate(provider, invocation, correlation_id, Some(mode_timeout))
                .await;
            (provider.clone(), outcome)
        });
        let outcomes = join_all(calls).await;

        let mut entries: Vec<RoundTableEntry> = outcomes
            .into_iter()
            .map(|(provider, outcome)| match outcome {
                Ok((output, latency_ms)) => {
                    let cost_usd = self.estimate_cost(&provider, &output.usage);
                    let scores = ResponseScorer::score(
                        &output.content,
                        &prompt_text,
                        category,
                        latency_ms,
                        cost_usd,
                    );
                    RoundTableEntry {
                        provider,
                        content: Some(output.content),
                        usage: output.usage,
                        latency_ms,
                        cost_usd,
                        scores,
                        total_score: 0.0,
                        rank: 0,
                        error: None,
                    }
                }
                Err(err) => RoundTableEntry {
                    provider,
                    content: None,
                    usage: Usage::default(),
                    latency_ms: 0,
                    cost_usd: 0.0,
                    scores: Default::default(),
                    total_score: 0.0,
                    rank: 0,
                    error: Some(err.reason_code().to_string()),
                },
            })
            .collect();

        rank_entries(&mut entries, &rt.weights);
        let responses = entries.iter().filter(|e| e.succeeded()).count();
        if responses < rt.min_responses {
            return Err(GatewayError::RoundTableInsufficientResponses {
                received: responses,
                required: rt.min_responses,
            });
        }

        if tie_break_swaps(&entries, rt.tie_break, self.router.descriptors()) {
            entries.swap(0, 1);
            entries[0].rank = 1;
            entries[1].rank = 2;
        }

        let mut confidence = scored_confidence(&entries);
        let mut judge = None;
        if let Some(judge_provider) = rt.judge_provider.clone() {
            if responses >= 2 {
                let prompt = judge_prompt(&prompt_text, &entries[0], &entries[1]);
                let judge_invocation = InvocationRequest {
                    messages: vec![Message::user(prompt)],
                    temperature: 0.1,
                    max_tokens: 512,
                };
                // Judge failures are non-fatal: the scorer's ranking stands.
                if let Ok((output, _)) = self
                    .invoke_candidate(&judge_provider, &judge_invocation, correlation_id, Some(mode_timeout))
                    .await
                {
                    if let Some(verdict) = parse_judge_verdict(
                        &output.content,
                        &judge_provider,
                        &entries[0].provider,
                        &entries[1].provider,
                    ) {
                        if verdict.winner == entries[1].provider {
                            entries.swap(0, 1);
                            entries[0].rank = 1;
                            entries[1].rank = 2;
                        }
                        confidence = verdict.confidence;
                        judge = Some(verdict);
                    }
                }
            }
        }

        let winner = entries[0].clone();
        self.events.publish(GatewayEvent::RoundTableScored {
            correlation_id: correlation_id.clone(),
            winner: winner.provider.clone(),
            participants: participants.len(),
            responses,
            confidence,
            timestamp: Utc::now(),
        });

        self.history.record(RoundTableResult {
            correlation_id: correlation_id.clone(),
            winner: winner.provider.clone(),
            confidence,
            entries,
            judge,
            total_latency_ms: started.elapsed().as_millis() as u64,
            created_at: Utc::now(),
        });

        let output = ProviderOutput {
            content: winner.content.unwrap_or_default(),
            usage: winner.usage,
        };
        Ok((winner.provider, output))
    }

    /// Invoke one provider with breaker gating, timeout enforcement, and
    /// success/failure reporting. Returns the output and observed latency.
    async fn invoke_candidate(
        &self,
        provider: &ProviderId,
        invocation: &InvocationRequest,
        correlation_id: &CorrelationId,
        timeout_cap: Option<Duration>,
    ) -> GatewayResult<(ProviderOutput, u64)> {
        let descriptor = self.router.descriptor(provider).ok_or_else(|| {
            GatewayError::ProviderUnavailable {
                detail: format!("provider {provider} has no descriptor"),
            }
        })?;
        let client =
            self.registry
                .client(provider)
                .ok_or_else(|| GatewayError::ProviderUnavailable {
                    detail: format!("provider {provider} has no registered client"),
                })?;

        let (admitted, transition) = self.breaker.try_acquire(provider);
        self.publish_transition(provider, transition);
        if !admitted {
            return Err(GatewayError::ProviderUnavailable {
                detail: format!("provider {provider} circuit open"),
            });
        }

        let timeout = match timeout_cap {
            Some(cap) => descriptor.timeout().min(cap),
            None => descriptor.timeout(),
        };

        self.events.publish(GatewayEvent::ProviderCallStarted {
            correlation_id: correlation_id.clone(),
            provider: provider.clone(),
            timestamp: Utc::now(),
        });

        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, client.invoke(invocation)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(output)) => {
                self.registry.record_success(provider, latency_ms);
                let transition = self.breaker.record_success(provider);
                self.publish_transition(provider, transition);
                self.publish_call_completed(correlation_id, provider, true, latency_ms);
                Ok((output, latency_ms))
            }
            Ok(Err(err)) => {
                self.registry.record_failure(provider);
                let transition = self.breaker.record_failure(provider);
                self.publish_transition(provider, transition);
                self.publish_call_completed(correlation_id, provider, false, latency_ms);
                Err(GatewayError::ProviderError {
                    provider: provider.to_string(),
                    message: err.to_string(),
                })
            }
            Err(_elapsed) => {
                self.registry.record_failure(provider);
                let transition = self.breaker.record_failure(provider);
                self.publish_transition(provider, transition);
                self.publish_call_completed(correlation_id, provider, false, latency_ms);
                Err(GatewayError::ProviderTimeout {
                    provider: provider.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn publish_transition(&self, provider: &ProviderId, transition: Option<CircuitTransition>) {
        if let Some(t) = transition {
            self.events.publish(GatewayEvent::BreakerTransition {
                provider: provider.clone(),
                from: t.from,
                to: t.to,
                timestamp: Utc::now(),
            });
        }
    }

    fn publish_call_completed(
        &self,
        correlation_id: &CorrelationId,
        provider: &ProviderId,
        success: bool,
        latency_ms: u64,
    ) {
        self.events.publish(GatewayEvent::ProviderCallCompleted {
            correlation_id: correlation_id.clone(),
            provider: provider.clone(),
            success,
            latency_ms,
            timestamp: Utc::now(),
        });
    }

    fn fail<T>(
        &self,
        correlation_id: &CorrelationId,
        err: GatewayError,
    ) -> GatewayResult<T> {
        self.events.publish(GatewayEvent::RequestFailed {
            correlation_id: correlation_id.clone(),
            reason_code: err.reason_code().to_string(),
            timestamp: Utc::now(),
        });
        Err(err)
    }
}

fn no_eligible(category: TaskCategory) -> GatewayError {
    GatewayError::ProviderUnavailable {
        detail: format!("no eligible providers for category {category}"),
    }
}

/// Prepend the technique's system preamble, when it has one.
fn apply_technique(messages: &[Message], technique: Technique) -> Vec<Message> {
    match technique.preamble() {
        Some(preamble) => {
            let mut prepared = Vec::with_capacity(messages.len() + 1);
            prepared.push(Message::system(preamble));
            prepared.extend(messages.iter().cloned());
            prepared
        }
        None => messages.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Role;

    #[test]
    fn test_apply_technique_prepends_preamble() {
        let messages = vec![Message::user("prove this")];
        let prepared = apply_technique(&messages, Technique::ChainOfThought);
        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[0].role, Role::System);
        assert!(prepared[0].content.contains("step by step"));
        assert_eq!(prepared[1].content, "prove this");
    }

    #[test]
    fn test_apply_technique_direct_is_identity() {
        let messages = vec![Message::user("hello")];
        let prepared = apply_technique(&messages, Technique::Direct);
        assert_eq!(prepared, messages);
    }

    #[tokio::test]
    async fn test_empty_request_is_invalid() {
        let gateway = Gateway::new(GatewayConfig::default(), ProviderRegistry::new());
        let result = gateway.submit(Request::new(vec![])).await;
        assert!(matches!(result, Err(GatewayError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn test_unknown_forced_provider_is_invalid() {
        let gateway = Gateway::new(GatewayConfig::default(), ProviderRegistry::new());
        let request = Request::new(vec![Message::user("hi")])
            .with_provider(ProviderId::from("does-not-exist"));
        let result = gateway.submit(request).await;
        assert!(matches!(result, Err(GatewayError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn test_no_providers_configured_is_unavailable() {
        let gateway = Gateway::new(GatewayConfig::default(), ProviderRegistry::new());
        let result = gateway.submit(Request::new(vec![Message::user("hi")])).await;
        assert!(matches!(
            result,
            Err(GatewayError::ProviderUnavailable { .. })
        ));
    }

    #[test]
    fn test_estimate_cost_unknown_provider_is_zero() {
        let gateway = Gateway::new(GatewayConfig::default(), ProviderRegistry::new());
        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 1000,
        };
        assert_eq!(
            gateway.estimate_cost(&ProviderId::from("ghost"), &usage),
            0.0
        );
    }
}
