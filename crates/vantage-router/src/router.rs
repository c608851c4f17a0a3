// Model routing and execution with fallback.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use vantage_observability::EventBus;
use vantage_types::{
    BudgetSnapshot, ModelInfo, ProviderInfo, RoutingDecision, RoutingRequest, TokenEstimate,
};

use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::budget::BudgetLedger;
use crate::cache::{CachedResponse, ResponseCache};
use crate::catalog::ModelCatalog;
use crate::error::{RouterError, RouterResult};

// Applied when a request carries no token estimate.
const DEFAULT_TOKEN_ESTIMATE: TokenEstimate = TokenEstimate {
    input: 1000,
    output: 1000,
};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub attempt_timeout: Duration,
    pub breaker: BreakerConfig,
    pub cache_ttl_secs: i64,
    pub cache_max_entries: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            breaker: BreakerConfig::default(),
            cache_ttl_secs: 300,
            cache_max_entries: 1000,
        }
    }
}

/// Result of a routed call. A successful call is returned even when its
/// debit pushes the workspace over budget; the crossing is carried in
/// `budget_exceeded` (blocking is the policy engine's job).
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub output: Value,
    pub model_id: String,
    pub provider_id: String,
    pub cost: f64,
    pub cached: bool,
    pub budget_exceeded: bool,
}

/// Routes LLM work to the best provider/model and executes it with
/// cross-provider fallback. The actual network call is supplied by the
/// caller; the router owns candidate selection, circuit breaking, budget
/// accounting, and response caching.
pub struct ModelRouter {
    catalog: ModelCatalog,
    breakers: BreakerRegistry,
    budget: BudgetLedger,
    cache: ResponseCache,
    config: RouterConfig,
}

impl ModelRouter {
    pub fn new(bus: EventBus, config: RouterConfig) -> Self {
        Self {
            catalog: ModelCatalog::new(),
            breakers: BreakerRegistry::new(config.breaker.clone(), bus.clone()),
            budget: BudgetLedger::new(bus),
            cache: ResponseCache::new(config.cache_ttl_secs, config.cache_max_entries),
            config,
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub async fn set_budget(&self, workspace_id: &str, total: f64) {
        self.budget.set_budget(workspace_id, total).await;
    }

    pub async fn configure_alerts(&self, workspace_id: &str, thresholds: Vec<f64>) {
        self.budget.configure_alerts(workspace_id, thresholds).await;
    }

    pub async fn get_budget(&self, workspace_id: &str) -> BudgetSnapshot {
        self.budget.get_budget(workspace_id).await
    }

    pub fn estimate_cost(&self, request: &RoutingRequest, model: &ModelInfo) -> f64 {
        let tokens = request.estimated_tokens.unwrap_or(DEFAULT_TOKEN_ESTIMATE);
        tokens.input as f64 * model.pricing.input / 1000.0
            + tokens.output as f64 * model.pricing.output / 1000.0
    }

    /// Pick the best model for a request: filter by capabilities, context
    /// window, constraint ceilings, and breaker availability, then score the
    /// survivors. The rest of the field is kept as an ordered fallback chain.
    pub async fn route(&self, request: &RoutingRequest) -> RouterResult<RoutingDecision> {
        let tokens = request.estimated_tokens.unwrap_or(DEFAULT_TOKEN_ESTIMATE);
        let constraints = &request.constraints;

        let mut candidates: Vec<(ModelInfo, ProviderInfo, f64)> = Vec::new();
        for model in self.catalog.all_models().await {
            let Some(provider) = self.catalog.provider(&model.provider_id).await else {
                continue;
            };
            if !constraints
                .required_capabilities
                .iter()
                .all(|cap| model.capabilities.contains(cap))
            {
                continue;
            }
            if model.context_window < tokens.total() {
                continue;
            }
            let cost = self.estimate_cost(request, &model);
            if constraints.max_cost.is_some_and(|max| cost > max) {
                continue;
            }
            if constraints
                .max_latency_ms
                .is_some_and(|max| model.avg_latency_ms > max)
            {
                continue;
            }
            if constraints
                .min_quality
                .is_some_and(|min| model.quality_score < min)
            {
                continue;
            }
            if !self.breakers.breaker_for(&provider.id).await.would_admit() {
                continue;
            }
            candidates.push((model, provider, cost));
        }

        if candidates.is_empty() {
            return Err(RouterError::NoCandidate(format!(
                "domain={} task={} constraints={:?}",
                request.domain, request.task, constraints
            )));
        }

        let max_cost = candidates.iter().map(|c| c.2).fold(f64::MIN, f64::max);
        let max_latency = candidates
            .iter()
            .map(|c| c.0.avg_latency_ms)
            .max()
            .unwrap_or(1) as f64;

        let mut scored: Vec<(ModelInfo, ProviderInfo, f64, f64)> = candidates
            .into_iter()
            .map(|(model, provider, cost)| {
                let price_norm = if max_cost > 0.0 { cost / max_cost } else { 0.0 };
                let latency_norm = if max_latency > 0.0 {
                    model.avg_latency_ms as f64 / max_latency
                } else {
                    0.0
                };
                let score = 0.5 * model.quality_score
                    + 0.3 * (1.0 - price_norm)
                    + 0.2 * (1.0 - latency_norm);
                (model, provider, cost, score)
            })
            .collect();
        scored.sort_by(|a, b| b.3.total_cmp(&a.3));

        let mut iter = scored.into_iter();
        let (model, provider, cost, score) = match iter.next() {
            Some(best) => best,
            None => {
                return Err(RouterError::NoCandidate(request.task.clone()));
            }
        };
        let fallbacks: Vec<(ModelInfo, ProviderInfo)> =
            iter.map(|(m, p, _, _)| (m, p)).collect();

        let reasoning = format!(
            "selected {} via {} (score {:.3}): quality {:.2}, est cost ${:.4}, \
             est latency {}ms; {} fallback(s)",
            model.id,
            provider.id,
            score,
            model.quality_score,
            cost,
            model.avg_latency_ms,
            fallbacks.len()
        );
        debug!(model = %model.id, provider = %provider.id, score, "routing decision");

        Ok(RoutingDecision {
            estimated_cost: cost,
            estimated_latency_ms: model.avg_latency_ms,
            quality_score: model.quality_score,
            reasoning,
            fallbacks,
            model,
            provider,
        })
    }

    /// Execute a decision, walking the fallback chain on failure or timeout.
    /// The first success records breaker success, caches the response, and
    /// debits the workspace budget. A debit that crosses the budget does not
    /// discard the output; it is reported on the outcome.
    pub async fn execute<F, Fut>(
        &self,
        decision: &RoutingDecision,
        call: F,
        request: &RoutingRequest,
    ) -> RouterResult<RouteOutcome>
    where
        F: Fn(ModelInfo, ProviderInfo) -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let mut chain = vec![(decision.model.clone(), decision.provider.clone())];
        chain.extend(decision.fallbacks.iter().cloned());

        let mut failures: Vec<String> = Vec::new();
        let mut attempts = 0usize;
        let mut timeouts = 0usize;
        let mut skipped_open = false;

        for (model, provider) in chain {
            let breaker = self.breakers.breaker_for(&provider.id).await;
            if !breaker.try_acquire() {
                failures.push(format!("{}: circuit open", model.id));
                skipped_open = true;
                continue;
            }
            attempts += 1;

            match tokio::time::timeout(self.config.attempt_timeout, call(model.clone(), provider.clone()))
                .await
            {
                Ok(Ok(output)) => {
                    breaker.record_success();
                    let cost = self.estimate_cost(request, &model);
                    // Cache first: the response was paid for either way, and
                    // a retry must not re-execute and re-debit.
                    self.cache
                        .put(
                            &ResponseCache::cache_key(request),
                            CachedResponse {
                                output: output.clone(),
                                model_id: model.id.clone(),
                                provider_id: provider.id.clone(),
                            },
                        )
                        .await;
                    let budget_exceeded =
                        match self.budget.debit(&request.workspace_id, cost).await {
                            Ok(_) => false,
                            Err(RouterError::BudgetExceeded {
                                workspace_id,
                                spent,
                                total,
                            }) => {
                                warn!(
                                    workspace = %workspace_id,
                                    spent,
                                    total,
                                    "workspace budget exceeded"
                                );
                                true
                            }
                            Err(other) => return Err(other),
                        };
                    return Ok(RouteOutcome {
                        output,
                        model_id: model.id,
                        provider_id: provider.id,
                        cost,
                        cached: false,
                        budget_exceeded,
                    });
                }
                Ok(Err(err)) => {
                    breaker.record_failure();
                    failures.push(format!("{}: {err}", model.id));
                }
                Err(_elapsed) => {
                    breaker.record_failure();
                    timeouts += 1;
                    failures.push(format!(
                        "{}: timed out after {:?}",
                        model.id, self.config.attempt_timeout
                    ));
                }
            }
        }

        if attempts == 0 {
            return Err(RouterError::CircuitOpen(failures.join(", ")));
        }
        if !skipped_open && timeouts == attempts {
            return Err(RouterError::Timeout(self.config.attempt_timeout));
        }
        Err(RouterError::AllCandidatesFailed(failures.join(", ")))
    }

    /// Like `route` + `execute`, but a fresh-enough cached response bypasses
    /// both routing and the call entirely.
    pub async fn execute_cached<F, Fut>(
        &self,
        request: &RoutingRequest,
        call: F,
    ) -> RouterResult<RouteOutcome>
    where
        F: Fn(ModelInfo, ProviderInfo) -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let key = ResponseCache::cache_key(request);
        if let Some(hit) = self.cache.get(&key).await {
            debug!(model = %hit.model_id, "response cache hit");
            return Ok(RouteOutcome {
                output: hit.output,
                model_id: hit.model_id,
                provider_id: hit.provider_id,
                cost: 0.0,
                cached: true,
                budget_exceeded: false,
            });
        }
        let decision = self.route(request).await?;
        self.execute(&decision, call, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use vantage_types::{Domain, ModelPricing, Priority, RoutingConstraints};

    fn provider(id: &str) -> ProviderInfo {
        ProviderInfo {
            id: id.to_string(),
            name: id.to_string(),
            capabilities: vec![],
        }
    }

    fn model(id: &str, provider: &str, quality: f64, latency: u64, price: f64) -> ModelInfo {
        ModelInfo {
            id: id.to_string(),
            provider_id: provider.to_string(),
            quality_score: quality,
            context_window: 128_000,
            avg_latency_ms: latency,
            pricing: ModelPricing {
                input: price,
                output: price,
            },
            capabilities: vec!["chat".to_string()],
        }
    }

    fn request() -> RoutingRequest {
        RoutingRequest {
            domain: Domain::Code,
            task: "refactor".to_string(),
            priority: Priority::Normal,
            constraints: RoutingConstraints::default(),
            workspace_id: "ws".to_string(),
            user_id: "user".to_string(),
            estimated_tokens: Some(TokenEstimate {
                input: 1000,
                output: 1000,
            }),
        }
    }

    fn test_config() -> RouterConfig {
        RouterConfig {
            attempt_timeout: Duration::from_millis(200),
            breaker: BreakerConfig {
                failure_threshold: 5,
                window: Duration::from_secs(60),
                half_open_delay: Duration::ZERO,
            },
            ..RouterConfig::default()
        }
    }

    async fn router_with_two_providers() -> ModelRouter {
        let router = ModelRouter::new(EventBus::new(), test_config());
        router.catalog().register_provider(provider("p1")).await;
        router.catalog().register_provider(provider("p2")).await;
        router
            .catalog()
            .register_model(model("strong", "p1", 0.95, 900, 0.01))
            .await;
        router
            .catalog()
            .register_model(model("cheap", "p2", 0.70, 400, 0.001))
            .await;
        router
    }

    #[tokio::test]
    async fn route_picks_best_score_and_keeps_fallbacks() {
        let router = router_with_two_providers().await;
        let decision = router.route(&request()).await.unwrap();
        // "cheap" wins on price and latency; "strong" stays as fallback
        assert_eq!(decision.model.id, "cheap");
        assert_eq!(decision.fallbacks.len(), 1);
        assert_eq!(decision.fallbacks[0].0.id, "strong");
        assert!(decision.reasoning.contains("cheap"));
    }

    #[tokio::test]
    async fn route_honors_constraint_ceilings() {
        let router = router_with_two_providers().await;
        let mut req = request();
        req.constraints.min_quality = Some(0.9);
        let decision = router.route(&req).await.unwrap();
        assert_eq!(decision.model.id, "strong");

        req.constraints.max_latency_ms = Some(500);
        let err = router.route(&req).await.unwrap_err();
        assert!(matches!(err, RouterError::NoCandidate(_)));
    }

    #[tokio::test]
    async fn route_requires_capabilities() {
        let router = router_with_two_providers().await;
        let mut req = request();
        req.constraints.required_capabilities = vec!["vision".to_string()];
        assert!(matches!(
            router.route(&req).await,
            Err(RouterError::NoCandidate(_))
        ));
    }

    #[tokio::test]
    async fn execute_falls_back_on_failure() {
        let router = router_with_two_providers().await;
        let req = request();
        let decision = router.route(&req).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_in = calls.clone();
        let outcome = router
            .execute(
                &decision,
                move |model, _provider| {
                    let calls = calls_in.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        if model.id == "cheap" {
                            anyhow::bail!("upstream 500");
                        }
                        Ok(json!({"text": "ok"}))
                    }
                },
                &req,
            )
            .await
            .unwrap();

        assert_eq!(outcome.model_id, "strong");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!outcome.cached);
    }

    #[tokio::test]
    async fn execute_times_out_slow_attempts() {
        let router = router_with_two_providers().await;
        let req = request();
        let decision = router.route(&req).await.unwrap();

        let outcome = router
            .execute(
                &decision,
                |model, _provider| async move {
                    if model.id == "cheap" {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok(json!({"text": "ok"}))
                },
                &req,
            )
            .await
            .unwrap();
        assert_eq!(outcome.model_id, "strong");
    }

    #[tokio::test]
    async fn every_attempt_timing_out_yields_timeout() {
        let router = router_with_two_providers().await;
        let req = request();
        let decision = router.route(&req).await.unwrap();

        let err = router
            .execute(
                &decision,
                |_model, _provider| async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!({"text": "too late"}))
                },
                &req,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Timeout(_)));
    }

    #[tokio::test]
    async fn all_failures_reports_every_attempt() {
        let router = router_with_two_providers().await;
        let req = request();
        let decision = router.route(&req).await.unwrap();

        let err = router
            .execute(
                &decision,
                |_model, _provider| async move { anyhow::bail!("boom") },
                &req,
            )
            .await
            .unwrap_err();
        match err {
            RouterError::AllCandidatesFailed(detail) => {
                assert!(detail.contains("strong"));
                assert!(detail.contains("cheap"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn repeated_failures_exclude_provider_from_routing() {
        let router = ModelRouter::new(
            EventBus::new(),
            RouterConfig {
                breaker: BreakerConfig {
                    failure_threshold: 5,
                    window: Duration::from_secs(60),
                    half_open_delay: Duration::from_secs(3600),
                },
                ..test_config()
            },
        );
        router.catalog().register_provider(provider("p1")).await;
        router
            .catalog()
            .register_model(model("only", "p1", 0.9, 500, 0.01))
            .await;

        let req = request();
        for _ in 0..5 {
            let decision = router.route(&req).await.unwrap();
            let _ = router
                .execute(
                    &decision,
                    |_m, _p| async move { anyhow::bail!("down") },
                    &req,
                )
                .await;
        }
        // Breaker is open and the delay has not elapsed
        assert!(matches!(
            router.route(&req).await,
            Err(RouterError::NoCandidate(_))
        ));
    }

    #[tokio::test]
    async fn cached_execution_bypasses_the_call() {
        let router = router_with_two_providers().await;
        let req = request();
        let calls = Arc::new(AtomicUsize::new(0));

        for expected_cached in [false, true] {
            let calls_in = calls.clone();
            let outcome = router
                .execute_cached(&req, move |_model, _provider| {
                    let calls = calls_in.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json!({"text": "ok"}))
                    }
                })
                .await
                .unwrap();
            assert_eq!(outcome.cached, expected_cached);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn execution_debits_the_workspace_budget() {
        let router = router_with_two_providers().await;
        router.set_budget("ws", 10.0).await;
        let req = request();
        let decision = router.route(&req).await.unwrap();

        router
            .execute(
                &decision,
                |_m, _p| async move { Ok(json!({"text": "ok"})) },
                &req,
            )
            .await
            .unwrap();

        let snap = router.get_budget("ws").await;
        // cheap: 1000 in + 1000 out at $0.001/1k each side
        assert!((snap.spent - 0.002).abs() < 1e-9);
        assert!((snap.spent + snap.remaining - snap.total).abs() < 1e-9);
    }

    #[tokio::test]
    async fn over_budget_execution_keeps_the_output() {
        let router = router_with_two_providers().await;
        router.set_budget("ws", 0.001).await;
        let req = request();
        let decision = router.route(&req).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_in = calls.clone();
        let outcome = router
            .execute(
                &decision,
                move |_model, _provider| {
                    let calls = calls_in.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json!({"text": "paid for"}))
                    }
                },
                &req,
            )
            .await
            .unwrap();

        // The call succeeded, so its output comes back with the crossing
        // carried as a flag, and the spend stays on the books.
        assert!(outcome.budget_exceeded);
        assert_eq!(outcome.output, json!({"text": "paid for"}));
        let snap = router.get_budget("ws").await;
        assert!((snap.spent - 0.002).abs() < 1e-9);

        // The response was cached before the debit check: a retry is a
        // cache hit, with no second call and no second debit.
        let retry = router
            .execute_cached(&req, |_model, _provider| async move {
                Ok(json!({"text": "fresh"}))
            })
            .await
            .unwrap();
        assert!(retry.cached);
        assert_eq!(retry.output, json!({"text": "paid for"}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let snap = router.get_budget("ws").await;
        assert!((snap.spent - 0.002).abs() < 1e-9);
    }
}
