// Per-provider circuit breakers.
//
// closed -> open after `failure_threshold` consecutive failures inside
// `window`; open -> half-open once `half_open_delay` has elapsed; the
// half-open trial is single-flight: exactly one caller gets through, everyone
// else sees the breaker as open until the trial resolves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::RwLock;
use tracing::Level;

use vantage_observability::{emit_event, Component, EventBus, ObservabilityEvent};
use vantage_types::CoreEvent;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub window: Duration,
    pub half_open_delay: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            half_open_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed {
        failures: u32,
        window_start: Option<Instant>,
    },
    Open {
        since: Instant,
    },
    HalfOpen {
        trial_in_flight: bool,
    },
}

pub struct CircuitBreaker {
    provider_id: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    bus: EventBus,
}

impl CircuitBreaker {
    pub fn new(provider_id: String, config: BreakerConfig, bus: EventBus) -> Self {
        Self {
            provider_id,
            config,
            state: Mutex::new(BreakerState::Closed {
                failures: 0,
                window_start: None,
            }),
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Would a call be admitted right now? Non-mutating; `route` uses this to
    /// filter candidates without claiming the half-open trial.
    pub fn would_admit(&self) -> bool {
        match &*self.lock() {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { since } => since.elapsed() >= self.config.half_open_delay,
            BreakerState::HalfOpen { trial_in_flight } => !trial_in_flight,
        }
    }

    /// Claim permission for one call. Transitions open -> half-open when the
    /// delay has elapsed and hands the single trial slot to the caller.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        match &mut *state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { since } => {
                if since.elapsed() >= self.config.half_open_delay {
                    *state = BreakerState::HalfOpen {
                        trial_in_flight: true,
                    };
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen { trial_in_flight } => {
                if *trial_in_flight {
                    false
                } else {
                    *trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        match &mut *state {
            BreakerState::Closed { failures, .. } => {
                *failures = 0;
            }
            BreakerState::HalfOpen { .. } | BreakerState::Open { .. } => {
                *state = BreakerState::Closed {
                    failures: 0,
                    window_start: None,
                };
                drop(state);
                self.publish_transition("breaker.closed", Level::INFO);
            }
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        match &mut *state {
            BreakerState::Closed {
                failures,
                window_start,
            } => {
                let now = Instant::now();
                match window_start {
                    Some(start) if start.elapsed() <= self.config.window => {}
                    _ => {
                        *window_start = Some(now);
                        *failures = 0;
                    }
                }
                *failures += 1;
                if *failures >= self.config.failure_threshold {
                    *state = BreakerState::Open { since: now };
                    drop(state);
                    self.publish_transition("breaker.open", Level::WARN);
                }
            }
            BreakerState::HalfOpen { .. } => {
                // Failed trial: re-open and restart the delay clock
                *state = BreakerState::Open {
                    since: Instant::now(),
                };
                drop(state);
                self.publish_transition("breaker.open", Level::WARN);
            }
            BreakerState::Open { .. } => {}
        }
    }

    pub fn state_name(&self) -> &'static str {
        match &*self.lock() {
            BreakerState::Closed { .. } => "closed",
            BreakerState::Open { .. } => "open",
            BreakerState::HalfOpen { .. } => "half_open",
        }
    }

    fn publish_transition(&self, event: &str, level: Level) {
        self.bus.publish(CoreEvent::new(
            event,
            json!({ "provider": self.provider_id }),
        ));
        emit_event(
            level,
            Component::Router,
            ObservabilityEvent {
                event,
                mission_id: None,
                workspace_id: None,
                provider_id: Some(&self.provider_id),
                model_id: None,
                status: None,
                error_code: None,
                detail: None,
            },
        );
    }
}

/// Lazily creates one breaker per provider id.
#[derive(Clone)]
pub struct BreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
    config: BreakerConfig,
    bus: EventBus,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, bus: EventBus) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            config,
            bus,
        }
    }

    pub async fn breaker_for(&self, provider_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(provider_id) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(provider_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    provider_id.to_string(),
                    self.config.clone(),
                    self.bus.clone(),
                ))
            })
            .clone()
    }
}
