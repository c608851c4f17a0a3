// Per-workspace budget accounting.
//
// Spend is always recorded, even past the limit: going over budget is a
// signal (`RouterError::BudgetExceeded`), not a silent clamp, so the
// snapshot invariant spent + remaining == total holds at all times.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::RwLock;
use tracing::Level;

use vantage_observability::{emit_event, Component, EventBus, ObservabilityEvent};
use vantage_types::{BudgetAlert, BudgetSnapshot, CoreEvent};

use crate::error::{RouterError, RouterResult};

#[derive(Debug, Default)]
struct BudgetTracker {
    total: f64,
    spent: f64,
    alerts: Vec<BudgetAlert>,
}

#[derive(Clone)]
pub struct BudgetLedger {
    trackers: Arc<RwLock<HashMap<String, BudgetTracker>>>,
    bus: EventBus,
}

impl BudgetLedger {
    pub fn new(bus: EventBus) -> Self {
        Self {
            trackers: Arc::new(RwLock::new(HashMap::new())),
            bus,
        }
    }

    /// Set (or replace) the budget total for a workspace. Spend already
    /// recorded is kept.
    pub async fn set_budget(&self, workspace_id: &str, total: f64) {
        let mut trackers = self.trackers.write().await;
        let tracker = trackers.entry(workspace_id.to_string()).or_default();
        tracker.total = total;
    }

    /// Replace alert thresholds (fractions of total, e.g. 0.8 fires at 80%).
    pub async fn configure_alerts(&self, workspace_id: &str, thresholds: Vec<f64>) {
        let mut trackers = self.trackers.write().await;
        let tracker = trackers.entry(workspace_id.to_string()).or_default();
        tracker.alerts = thresholds
            .into_iter()
            .map(|threshold| BudgetAlert {
                threshold,
                triggered: false,
            })
            .collect();
    }

    /// Record a spend. Workspaces with no configured total (total == 0) are
    /// untracked: spend accumulates but never trips alerts or the limit.
    pub async fn debit(&self, workspace_id: &str, amount: f64) -> RouterResult<BudgetSnapshot> {
        let mut trackers = self.trackers.write().await;
        let tracker = trackers.entry(workspace_id.to_string()).or_default();
        tracker.spent += amount;

        let snapshot = BudgetSnapshot {
            workspace_id: workspace_id.to_string(),
            total: tracker.total,
            spent: tracker.spent,
            remaining: tracker.total - tracker.spent,
        };

        if tracker.total <= 0.0 {
            return Ok(snapshot);
        }

        let fraction = tracker.spent / tracker.total;
        for alert in &mut tracker.alerts {
            if !alert.triggered && fraction >= alert.threshold {
                alert.triggered = true;
                self.bus.publish(CoreEvent::new(
                    "budget.alert",
                    json!({
                        "workspace_id": workspace_id,
                        "threshold": alert.threshold,
                        "spent": tracker.spent,
                        "total": tracker.total,
                    }),
                ));
                emit_event(
                    Level::WARN,
                    Component::Router,
                    ObservabilityEvent {
                        event: "budget.alert",
                        mission_id: None,
                        workspace_id: Some(workspace_id),
                        provider_id: None,
                        model_id: None,
                        status: None,
                        error_code: None,
                        detail: None,
                    },
                );
            }
        }

        if tracker.spent > tracker.total {
            // Publish only on the debit that crosses the line.
            if tracker.spent - amount <= tracker.total {
                self.bus.publish(CoreEvent::new(
                    "budget.exceeded",
                    json!({
                        "workspace_id": workspace_id,
                        "spent": tracker.spent,
                        "total": tracker.total,
                    }),
                ));
                emit_event(
                    Level::WARN,
                    Component::Router,
                    ObservabilityEvent {
                        event: "budget.exceeded",
                        mission_id: None,
                        workspace_id: Some(workspace_id),
                        provider_id: None,
                        model_id: None,
                        status: None,
                        error_code: Some("budget_exceeded"),
                        detail: None,
                    },
                );
            }
            return Err(RouterError::BudgetExceeded {
                workspace_id: workspace_id.to_string(),
                spent: tracker.spent,
                total: tracker.total,
            });
        }
        Ok(snapshot)
    }

    pub async fn get_budget(&self, workspace_id: &str) -> BudgetSnapshot {
        let trackers = self.trackers.read().await;
        match trackers.get(workspace_id) {
            Some(tracker) => BudgetSnapshot {
                workspace_id: workspace_id.to_string(),
                total: tracker.total,
                spent: tracker.spent,
                remaining: tracker.total - tracker.spent,
            },
            None => BudgetSnapshot {
                workspace_id: workspace_id.to_string(),
                total: 0.0,
                spent: 0.0,
                remaining: 0.0,
            },
        }
    }
}
