use serde::{Deserialize, Serialize};

use crate::{Domain, Priority};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Price in dollars per 1k tokens.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider_id: String,
    /// 0.0..=1.0, higher is better.
    pub quality_score: f64,
    pub context_window: u64,
    pub avg_latency_ms: u64,
    pub pricing: ModelPricing,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenEstimate {
    pub input: u64,
    pub output: u64,
}

impl TokenEstimate {
    pub fn total(self) -> u64 {
        self.input + self.output
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_quality: Option<f64>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

/// One LLM call the router must place with some provider/model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRequest {
    pub domain: Domain,
    pub task: String,
    pub priority: Priority,
    #[serde(default)]
    pub constraints: RoutingConstraints,
    pub workspace_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_tokens: Option<TokenEstimate>,
}

/// Derived per call; not persisted beyond the call's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub model: ModelInfo,
    pub provider: ProviderInfo,
    pub estimated_cost: f64,
    pub estimated_latency_ms: u64,
    pub quality_score: f64,
    pub reasoning: String,
    #[serde(default)]
    pub fallbacks: Vec<(ModelInfo, ProviderInfo)>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetAlert {
    /// Fraction of the total budget, e.g. 0.8 fires at 80% spent.
    pub threshold: f64,
    #[serde(default)]
    pub triggered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub workspace_id: String,
    pub total: f64,
    pub spent: f64,
    pub remaining: f64,
}
