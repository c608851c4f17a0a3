// Configuration boundary.
//
// A single JSON document describes the provider/model catalog, policy rules,
// plan limits, and scheduler tuning. Loading is async and late: components
// are constructed first and tolerate running unconfigured until `apply`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use vantage_router::ModelRouter;
use vantage_types::{ModelInfo, PlanLimits, PolicyRule, ProviderInfo};

use crate::policy::{builtin_rules, default_plan_limits, PolicyEngine};
use crate::scheduler::{BudgetBreachPolicy, SchedulerConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySection {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub plans: Vec<PlanLimits>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    pub queue_capacity: usize,
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub budget_breach: BudgetBreachPolicy,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            tick_interval_ms: 1000,
            budget_breach: BudgetBreachPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub providers: Vec<ProviderInfo>,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
}

pub struct ConfigStore {
    config: Arc<RwLock<CoreConfig>>,
    path: Option<PathBuf>,
}

impl ConfigStore {
    /// Load the config file. A missing file yields defaults (built-in rules
    /// and plan tiers, empty catalog); a malformed one is an error.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice::<CoreConfig>(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "config file missing, using defaults");
                CoreConfig::default()
            }
            Err(err) => return Err(err.into()),
        };
        fill_defaults(&mut config);
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn from_config(mut config: CoreConfig) -> Self {
        fill_defaults(&mut config);
        Self {
            config: Arc::new(RwLock::new(config)),
            path: None,
        }
    }

    /// Re-read the file, keeping current values on a missing path.
    pub async fn reload(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = tokio::fs::read(path).await?;
        let mut fresh: CoreConfig = serde_json::from_slice(&bytes)?;
        fill_defaults(&mut fresh);
        *self.config.write().await = fresh;
        Ok(())
    }

    /// Push catalog, rules, and plan limits into the running components.
    /// Callable any time after construction.
    pub async fn apply(&self, router: &ModelRouter, policy: &PolicyEngine) {
        let config = self.config.read().await.clone();
        router
            .catalog()
            .replace(config.providers, config.models)
            .await;
        policy.load_rules(config.policy.rules).await;
        policy.load_plan_limits(config.policy.plans).await;
        info!("configuration applied");
    }

    pub async fn scheduler_config(&self) -> SchedulerConfig {
        let config = self.config.read().await;
        SchedulerConfig {
            queue_capacity: config.scheduler.queue_capacity,
            tick_interval: Duration::from_millis(config.scheduler.tick_interval_ms),
            budget_breach: config.scheduler.budget_breach,
        }
    }

    pub async fn snapshot(&self) -> CoreConfig {
        self.config.read().await.clone()
    }
}

fn fill_defaults(config: &mut CoreConfig) {
    if config.policy.rules.is_empty() {
        config.policy.rules = builtin_rules();
    }
    if config.policy.plans.is_empty() {
        config.policy.plans = default_plan_limits();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vantage_observability::EventBus;
    use vantage_router::RouterConfig;

    #[tokio::test]
    async fn missing_file_yields_builtin_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ConfigStore::load(&dir.path().join("nope.json"))
            .await
            .unwrap();
        let config = store.snapshot().await;
        assert!(!config.policy.rules.is_empty());
        assert_eq!(config.policy.plans.len(), 5);
        assert_eq!(config.scheduler.queue_capacity, 1000);
    }

    #[tokio::test]
    async fn loads_and_applies_catalog_and_policy() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("core.json");
        let doc = json!({
            "providers": [{"id": "openai", "name": "OpenAI", "capabilities": ["chat"]}],
            "models": [{
                "id": "gpt-4o",
                "provider_id": "openai",
                "quality_score": 0.92,
                "context_window": 128000,
                "avg_latency_ms": 1100,
                "pricing": {"input": 0.0025, "output": 0.01},
                "capabilities": ["chat"]
            }],
            "scheduler": {"queue_capacity": 50, "tick_interval_ms": 200, "budget_breach": "pause"}
        });
        tokio::fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap())
            .await
            .unwrap();

        let store = ConfigStore::load(&path).await.unwrap();
        let bus = EventBus::new();
        let router = ModelRouter::new(bus.clone(), RouterConfig::default());
        let policy = PolicyEngine::new(bus);
        store.apply(&router, &policy).await;

        assert!(router.catalog().model("gpt-4o").await.is_some());
        let sched = store.scheduler_config().await;
        assert_eq!(sched.queue_capacity, 50);
        assert_eq!(sched.tick_interval, Duration::from_millis(200));
        assert_eq!(sched.budget_breach, BudgetBreachPolicy::Pause);
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("core.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(ConfigStore::load(&path).await.is_err());
    }
}
