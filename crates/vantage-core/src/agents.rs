// Agent registry.
//
// Capability records drive planning; handlers do the actual work. Load
// counters are mutated only by the scheduler through reserve/release.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use vantage_types::{AgentCapability, Mission};

#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn invoke(&self, mission: &Mission) -> anyhow::Result<Value>;
}

struct AgentRecord {
    capability: AgentCapability,
    handler: Arc<dyn AgentHandler>,
}

#[derive(Clone, Default)]
pub struct AgentRegistry {
    inner: Arc<RwLock<HashMap<String, AgentRecord>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, capability: AgentCapability, handler: Arc<dyn AgentHandler>) {
        let mut inner = self.inner.write().await;
        inner.insert(
            capability.agent_id.clone(),
            AgentRecord {
                capability,
                handler,
            },
        );
    }

    pub async fn capabilities(&self) -> Vec<AgentCapability> {
        self.inner
            .read()
            .await
            .values()
            .map(|r| r.capability.clone())
            .collect()
    }

    pub async fn capability(&self, agent_id: &str) -> Option<AgentCapability> {
        self.inner
            .read()
            .await
            .get(agent_id)
            .map(|r| r.capability.clone())
    }

    pub async fn handler(&self, agent_id: &str) -> Option<Arc<dyn AgentHandler>> {
        self.inner.read().await.get(agent_id).map(|r| r.handler.clone())
    }

    /// Claim one concurrency slot. Returns false when the agent is unknown
    /// or already at max_concurrent.
    pub async fn reserve(&self, agent_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.get_mut(agent_id) {
            Some(record) if record.capability.current_load < record.capability.max_concurrent => {
                record.capability.current_load += 1;
                true
            }
            _ => false,
        }
    }

    pub async fn release(&self, agent_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.get_mut(agent_id) {
            record.capability.current_load = record.capability.current_load.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vantage_types::Domain;

    struct Echo;

    #[async_trait]
    impl AgentHandler for Echo {
        async fn invoke(&self, mission: &Mission) -> anyhow::Result<Value> {
            Ok(mission.payload.clone())
        }
    }

    fn capability(id: &str, max_concurrent: u32) -> AgentCapability {
        AgentCapability {
            agent_id: id.to_string(),
            capabilities: vec![Domain::Code],
            cost_per_request: 0.01,
            avg_latency_ms: 500,
            quality_score: 0.9,
            max_concurrent,
            current_load: 0,
        }
    }

    #[tokio::test]
    async fn reserve_respects_max_concurrent() {
        let registry = AgentRegistry::new();
        registry.register(capability("a", 2), Arc::new(Echo)).await;

        assert!(registry.reserve("a").await);
        assert!(registry.reserve("a").await);
        assert!(!registry.reserve("a").await);

        registry.release("a").await;
        assert!(registry.reserve("a").await);
    }

    #[tokio::test]
    async fn reserve_unknown_agent_fails() {
        let registry = AgentRegistry::new();
        assert!(!registry.reserve("ghost").await);
    }

    #[tokio::test]
    async fn handler_is_invocable() {
        let registry = AgentRegistry::new();
        registry.register(capability("a", 1), Arc::new(Echo)).await;
        let handler = registry.handler("a").await.unwrap();
        let mission = Mission::new(Domain::Code, vantage_types::Priority::Normal, 1.0, json!(42));
        assert_eq!(handler.invoke(&mission).await.unwrap(), json!(42));
    }
}
