use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use vantage_types::{ModelInfo, ProviderInfo};

#[derive(Default)]
struct CatalogInner {
    providers: HashMap<String, ProviderInfo>,
    models: HashMap<String, ModelInfo>,
}

/// Registry of known providers and their models. Populated from configuration
/// after construction; safe to consult while empty.
#[derive(Clone, Default)]
pub struct ModelCatalog {
    inner: Arc<RwLock<CatalogInner>>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_provider(&self, provider: ProviderInfo) {
        let mut inner = self.inner.write().await;
        inner.providers.insert(provider.id.clone(), provider);
    }

    pub async fn register_model(&self, model: ModelInfo) {
        let mut inner = self.inner.write().await;
        inner.models.insert(model.id.clone(), model);
    }

    pub async fn provider(&self, id: &str) -> Option<ProviderInfo> {
        self.inner.read().await.providers.get(id).cloned()
    }

    pub async fn model(&self, id: &str) -> Option<ModelInfo> {
        self.inner.read().await.models.get(id).cloned()
    }

    pub async fn all_models(&self) -> Vec<ModelInfo> {
        self.inner.read().await.models.values().cloned().collect()
    }

    pub async fn models_for(&self, provider_id: &str) -> Vec<ModelInfo> {
        self.inner
            .read()
            .await
            .models
            .values()
            .filter(|m| m.provider_id == provider_id)
            .cloned()
            .collect()
    }

    /// Swap the whole catalog, used on configuration (re)load.
    pub async fn replace(&self, providers: Vec<ProviderInfo>, models: Vec<ModelInfo>) {
        let mut inner = self.inner.write().await;
        inner.providers = providers.into_iter().map(|p| (p.id.clone(), p)).collect();
        inner.models = models.into_iter().map(|m| (m.id.clone(), m)).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_types::ModelPricing;

    fn model(id: &str, provider: &str) -> ModelInfo {
        ModelInfo {
            id: id.to_string(),
            provider_id: provider.to_string(),
            quality_score: 0.9,
            context_window: 128_000,
            avg_latency_ms: 900,
            pricing: ModelPricing {
                input: 0.003,
                output: 0.015,
            },
            capabilities: vec!["chat".to_string()],
        }
    }

    #[tokio::test]
    async fn models_for_filters_by_provider() {
        let catalog = ModelCatalog::new();
        catalog.register_model(model("m1", "p1")).await;
        catalog.register_model(model("m2", "p1")).await;
        catalog.register_model(model("m3", "p2")).await;

        let p1 = catalog.models_for("p1").await;
        assert_eq!(p1.len(), 2);
        assert!(p1.iter().all(|m| m.provider_id == "p1"));
    }

    #[tokio::test]
    async fn replace_swaps_everything() {
        let catalog = ModelCatalog::new();
        catalog.register_model(model("old", "p1")).await;
        catalog.replace(vec![], vec![model("new", "p2")]).await;
        assert!(catalog.model("old").await.is_none());
        assert!(catalog.model("new").await.is_some());
    }
}
