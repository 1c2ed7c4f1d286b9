//! Model catalog: which providers and models exist and how large their context windows are.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub display_name: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub provider_id: String,
    pub id: String,
    pub context_window: u32,
    pub max_output_tokens: Option<u32>,
}

/// Read-only source of provider and model metadata.
pub trait ModelCatalog: Send + Sync {
    fn list_providers(&self) -> Vec<ProviderInfo>;
    fn list_models(&self, provider_id: &str) -> Vec<ModelInfo>;
    fn get_model(&self, provider_id: &str, model_id: &str) -> Option<ModelInfo>;
}

/// Catalog backed by a fixed list, typically built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticModelCatalog {
    providers: Vec<ProviderInfo>,
    models: Vec<ModelInfo>,
}

impl StaticModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: ProviderInfo) -> Self {
        self.providers.retain(|p| p.id != provider.id);
        self.providers.push(provider);
        self
    }

    pub fn with_model(mut self, model: ModelInfo) -> Self {
        self.models
            .retain(|m| !(m.provider_id == model.provider_id && m.id == model.id));
        self.models.push(model);
        self
    }
}

impl ModelCatalog for StaticModelCatalog {
    fn list_providers(&self) -> Vec<ProviderInfo> {
        self.providers.clone()
    }

    fn list_models(&self, provider_id: &str) -> Vec<ModelInfo> {
        self.models
            .iter()
            .filter(|m| m.provider_id == provider_id)
            .cloned()
            .collect()
    }

    fn get_model(&self, provider_id: &str, model_id: &str) -> Option<ModelInfo> {
        self.models
            .iter()
            .find(|m| m.provider_id == provider_id && m.id == model_id)
            .cloned()
    }
}
