pub mod providers;

use crate::config::LlmConfig;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Chat message for LLM communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// LLM response
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub tokens_used: Option<u32>,
}

/// Model + provider pair selecting which client serves a request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSelector {
    pub model: String,
    pub provider_id: String,
}

impl ModelSelector {
    pub fn new(model: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            provider_id: provider_id.into(),
        }
    }
}

/// Trait for LLM providers
#[async_trait]
pub trait Llm: Send + Sync {
    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<LlmResponse>;
    async fn is_available(&self) -> bool;
}

/// Client registry keyed by (model, provider).
///
/// Engines receive this as an injected dependency instead of reaching for a
/// module-level cache, so two pipelines with different configurations never
/// share clients by accident.
pub struct LlmRegistry {
    config: LlmConfig,
    clients: Mutex<HashMap<ModelSelector, Arc<dyn Llm>>>,
}

impl LlmRegistry {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Default selector from the configuration
    pub fn default_selector(&self) -> ModelSelector {
        ModelSelector::new(self.config.model.clone(), self.config.provider_id.clone())
    }

    /// Get or create the client for a selector
    pub fn client(&self, selector: &ModelSelector) -> Result<Arc<dyn Llm>> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| PipelineError::Config("LLM registry lock poisoned".to_string()))?;

        if let Some(client) = clients.get(selector) {
            return Ok(Arc::clone(client));
        }

        let client: Arc<dyn Llm> = Arc::new(providers::OpenAiCompatProvider::new(
            self.config.clone(),
            selector.model.clone(),
        )?);
        clients.insert(selector.clone(), Arc::clone(&client));
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_registry_reuses_clients() {
        let registry = LlmRegistry::new(Config::default().llm);
        let selector = registry.default_selector();

        let a = registry.client(&selector).unwrap();
        let b = registry.client(&selector).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = ModelSelector::new("another-model", "openai");
        let c = registry.client(&other).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
