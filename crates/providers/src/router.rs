//! Provider router — turns model ids into providers.
//!
//! Model ids look like `"<provider>/<model>"`. The prefix picks a registered
//! provider; ids without a known prefix go to the default provider.

use std::collections::HashMap;
use std::sync::Arc;
use tidemark_core::error::ProviderError;
use tidemark_core::provider::{ModelResolver, Provider};
use tracing::debug;
use crate::extractive::ExtractiveProvider;

/// Routes model ids to the correct provider.
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: Option<String>,
}

impl ProviderRouter {
    /// Create an empty router. Without a default, unknown prefixes fail to resolve.
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: None,
        }
    }

    /// A router that only knows the offline extractive summarizer, which is
    /// also the default.
    pub fn offline() -> Self {
        let mut router = Self::new();
        router.register("extractive", Arc::new(ExtractiveProvider::new()));
        router.set_default("extractive");
        router
    }

    /// Register a provider.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Send ids with an unknown prefix to this provider.
    pub fn set_default(&mut self, name: impl Into<String>) {
        self.default_provider = Some(name.into());
    }

    /// Get the default provider.
    pub fn default(&self) -> Option<Arc<dyn Provider>> {
        self.default_provider
            .as_ref()
            .and_then(|name| self.providers.get(name))
            .cloned()
    }

    /// Get a specific provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// List all registered provider names.
    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ProviderRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelResolver for ProviderRouter {
    fn resolve(&self, model_id: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        let model_id = model_id.trim();
        if model_id.is_empty() {
            return Err(ProviderError::ModelNotFound("empty model id".into()));
        }

        if let Some((prefix, _)) = model_id.split_once('/') {
            if let Some(provider) = self.get(prefix) {
                return Ok(provider);
            }
        }

        match self.default() {
            Some(provider) => {
                debug!(model = model_id, provider = provider.name(), "Routing model to default provider");
                Ok(provider)
            }
            None => Err(ProviderError::ModelNotFound(format!(
                "no provider registered for '{model_id}'"
            ))),
        }
    }
}
