//! Factory catalog for building providers from configuration.
//!
//! Each provider implementation registers a factory under its `type` key.
//! The catalog is consulted once, when the configured provider list is
//! turned into live providers; routing never looks at provider types.
//!
//! ```ignore
//! let mut catalog = ProviderCatalog::new();
//! catalog.register(Arc::new(AnthropicProviderFactory));
//!
//! let provider = catalog.create("anthropic", &entry.config)?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::{GenerationProvider, ProviderError};

/// Builds providers of one type from their JSON config block.
pub trait ProviderFactory: Send + Sync {
    /// The `type` value this factory answers to.
    fn provider_type(&self) -> &'static str;

    /// Create a provider instance.
    fn create(&self, config: &JsonValue) -> Result<Arc<dyn GenerationProvider>, ProviderError>;

    /// Check a config block without building anything.
    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError>;

    fn description(&self) -> &'static str {
        "Generation provider"
    }
}

/// Provider factories keyed by type.
#[derive(Default)]
pub struct ProviderCatalog {
    factories: BTreeMap<String, Arc<dyn ProviderFactory>>,
}

impl ProviderCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any factory of the same type.
    pub fn register(&mut self, factory: Arc<dyn ProviderFactory>) {
        self.factories
            .insert(factory.provider_type().to_string(), factory);
    }

    /// Build a provider of the given type.
    pub fn create(
        &self,
        provider_type: &str,
        config: &JsonValue,
    ) -> Result<Arc<dyn GenerationProvider>, ProviderError> {
        self.factory(provider_type)?.create(config)
    }

    /// Validate a config block for the given type.
    pub fn validate(&self, provider_type: &str, config: &JsonValue) -> Result<(), ProviderError> {
        self.factory(provider_type)?.validate_config(config)
    }

    /// Registered types, sorted.
    pub fn available_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    pub fn has_type(&self, provider_type: &str) -> bool {
        self.factories.contains_key(provider_type)
    }

    fn factory(&self, provider_type: &str) -> Result<&Arc<dyn ProviderFactory>, ProviderError> {
        self.factories.get(provider_type).ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "Unknown provider type: '{}'. Available: {:?}",
                provider_type,
                self.available_types()
            ))
        })
    }

    /// Catalog with every provider compiled into this build.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut catalog = Self::new();
        #[cfg(feature = "anthropic")]
        catalog.register(Arc::new(super::AnthropicProviderFactory));
        #[cfg(feature = "openai")]
        catalog.register(Arc::new(super::OpenAiProviderFactory));
        catalog
    }
}

impl std::fmt::Debug for ProviderCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCatalog")
            .field("types", &self.available_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{GenerationOptions, GenerationResponse, TokenUsage};
    use async_trait::async_trait;

    struct EchoProvider {
        model: String,
    }

    #[async_trait]
    impl GenerationProvider for EchoProvider {
        async fn generate(
            &self,
            prompt: &str,
            _options: &GenerationOptions,
        ) -> Result<GenerationResponse, ProviderError> {
            Ok(GenerationResponse {
                text: prompt.to_string(),
                usage: TokenUsage::default(),
                model: self.model.clone(),
                cost: None,
            })
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    struct EchoFactory;

    impl ProviderFactory for EchoFactory {
        fn provider_type(&self) -> &'static str {
            "echo"
        }

        fn create(&self, config: &JsonValue) -> Result<Arc<dyn GenerationProvider>, ProviderError> {
            self.validate_config(config)?;
            let model = config["model"].as_str().unwrap_or("echo-1").to_string();
            Ok(Arc::new(EchoProvider { model }))
        }

        fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError> {
            if config.get("model").is_some_and(|m| !m.is_string()) {
                return Err(ProviderError::NotConfigured("model must be a string".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_catalog_register_and_create() {
        let mut catalog = ProviderCatalog::new();
        catalog.register(Arc::new(EchoFactory));
        assert!(catalog.has_type("echo"));

        let provider = catalog
            .create("echo", &serde_json::json!({"model": "echo-2"}))
            .unwrap();
        let response = provider
            .generate("ping", &GenerationOptions::default())
            .await
            .unwrap();
        assert_eq!(response.text, "ping");
        assert_eq!(response.model, "echo-2");
    }

    #[test]
    fn test_unknown_type_lists_available() {
        let mut catalog = ProviderCatalog::new();
        catalog.register(Arc::new(EchoFactory));

        match catalog.create("bedrock", &serde_json::json!({})) {
            Err(ProviderError::NotConfigured(msg)) => {
                assert!(msg.contains("Unknown provider type: 'bedrock'"));
                assert!(msg.contains("echo"));
            }
            _ => panic!("Expected NotConfigured error"),
        }
    }

    #[test]
    fn test_validate_delegates_to_factory() {
        let mut catalog = ProviderCatalog::new();
        catalog.register(Arc::new(EchoFactory));

        assert!(catalog.validate("echo", &serde_json::json!({})).is_ok());
        assert!(catalog.validate("echo", &serde_json::json!({"model": 3})).is_err());
        assert!(catalog.validate("nope", &serde_json::json!({})).is_err());
    }
}
