//! Anthropic Messages API provider.
//!
//! ## Security
//!
//! The API key is held in an [`ApiCredential`] and only exposed when the
//! request header is set.

use super::{
    factory::ProviderFactory,
    secrets::{ApiCredential, CredentialSource},
    GenerationOptions, GenerationProvider, GenerationResponse, ProviderError, TokenUsage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

/// Default environment variable for the Anthropic API key.
pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
const API_VERSION: &str = "2023-06-01";

/// Anthropic Claude provider.
pub struct AnthropicProvider {
    credential: ApiCredential,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl AnthropicProvider {
    /// Create a provider from a key value.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        let credential =
            ApiCredential::new(api_key, CredentialSource::Programmatic, "Anthropic API key");
        Self::with_credential(credential, DEFAULT_BASE_URL, DEFAULT_MODEL)
    }

    /// Create from a provider config block.
    ///
    /// Recognized keys: `api_key`, `api_key_env`, `base_url`, `model`.
    pub fn from_config(config: &JsonValue) -> Result<Self, ProviderError> {
        let credential = ApiCredential::resolve(config, ANTHROPIC_API_KEY_ENV, "Anthropic API key")?;
        let base_url = config["base_url"].as_str().unwrap_or(DEFAULT_BASE_URL);
        let model = config["model"].as_str().unwrap_or(DEFAULT_MODEL);
        Self::with_credential(credential, base_url, model)
    }

    fn with_credential(
        credential: ApiCredential,
        base_url: &str,
        model: &str,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {}", e)))?;
        Ok(Self {
            credential,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
        })
    }

    /// Model requests are sent to.
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    model: String,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
    #[serde(default)]
    cache_creation_input_tokens: u32,
    #[serde(default)]
    cache_read_input_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[async_trait]
impl GenerationProvider for AnthropicProvider {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, ProviderError> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: options.max_tokens,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            temperature: options.temperature,
        };

        let mut builder = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.credential.expose())
            .header("anthropic-version", API_VERSION)
            .json(&request);
        if let Some(timeout) = options.timeout() {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(options.timeout().unwrap_or_default())
            } else {
                ProviderError::HttpError(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited { retry_after });
        }

        if !(200..300).contains(&status) {
            let message = response
                .json::<ErrorEnvelope>()
                .await
                .map(|e| e.error.message)
                .unwrap_or_else(|e| format!("unreadable error body: {}", e));
            return Err(match status {
                401 | 403 => ProviderError::AuthError(message),
                _ => ProviderError::ApiError { status, message },
            });
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        let text = body
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(GenerationResponse {
            text,
            usage: TokenUsage {
                prompt_tokens: body.usage.input_tokens,
                completion_tokens: body.usage.output_tokens,
                cache_read_tokens: body.usage.cache_read_input_tokens,
                cache_creation_tokens: body.usage.cache_creation_input_tokens,
            },
            model: body.model,
            cost: None,
        })
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

/// Factory for `type: anthropic` providers.
///
/// ```json
/// {
///   "api_key": "sk-ant-...",
///   "api_key_env": "ANTHROPIC_BACKUP_KEY",
///   "base_url": "https://...",
///   "model": "claude-sonnet-4-5-20250929"
/// }
/// ```
pub struct AnthropicProviderFactory;

impl ProviderFactory for AnthropicProviderFactory {
    fn provider_type(&self) -> &'static str {
        "anthropic"
    }

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn GenerationProvider>, ProviderError> {
        self.validate_config(config)?;
        Ok(Arc::new(AnthropicProvider::from_config(config)?))
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError> {
        if !ApiCredential::is_available(config, ANTHROPIC_API_KEY_ENV) {
            return Err(ProviderError::NotConfigured(format!(
                "Anthropic API key required: set 'api_key' in config or {} env",
                ANTHROPIC_API_KEY_ENV
            )));
        }
        if let Some(url) = config["base_url"].as_str() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ProviderError::NotConfigured(
                    "base_url must start with http:// or https://".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Anthropic Messages API"
    }
}
