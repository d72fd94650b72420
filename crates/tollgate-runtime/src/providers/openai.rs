//! OpenAI-compatible chat completions provider.
//!
//! Works against api.openai.com and any server that speaks the same
//! `/chat/completions` dialect (vLLM, Ollama, LiteLLM). A key is required
//! for the default endpoint and optional for a custom `base_url`.

use super::{
    factory::ProviderFactory, secrets::ApiCredential, GenerationOptions, GenerationProvider,
    GenerationResponse, ProviderError, TokenUsage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

/// Default environment variable for the OpenAI API key.
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// OpenAI-compatible provider.
pub struct OpenAiProvider {
    credential: Option<ApiCredential>,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiProvider {
    /// Create from a provider config block.
    ///
    /// Recognized keys: `api_key`, `api_key_env`, `base_url`, `model`.
    pub fn from_config(config: &JsonValue) -> Result<Self, ProviderError> {
        let base_url = config["base_url"].as_str().unwrap_or(DEFAULT_BASE_URL);
        let credential = if ApiCredential::is_available(config, OPENAI_API_KEY_ENV) {
            Some(ApiCredential::resolve(config, OPENAI_API_KEY_ENV, "OpenAI API key")?)
        } else if base_url == DEFAULT_BASE_URL {
            return Err(ProviderError::NotConfigured(format!(
                "OpenAI API key required: set 'api_key' in config or {} env",
                OPENAI_API_KEY_ENV
            )));
        } else {
            None
        };

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {}", e)))?;

        Ok(Self {
            credential,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config["model"].as_str().unwrap_or(DEFAULT_MODEL).to_string(),
            client,
        })
    }

    /// Model requests are sent to.
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    model: String,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[async_trait]
impl GenerationProvider for OpenAiProvider {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, ProviderError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if let Some(credential) = &self.credential {
            builder = builder.bearer_auth(credential.expose());
        }
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
            let message = response.text().await.unwrap_or_default();
            return Err(match status {
                401 | 403 => ProviderError::AuthError(message),
                _ => ProviderError::ApiError { status, message },
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::ParseError("response has no choices".to_string()))?;
        let usage = body
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                ..Default::default()
            })
            .unwrap_or_else(|| TokenUsage {
                prompt_tokens: self.estimate_tokens(prompt),
                completion_tokens: self.estimate_tokens(&text),
                ..Default::default()
            });

        Ok(GenerationResponse {
            text,
            usage,
            model: body.model,
            cost: None,
        })
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// Factory for `type: openai` providers.
pub struct OpenAiProviderFactory;

impl ProviderFactory for OpenAiProviderFactory {
    fn provider_type(&self) -> &'static str {
        "openai"
    }

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn GenerationProvider>, ProviderError> {
        self.validate_config(config)?;
        Ok(Arc::new(OpenAiProvider::from_config(config)?))
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError> {
        match config["base_url"].as_str() {
            Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                Err(ProviderError::NotConfigured(
                    "base_url must start with http:// or https://".to_string(),
                ))
            }
            None if !ApiCredential::is_available(config, OPENAI_API_KEY_ENV) => {
                Err(ProviderError::NotConfigured(format!(
                    "OpenAI API key required: set 'api_key' in config or {} env",
                    OPENAI_API_KEY_ENV
                )))
            }
            _ => Ok(()),
        }
    }

    fn description(&self) -> &'static str {
        "OpenAI-compatible chat completions"
    }
}
