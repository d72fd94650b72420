//! Generation provider abstractions for tollgate-runtime.
//!
//! This module defines the capability trait every upstream provider
//! implements, the errors they return, and how those errors are classified
//! for fallback routing.
//!
//! ## Security
//!
//! All providers use the [`secrets`] module for secure credential handling.
//! See [`ApiCredential`] for the recommended patterns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

mod factory;
pub mod secrets;

#[cfg(feature = "anthropic")]
mod anthropic;

#[cfg(feature = "openai")]
mod openai;

pub use factory::{ProviderCatalog, ProviderFactory};
pub use secrets::{ApiCredential, CredentialSource};

#[cfg(feature = "anthropic")]
pub use anthropic::{AnthropicProvider, AnthropicProviderFactory};

#[cfg(feature = "openai")]
pub use openai::{OpenAiProvider, OpenAiProviderFactory};

/// Errors from generation providers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    ParseError(String),

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    /// How the fallback router treats this failure.
    pub fn classify(&self) -> AttemptClass {
        match self {
            ProviderError::Timeout(_) => AttemptClass::Timeout,
            ProviderError::RateLimited { .. } => AttemptClass::RateLimited,
            ProviderError::HttpError(_) | ProviderError::ParseError(_) => AttemptClass::Transient,
            ProviderError::AuthError(_) => AttemptClass::Auth,
            ProviderError::NotConfigured(_) => AttemptClass::Config,
            ProviderError::InvalidRequest(_) => AttemptClass::InvalidRequest,
            ProviderError::ApiError { status, .. } => match *status {
                401 | 403 => AttemptClass::Auth,
                408 => AttemptClass::Timeout,
                429 => AttemptClass::RateLimited,
                500..=599 => AttemptClass::Transient,
                _ => AttemptClass::InvalidRequest,
            },
        }
    }
}

/// Classification of one provider attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptClass {
    Success,

    /// No answer within the attempt deadline
    Timeout,

    /// 5xx, dropped connection, garbled payload
    Transient,

    /// Upstream throttling
    RateLimited,

    /// Credentials rejected
    Auth,

    /// Provider misconfigured locally
    Config,

    /// Upstream refused this particular request
    InvalidRequest,
}

impl AttemptClass {
    /// Whether the same provider may succeed if asked again later.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            AttemptClass::Timeout | AttemptClass::Transient | AttemptClass::RateLimited
        )
    }

    /// Whether the failure says something about the provider itself
    /// rather than the request.
    pub fn is_provider_fault(self) -> bool {
        !matches!(self, AttemptClass::Success | AttemptClass::InvalidRequest)
    }
}

impl std::fmt::Display for AttemptClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AttemptClass::Success => "success",
            AttemptClass::Timeout => "timeout",
            AttemptClass::Transient => "transient",
            AttemptClass::RateLimited => "rate_limited",
            AttemptClass::Auth => "auth",
            AttemptClass::Config => "config",
            AttemptClass::InvalidRequest => "invalid_request",
        };
        f.write_str(label)
    }
}

/// Options for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Sampling temperature
    pub temperature: f32,

    /// Per-attempt deadline; the router's default applies when unset
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Try this provider first
    #[serde(default)]
    pub preferred_provider: Option<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.7,
            timeout_ms: None,
            preferred_provider: None,
        }
    }
}

impl GenerationOptions {
    /// Per-attempt timeout, if the caller set one.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,

    /// Tokens in the completion
    pub completion_tokens: u32,

    /// Tokens read from a prompt cache
    #[serde(default)]
    pub cache_read_tokens: u32,

    /// Tokens written to a prompt cache
    #[serde(default)]
    pub cache_creation_tokens: u32,
}

impl TokenUsage {
    /// Total tokens used.
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Response from a generation provider.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResponse {
    /// Generated text
    pub text: String,

    pub usage: TokenUsage,

    /// Model that served the request
    pub model: String,

    /// Cost reported by the provider, when it reports one (USD)
    pub cost: Option<f64>,
}

/// Capability every upstream text-generation provider implements.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Generate text for a prompt.
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, ProviderError>;

    /// Implementation label for logs ("anthropic", "openai", ...).
    fn name(&self) -> &str;

    /// Estimate tokens for a prompt.
    fn estimate_tokens(&self, text: &str) -> u32 {
        estimate_tokens(text)
    }
}

/// Rough token count: ~4 chars per token, at least one for non-empty text.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    if chars == 0 {
        0
    } else {
        chars.div_ceil(4).max(1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
            ..Default::default()
        };
        assert_eq!(usage.total(), 150);
    }

    #[test]
    fn test_classify_errors() {
        assert_eq!(
            ProviderError::Timeout(Duration::from_secs(30)).classify(),
            AttemptClass::Timeout
        );
        assert_eq!(
            ProviderError::HttpError("connection reset".into()).classify(),
            AttemptClass::Transient
        );
        assert_eq!(
            ProviderError::ApiError { status: 503, message: "overloaded".into() }.classify(),
            AttemptClass::Transient
        );
        assert_eq!(
            ProviderError::ApiError { status: 401, message: "bad key".into() }.classify(),
            AttemptClass::Auth
        );
        assert_eq!(
            ProviderError::ApiError { status: 400, message: "too long".into() }.classify(),
            AttemptClass::InvalidRequest
        );
        assert_eq!(
            ProviderError::NotConfigured("no key".into()).classify(),
            AttemptClass::Config
        );
    }

    #[test]
    fn test_retryable_classes() {
        assert!(AttemptClass::Timeout.is_retryable());
        assert!(AttemptClass::RateLimited.is_retryable());
        assert!(!AttemptClass::Auth.is_retryable());
        assert!(!AttemptClass::InvalidRequest.is_retryable());
        assert!(!AttemptClass::InvalidRequest.is_provider_fault());
        assert!(AttemptClass::Config.is_provider_fault());
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("hi"), 1);
        assert_eq!(estimate_tokens("Hello, world!"), 4);
    }

    #[test]
    fn test_options_timeout() {
        let options = GenerationOptions {
            timeout_ms: Some(1500),
            ..Default::default()
        };
        assert_eq!(options.timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(GenerationOptions::default().timeout(), None);
    }
}
