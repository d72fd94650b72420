//! Credential handling for upstream providers.
//!
//! API keys are wrapped in [`SecretString`] the moment they are read, so they
//! cannot reach a log line through `Debug` or `Display`. Keys come from the
//! provider's config block or from an environment variable; the variable name
//! itself may be overridden per provider with `api_key_env`, which lets two
//! providers of the same type use different accounts.
//!
//! ```ignore
//! // config: { "api_key_env": "ANTHROPIC_BACKUP_KEY" }
//! let cred = ApiCredential::resolve(&config, "ANTHROPIC_API_KEY", "Anthropic API key")?;
//! request.header("x-api-key", cred.expose());
//! ```

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value as JsonValue;
use std::fmt;

use super::ProviderError;

/// Config key holding an inline API key.
pub const API_KEY_FIELD: &str = "api_key";

/// Config key naming the environment variable to read instead of the default.
pub const API_KEY_ENV_FIELD: &str = "api_key_env";

/// Where a credential was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Config,
    Environment,
    Programmatic,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Config => write!(f, "config"),
            CredentialSource::Environment => write!(f, "environment"),
            CredentialSource::Programmatic => write!(f, "programmatic"),
        }
    }
}

/// A provider API key that never prints itself.
pub struct ApiCredential {
    value: SecretString,
    source: CredentialSource,
    label: &'static str,
}

impl ApiCredential {
    /// Wrap a key value.
    pub fn new(value: impl Into<String>, source: CredentialSource, label: &'static str) -> Self {
        Self {
            value: SecretString::from(value.into()),
            source,
            label,
        }
    }

    /// Load a key from the provider config, falling back to the environment.
    ///
    /// Lookup order: inline `api_key`, then the variable named by
    /// `api_key_env`, then `default_env`.
    pub fn resolve(
        config: &JsonValue,
        default_env: &str,
        label: &'static str,
    ) -> Result<Self, ProviderError> {
        if let Some(value) = config[API_KEY_FIELD].as_str() {
            return Ok(Self::new(value, CredentialSource::Config, label));
        }

        let env_var = Self::env_var(config, default_env);
        std::env::var(env_var)
            .map(|v| Self::new(v, CredentialSource::Environment, label))
            .map_err(|_| {
                ProviderError::NotConfigured(format!(
                    "{} required: set '{}' in config or the {} environment variable",
                    label, API_KEY_FIELD, env_var
                ))
            })
    }

    /// Whether `resolve` would find a key, without reading it.
    pub fn is_available(config: &JsonValue, default_env: &str) -> bool {
        config[API_KEY_FIELD].as_str().is_some()
            || std::env::var(Self::env_var(config, default_env)).is_ok()
    }

    fn env_var<'a>(config: &'a JsonValue, default_env: &'a str) -> &'a str {
        config[API_KEY_ENV_FIELD].as_str().unwrap_or(default_env)
    }

    /// Key value for an outgoing request header. Do not store the result.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.value.expose_secret().is_empty()
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("value", &"[REDACTED]")
            .field("source", &self.source)
            .field("label", &self.label)
            .finish()
    }
}

impl fmt::Display for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} [REDACTED]", self.label, self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_redacted_in_debug_and_display() {
        let secret = "sk-super-secret-key-12345";
        let cred = ApiCredential::new(secret, CredentialSource::Config, "Test API key");

        let debug = format!("{:?}", cred);
        let display = format!("{}", cred);
        assert!(!debug.contains(secret), "Secret exposed in Debug!");
        assert!(!display.contains(secret), "Secret exposed in Display!");
        assert!(debug.contains("[REDACTED]"));
        assert!(display.contains("Test API key from config"));
        assert_eq!(cred.expose(), secret);
    }

    #[test]
    fn test_resolve_prefers_inline_key() {
        let config = serde_json::json!({ "api_key": "inline" });
        std::env::set_var("TOLLGATE_TEST_KEY_PRIORITY", "env");

        let cred = ApiCredential::resolve(&config, "TOLLGATE_TEST_KEY_PRIORITY", "Test key").unwrap();
        assert_eq!(cred.expose(), "inline");
        assert_eq!(cred.source(), CredentialSource::Config);

        std::env::remove_var("TOLLGATE_TEST_KEY_PRIORITY");
    }

    #[test]
    fn test_resolve_uses_overridden_env_var() {
        let config = serde_json::json!({ "api_key_env": "TOLLGATE_TEST_KEY_BACKUP" });
        std::env::set_var("TOLLGATE_TEST_KEY_BACKUP", "backup-key");

        let cred = ApiCredential::resolve(&config, "TOLLGATE_TEST_KEY_UNSET", "Test key").unwrap();
        assert_eq!(cred.expose(), "backup-key");
        assert_eq!(cred.source(), CredentialSource::Environment);
        assert!(ApiCredential::is_available(&config, "TOLLGATE_TEST_KEY_UNSET"));

        std::env::remove_var("TOLLGATE_TEST_KEY_BACKUP");
    }

    #[test]
    fn test_missing_key_names_where_to_put_it() {
        let config = serde_json::json!({});
        let err = ApiCredential::resolve(&config, "TOLLGATE_TEST_KEY_MISSING", "Test key").unwrap_err();

        let message = err.to_string();
        assert!(message.contains("Test key"));
        assert!(message.contains("api_key"));
        assert!(message.contains("TOLLGATE_TEST_KEY_MISSING"));
        assert!(!ApiCredential::is_available(&config, "TOLLGATE_TEST_KEY_MISSING"));
    }
}
