//! Configuration parsing from YAML/JSON.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

use super::schema::validate_config_schema;
use super::GatewayConfig;

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config does not match schema: {}", .0.join("; "))]
    Schema(Vec<String>),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl GatewayConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Parse configuration from a file; `.json` is read as JSON, anything
    /// else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        validate_config_schema(&value).map_err(ConfigError::Schema)?;
        let config: GatewayConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::Invalid("at least one tier is required".to_string()));
        }

        for (name, tier) in self.resolved_tiers()? {
            if tier.hourly_requests > tier.daily_requests
                || tier.hourly_tokens > tier.daily_tokens
                || tier.hourly_cost_limit > tier.daily_cost_limit
            {
                return Err(ConfigError::Invalid(format!(
                    "tier '{}' has an hourly limit above its daily limit",
                    name
                )));
            }
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider name '{}'",
                    provider.name
                )));
            }
        }

        let alerts = &self.alerts;
        if alerts.warning_threshold >= alerts.critical_threshold {
            return Err(ConfigError::Invalid(format!(
                "alert warning threshold ({}) must be below critical threshold ({})",
                alerts.warning_threshold, alerts.critical_threshold
            )));
        }

        if self.routing.default_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "routing.default_timeout must be greater than zero".to_string(),
            ));
        }
        if self.alerts.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "alerts.poll_interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CooldownPolicy;
    use crate::tier::Tier;
    use std::time::Duration;

    const FULL: &str = r#"
tiers:
  free:
    preset: free
  team:
    daily_requests: 500
    daily_tokens: 1000000
    daily_cost_limit: 20.0
    hourly_requests: 100
    hourly_tokens: 200000
    hourly_cost_limit: 5.0
    max_request_tokens: 8000
    max_request_cost: 0.5
providers:
  - name: primary
    type: anthropic
    priority: 1
    config:
      model: claude-sonnet-4-20250514
  - name: backup
    type: openai
    priority: 2
    enabled: false
circuit_breaker:
  critical_threshold: 95
  cooldown: 30m
alerts:
  poll_interval: 30s
  warning_threshold: 75
  critical_threshold: 92
  transports:
    - kind: log
    - kind: webhook
      endpoint: https://hooks.example.com/quota
ledger:
  directory: /var/lib/tollgate
routing:
  default_timeout: 20s
  unhealthy_after: 2
"#;

    #[test]
    fn test_parse_full_yaml() {
        let config = GatewayConfig::from_yaml(FULL).unwrap();

        let tiers = config.resolved_tiers().unwrap();
        assert_eq!(tiers["free"], Tier::free());
        assert_eq!(tiers["team"].daily_requests, 500);

        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].provider_type, "anthropic");
        assert!(config.providers[0].enabled);
        assert!(!config.providers[1].enabled);
        assert_eq!(config.providers[0].config["model"], "claude-sonnet-4-20250514");

        assert_eq!(
            config.circuit_breaker.cooldown,
            CooldownPolicy::Fixed(Duration::from_secs(1800))
        );
        assert_eq!(config.alerts.poll_interval, Duration::from_secs(30));
        assert_eq!(config.alerts.transports[1].endpoint.as_deref(), Some("https://hooks.example.com/quota"));
        assert_eq!(config.routing.default_timeout, Duration::from_secs(20));
        assert_eq!(config.routing.unhealthy_after, 2);
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let config =
            GatewayConfig::from_json(r#"{"tiers": {"pro": {"preset": "pro"}}}"#).unwrap();
        assert!(config.providers.is_empty());
        assert_eq!(config.circuit_breaker.critical_threshold, 95.0);
        assert_eq!(config.circuit_breaker.cooldown, CooldownPolicy::NextWindow);
        assert!(config.ledger.directory.is_none());
        assert_eq!(config.routing.default_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_mixed_case_preset_loads() {
        let config = GatewayConfig::from_yaml("tiers:\n  team: { preset: Pro }\n").unwrap();
        let tiers = config.resolved_tiers().unwrap();
        assert_eq!(tiers["team"], Tier::pro());
    }

    #[test]
    fn test_schema_rejects_unknown_section() {
        let err = GatewayConfig::from_json(r#"{"tiers": {"pro": {"preset": "pro"}}, "extra": 1}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Schema(_)));
    }

    #[test]
    fn test_empty_tiers_rejected() {
        let err = GatewayConfig::from_json(r#"{"tiers": {}}"#).unwrap_err();
        assert!(err.to_string().contains("at least one tier"));
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let json = r#"{
            "tiers": {"free": {"preset": "free"}},
            "providers": [
                {"name": "a", "type": "anthropic"},
                {"name": "a", "type": "openai"}
            ]
        }"#;
        let err = GatewayConfig::from_json(json).unwrap_err();
        assert!(err.to_string().contains("duplicate provider name 'a'"));
    }

    #[test]
    fn test_inverted_alert_thresholds_rejected() {
        let json = r#"{
            "tiers": {"free": {"preset": "free"}},
            "alerts": {"warning_threshold": 90, "critical_threshold": 80}
        }"#;
        assert!(matches!(
            GatewayConfig::from_json(json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_hourly_above_daily_rejected() {
        let json = r#"{
            "tiers": {"odd": {
                "daily_requests": 10, "daily_tokens": 1000, "daily_cost_limit": 1.0,
                "hourly_requests": 20, "hourly_tokens": 100, "hourly_cost_limit": 0.5,
                "max_request_tokens": 100, "max_request_cost": 0.1
            }}
        }"#;
        let err = GatewayConfig::from_json(json).unwrap_err();
        assert!(err.to_string().contains("tier 'odd'"));
    }

    #[test]
    fn test_from_file_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("gateway.yaml");
        std::fs::write(&yaml, FULL).unwrap();
        assert!(GatewayConfig::from_file(&yaml).is_ok());

        let json = dir.path().join("gateway.json");
        std::fs::write(&json, r#"{"tiers": {"free": {"preset": "free"}}}"#).unwrap();
        assert!(GatewayConfig::from_file(&json).is_ok());
    }
}
