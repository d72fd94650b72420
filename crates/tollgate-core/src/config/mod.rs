//! Gateway configuration.
//!
//! Configuration is structured data validated against JSON Schema and then
//! checked for semantic consistency. This module handles parsing YAML/JSON
//! configuration and validating it.

mod parser;
mod schema;

pub use parser::ConfigError;
pub use schema::validate_config_schema;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::circuit::CircuitBreakerConfig;
use crate::tier::Tier;

/// Default per-attempt provider timeout.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default consecutive failures before a provider is marked unhealthy.
pub const DEFAULT_UNHEALTHY_AFTER: u32 = 3;

/// Full gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Tier name to limits
    pub tiers: BTreeMap<String, TierSpec>,

    /// Generation providers, in registration order
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub routing: RoutingConfig,
}

impl GatewayConfig {
    /// Resolved limits for every tier.
    pub fn resolved_tiers(&self) -> Result<BTreeMap<String, Tier>, ConfigError> {
        self.tiers
            .iter()
            .map(|(name, spec)| Ok((name.clone(), spec.resolve(name)?)))
            .collect()
    }
}

/// Either a named preset or explicit limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TierSpec {
    Preset { preset: String },
    Limits(Tier),
}

impl TierSpec {
    /// Limits for this tier.
    pub fn resolve(&self, tier_name: &str) -> Result<Tier, ConfigError> {
        match self {
            TierSpec::Limits(tier) => Ok(tier.clone()),
            TierSpec::Preset { preset } => Tier::preset(preset).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "tier '{}' uses unknown preset '{}'",
                    tier_name, preset
                ))
            }),
        }
    }
}

/// One configured generation provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Unique provider name
    pub name: String,

    /// Implementation key looked up in the provider catalog
    #[serde(rename = "type")]
    pub provider_type: String,

    /// Lower is tried first
    #[serde(default)]
    pub priority: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Endpoint configuration passed to the provider factory
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_true() -> bool {
    true
}

/// Background alerting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_poll_interval", with = "duration_str")]
    pub poll_interval: Duration,

    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,

    /// Deadline for one delivery attempt
    #[serde(default = "default_delivery_timeout", with = "duration_str")]
    pub delivery_timeout: Duration,

    /// Retries after a failed delivery attempt
    #[serde(default = "default_delivery_retries")]
    pub delivery_retries: usize,

    #[serde(default)]
    pub transports: Vec<TransportEntry>,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_warning_threshold() -> f64 {
    70.0
}

fn default_critical_threshold() -> f64 {
    90.0
}

fn default_delivery_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_delivery_retries() -> usize {
    3
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            warning_threshold: default_warning_threshold(),
            critical_threshold: default_critical_threshold(),
            delivery_timeout: default_delivery_timeout(),
            delivery_retries: default_delivery_retries(),
            transports: Vec::new(),
        }
    }
}

/// An alert destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportEntry {
    /// "log", "email", "webhook", ...
    pub kind: String,

    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Ledger persistence configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Directory for monthly JSONL files; in-memory only when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Fallback routing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_attempt_timeout", with = "duration_str")]
    pub default_timeout: Duration,

    #[serde(default = "default_unhealthy_after")]
    pub unhealthy_after: u32,
}

fn default_attempt_timeout() -> Duration {
    DEFAULT_ATTEMPT_TIMEOUT
}

fn default_unhealthy_after() -> u32 {
    DEFAULT_UNHEALTHY_AFTER
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            unhealthy_after: DEFAULT_UNHEALTHY_AFTER,
        }
    }
}

/// Human-readable durations ("30s", "1h 30m").
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration '{}': {}", raw, e)))
    }
}
