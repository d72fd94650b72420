//! Tier quota profiles.

use serde::{Deserialize, Serialize};

/// Immutable quota profile for a tier.
///
/// All limits are inclusive upper bounds: once usage equals a limit, the
/// next unit is blocked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    /// Requests allowed per UTC day
    pub daily_requests: u64,

    /// Tokens allowed per UTC day
    pub daily_tokens: u64,

    /// Spend allowed per UTC day (USD)
    pub daily_cost_limit: f64,

    /// Requests allowed per clock hour
    pub hourly_requests: u64,

    /// Tokens allowed per clock hour
    pub hourly_tokens: u64,

    /// Spend allowed per clock hour (USD)
    pub hourly_cost_limit: f64,

    /// Hard cap on the estimated tokens of a single request
    pub max_request_tokens: u64,

    /// Hard cap on the estimated cost of a single request (USD)
    pub max_request_cost: f64,
}

impl Tier {
    /// Free tier.
    pub fn free() -> Self {
        Self {
            daily_requests: 50,
            daily_tokens: 100_000,
            daily_cost_limit: 1.0,
            hourly_requests: 20,
            hourly_tokens: 25_000,
            hourly_cost_limit: 0.25,
            max_request_tokens: 4_000,
            max_request_cost: 0.05,
        }
    }

    /// Paid tier.
    pub fn pro() -> Self {
        Self {
            daily_requests: 2_000,
            daily_tokens: 2_000_000,
            daily_cost_limit: 25.0,
            hourly_requests: 300,
            hourly_tokens: 400_000,
            hourly_cost_limit: 5.0,
            max_request_tokens: 32_000,
            max_request_cost: 1.0,
        }
    }

    /// Enterprise tier.
    pub fn enterprise() -> Self {
        Self {
            daily_requests: 50_000,
            daily_tokens: 50_000_000,
            daily_cost_limit: 500.0,
            hourly_requests: 5_000,
            hourly_tokens: 5_000_000,
            hourly_cost_limit: 75.0,
            max_request_tokens: 200_000,
            max_request_cost: 10.0,
        }
    }

    /// Look up a built-in preset by name.
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "free" => Some(Self::free()),
            "pro" => Some(Self::pro()),
            "enterprise" => Some(Self::enterprise()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_hourly_within_daily() {
        for tier in [Tier::free(), Tier::pro(), Tier::enterprise()] {
            assert!(tier.hourly_requests <= tier.daily_requests);
            assert!(tier.hourly_tokens <= tier.daily_tokens);
            assert!(tier.hourly_cost_limit <= tier.daily_cost_limit);
        }
    }

    #[test]
    fn test_preset_lookup_is_case_insensitive() {
        assert_eq!(Tier::preset("FREE"), Some(Tier::free()));
        assert!(Tier::preset("platinum").is_none());
    }
}
