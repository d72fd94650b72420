//! Cost estimates from token usage.
//!
//! Used for admission estimates before a call, and for billing when a
//! provider does not report cost itself.

use serde::{Deserialize, Serialize};

use crate::providers::TokenUsage;

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRates {
    pub input: f64,
    pub output: f64,
    #[serde(default)]
    pub cache_write: f64,
    #[serde(default)]
    pub cache_read: f64,
}

impl ModelRates {
    pub const fn new(input: f64, output: f64, cache_write: f64, cache_read: f64) -> Self {
        Self {
            input,
            output,
            cache_write,
            cache_read,
        }
    }

    /// Cost of one call.
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        per_million(usage.prompt_tokens, self.input)
            + per_million(usage.completion_tokens, self.output)
            + per_million(usage.cache_creation_tokens, self.cache_write)
            + per_million(usage.cache_read_tokens, self.cache_read)
    }
}

fn per_million(tokens: u32, rate: f64) -> f64 {
    tokens as f64 / 1_000_000.0 * rate
}

/// Model-family pricing, matched by substring in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    entries: Vec<(String, ModelRates)>,
    fallback: ModelRates,
}

impl Default for PricingTable {
    fn default() -> Self {
        let entries = [
            ("opus-4", ModelRates::new(15.0, 75.0, 18.75, 1.5)),
            ("sonnet-4", ModelRates::new(3.0, 15.0, 3.75, 0.3)),
            ("haiku-4", ModelRates::new(1.0, 5.0, 1.25, 0.1)),
            ("gpt-4o-mini", ModelRates::new(0.15, 0.6, 0.0, 0.075)),
            ("gpt-4o", ModelRates::new(2.5, 10.0, 0.0, 1.25)),
        ];
        Self {
            entries: entries
                .into_iter()
                .map(|(family, rates)| (family.to_string(), rates))
                .collect(),
            fallback: ModelRates::new(3.0, 15.0, 3.75, 0.3),
        }
    }
}

impl PricingTable {
    /// Empty table with a single fallback rate.
    pub fn flat(rates: ModelRates) -> Self {
        Self {
            entries: Vec::new(),
            fallback: rates,
        }
    }

    /// Add a family ahead of the built-in ones.
    pub fn with_model(mut self, family: impl Into<String>, rates: ModelRates) -> Self {
        self.entries.insert(0, (family.into(), rates));
        self
    }

    /// Rates for a model name.
    pub fn rates(&self, model: &str) -> ModelRates {
        self.entries
            .iter()
            .find(|(family, _)| model.contains(family.as_str()))
            .map(|(_, rates)| *rates)
            .unwrap_or(self.fallback)
    }

    /// Cost of a completed call.
    pub fn cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        self.rates(model).cost(usage)
    }

    /// Upper-bound cost for admission: prompt estimate plus the full
    /// completion budget, at fallback rates.
    pub fn estimate(&self, prompt_tokens: u32, max_tokens: u32) -> f64 {
        self.fallback.cost(&TokenUsage {
            prompt_tokens,
            completion_tokens: max_tokens,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(prompt: u32, completion: u32) -> TokenUsage {
        TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            ..Default::default()
        }
    }

    #[test]
    fn test_family_match() {
        let table = PricingTable::default();
        let cost = table.cost("claude-sonnet-4-5-20250929", &usage(1_000_000, 1_000_000));
        assert!((cost - 18.0).abs() < 1e-9);

        let mini = table.cost("gpt-4o-mini-2024-07-18", &usage(1_000_000, 0));
        assert!((mini - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_uses_fallback() {
        let table = PricingTable::flat(ModelRates::new(1.0, 2.0, 0.0, 0.0));
        let cost = table.cost("llama3.1", &usage(500_000, 500_000));
        assert!((cost - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_custom_family_takes_precedence() {
        let table =
            PricingTable::default().with_model("sonnet-4-5", ModelRates::new(0.0, 0.0, 0.0, 0.0));
        assert_eq!(table.cost("claude-sonnet-4-5", &usage(1000, 1000)), 0.0);
    }

    #[test]
    fn test_cache_tokens_billed() {
        let table = PricingTable::default();
        let with_cache = TokenUsage {
            cache_read_tokens: 1_000_000,
            ..Default::default()
        };
        assert!((table.cost("claude-haiku-4-5", &with_cache) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_is_upper_bound() {
        let table = PricingTable::default();
        let estimate = table.estimate(1000, 1000);
        assert!(estimate > 0.0);
        assert!(estimate >= table.cost("claude-haiku-4-5", &usage(1000, 1000)));
    }
}
