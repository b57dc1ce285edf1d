//! Per-model token pricing.
//!
//! Prices are USD per million tokens. Lookup tries the exact model name, then
//! the longest known prefix, so dated variants such as
//! `claude-3-5-sonnet-20241022` resolve to `claude-3-5-sonnet`. Configured
//! `[pricing]` entries take precedence over the built-in table. Unknown
//! models cost nothing.

use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ModelPrice {
    pub input_per_million: f64,
    #[serde(default)]
    pub output_per_million: f64,
}

const BUILTIN: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4-turbo", 10.00, 30.00),
    ("claude-3-5-sonnet", 3.00, 15.00),
    ("claude-3-5-haiku", 0.80, 4.00),
    ("claude-3-opus", 15.00, 75.00),
    ("text-embedding-3-small", 0.02, 0.0),
    ("text-embedding-3-large", 0.13, 0.0),
    ("text-embedding-ada-002", 0.10, 0.0),
];

#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    overrides: HashMap<String, ModelPrice>,
}

impl PriceTable {
    pub fn new(overrides: HashMap<String, ModelPrice>) -> Self {
        Self { overrides }
    }

    pub fn price(&self, model: &str) -> Option<ModelPrice> {
        if let Some(price) = self.overrides.get(model) {
            return Some(*price);
        }
        let builtin = BUILTIN.iter().map(|(name, input, output)| {
            (
                *name,
                ModelPrice {
                    input_per_million: *input,
                    output_per_million: *output,
                },
            )
        });
        let overrides = self.overrides.iter().map(|(name, p)| (name.as_str(), *p));

        // max_by_key keeps the last maximum, so overrides win ties
        builtin
            .chain(overrides)
            .filter(|(name, _)| model.starts_with(name))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, price)| price)
    }

    /// Cost of a call in USD, rounded to six decimals.
    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let Some(price) = self.price(model) else {
            return 0.0;
        };
        let raw = input_tokens as f64 / 1_000_000.0 * price.input_per_million
            + output_tokens as f64 / 1_000_000.0 * price.output_per_million;
        round6(raw)
    }

    pub fn embedding_cost(&self, model: &str, tokens: u64) -> f64 {
        self.cost(model, tokens, 0)
    }
}

pub fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}
