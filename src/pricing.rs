//! Per-model token pricing used to backfill job costs.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Token counts reported by the generation that produced a job's output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone)]
pub struct PriceTable {
    prices: HashMap<String, ModelPrice>,
    default_model: String,
}

const BUILTIN_PRICES: &[(&str, f64, f64)] = &[
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4.1", 2.00, 8.00),
    ("gpt-4.1-mini", 0.40, 1.60),
    ("gemini-2.5-pro", 1.25, 10.00),
    ("gemini-2.5-flash", 0.30, 2.50),
    ("claude-sonnet-4", 3.00, 15.00),
];

impl PriceTable {
    pub fn builtin(default_model: impl Into<String>) -> Self {
        let prices = BUILTIN_PRICES
            .iter()
            .map(|(model, input, output)| {
                (
                    model.to_string(),
                    ModelPrice {
                        input: *input,
                        output: *output,
                    },
                )
            })
            .collect();

        Self {
            prices,
            default_model: default_model.into(),
        }
    }

    /// Parse `model=input/output;model=input/output` on top of the built-in table.
    pub fn parse(raw: &str, default_model: impl Into<String>) -> Result<Self> {
        let mut table = Self::builtin(default_model);

        for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (model, rates) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("expected model=input/output, got {:?}", entry))?;
            let (input, output) = rates
                .split_once('/')
                .ok_or_else(|| anyhow!("expected input/output rates for {}", model.trim()))?;

            let price = ModelPrice {
                input: input
                    .trim()
                    .parse()
                    .with_context(|| format!("bad input rate for {}", model.trim()))?,
                output: output
                    .trim()
                    .parse()
                    .with_context(|| format!("bad output rate for {}", model.trim()))?,
            };
            table.prices.insert(model.trim().to_string(), price);
        }

        Ok(table)
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Price for a model, falling back to the default model's price.
    pub fn price_for(&self, model: Option<&str>) -> ModelPrice {
        let model = model.unwrap_or(&self.default_model);
        if let Some(price) = self.prices.get(model) {
            return *price;
        }
        debug!("No price for model '{}', using '{}'", model, self.default_model);
        self.prices
            .get(&self.default_model)
            .copied()
            .unwrap_or(ModelPrice {
                input: 0.0,
                output: 0.0,
            })
    }

    /// Cost in USD of a generation. Missing usage costs nothing.
    pub fn cost(&self, model: Option<&str>, usage: Option<&TokenUsage>) -> f64 {
        let Some(usage) = usage else {
            return 0.0;
        };
        let price = self.price_for(model);
        (usage.prompt_tokens as f64 * price.input + usage.completion_tokens as f64 * price.output)
            / 1_000_000.0
    }
}
