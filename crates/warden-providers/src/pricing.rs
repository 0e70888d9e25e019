//! Per-model price table and cost tabulation.
//!
//! Prices are USD per million tokens (per-minute for duration-based
//! models). Unknown models fall back to a conservative default rather
//! than erroring, so a new/renamed model never blocks a chat call.

use std::collections::HashMap;
use warden_domain::stream::Usage;

#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_write_per_million: Option<f64>,
    pub cache_read_per_million: Option<f64>,
}

const FALLBACK: ModelPrice = ModelPrice {
    input_per_million: 10.0,
    output_per_million: 30.0,
    cache_write_per_million: None,
    cache_read_per_million: None,
};

const FALLBACK_PER_MINUTE: f64 = 0.01;

/// Static price table. Keyed by `(provider, model)`.
fn table() -> &'static HashMap<(&'static str, &'static str), ModelPrice> {
    static TABLE: std::sync::OnceLock<HashMap<(&'static str, &'static str), ModelPrice>> =
        std::sync::OnceLock::new();
    TABLE.get_or_init(|| {
        let mut m = HashMap::new();
        m.insert(
            ("anthropic", "claude-sonnet-4-5-20250929"),
            ModelPrice {
                input_per_million: 3.0,
                output_per_million: 15.0,
                cache_write_per_million: Some(3.75),
                cache_read_per_million: Some(0.30),
            },
        );
        m.insert(
            ("anthropic", "claude-opus-4-1-20250805"),
            ModelPrice {
                input_per_million: 15.0,
                output_per_million: 75.0,
                cache_write_per_million: Some(18.75),
                cache_read_per_million: Some(1.50),
            },
        );
        m.insert(
            ("anthropic", "claude-haiku-4-5-20251001"),
            ModelPrice {
                input_per_million: 1.0,
                output_per_million: 5.0,
                cache_write_per_million: Some(1.25),
                cache_read_per_million: Some(0.10),
            },
        );
        m.insert(
            ("openai", "gpt-4o"),
            ModelPrice {
                input_per_million: 2.5,
                output_per_million: 10.0,
                cache_write_per_million: None,
                cache_read_per_million: Some(1.25),
            },
        );
        m.insert(
            ("openai", "gpt-4o-mini"),
            ModelPrice {
                input_per_million: 0.15,
                output_per_million: 0.6,
                cache_write_per_million: None,
                cache_read_per_million: Some(0.075),
            },
        );
        m.insert(
            ("groq", "llama-3.3-70b-versatile"),
            ModelPrice {
                input_per_million: 0.59,
                output_per_million: 0.79,
                cache_write_per_million: None,
                cache_read_per_million: None,
            },
        );
        m
    })
}

/// Cost in USD from a token usage struct.
pub fn calculate_cost(provider: &str, model: &str, usage: &Usage) -> f64 {
    let prices = table().get(&(provider, model)).copied().unwrap_or_else(|| {
        tracing::debug!(provider, model, "unknown model, using fallback pricing");
        FALLBACK
    });

    let input_cost = usage.prompt_tokens as f64 * prices.input_per_million / 1_000_000.0;
    let output_cost = usage.completion_tokens as f64 * prices.output_per_million / 1_000_000.0;

    let cache_write_cost = prices
        .cache_write_per_million
        .map(|p| usage.cache_creation_tokens as f64 * p / 1_000_000.0)
        .unwrap_or(0.0);
    let cache_read_cost = prices
        .cache_read_per_million
        .map(|p| usage.cache_read_tokens as f64 * p / 1_000_000.0)
        .unwrap_or(0.0);

    input_cost + output_cost + cache_write_cost + cache_read_cost
}

/// Cost in USD from audio/video duration, for per-minute billed models.
pub fn calculate_cost_duration(provider: &str, model: &str, duration_seconds: f64) -> f64 {
    let per_minute = table()
        .get(&(provider, model))
        .and_then(|_| None::<f64>) // no per-minute models in the static table yet
        .unwrap_or(FALLBACK_PER_MINUTE);
    (duration_seconds / 60.0) * per_minute
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_uses_table_price() {
        let usage = Usage {
            prompt_tokens: 1_000_000,
            completion_tokens: 1_000_000,
            total_tokens: 2_000_000,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
            reasoning_tokens: 0,
        };
        let cost = calculate_cost("anthropic", "claude-sonnet-4-5-20250929", &usage);
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_uses_fallback() {
        let usage = Usage {
            prompt_tokens: 1_000_000,
            completion_tokens: 0,
            total_tokens: 1_000_000,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
            reasoning_tokens: 0,
        };
        let cost = calculate_cost("openai", "some-future-model", &usage);
        assert!((cost - FALLBACK.input_per_million).abs() < 1e-9);
    }

    #[test]
    fn cache_read_is_cheaper_than_input() {
        let usage = Usage {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            cache_read_tokens: 1_000_000,
            cache_creation_tokens: 0,
            reasoning_tokens: 0,
        };
        let cost = calculate_cost("anthropic", "claude-sonnet-4-5-20250929", &usage);
        assert!((cost - 0.30).abs() < 1e-9);
    }
}
