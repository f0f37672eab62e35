// src/provider/pricing.rs — Per-model token pricing

use super::{ModelInfo, TokenUsage};

/// Cost in USD of one call at the given per-million-token prices.
pub fn cost_at(input_price: f64, output_price: f64, usage: &TokenUsage) -> f64 {
    (usage.input_tokens as f64 / 1_000_000.0) * input_price
        + (usage.output_tokens as f64 / 1_000_000.0) * output_price
}

/// Price a call: catalog entry first, then the built-in table. `None`
/// means the model's price is unknown.
pub fn calculate_cost(model: &str, catalog: &[ModelInfo], usage: &TokenUsage) -> Option<f64> {
    let (input, output) = catalog_pricing(model, catalog).or_else(|| model_pricing(model))?;
    Some(cost_at(input, output, usage))
}

fn catalog_pricing(model: &str, catalog: &[ModelInfo]) -> Option<(f64, f64)> {
    catalog
        .iter()
        .find(|m| m.id == model)
        .filter(|m| m.input_price_per_mtok > 0.0 || m.output_price_per_mtok > 0.0)
        .map(|m| (m.input_price_per_mtok, m.output_price_per_mtok))
}

/// Returns (input_price_per_mtok, output_price_per_mtok) for well-known
/// models. Matching ignores any `vendor/` prefix.
pub fn model_pricing(model: &str) -> Option<(f64, f64)> {
    let m = model.rsplit('/').next().unwrap_or(model);
    let price = match m {
        // Anthropic
        m if m.contains("claude-opus") => (15.0, 75.0),
        m if m.contains("claude-sonnet") || m.contains("claude-3.5-sonnet") => (3.0, 15.0),
        m if m.contains("haiku") => (0.8, 4.0),

        // OpenAI
        m if m.contains("gpt-4.1-nano") => (0.1, 0.4),
        m if m.contains("gpt-4.1-mini") => (0.4, 1.6),
        m if m.contains("gpt-4.1") => (2.0, 8.0),
        m if m.contains("gpt-4o-mini") => (0.15, 0.6),
        m if m.contains("gpt-4o") => (2.5, 10.0),
        m if m.contains("o3-mini") || m.contains("o4-mini") => (1.1, 4.4),
        m if m.starts_with("o3") => (10.0, 40.0),

        // Google Gemini
        m if m.contains("gemini-2.5-pro") => (1.25, 10.0),
        m if m.contains("gemini-2.5-flash") => (0.15, 0.6),
        m if m.contains("gemini-2.0-flash") => (0.1, 0.4),
        m if m.contains("gemini-1.5-pro") => (1.25, 5.0),
        m if m.contains("gemini-1.5-flash") => (0.075, 0.3),

        // Local models
        m if m.contains("llama") || m.contains("gemma") || m.contains("qwen") => (0.0, 0.0),

        _ => return None,
    };
    Some(price)
}
