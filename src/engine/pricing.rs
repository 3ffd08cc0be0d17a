//! Static per-model pricing table.
//!
//! Prices are USD per 1K tokens and are configuration, not state — they must
//! not differ across replicas. Lookup is longest-prefix, exact match
//! preferred.

use std::str::FromStr;

use once_cell::sync::Lazy;
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_1k: Decimal,
    pub output_per_1k: Decimal,
}

fn d(s: &str) -> Decimal {
    Decimal::from_str(s).expect("invalid pricing constant")
}

/// `(model prefix, input $/1k, output $/1k)`
static PRICING: Lazy<Vec<(&'static str, ModelPricing)>> = Lazy::new(|| {
    vec![
        ("gpt-4o-mini", ModelPricing { input_per_1k: d("0.00015"), output_per_1k: d("0.0006") }),
        ("gpt-4o", ModelPricing { input_per_1k: d("0.005"), output_per_1k: d("0.015") }),
        ("gpt-4-turbo", ModelPricing { input_per_1k: d("0.01"), output_per_1k: d("0.03") }),
        ("gpt-4", ModelPricing { input_per_1k: d("0.03"), output_per_1k: d("0.06") }),
        ("gpt-3.5-turbo", ModelPricing { input_per_1k: d("0.0005"), output_per_1k: d("0.0015") }),
        ("claude-3-opus", ModelPricing { input_per_1k: d("0.015"), output_per_1k: d("0.075") }),
        ("claude-3-sonnet", ModelPricing { input_per_1k: d("0.003"), output_per_1k: d("0.015") }),
        ("claude-3-haiku", ModelPricing { input_per_1k: d("0.00025"), output_per_1k: d("0.00125") }),
        ("claude-3.5-sonnet", ModelPricing { input_per_1k: d("0.003"), output_per_1k: d("0.015") }),
        ("mistral-large", ModelPricing { input_per_1k: d("0.004"), output_per_1k: d("0.012") }),
        ("mistral-medium", ModelPricing { input_per_1k: d("0.0027"), output_per_1k: d("0.0081") }),
        ("mistral-small", ModelPricing { input_per_1k: d("0.001"), output_per_1k: d("0.003") }),
        ("text-embedding-3-small", ModelPricing { input_per_1k: d("0.00002"), output_per_1k: d("0") }),
        ("text-embedding-3-large", ModelPricing { input_per_1k: d("0.00013"), output_per_1k: d("0") }),
    ]
});

static DEFAULT_PRICING: Lazy<ModelPricing> = Lazy::new(|| ModelPricing {
    input_per_1k: d("0.001"),
    output_per_1k: d("0.002"),
});

/// Exact match preferred, otherwise the longest matching prefix wins,
/// otherwise the default fallback.
pub fn pricing_for(model: &str) -> ModelPricing {
    let mut best: Option<(&str, ModelPricing)> = None;
    for (prefix, pricing) in PRICING.iter() {
        if model == *prefix {
            return *pricing;
        }
        if model.starts_with(prefix) {
            match best {
                Some((current, _)) if current.len() >= prefix.len() => {}
                _ => best = Some((prefix, *pricing)),
            }
        }
    }
    best.map(|(_, p)| p).unwrap_or(*DEFAULT_PRICING)
}

/// `in/1000 · in_rate + out/1000 · out_rate`, exact Decimal arithmetic.
pub fn estimate_cost(model: &str, input_tokens: u32, output_tokens: u32) -> Decimal {
    let pricing = pricing_for(model);
    let thousand = Decimal::from(1000);
    (Decimal::from(input_tokens) / thousand) * pricing.input_per_1k
        + (Decimal::from(output_tokens) / thousand) * pricing.output_per_1k
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_preferred() {
        let p = pricing_for("gpt-4");
        assert_eq!(p.input_per_1k, d("0.03"));
    }

    #[test]
    fn test_longest_prefix_wins() {
        // "gpt-4o-mini-2024" matches both "gpt-4o" and "gpt-4o-mini";
        // the longer prefix must win
        let p = pricing_for("gpt-4o-mini-2024-07-18");
        assert_eq!(p.input_per_1k, d("0.00015"));

        let p = pricing_for("gpt-4o-2024-08-06");
        assert_eq!(p.input_per_1k, d("0.005"));
    }

    #[test]
    fn test_unknown_model_uses_default() {
        let p = pricing_for("my-fine-tune");
        assert_eq!(p.input_per_1k, d("0.001"));
        assert_eq!(p.output_per_1k, d("0.002"));
    }

    #[test]
    fn test_estimate_cost_gpt4() {
        // 1000 in + 1000 out on gpt-4 = 0.03 + 0.06
        assert_eq!(estimate_cost("gpt-4", 1000, 1000), d("0.09"));
    }

    #[test]
    fn test_estimate_cost_zero_tokens() {
        assert_eq!(estimate_cost("gpt-4", 0, 0), Decimal::ZERO);
    }

    #[test]
    fn test_cost_additivity() {
        // estimate(a, b) + estimate(c, d) == estimate(a+c, b+d), exactly
        let lhs = estimate_cost("claude-3-opus", 123, 456) + estimate_cost("claude-3-opus", 789, 12);
        let rhs = estimate_cost("claude-3-opus", 123 + 789, 456 + 12);
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn test_embedding_output_is_free() {
        let p = pricing_for("text-embedding-3-small");
        assert_eq!(p.output_per_1k, Decimal::ZERO);
        assert_eq!(
            estimate_cost("text-embedding-3-small", 1000, 0),
            d("0.00002")
        );
    }

    #[test]
    fn test_mock_models_use_default_pricing() {
        // Mock models bill at the default rate so budget tests have real costs
        assert!(estimate_cost("mock-gpt-4", 100, 100) > Decimal::ZERO);
    }
}
