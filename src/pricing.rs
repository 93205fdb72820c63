/// Per-token prices in USD (not per 1M tokens).
struct PriceEntry {
    model: &'static str,
    input_per_token: f64,
    output_per_token: f64,
}

const PRICES: &[PriceEntry] = &[
    PriceEntry {
        model: "gpt-4o",
        input_per_token: 2.50 / 1_000_000.0,
        output_per_token: 10.00 / 1_000_000.0,
    },
    PriceEntry {
        model: "gpt-4o-mini",
        input_per_token: 0.15 / 1_000_000.0,
        output_per_token: 0.60 / 1_000_000.0,
    },
    PriceEntry {
        model: "gpt-4.1-nano",
        input_per_token: 0.10 / 1_000_000.0,
        output_per_token: 0.40 / 1_000_000.0,
    },
];

/// Cost in USD for the given model and token counts. Unknown models cost 0.
pub fn calculate(model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
    let Some(entry) = PRICES.iter().find(|entry| entry.model == model) else {
        return 0.0;
    };
    f64::from(input_tokens) * entry.input_per_token
        + f64::from(output_tokens) * entry.output_per_token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_costs_scale_with_tokens() {
        let cost = calculate("gpt-4o", 1_000_000, 1_000_000);
        assert!((cost - 12.50).abs() < 1e-9);

        let half = calculate("gpt-4o", 500_000, 0);
        assert!((half - 1.25).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_costs_nothing() {
        assert_eq!(calculate("llama-unknown", 1000, 1000), 0.0);
    }

    #[test]
    fn zero_tokens_cost_nothing() {
        assert_eq!(calculate("gpt-4o-mini", 0, 0), 0.0);
    }
}
