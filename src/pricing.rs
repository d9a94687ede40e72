// Pricing tables for cost estimation across provider families.
//
// Used by the budget manager (spend recording) and the anomaly detector's
// token-explosion check. Unknown models fall back to Sonnet-tier pricing
// rather than failing the request.

/// Pricing information for a specific model
#[derive(Debug, Clone)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_write_per_million: f64,
    pub cache_read_per_million: f64,
}

const DEFAULT_PRICING: ModelPricing = ModelPricing {
    input_per_million: 3.00,
    output_per_million: 15.00,
    cache_write_per_million: 3.75,
    cache_read_per_million: 0.30,
};

/// Get pricing for a specific model
/// Returns default (Sonnet-tier) pricing for unknown models
pub fn get_pricing(model: &str) -> ModelPricing {
    match model {
        // Anthropic
        "claude-3-5-sonnet-20241022" | "claude-sonnet-4-20250514" => ModelPricing {
            input_per_million: 3.00,
            output_per_million: 15.00,
            cache_write_per_million: 3.75,
            cache_read_per_million: 0.30,
        },
        "claude-3-5-haiku-20241022" | "claude-haiku-4-20250514" => ModelPricing {
            input_per_million: 1.00,
            output_per_million: 5.00,
            cache_write_per_million: 1.25,
            cache_read_per_million: 0.10,
        },
        "claude-3-opus-20240229" | "claude-opus-4-20250514" => ModelPricing {
            input_per_million: 15.00,
            output_per_million: 75.00,
            cache_write_per_million: 18.75,
            cache_read_per_million: 1.50,
        },
        "claude-3-sonnet-20240229" => ModelPricing {
            input_per_million: 3.00,
            output_per_million: 15.00,
            cache_write_per_million: 3.75,
            cache_read_per_million: 0.30,
        },
        "claude-3-haiku-20240307" => ModelPricing {
            input_per_million: 0.25,
            output_per_million: 1.25,
            cache_write_per_million: 0.30,
            cache_read_per_million: 0.03,
        },

        // OpenAI
        "gpt-4o" => ModelPricing {
            input_per_million: 2.50,
            output_per_million: 10.00,
            cache_write_per_million: 2.50,
            cache_read_per_million: 1.25,
        },
        "gpt-4o-mini" => ModelPricing {
            input_per_million: 0.15,
            output_per_million: 0.60,
            cache_write_per_million: 0.15,
            cache_read_per_million: 0.075,
        },
        "o1" => ModelPricing {
            input_per_million: 15.00,
            output_per_million: 60.00,
            cache_write_per_million: 15.00,
            cache_read_per_million: 7.50,
        },
        "o1-mini" => ModelPricing {
            input_per_million: 1.10,
            output_per_million: 4.40,
            cache_write_per_million: 1.10,
            cache_read_per_million: 0.55,
        },

        // Google
        "gemini-1.5-pro" => ModelPricing {
            input_per_million: 1.25,
            output_per_million: 5.00,
            cache_write_per_million: 1.25,
            cache_read_per_million: 0.3125,
        },
        "gemini-1.5-flash" => ModelPricing {
            input_per_million: 0.075,
            output_per_million: 0.30,
            cache_write_per_million: 0.075,
            cache_read_per_million: 0.01875,
        },

        // Default to Sonnet-tier pricing for unrecognized models
        _ => DEFAULT_PRICING,
    }
}

/// Calculate cost in USD for the given token usage
pub fn calculate_cost(
    model: &str,
    input_tokens: u32,
    output_tokens: u32,
    cache_creation_tokens: u32,
    cache_read_tokens: u32,
) -> f64 {
    let pricing = get_pricing(model);

    let input_cost = (input_tokens as f64 / 1_000_000.0) * pricing.input_per_million;
    let output_cost = (output_tokens as f64 / 1_000_000.0) * pricing.output_per_million;
    let cache_write_cost =
        (cache_creation_tokens as f64 / 1_000_000.0) * pricing.cache_write_per_million;
    let cache_read_cost = (cache_read_tokens as f64 / 1_000_000.0) * pricing.cache_read_per_million;

    input_cost + output_cost + cache_write_cost + cache_read_cost
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sonnet_pricing() {
        let pricing = get_pricing("claude-3-5-sonnet-20241022");
        assert_eq!(pricing.input_per_million, 3.00);
        assert_eq!(pricing.output_per_million, 15.00);
    }

    #[test]
    fn test_calculate_cost() {
        // Example from ANTHROPIC_PRICING.md
        // Input: 1,000 tokens, Output: 500 tokens
        let cost = calculate_cost("claude-3-5-sonnet-20241022", 1000, 500, 0, 0);
        assert!((cost - 0.0105).abs() < 0.0001); // $0.0105
    }
}
