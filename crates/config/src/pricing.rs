//! Static model pricing table.
//!
//! Catalog refresh is an external concern; the gateway only reads whatever
//! snapshot the configuration carries.

use serde::Deserialize;

/// Cost per million tokens for one model.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelPricing {
    /// USD per million input tokens.
    pub input: f64,
    /// USD per million output tokens.
    pub output: f64,
}

impl ModelPricing {
    /// Expected combined cost per million tokens, used by the cost selector.
    pub fn combined(&self) -> f64 {
        self.input + self.output
    }

    /// Cost of a concrete token count in USD.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input + output_tokens as f64 * self.output) / 1_000_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_scales_per_million() {
        let pricing = ModelPricing {
            input: 2.0,
            output: 10.0,
        };

        assert_eq!(pricing.combined(), 12.0);
        assert!((pricing.cost(1_000_000, 500_000) - 7.0).abs() < f64::EPSILON);
    }
}
