//! Token usage accounting and cost estimation
//!
//! Usage is accumulated across every API round of a single chat turn
//! (including tool-call continuations) and priced once at the end against
//! the model catalog.

use serde::{Deserialize, Serialize};

use crate::catalog;

/// Flat per-search estimate; vendors do not report billed search cost
pub const WEB_SEARCH_COST: f64 = 0.01;

/// Usage reported to the UI once per completed turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageData {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub web_searches: u32,
    pub cost: f64,
}

impl UsageData {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::fmt::Display for UsageData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} in / {} out tokens",
            self.input_tokens, self.output_tokens
        )?;
        if self.web_searches > 0 {
            write!(f, ", {} web searches", self.web_searches)?;
        }
        write!(f, " (${:.4})", self.cost)
    }
}

/// Accumulated usage from a single turn (may span multiple API rounds)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub web_searches: u32,
    pub api_calls: u32,
}

impl TurnUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add usage from one completed API round
    pub fn add_round(&mut self, input_tokens: u64, output_tokens: u64, web_searches: u32) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.web_searches += web_searches;
        self.api_calls += 1;
    }

    /// Whether any tokens were recorded at all
    pub fn has_tokens(&self) -> bool {
        self.input_tokens > 0 || self.output_tokens > 0
    }

    /// Price the turn against the catalog entry for `model_id`
    pub fn finalize(&self, model_id: &str) -> UsageData {
        UsageData {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            web_searches: self.web_searches,
            cost: calculate_cost(
                self.input_tokens,
                self.output_tokens,
                model_id,
                self.web_searches,
            ),
        }
    }
}

/// Linear cost in USD. Unknown model ids cost nothing.
pub fn calculate_cost(
    input_tokens: u64,
    output_tokens: u64,
    model_id: &str,
    web_searches: u32,
) -> f64 {
    let Some(model) = catalog::find_model(model_id) else {
        return 0.0;
    };
    let input_cost = (input_tokens as f64 / 1_000_000.0) * model.input_cost_per_million;
    let output_cost = (output_tokens as f64 / 1_000_000.0) * model.output_cost_per_million;
    input_cost + output_cost + web_searches as f64 * WEB_SEARCH_COST
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_million_input_tokens_costs_input_price() {
        for model in catalog::MODELS.iter() {
            assert_eq!(
                calculate_cost(1_000_000, 0, model.id, 0),
                model.input_cost_per_million
            );
        }
    }

    #[test]
    fn test_unknown_model_is_free() {
        assert_eq!(calculate_cost(1_000_000, 1_000_000, "no-such-model", 3), 0.0);
    }

    #[test]
    fn test_web_search_surcharge() {
        let cost = calculate_cost(0, 0, "claude-sonnet-4-5-20250929", 3);
        assert!((cost - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_mixed_cost() {
        // 1000 input + 500 output on Sonnet: 0.003 + 0.0075
        let cost = calculate_cost(1000, 500, "claude-sonnet-4-5-20250929", 0);
        assert!((cost - 0.0105).abs() < 1e-9);
    }

    #[test]
    fn test_turn_usage_accumulates_rounds() {
        let mut usage = TurnUsage::new();
        assert!(!usage.has_tokens());
        usage.add_round(100, 50, 0);
        usage.add_round(200, 100, 1);

        assert_eq!(usage.input_tokens, 300);
        assert_eq!(usage.output_tokens, 150);
        assert_eq!(usage.web_searches, 1);
        assert_eq!(usage.api_calls, 2);
        assert!(usage.has_tokens());

        let data = usage.finalize("gpt-5-mini");
        assert_eq!(data.total_tokens(), 450);
        assert!(data.cost > WEB_SEARCH_COST);
    }

    #[test]
    fn test_usage_display() {
        let data = UsageData {
            input_tokens: 10,
            output_tokens: 5,
            web_searches: 0,
            cost: 0.5,
        };
        assert_eq!(data.to_string(), "10 in / 5 out tokens ($0.5000)");
    }
}
