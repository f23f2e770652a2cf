use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::usage::TokenUsage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Credit billing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Starting balance for users the in-memory billing backend has not seen.
    #[serde(default = "d_initial_balance")]
    pub initial_balance: i64,
    /// Credit rates keyed by billing model name (e.g. "gpt-4o", "auto").
    #[serde(default)]
    pub rates: HashMap<String, CreditRate>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_balance: d_initial_balance(),
            rates: HashMap::new(),
        }
    }
}

impl BillingConfig {
    pub fn rate_for(&self, model: &str) -> Option<&CreditRate> {
        self.rates.get(model)
    }
}

/// Credits charged per million tokens for one model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CreditRate {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
    /// Falls back to `input_per_1m` when unset.
    #[serde(default)]
    pub cache_read_per_1m: Option<f64>,
    /// Falls back to `input_per_1m` when unset.
    #[serde(default)]
    pub cache_write_per_1m: Option<f64>,
}

impl CreditRate {
    /// Credits owed for `usage`, rounded up to a whole credit.
    pub fn credits(&self, usage: &TokenUsage) -> u64 {
        let read = self.cache_read_per_1m.unwrap_or(self.input_per_1m);
        let write = self.cache_write_per_1m.unwrap_or(self.input_per_1m);
        let raw = (usage.input_tokens as f64 * self.input_per_1m
            + usage.output_tokens as f64 * self.output_per_1m
            + usage.cache_read_tokens as f64 * read
            + usage.cache_write_tokens as f64 * write)
            / 1_000_000.0;
        if raw <= 0.0 {
            0
        } else {
            raw.ceil() as u64
        }
    }

    pub fn is_valid(&self) -> bool {
        let ok = |v: f64| v.is_finite() && v >= 0.0;
        ok(self.input_per_1m)
            && ok(self.output_per_1m)
            && self.cache_read_per_1m.map_or(true, ok)
            && self.cache_write_per_1m.map_or(true, ok)
    }
}

fn d_true() -> bool {
    true
}
fn d_initial_balance() -> i64 {
    1_000
}
