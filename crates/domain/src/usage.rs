use serde::{Deserialize, Serialize};

/// Normalized token usage for one model call.
///
/// `input_tokens` never includes cached prompt tokens, so the total is
/// always `input + cache_read + output` no matter how the provider reported
/// it. `cache_write_tokens` is informational and already counted in
/// `input_tokens`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Self::default()
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens + self.output_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens() == 0 && self.cache_write_tokens == 0
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

/// One usage record tracked by the result aggregator and billed at finalize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageItem {
    /// The model that actually executed the call. Token counts belong to it.
    pub model: String,
    #[serde(default)]
    pub provider: String,
    /// When the request was routed (e.g. from `auto`), the model whose
    /// credit rate applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_model: Option<String>,
    pub usage: TokenUsage,
    /// True when counts were estimated from partial output after an abort.
    #[serde(default)]
    pub estimated: bool,
}

impl UsageItem {
    /// The model whose credit rate should be applied.
    pub fn billing_model(&self) -> &str {
        self.rate_model.as_deref().unwrap_or(&self.model)
    }
}
