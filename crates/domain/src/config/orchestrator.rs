use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Invocation runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Abort the invocation when the engine produces nothing for this long.
    /// `0` disables the idle watchdog.
    #[serde(default)]
    pub stream_idle_timeout_ms: u64,
    #[serde(default = "d_5000")]
    pub idle_check_interval_ms: u64,
    /// How often the durable abort flag is polled.
    #[serde(default = "d_3000")]
    pub abort_poll_interval_ms: u64,
    /// Ledger auto-save period.
    #[serde(default = "d_3000")]
    pub autosave_interval_ms: u64,
    /// Extra attempts made by the final ledger flush.
    #[serde(default = "d_3")]
    pub flush_retries: u32,
    #[serde(default = "d_64")]
    pub output_channel_capacity: usize,
    /// Enqueue usage-report jobs (per LLM call and per invocation).
    #[serde(default = "d_true")]
    pub report_usage: bool,
    #[serde(default = "d_locale")]
    pub default_locale: String,
    #[serde(default)]
    pub tool_output: ToolOutputPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stream_idle_timeout_ms: 0,
            idle_check_interval_ms: 5_000,
            abort_poll_interval_ms: 3_000,
            autosave_interval_ms: 3_000,
            flush_retries: 3,
            output_channel_capacity: 64,
            report_usage: true,
            default_locale: d_locale(),
            tool_output: ToolOutputPolicy::default(),
        }
    }
}

/// How raw tool outputs are cut down before they reach the ledger and the
/// output channel.
///
/// Objects keep only `keep_keys`. An output whose error text matches one of
/// the token-limit patterns (or carries one of the codes) is kept whole, so
/// the caller can see why the tool result was cut off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutputPolicy {
    #[serde(default = "d_keep_keys")]
    pub keep_keys: Vec<String>,
    #[serde(default = "d_token_limit_patterns")]
    pub token_limit_patterns: Vec<String>,
    #[serde(default = "d_token_limit_codes")]
    pub token_limit_codes: Vec<String>,
}

impl Default for ToolOutputPolicy {
    fn default() -> Self {
        Self {
            keep_keys: d_keep_keys(),
            token_limit_patterns: d_token_limit_patterns(),
            token_limit_codes: d_token_limit_codes(),
        }
    }
}

fn d_5000() -> u64 {
    5_000
}
fn d_3000() -> u64 {
    3_000
}
fn d_3() -> u32 {
    3
}
fn d_64() -> usize {
    64
}
fn d_true() -> bool {
    true
}
fn d_locale() -> String {
    "en".into()
}
fn d_keep_keys() -> Vec<String> {
    vec!["output".into()]
}
fn d_token_limit_patterns() -> Vec<String> {
    vec![
        r"(?i)maximum context length".into(),
        r"(?i)too many tokens".into(),
        r"(?i)token limit".into(),
        r"(?i)context[_ ]length[_ ]exceeded".into(),
    ]
}
fn d_token_limit_codes() -> Vec<String> {
    vec!["context_length_exceeded".into(), "TOKEN_LIMIT".into()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_table_fills_defaults() {
        let cfg: OrchestratorConfig = toml::from_str(
            r#"
            stream_idle_timeout_ms = 60000
            [tool_output]
            keep_keys = ["output", "summary"]
        "#,
        )
        .unwrap();
        assert_eq!(cfg.stream_idle_timeout_ms, 60_000);
        assert_eq!(cfg.abort_poll_interval_ms, 3_000);
        assert_eq!(cfg.tool_output.keep_keys, vec!["output", "summary"]);
        assert!(!cfg.tool_output.token_limit_patterns.is_empty());
    }

    #[test]
    fn idle_timeout_disabled_by_default() {
        assert_eq!(OrchestratorConfig::default().stream_idle_timeout_ms, 0);
    }

    #[test]
    fn default_patterns_compile() {
        for p in ToolOutputPolicy::default().token_limit_patterns {
            assert!(regex::Regex::new(&p).is_ok(), "{p}");
        }
    }
}
