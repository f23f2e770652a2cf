mod billing;
mod observability;
mod orchestrator;
mod routing;
mod storage;

pub use billing::*;
pub use observability::*;
pub use orchestrator::*;
pub use routing::*;
pub use storage::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigError {
    fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let orch = &self.orchestrator;

        if orch.abort_poll_interval_ms == 0 {
            errors.push(ConfigError::error(
                "orchestrator.abort_poll_interval_ms",
                "poll interval must be greater than 0",
            ));
        }
        if orch.autosave_interval_ms == 0 {
            errors.push(ConfigError::error(
                "orchestrator.autosave_interval_ms",
                "autosave interval must be greater than 0",
            ));
        }
        if orch.output_channel_capacity == 0 {
            errors.push(ConfigError::error(
                "orchestrator.output_channel_capacity",
                "channel capacity must be greater than 0",
            ));
        }
        if orch.stream_idle_timeout_ms > 0 {
            if orch.idle_check_interval_ms == 0 {
                errors.push(ConfigError::error(
                    "orchestrator.idle_check_interval_ms",
                    "idle check interval must be greater than 0 when the idle timeout is enabled",
                ));
            } else if orch.stream_idle_timeout_ms < orch.idle_check_interval_ms {
                errors.push(ConfigError::warning(
                    "orchestrator.stream_idle_timeout_ms",
                    "idle timeout is shorter than the check interval; it will fire late",
                ));
            }
        }

        for (i, pattern) in orch.tool_output.token_limit_patterns.iter().enumerate() {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(ConfigError::error(
                    format!("orchestrator.tool_output.token_limit_patterns[{i}]"),
                    format!("invalid regex: {e}"),
                ));
            }
        }
        if orch.tool_output.keep_keys.is_empty() {
            errors.push(ConfigError::warning(
                "orchestrator.tool_output.keep_keys",
                "no keys kept; every normalized tool output will be empty",
            ));
        }

        if self.routing.auto_alias.is_empty() {
            errors.push(ConfigError::error(
                "routing.auto_alias",
                "auto alias must not be empty",
            ));
        }

        for (model, rate) in &self.billing.rates {
            if !rate.is_valid() {
                errors.push(ConfigError::error(
                    format!("billing.rates.{model}"),
                    "rates must be finite and non-negative",
                ));
            }
        }
        if self.billing.enabled && self.billing.rates.is_empty() {
            errors.push(ConfigError::warning(
                "billing.rates",
                "billing is enabled but no model rates are configured; nothing will be charged",
            ));
        }

        if self.storage.backend == StorageBackend::Jsonl
            && self.storage.state_path.as_os_str().is_empty()
        {
            errors.push(ConfigError::error(
                "storage.state_path",
                "state_path must not be empty for the jsonl backend",
            ));
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_errors() {
        let issues = Config::default().validate();
        assert!(issues
            .iter()
            .all(|i| i.severity != ConfigSeverity::Error));
    }

    #[test]
    fn zero_poll_interval_is_an_error() {
        let mut cfg = Config::default();
        cfg.orchestrator.abort_poll_interval_ms = 0;
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "orchestrator.abort_poll_interval_ms"
                && i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn invalid_token_limit_regex_is_reported() {
        let mut cfg = Config::default();
        cfg.orchestrator.tool_output.token_limit_patterns = vec!["(unclosed".into()];
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.field.starts_with("orchestrator.tool_output.token_limit_patterns")));
    }

    #[test]
    fn short_idle_timeout_warns() {
        let mut cfg = Config::default();
        cfg.orchestrator.stream_idle_timeout_ms = 100;
        cfg.orchestrator.idle_check_interval_ms = 1_000;
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "orchestrator.stream_idle_timeout_ms"
                && i.severity == ConfigSeverity::Warning));
    }

    #[test]
    fn negative_rate_is_an_error() {
        let mut cfg = Config::default();
        cfg.billing.rates.insert(
            "gpt-4o".into(),
            CreditRate {
                input_per_1m: -1.0,
                output_per_1m: 1.0,
                cache_read_per_1m: None,
                cache_write_per_1m: None,
            },
        );
        let issues = cfg.validate();
        assert!(issues.iter().any(|i| i.field == "billing.rates.gpt-4o"));
    }

    #[test]
    fn config_error_display() {
        let e = ConfigError::warning("a.b", "careful");
        assert_eq!(e.to_string(), "[WARN] a.b: careful");
    }
}
