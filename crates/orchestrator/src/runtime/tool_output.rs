//! Tool output normalization before it reaches the ledger.

use regex::Regex;
use serde_json::{Map, Value};
use sr_domain::config::ToolOutputPolicy;

/// Applies a [`ToolOutputPolicy`]: object outputs keep only the configured
/// keys, unless they look like a token-limit failure, in which case they
/// are kept whole.
pub struct ToolOutputNormalizer {
    keep_keys: Vec<String>,
    patterns: Vec<Regex>,
    codes: Vec<String>,
}

impl ToolOutputNormalizer {
    pub fn new(policy: &ToolOutputPolicy) -> Self {
        let patterns = policy
            .token_limit_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "ignoring invalid token-limit pattern");
                    None
                }
            })
            .collect();
        Self {
            keep_keys: policy.keep_keys.clone(),
            patterns,
            codes: policy.token_limit_codes.clone(),
        }
    }

    pub fn normalize(&self, raw: &Value) -> Value {
        let Some(obj) = raw.as_object() else {
            return raw.clone();
        };
        if self.is_token_limit(raw) {
            return raw.clone();
        }
        let kept: Map<String, Value> = self
            .keep_keys
            .iter()
            .filter_map(|k| obj.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        Value::Object(kept)
    }

    /// Whether the output reports a token/context-length overflow.
    pub fn is_token_limit(&self, raw: &Value) -> bool {
        match raw {
            Value::String(s) => self.matches_text(s),
            Value::Object(obj) => {
                let code_hit = ["code", "error_code", "errorCode"]
                    .iter()
                    .filter_map(|k| obj.get(*k).and_then(Value::as_str))
                    .chain(
                        obj.get("error")
                            .and_then(|e| e.get("code"))
                            .and_then(Value::as_str),
                    )
                    .any(|c| self.codes.iter().any(|known| known == c));
                if code_hit {
                    return true;
                }
                ["error", "message", "output"]
                    .iter()
                    .filter_map(|k| obj.get(*k))
                    .any(|v| match v {
                        Value::String(s) => self.matches_text(s),
                        Value::Object(inner) => inner
                            .get("message")
                            .and_then(Value::as_str)
                            .is_some_and(|s| self.matches_text(s)),
                        _ => false,
                    })
            }
            _ => false,
        }
    }

    fn matches_text(&self, text: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(text))
    }
}

/// Whether a tool output signals an application-level failure even though
/// the tool itself returned.
pub fn output_signals_error(output: &Value) -> bool {
    let Some(obj) = output.as_object() else {
        return false;
    };
    let flagged = ["is_error", "isError"]
        .iter()
        .any(|k| obj.get(*k).and_then(Value::as_bool) == Some(true));
    let status_failed = obj
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|s| s.eq_ignore_ascii_case("error") || s.eq_ignore_ascii_case("failed"));
    flagged || status_failed
}

/// Best-effort error text from a failed tool output.
pub fn output_error_message(output: &Value) -> String {
    let from_obj = output.as_object().and_then(|obj| {
        ["error", "message", "output"].iter().find_map(|k| match obj.get(*k) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Object(inner)) => inner
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned),
            _ => None,
        })
    });
    from_obj.unwrap_or_else(|| "Tool reported an error".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalizer() -> ToolOutputNormalizer {
        ToolOutputNormalizer::new(&ToolOutputPolicy::default())
    }

    #[test]
    fn keeps_only_output_key() {
        let out = normalizer().normalize(&json!({"output": "42", "raw_html": "<html>", "debug": 1}));
        assert_eq!(out, json!({"output": "42"}));
    }

    #[test]
    fn token_limit_message_keeps_everything() {
        let raw = json!({"error": "This model's maximum context length is 128000 tokens", "detail": 1});
        assert_eq!(normalizer().normalize(&raw), raw);
    }

    #[test]
    fn token_limit_code_keeps_everything() {
        let raw = json!({"error": {"code": "context_length_exceeded"}, "extra": true});
        assert!(normalizer().is_token_limit(&raw));
        assert_eq!(normalizer().normalize(&raw), raw);
    }

    #[test]
    fn non_objects_pass_through() {
        assert_eq!(normalizer().normalize(&json!("plain")), json!("plain"));
        assert_eq!(normalizer().normalize(&json!([1, 2])), json!([1, 2]));
    }

    #[test]
    fn configurable_keep_keys() {
        let policy = ToolOutputPolicy {
            keep_keys: vec!["output".into(), "summary".into()],
            ..Default::default()
        };
        let out = ToolOutputNormalizer::new(&policy)
            .normalize(&json!({"output": 1, "summary": "s", "noise": 0}));
        assert_eq!(out, json!({"output": 1, "summary": "s"}));
    }

    #[test]
    fn error_signals() {
        assert!(output_signals_error(&json!({"is_error": true})));
        assert!(output_signals_error(&json!({"isError": true})));
        assert!(output_signals_error(&json!({"status": "failed"})));
        assert!(!output_signals_error(&json!({"status": "ok", "output": "x"})));
        assert!(!output_signals_error(&json!("error")));
    }

    #[test]
    fn error_message_extraction() {
        assert_eq!(output_error_message(&json!({"error": "quota"})), "quota");
        assert_eq!(
            output_error_message(&json!({"error": {"message": "bad input"}})),
            "bad input"
        );
        assert_eq!(output_error_message(&json!({})), "Tool reported an error");
    }
}
