//! Token usage extraction from raw provider metadata.
//!
//! Providers report usage in three incompatible shapes:
//!
//! 1. `input_token_details: { cache_read, cache_creation }` next to
//!    `input_tokens` / `output_tokens`;
//! 2. flat legacy keys (`cache_read_input_tokens`, `cacheReadInputTokens`,
//!    `cache_creation_input_tokens`, ...);
//! 3. prompt counters that *include* cached tokens (`promptTokenCount` +
//!    `cachedContentTokenCount`, or `prompt_tokens` +
//!    `prompt_tokens_details.cached_tokens`).
//!
//! Shapes 1 and 2 are additive. For shape 3 the cached count is subtracted
//! from the prompt count, so `total = input + cache_read + output` holds
//! for every provider.

use serde_json::Value;
use sr_domain::usage::TokenUsage;

/// Cache-token counts recovered from a provider `custom` event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheHint {
    pub cache_read: u64,
    pub cache_write: u64,
}

const INPUT_KEYS: &[&str] = &["input_tokens", "inputTokens"];
const OUTPUT_KEYS: &[&str] = &[
    "output_tokens",
    "outputTokens",
    "completion_tokens",
    "candidatesTokenCount",
];
const LEGACY_CACHE_READ_KEYS: &[&str] = &[
    "cache_read_input_tokens",
    "cacheReadInputTokens",
    "cache_read_tokens",
    "cached_tokens",
];
const LEGACY_CACHE_WRITE_KEYS: &[&str] = &[
    "cache_creation_input_tokens",
    "cacheWriteInputTokens",
    "cache_creation_tokens",
    "cache_write_tokens",
];

/// Normalize `raw` into [`TokenUsage`]. `raw` may be the usage object itself
/// or a message carrying it under `usage_metadata`, `usageMetadata` or
/// `usage`. Returns `None` when no token counts are present at all.
pub fn extract_token_usage(raw: &Value, hint: Option<&CacheHint>) -> Option<TokenUsage> {
    let obj = locate_usage(raw)?;

    let mut usage = TokenUsage::default();
    let mut found = false;

    if let Some(prompt) = first_u64(obj, &["promptTokenCount", "prompt_tokens"]) {
        // Shape 3: the prompt count already includes cached tokens.
        let cached = obj
            .get("cachedContentTokenCount")
            .and_then(as_u64)
            .or_else(|| {
                obj.get("prompt_tokens_details")
                    .and_then(|d| d.get("cached_tokens"))
                    .and_then(as_u64)
            })
            .unwrap_or(0);
        usage.input_tokens = prompt.saturating_sub(cached);
        usage.cache_read_tokens = cached;
        found = true;
    } else if let Some(input) = first_u64(obj, INPUT_KEYS) {
        usage.input_tokens = input;
        found = true;
    }

    if let Some(output) = first_u64(obj, OUTPUT_KEYS) {
        usage.output_tokens = output;
        found = true;
    }

    // Shape 1.
    if let Some(details) = obj.get("input_token_details").and_then(Value::as_object) {
        if let Some(read) = details.get("cache_read").and_then(as_u64) {
            usage.cache_read_tokens = read;
            found = true;
        }
        if let Some(write) = details.get("cache_creation").and_then(as_u64) {
            usage.cache_write_tokens = write;
            found = true;
        }
    }

    // Shape 2, only where shape 1 left a gap.
    if usage.cache_read_tokens == 0 {
        if let Some(read) = first_u64(obj, LEGACY_CACHE_READ_KEYS) {
            usage.cache_read_tokens = read;
            found = true;
        }
    }
    if usage.cache_write_tokens == 0 {
        if let Some(write) = first_u64(obj, LEGACY_CACHE_WRITE_KEYS) {
            usage.cache_write_tokens = write;
            found = true;
        }
    }

    if let Some(h) = hint {
        if usage.cache_read_tokens == 0 && h.cache_read > 0 {
            usage.cache_read_tokens = h.cache_read;
        }
        if usage.cache_write_tokens == 0 && h.cache_write > 0 {
            usage.cache_write_tokens = h.cache_write;
        }
    }

    found.then_some(usage)
}

/// Pull cache-token counts out of a `custom` event payload.
pub fn parse_cache_hint(data: &Value) -> Option<CacheHint> {
    let obj = data.as_object()?;
    let read = ["cache_read_tokens", "cacheReadTokens", "cache_read"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(as_u64));
    let write = ["cache_write_tokens", "cacheWriteTokens", "cache_write"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(as_u64));
    if read.is_none() && write.is_none() {
        return None;
    }
    Some(CacheHint {
        cache_read: read.unwrap_or(0),
        cache_write: write.unwrap_or(0),
    })
}

/// Rough output-token estimate for partial output (4 chars per token).
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

fn locate_usage(raw: &Value) -> Option<&serde_json::Map<String, Value>> {
    let obj = raw.as_object()?;
    for key in ["usage_metadata", "usageMetadata", "usage"] {
        if let Some(inner) = obj.get(key).and_then(Value::as_object) {
            return Some(inner);
        }
    }
    Some(obj)
}

fn first_u64(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| obj.get(*k).and_then(as_u64))
}

/// Accept integers and integral floats; some providers send `12.0`.
fn as_u64(v: &Value) -> Option<u64> {
    v.as_u64()
        .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inclusive_prompt_count_subtracts_cache() {
        let raw = json!({
            "usageMetadata": {
                "promptTokenCount": 130,
                "cachedContentTokenCount": 30,
                "candidatesTokenCount": 20
            }
        });
        let u = extract_token_usage(&raw, None).unwrap();
        assert_eq!(u.input_tokens, 100);
        assert_eq!(u.cache_read_tokens, 30);
        assert_eq!(u.output_tokens, 20);
        assert_eq!(u.total_tokens(), 150);
    }

    #[test]
    fn openai_prompt_details_subtract_cache() {
        let raw = json!({
            "prompt_tokens": 1000,
            "completion_tokens": 50,
            "prompt_tokens_details": {"cached_tokens": 800}
        });
        let u = extract_token_usage(&raw, None).unwrap();
        assert_eq!(u.input_tokens, 200);
        assert_eq!(u.cache_read_tokens, 800);
        assert_eq!(u.total_tokens(), 1050);
    }

    #[test]
    fn input_token_details_are_additive() {
        let raw = json!({
            "usage_metadata": {
                "input_tokens": 40,
                "output_tokens": 10,
                "input_token_details": {"cache_read": 25, "cache_creation": 5}
            }
        });
        let u = extract_token_usage(&raw, None).unwrap();
        assert_eq!(u.input_tokens, 40);
        assert_eq!(u.cache_read_tokens, 25);
        assert_eq!(u.cache_write_tokens, 5);
        assert_eq!(u.total_tokens(), 75);
    }

    #[test]
    fn legacy_keys_are_recognized() {
        let raw = json!({
            "input_tokens": 12,
            "output_tokens": 4,
            "cache_read_input_tokens": 7,
            "cache_creation_input_tokens": 3
        });
        let u = extract_token_usage(&raw, None).unwrap();
        assert_eq!(u.cache_read_tokens, 7);
        assert_eq!(u.cache_write_tokens, 3);

        let camel = json!({"inputTokens": 1, "outputTokens": 2, "cacheReadInputTokens": 9});
        assert_eq!(extract_token_usage(&camel, None).unwrap().cache_read_tokens, 9);
    }

    #[test]
    fn plain_counts() {
        let u = extract_token_usage(&json!({"input": 0, "input_tokens": 5, "output_tokens": 3}), None)
            .unwrap();
        assert_eq!(u, TokenUsage::new(5, 3));
    }

    #[test]
    fn hint_fills_missing_cache_counts() {
        let hint = CacheHint {
            cache_read: 11,
            cache_write: 0,
        };
        let u = extract_token_usage(&json!({"input_tokens": 5, "output_tokens": 3}), Some(&hint))
            .unwrap();
        assert_eq!(u.cache_read_tokens, 11);
    }

    #[test]
    fn no_counts_means_none() {
        assert!(extract_token_usage(&json!({"model": "x"}), None).is_none());
        assert!(extract_token_usage(&json!("nope"), None).is_none());
    }

    #[test]
    fn parse_hint_variants() {
        assert_eq!(
            parse_cache_hint(&json!({"cacheReadTokens": 4})),
            Some(CacheHint {
                cache_read: 4,
                cache_write: 0
            })
        );
        assert!(parse_cache_hint(&json!({"other": 1})).is_none());
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
