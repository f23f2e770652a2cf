//! Failure categorization and terminal error-type resolution.

use sr_domain::error::Error;
use sr_domain::invocation::ErrorType;
use sr_domain::usage::{TokenUsage, UsageItem};

use super::cancel::{AbortReason, AbortSource};
use super::context::InvocationContext;
use super::truncate_str;
use super::usage::estimate_tokens;

const ORIGIN_MAX_CHARS: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    Timeout,
    Network,
    Abort,
    Other,
}

/// A failure split into what the user sees and what diagnostics keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorizedError {
    pub category: FailureCategory,
    pub user_message: String,
    pub origin: String,
}

impl CategorizedError {
    fn new(category: FailureCategory, origin: impl AsRef<str>) -> Self {
        Self {
            category,
            user_message: user_message(category).to_owned(),
            origin: truncate_str(origin.as_ref(), ORIGIN_MAX_CHARS),
        }
    }
}

fn user_message(category: FailureCategory) -> &'static str {
    match category {
        FailureCategory::Timeout => "The model took too long to respond. Please try again.",
        FailureCategory::Network => "A network error interrupted the response. Please try again.",
        FailureCategory::Abort => "The run was aborted.",
        FailureCategory::Other => "Something went wrong while running the skill.",
    }
}

/// Categorize an error the engine (or the runtime) raised.
pub fn categorize(err: &Error) -> CategorizedError {
    let category = match err {
        Error::Timeout(_) => FailureCategory::Timeout,
        Error::Network(_) => FailureCategory::Network,
        Error::Aborted(_) => FailureCategory::Abort,
        Error::Engine(msg) | Error::Other(msg) => categorize_text(msg),
        _ => FailureCategory::Other,
    };
    CategorizedError::new(category, err.to_string())
}

/// Categorize a cancellation the runtime itself observed. An idle-timeout
/// abort reads as a timeout to the user.
pub fn categorize_abort(reason: &AbortReason) -> CategorizedError {
    let category = match reason.source {
        AbortSource::IdleTimeout => FailureCategory::Timeout,
        AbortSource::Explicit | AbortSource::CrossProcess => FailureCategory::Abort,
    };
    CategorizedError::new(
        category,
        format!("{}: {}", reason.source.as_str(), reason.message),
    )
}

fn categorize_text(msg: &str) -> FailureCategory {
    let lower = msg.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        FailureCategory::Timeout
    } else if ["network", "connection", "econnreset", "socket"]
        .iter()
        .any(|k| lower.contains(k))
    {
        FailureCategory::Network
    } else if lower.contains("abort") {
        FailureCategory::Abort
    } else {
        FailureCategory::Other
    }
}

/// Terminal error type, by precedence: a value recovered from durable
/// state, then the known abort reason, then whatever the invocation
/// carried before this run. Falls back to a system error.
pub fn resolve_error_type(
    recovered: Option<ErrorType>,
    abort_reason: Option<&AbortReason>,
    existing: Option<ErrorType>,
) -> ErrorType {
    recovered
        .or_else(|| abort_reason.map(AbortReason::error_type))
        .or(existing)
        .unwrap_or(ErrorType::SystemError)
}

/// Estimate usage for output that streamed before an abort and never got a
/// provider usage report.
pub fn estimate_partial_usage(ctx: &InvocationContext, partial: &str) -> Option<UsageItem> {
    if partial.is_empty() {
        return None;
    }
    let usage = TokenUsage::new(
        (ctx.prompt_chars as u64).div_ceil(4),
        estimate_tokens(partial),
    );
    Some(UsageItem {
        model: ctx.model.clone(),
        provider: ctx.provider.clone(),
        rate_model: ctx.rate_model.clone(),
        usage,
        estimated: true,
    })
}
