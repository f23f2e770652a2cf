//! Invocation runtime: drives one engine event stream into live output,
//! the message ledger, tool-call tracking and a single terminal commit.
//!
//! Entry point: [`invoke::start_invocation`] takes an [`InvocationInput`]
//! and returns a handle carrying the live [`SkillEvent`] channel and the
//! join handle that resolves to the [`InvocationSummary`].
//!
//! [`InvocationInput`]: context::InvocationInput
//! [`SkillEvent`]: sr_domain::event::SkillEvent
//! [`InvocationSummary`]: finalize::InvocationSummary

pub mod abort;
pub mod cancel;
pub mod context;
pub mod effects;
pub mod engine;
pub mod errors;
pub mod finalize;
pub mod invoke;
pub mod ledger;
pub mod processor;
pub mod results;
pub mod tool_output;
pub mod usage;

pub use cancel::{AbortReason, AbortSource, CancelMap, CancelToken};
pub use context::{ContextBuilder, InvocationContext, InvocationInput};
pub use engine::{ExecutionEngine, ScriptedEngine};
pub use finalize::InvocationSummary;
pub use invoke::{abort_invocation, start_invocation, InvocationHandle};

/// Truncate to at most `max` chars on a char boundary, appending "..." when
/// anything was cut.
pub(crate) fn truncate_str(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_owned(),
    }
}
