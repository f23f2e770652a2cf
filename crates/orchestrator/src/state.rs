use std::sync::Arc;

use sr_domain::config::Config;
use sr_store::{AbortStore, InvocationStore, LedgerStore, ToolCallStore};

use crate::runtime::cancel::CancelMap;
use crate::runtime::effects::Effects;
use crate::runtime::engine::ExecutionEngine;

/// Shared state handed to every invocation.
///
/// Fields are grouped by concern:
/// - **Core**: config and the execution engine
/// - **Storage**: one trait object per store concern (usually the same backend)
/// - **Runtime**: in-process cancellation and this process's id
/// - **Effects**: billing, canvas, usage reporting, auto-naming
#[derive(Clone)]
pub struct AppState {
    // ── Core ──────────────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub engine: Arc<dyn ExecutionEngine>,

    // ── Storage ───────────────────────────────────────────────────────
    pub invocations: Arc<dyn InvocationStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub tool_calls: Arc<dyn ToolCallStore>,
    pub aborts: Arc<dyn AbortStore>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub cancel_map: Arc<CancelMap>,
    /// Recorded with each execution registration.
    pub node_id: String,

    // ── Effects ───────────────────────────────────────────────────────
    pub effects: Effects,
}
