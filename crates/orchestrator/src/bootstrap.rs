//! AppState construction shared by the CLI commands and the tests.

use std::sync::Arc;

use anyhow::Context;

use sr_domain::config::{Config, ConfigSeverity, StorageBackend, StorageConfig};
use sr_store::{AbortStore, InvocationStore, JsonlStore, LedgerStore, MemoryStore, ToolCallStore};

use crate::runtime::cancel::CancelMap;
use crate::runtime::effects::{
    Effects, LogUsageReporter, MemoryBilling, NoopBilling, NoopCanvas, QueryTitles,
};
use crate::runtime::engine::ExecutionEngine;
use crate::state::AppState;

/// One trait object per store concern, all backed by the same store.
#[derive(Clone)]
pub struct Stores {
    pub invocations: Arc<dyn InvocationStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub tool_calls: Arc<dyn ToolCallStore>,
    pub aborts: Arc<dyn AbortStore>,
}

impl Stores {
    fn from_backend<S>(store: Arc<S>) -> Self
    where
        S: InvocationStore + LedgerStore + ToolCallStore + AbortStore + 'static,
    {
        Self {
            invocations: store.clone(),
            ledger: store.clone(),
            tool_calls: store.clone(),
            aborts: store,
        }
    }
}

/// Open the configured storage backend.
pub fn open_stores(storage: &StorageConfig) -> anyhow::Result<Stores> {
    match storage.backend {
        StorageBackend::Memory => {
            tracing::debug!("using in-memory store");
            Ok(Stores::from_backend(Arc::new(MemoryStore::new())))
        }
        StorageBackend::Jsonl => {
            let store = JsonlStore::open(&storage.state_path).with_context(|| {
                format!("opening jsonl store at {}", storage.state_path.display())
            })?;
            tracing::info!(path = %storage.state_path.display(), "jsonl store ready");
            Ok(Stores::from_backend(Arc::new(store)))
        }
    }
}

/// Validate config, open storage and wire the default effects into a
/// ready [`AppState`].
pub fn build_app_state(
    config: Arc<Config>,
    engine: Arc<dyn ExecutionEngine>,
) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Storage ──────────────────────────────────────────────────────
    let stores = open_stores(&config.storage)?;

    // ── Effects ──────────────────────────────────────────────────────
    let effects = Effects {
        billing: if config.billing.enabled {
            Arc::new(MemoryBilling::new(config.billing.initial_balance))
        } else {
            Arc::new(NoopBilling)
        },
        canvas: Arc::new(NoopCanvas),
        usage: Arc::new(LogUsageReporter),
        titles: Arc::new(QueryTitles),
    };

    Ok(assemble(config, engine, stores, effects))
}

/// AppState over a fresh [`MemoryStore`], returned alongside so callers can
/// inspect what was written.
pub fn in_memory_state(
    config: Config,
    engine: Arc<dyn ExecutionEngine>,
    effects: Effects,
) -> (AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let stores = Stores::from_backend(store.clone());
    (assemble(Arc::new(config), engine, stores, effects), store)
}

fn assemble(
    config: Arc<Config>,
    engine: Arc<dyn ExecutionEngine>,
    stores: Stores,
    effects: Effects,
) -> AppState {
    AppState {
        config,
        engine,
        invocations: stores.invocations,
        ledger: stores.ledger,
        tool_calls: stores.tool_calls,
        aborts: stores.aborts,
        cancel_map: Arc::new(CancelMap::new()),
        node_id: format!("skillrun-{}", std::process::id()),
        effects,
    }
}
