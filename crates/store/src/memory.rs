//! Process-local store backing every trait in [`crate::traits`].
//!
//! Used by tests and by the `memory` storage backend. Besides the trait
//! surface it exposes read-only observers and a couple of failure hooks so
//! tests can drive the orchestrator's degraded paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use sr_domain::error::{Error, Result};
use sr_domain::invocation::{
    CommitOutcome, FinalCommit, InvocationKey, InvocationRecord, Step, WorkflowNodeUpdate,
};
use sr_domain::message::{MessageRecord, ToolCallRecord};

use crate::tables::Tables;
use crate::traits::{AbortStore, InvocationStore, LedgerStore, ToolCallStore};

#[derive(Default)]
struct AbortState {
    flags: HashMap<InvocationKey, String>,
    executions: HashMap<InvocationKey, String>,
    deleted_jobs: Vec<InvocationKey>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    aborts: RwLock<AbortState>,
    /// Every `persist` call in arrival order.
    tool_call_log: RwLock<Vec<ToolCallRecord>>,
    released: RwLock<Vec<(InvocationKey, String)>>,
    commits: AtomicUsize,
    fail_abort_queries: AtomicBool,
    fail_message_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Failure hooks ─────────────────────────────────────────────────

    /// Make `is_abort_requested` return a storage error until reset.
    pub fn set_fail_abort_queries(&self, fail: bool) {
        self.fail_abort_queries.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `n` ledger writes (insert or update).
    pub fn fail_next_message_writes(&self, n: usize) {
        self.fail_message_writes.store(n, Ordering::SeqCst);
    }

    fn take_message_write_failure(&self) -> bool {
        self.fail_message_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    // ── Observers ─────────────────────────────────────────────────────

    pub fn invocation(&self, key: &InvocationKey) -> Option<InvocationRecord> {
        self.tables.read().invocations.get(key).cloned()
    }

    pub fn messages(&self, key: &InvocationKey) -> Vec<MessageRecord> {
        self.tables.read().messages_for(key)
    }

    pub fn steps(&self, key: &InvocationKey) -> Vec<Step> {
        self.tables.read().steps.get(key).cloned().unwrap_or_default()
    }

    pub fn workflow_node(&self, node_execution_id: &str) -> Option<WorkflowNodeUpdate> {
        self.tables
            .read()
            .workflow_nodes
            .get(node_execution_id)
            .cloned()
    }

    /// Latest state of one tool call.
    pub fn tool_call(&self, key: &InvocationKey, tool_call_id: &str) -> Option<ToolCallRecord> {
        self.tables.read().tool_call(key, tool_call_id).cloned()
    }

    pub fn tool_call_log(&self) -> Vec<ToolCallRecord> {
        self.tool_call_log.read().clone()
    }

    pub fn released_tool_call_ids(&self) -> Vec<String> {
        self.released.read().iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn is_execution_registered(&self, key: &InvocationKey) -> bool {
        self.aborts.read().executions.contains_key(key)
    }

    pub fn deleted_jobs(&self) -> Vec<InvocationKey> {
        self.aborts.read().deleted_jobs.clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn insert_messages(&self, records: &[MessageRecord]) -> Result<usize> {
        if self.take_message_write_failure() {
            return Err(Error::Storage("injected message insert failure".into()));
        }
        Ok(self.tables.write().insert_messages(records).len())
    }

    async fn update_message(&self, record: &MessageRecord) -> Result<()> {
        if self.take_message_write_failure() {
            return Err(Error::Storage("injected message update failure".into()));
        }
        self.tables.write().upsert_message(record);
        Ok(())
    }
}

#[async_trait]
impl InvocationStore for MemoryStore {
    async fn get_invocation(&self, key: &InvocationKey) -> Result<Option<InvocationRecord>> {
        Ok(self.invocation(key))
    }

    async fn upsert_invocation(&self, record: &InvocationRecord) -> Result<()> {
        self.tables.write().upsert_invocation(record);
        Ok(())
    }

    async fn commit(&self, commit: &FinalCommit) -> Result<CommitOutcome> {
        let outcome = self.tables.write().apply_commit(commit)?;
        if outcome == CommitOutcome::Applied {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }
        Ok(outcome)
    }
}

#[async_trait]
impl ToolCallStore for MemoryStore {
    async fn persist(&self, record: &ToolCallRecord) -> Result<()> {
        self.tables.write().persist_tool_call(record);
        self.tool_call_log.write().push(record.clone());
        Ok(())
    }

    async fn release_tool_call_id(&self, key: &InvocationKey, tool_call_id: &str) -> Result<()> {
        self.released
            .write()
            .push((key.clone(), tool_call_id.to_owned()));
        Ok(())
    }
}

#[async_trait]
impl AbortStore for MemoryStore {
    async fn is_abort_requested(&self, key: &InvocationKey) -> Result<bool> {
        if self.fail_abort_queries.load(Ordering::SeqCst) {
            return Err(Error::Storage("abort store unavailable".into()));
        }
        Ok(self.aborts.read().flags.contains_key(key))
    }

    async fn request_abort(&self, key: &InvocationKey, reason: &str) -> Result<()> {
        self.aborts
            .write()
            .flags
            .insert(key.clone(), reason.to_owned());
        self.tables.write().mark_user_abort(key);
        Ok(())
    }

    async fn register_execution(&self, key: &InvocationKey, node_id: &str) -> Result<()> {
        self.aborts
            .write()
            .executions
            .insert(key.clone(), node_id.to_owned());
        Ok(())
    }

    async fn unregister_execution(&self, key: &InvocationKey) -> Result<()> {
        self.aborts.write().executions.remove(key);
        Ok(())
    }

    async fn clear_abort(&self, key: &InvocationKey) -> Result<()> {
        self.aborts.write().flags.remove(key);
        Ok(())
    }

    async fn delete_queued_job(&self, key: &InvocationKey) -> Result<()> {
        self.aborts.write().deleted_jobs.push(key.clone());
        Ok(())
    }
}
