use async_trait::async_trait;
use sr_domain::error::Result;
use sr_domain::invocation::{CommitOutcome, FinalCommit, InvocationKey, InvocationRecord};
use sr_domain::message::{MessageRecord, ToolCallRecord};

/// Message ledger persistence used by the periodic auto-save sweep.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Bulk insert. Records whose `message_id` already exists are skipped,
    /// so a retried batch never fails on duplicates. Returns how many rows
    /// were actually inserted.
    async fn insert_messages(&self, records: &[MessageRecord]) -> Result<usize>;

    /// Overwrite one previously inserted record.
    async fn update_message(&self, record: &MessageRecord) -> Result<()>;
}

/// The invocation row and the one-shot terminal commit.
#[async_trait]
pub trait InvocationStore: Send + Sync {
    async fn get_invocation(&self, key: &InvocationKey) -> Result<Option<InvocationRecord>>;

    /// Create or replace the row. `created_at` of an existing row is kept.
    async fn upsert_invocation(&self, record: &InvocationRecord) -> Result<()>;

    /// Apply steps, messages (upsert), the workflow-node mirror, and the
    /// terminal row update as one unit. A row that is already terminal is
    /// left untouched and [`CommitOutcome::AlreadyTerminal`] is returned.
    async fn commit(&self, commit: &FinalCommit) -> Result<CommitOutcome>;
}

/// The externally owned tool-call table.
#[async_trait]
pub trait ToolCallStore: Send + Sync {
    /// Upsert by `tool_call_id`.
    async fn persist(&self, record: &ToolCallRecord) -> Result<()>;

    /// The call is over; the id may be reused by the engine.
    async fn release_tool_call_id(&self, key: &InvocationKey, tool_call_id: &str) -> Result<()>;
}

/// Shared state used to cancel an invocation from any process.
#[async_trait]
pub trait AbortStore: Send + Sync {
    async fn is_abort_requested(&self, key: &InvocationKey) -> Result<bool>;

    /// Set the abort flag. If the invocation row is still executing its
    /// error type is recorded as `userAbort` at the same time.
    async fn request_abort(&self, key: &InvocationKey, reason: &str) -> Result<()>;

    /// Record which process/node is executing `key`.
    async fn register_execution(&self, key: &InvocationKey, node_id: &str) -> Result<()>;

    /// Drop the execution registration for `key`. The abort flag stays.
    async fn unregister_execution(&self, key: &InvocationKey) -> Result<()>;

    /// Clear the abort flag for `key`. Called once the terminal row is
    /// committed, since until then the flag may be the only record of
    /// an abort another process requested.
    async fn clear_abort(&self, key: &InvocationKey) -> Result<()>;

    /// Remove a queued (not yet started) job for `key`, if any.
    async fn delete_queued_job(&self, key: &InvocationKey) -> Result<()>;
}
