//! Append-only JSONL store.
//!
//! Layout under the state directory:
//!
//! ```text
//! invocations.jsonl   one InvocationRecord per write, last write wins
//! messages.jsonl      one MessageRecord per insert/update, last write wins
//! tool_calls.jsonl    one ToolCallRecord per persist, last write wins
//! commits.jsonl       one FinalCommit per terminal commit (single line = atomic)
//! aborts/<key>        abort flag; body is the reason
//! running/<key>       execution registration; body is the node id
//! ```
//!
//! Rows are cached in memory after [`JsonlStore::open`]. Abort flags are
//! checked on disk on every query so a flag written by another process
//! (e.g. `skillrun abort`) is seen by the one running the invocation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sr_domain::error::{Error, Result};
use sr_domain::invocation::{
    CommitOutcome, ErrorType, FinalCommit, InvocationKey, InvocationRecord, InvocationStatus,
};
use sr_domain::message::{MessageRecord, ToolCallRecord};

use crate::tables::Tables;
use crate::traits::{AbortStore, InvocationStore, LedgerStore, ToolCallStore};

const INVOCATIONS: &str = "invocations.jsonl";
const MESSAGES: &str = "messages.jsonl";
const TOOL_CALLS: &str = "tool_calls.jsonl";
const COMMITS: &str = "commits.jsonl";
const ABORTS_DIR: &str = "aborts";
const RUNNING_DIR: &str = "running";

pub struct JsonlStore {
    dir: PathBuf,
    tables: RwLock<Tables>,
    /// Serializes check-then-append sequences within this process.
    write_gate: tokio::sync::Mutex<()>,
}

impl JsonlStore {
    /// Open (creating if needed) the state directory and replay its files.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir.join(ABORTS_DIR))?;
        std::fs::create_dir_all(dir.join(RUNNING_DIR))?;

        let mut tables = Tables::default();
        for rec in read_jsonl::<InvocationRecord>(&dir.join(INVOCATIONS))? {
            tables.upsert_invocation(&rec);
        }
        for rec in read_jsonl::<MessageRecord>(&dir.join(MESSAGES))? {
            tables.upsert_message(&rec);
        }
        for rec in read_jsonl::<ToolCallRecord>(&dir.join(TOOL_CALLS))? {
            tables.persist_tool_call(&rec);
        }
        let mut replayed = 0usize;
        for commit in read_jsonl::<FinalCommit>(&dir.join(COMMITS))? {
            match tables.replay_commit(&commit) {
                Ok(()) => replayed += 1,
                Err(e) => {
                    tracing::warn!(key = %commit.key, error = %e, "skipping unreplayable commit");
                }
            }
        }

        tracing::debug!(
            dir = %dir.display(),
            invocations = tables.invocations.len(),
            messages = tables.messages.len(),
            commits = replayed,
            "jsonl store opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            tables: RwLock::new(tables),
            write_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn messages(&self, key: &InvocationKey) -> Vec<MessageRecord> {
        self.tables.read().messages_for(key)
    }

    fn abort_path(&self, key: &InvocationKey) -> PathBuf {
        self.dir.join(ABORTS_DIR).join(key_file_name(key))
    }

    fn running_path(&self, key: &InvocationKey) -> PathBuf {
        self.dir.join(RUNNING_DIR).join(key_file_name(key))
    }

    async fn append<T: Serialize>(&self, file: &str, records: &[T]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let buf = serialize_lines(records)?;
        let path = self.dir.join(file);
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            f.write_all(buf.as_bytes())?;
            Ok::<(), Error>(())
        })
        .await
        .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))?
    }
}

/// File name for a key's flag files. Anything outside `[A-Za-z0-9._-]` in
/// the result id is replaced so ids can't escape the directory.
fn key_file_name(key: &InvocationKey) -> String {
    let safe: String = key
        .result_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}@v{}", key.version)
}

fn serialize_lines<T: Serialize>(records: &[T]) -> Result<String> {
    let mut buf = String::new();
    for rec in records {
        buf.push_str(&serde_json::to_string(rec)?);
        buf.push('\n');
    }
    Ok(buf)
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    let mut out = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(v) => out.push(v),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping malformed jsonl line"
                );
            }
        }
    }
    Ok(out)
}

async fn write_flag(path: PathBuf, body: String) -> Result<()> {
    tokio::task::spawn_blocking(move || std::fs::write(&path, body).map_err(Error::Io))
        .await
        .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))?
}

async fn remove_flag(path: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    })
    .await
    .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))?
}

#[async_trait]
impl LedgerStore for JsonlStore {
    async fn insert_messages(&self, records: &[MessageRecord]) -> Result<usize> {
        let _gate = self.write_gate.lock().await;
        let fresh: Vec<MessageRecord> = {
            let tables = self.tables.read();
            records
                .iter()
                .filter(|r| !tables.has_message(&r.message_id))
                .cloned()
                .collect()
        };
        // Disk first; the cache only changes once the write succeeded.
        self.append(MESSAGES, &fresh).await?;
        Ok(self.tables.write().insert_messages(&fresh).len())
    }

    async fn update_message(&self, record: &MessageRecord) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        self.append(MESSAGES, std::slice::from_ref(record)).await?;
        self.tables.write().upsert_message(record);
        Ok(())
    }
}

#[async_trait]
impl InvocationStore for JsonlStore {
    async fn get_invocation(&self, key: &InvocationKey) -> Result<Option<InvocationRecord>> {
        let mut row = self.tables.read().invocations.get(key).cloned();
        // Another process may have requested an abort since we cached the row.
        if let Some(ref mut r) = row {
            if r.status == InvocationStatus::Executing && self.abort_path(key).exists() {
                r.error_type = Some(ErrorType::UserAbort);
            }
        }
        Ok(row)
    }

    async fn upsert_invocation(&self, record: &InvocationRecord) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        self.append(INVOCATIONS, std::slice::from_ref(record)).await?;
        self.tables.write().upsert_invocation(record);
        Ok(())
    }

    async fn commit(&self, commit: &FinalCommit) -> Result<CommitOutcome> {
        let _gate = self.write_gate.lock().await;
        if self.tables.read().check_commit(commit)? == CommitOutcome::AlreadyTerminal {
            return Ok(CommitOutcome::AlreadyTerminal);
        }
        self.append(COMMITS, std::slice::from_ref(commit)).await?;
        self.tables.write().apply_commit(commit)
    }
}

#[async_trait]
impl ToolCallStore for JsonlStore {
    async fn persist(&self, record: &ToolCallRecord) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        self.append(TOOL_CALLS, std::slice::from_ref(record)).await?;
        self.tables.write().persist_tool_call(record);
        Ok(())
    }

    async fn release_tool_call_id(&self, key: &InvocationKey, tool_call_id: &str) -> Result<()> {
        tracing::debug!(key = %key, tool_call_id, "tool call id released");
        Ok(())
    }
}

#[async_trait]
impl AbortStore for JsonlStore {
    async fn is_abort_requested(&self, key: &InvocationKey) -> Result<bool> {
        let path = self.abort_path(key);
        tokio::task::spawn_blocking(move || path.try_exists().map_err(Error::Io))
            .await
            .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))?
    }

    async fn request_abort(&self, key: &InvocationKey, reason: &str) -> Result<()> {
        write_flag(self.abort_path(key), reason.to_owned()).await?;
        self.tables.write().mark_user_abort(key);
        Ok(())
    }

    async fn register_execution(&self, key: &InvocationKey, node_id: &str) -> Result<()> {
        write_flag(self.running_path(key), node_id.to_owned()).await
    }

    async fn unregister_execution(&self, key: &InvocationKey) -> Result<()> {
        remove_flag(self.running_path(key)).await
    }

    async fn clear_abort(&self, key: &InvocationKey) -> Result<()> {
        remove_flag(self.abort_path(key)).await
    }

    async fn delete_queued_job(&self, key: &InvocationKey) -> Result<()> {
        // No job queue behind this backend.
        tracing::debug!(key = %key, "no queued job to delete");
        Ok(())
    }
}
