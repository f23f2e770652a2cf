//! In-memory message ledger with periodic persistence.
//!
//! The ledger holds one entry per finished AI segment and one per tool call
//! (upserted by tool-call id). Every mutation marks its entry dirty and
//! bumps a revision counter; a sweep clears `dirty` only when the revision
//! it wrote is still current, so a mutation that lands mid-sweep is picked
//! up by the next one.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use sr_domain::error::{Error, Result};
use sr_domain::invocation::InvocationKey;
use sr_domain::message::{MessageRecord, MessageType, ToolCallMeta};
use sr_domain::trace::TraceEvent;
use sr_domain::usage::TokenUsage;
use sr_store::LedgerStore;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::cancel::CancelToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub message_id: String,
    pub kind: MessageType,
    pub step_name: Option<String>,
    pub content: String,
    pub reasoning_content: String,
    pub tool_calls: Vec<Value>,
    pub tool_call_id: Option<String>,
    pub tool_call_meta: Option<ToolCallMeta>,
    pub usage: Option<TokenUsage>,
    pub dirty: bool,
    pub persisted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    revision: u64,
}

impl LedgerEntry {
    fn to_record(&self, key: &InvocationKey) -> MessageRecord {
        MessageRecord {
            message_id: self.message_id.clone(),
            result_id: key.result_id.clone(),
            version: key.version,
            kind: self.kind,
            step_name: self.step_name.clone(),
            content: self.content.clone(),
            reasoning_content: self.reasoning_content.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
            tool_call_meta: self.tool_call_meta.clone(),
            usage: self.usage,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.revision += 1;
        self.updated_at = Utc::now();
    }
}

/// The AI segment currently being streamed. At most one exists.
#[derive(Debug)]
struct CurrentAiMessage {
    message_id: String,
    step_name: Option<String>,
    content: String,
    reasoning_content: String,
    usage: Option<TokenUsage>,
    tool_calls: Vec<Value>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    by_tool_call: HashMap<String, usize>,
    current: Option<CurrentAiMessage>,
}

impl LedgerState {
    fn finalize_current(&mut self) -> Option<String> {
        let cur = self.current.take()?;
        if cur.content.is_empty() && cur.reasoning_content.is_empty() && cur.tool_calls.is_empty()
        {
            return None;
        }
        let now = Utc::now();
        self.entries.push(LedgerEntry {
            message_id: cur.message_id.clone(),
            kind: MessageType::Ai,
            step_name: cur.step_name,
            content: cur.content,
            reasoning_content: cur.reasoning_content,
            tool_calls: cur.tool_calls,
            tool_call_id: None,
            tool_call_meta: None,
            usage: cur.usage,
            dirty: true,
            persisted: false,
            created_at: cur.created_at,
            updated_at: now,
            revision: 1,
        });
        Some(cur.message_id)
    }
}

/// Outcome of one persistence sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    /// Another sweep was already running; nothing was attempted.
    pub skipped: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MessageAggregator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MessageAggregator {
    key: InvocationKey,
    store: Arc<dyn LedgerStore>,
    cancel: CancelToken,
    state: Mutex<LedgerState>,
    /// Held for the length of a sweep; flush holds it across its retries.
    save_lock: tokio::sync::Mutex<()>,
    autosave: Mutex<Option<JoinHandle<()>>>,
    flush_retries: u32,
}

impl MessageAggregator {
    pub fn new(
        key: InvocationKey,
        store: Arc<dyn LedgerStore>,
        cancel: CancelToken,
        flush_retries: u32,
    ) -> Self {
        Self {
            key,
            store,
            cancel,
            state: Mutex::new(LedgerState::default()),
            save_lock: tokio::sync::Mutex::new(()),
            autosave: Mutex::new(None),
            flush_retries,
        }
    }

    // ── AI segments ───────────────────────────────────────────────────

    /// Finalize any open segment and open a new one. Returns its id.
    pub fn start_ai_message(&self, step_name: Option<String>) -> String {
        let mut state = self.state.lock();
        state.finalize_current();
        let message_id = uuid::Uuid::new_v4().to_string();
        state.current = Some(CurrentAiMessage {
            message_id: message_id.clone(),
            step_name,
            content: String::new(),
            reasoning_content: String::new(),
            usage: None,
            tool_calls: Vec::new(),
            created_at: Utc::now(),
        });
        message_id
    }

    /// Append deltas to the open segment. No-op (returns `false`) when the
    /// invocation is aborted or nothing is open.
    pub fn append_to_ai_message(&self, content: &str, reasoning: &str) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let mut state = self.state.lock();
        match state.current.as_mut() {
            Some(cur) => {
                cur.content.push_str(content);
                cur.reasoning_content.push_str(reasoning);
                true
            }
            None => false,
        }
    }

    pub fn current_message_id(&self) -> Option<String> {
        self.state
            .lock()
            .current
            .as_ref()
            .map(|c| c.message_id.clone())
    }

    /// Content plus reasoning streamed into the open segment so far.
    pub fn open_segment_text(&self) -> Option<String> {
        self.state.lock().current.as_ref().map(|c| {
            let mut text = c.content.clone();
            text.push_str(&c.reasoning_content);
            text
        })
    }

    /// Demote the open segment to a ledger entry. Empty segments are
    /// dropped. Returns the entry id when one was created.
    pub fn finalize_current_ai_message(&self) -> Option<String> {
        self.state.lock().finalize_current()
    }

    /// Attach usage and requested tool calls to the open segment, then
    /// finalize it. A message that only requests tools opens a segment
    /// to carry them.
    pub fn complete_ai_message(
        &self,
        step_name: Option<String>,
        usage: Option<TokenUsage>,
        tool_calls: Vec<Value>,
    ) -> Option<String> {
        let mut state = self.state.lock();
        if state.current.is_none() && !tool_calls.is_empty() {
            state.current = Some(CurrentAiMessage {
                message_id: uuid::Uuid::new_v4().to_string(),
                step_name,
                content: String::new(),
                reasoning_content: String::new(),
                usage: None,
                tool_calls: Vec::new(),
                created_at: Utc::now(),
            });
        }
        if let Some(cur) = state.current.as_mut() {
            if usage.is_some() {
                cur.usage = usage;
            }
            cur.tool_calls.extend(tool_calls);
        }
        state.finalize_current()
    }

    // ── Tool entries ──────────────────────────────────────────────────

    /// Upsert the entry for `tool_call_id`. Returns the entry's message id,
    /// which is stable across updates.
    pub fn add_tool_message(
        &self,
        tool_call_id: &str,
        step_name: Option<String>,
        meta: ToolCallMeta,
    ) -> String {
        let mut state = self.state.lock();
        if let Some(&idx) = state.by_tool_call.get(tool_call_id) {
            let entry = &mut state.entries[idx];
            match entry.tool_call_meta.as_mut() {
                Some(existing) => existing.merge_from(meta),
                None => entry.tool_call_meta = Some(meta),
            }
            if entry.step_name.is_none() {
                entry.step_name = step_name;
            }
            entry.touch();
            return entry.message_id.clone();
        }

        let now = Utc::now();
        let message_id = uuid::Uuid::new_v4().to_string();
        let idx = state.entries.len();
        state.entries.push(LedgerEntry {
            message_id: message_id.clone(),
            kind: MessageType::Tool,
            step_name,
            content: String::new(),
            reasoning_content: String::new(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.to_owned()),
            tool_call_meta: Some(meta),
            usage: None,
            dirty: true,
            persisted: false,
            created_at: now,
            updated_at: now,
            revision: 1,
        });
        state.by_tool_call.insert(tool_call_id.to_owned(), idx);
        message_id
    }

    // ── Persistence ───────────────────────────────────────────────────

    /// Sweep dirty entries every `interval` until flushed or disposed.
    pub fn start_auto_save(self: &Arc<Self>, interval: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let span = tracing::debug_span!("ledger.autosave", key = %self.key);
        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(agg) = weak.upgrade() else { break };
                    agg.save_dirty().await;
                }
            }
            .instrument(span),
        );
        if let Some(previous) = self.autosave.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_auto_save(&self) {
        if let Some(handle) = self.autosave.lock().take() {
            handle.abort();
        }
    }

    /// Persist every dirty entry once. Never-persisted entries go through a
    /// duplicate-tolerant bulk insert, the rest are updated one by one.
    /// Skipped entirely if another sweep is in flight.
    pub async fn save_dirty(&self) -> SaveReport {
        let Ok(_guard) = self.save_lock.try_lock() else {
            return SaveReport {
                skipped: true,
                ..Default::default()
            };
        };
        self.sweep().await
    }

    /// Caller holds `save_lock`.
    async fn sweep(&self) -> SaveReport {
        let (inserts, updates) = {
            let state = self.state.lock();
            let mut inserts = Vec::new();
            let mut updates = Vec::new();
            for (idx, entry) in state.entries.iter().enumerate() {
                if !entry.persisted {
                    inserts.push((idx, entry.revision, entry.to_record(&self.key)));
                } else if entry.dirty {
                    updates.push((idx, entry.revision, entry.to_record(&self.key)));
                }
            }
            (inserts, updates)
        };

        let mut report = SaveReport::default();
        if inserts.is_empty() && updates.is_empty() {
            return report;
        }

        if !inserts.is_empty() {
            let records: Vec<MessageRecord> = inserts.iter().map(|(_, _, r)| r.clone()).collect();
            match self.store.insert_messages(&records).await {
                Ok(n) => {
                    report.inserted = n;
                    let mut state = self.state.lock();
                    for (idx, rev, _) in &inserts {
                        let entry = &mut state.entries[*idx];
                        entry.persisted = true;
                        if entry.revision == *rev {
                            entry.dirty = false;
                        }
                    }
                }
                Err(e) => {
                    report.failed += inserts.len();
                    tracing::warn!(key = %self.key, count = inserts.len(), error = %e, "ledger insert failed");
                }
            }
        }

        for (idx, rev, record) in &updates {
            match self.store.update_message(record).await {
                Ok(()) => {
                    report.updated += 1;
                    let mut state = self.state.lock();
                    let entry = &mut state.entries[*idx];
                    if entry.revision == *rev {
                        entry.dirty = false;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        key = %self.key,
                        message_id = %record.message_id,
                        error = %e,
                        "ledger update failed"
                    );
                }
            }
        }

        TraceEvent::LedgerSaved {
            result_id: self.key.result_id.clone(),
            inserted: report.inserted,
            updated: report.updated,
            failed: report.failed,
        }
        .emit();
        report
    }

    /// Stop auto-save, finalize the open segment, and sweep until the
    /// ledger is fully persisted or the retry budget runs out.
    pub async fn flush(&self) -> Result<()> {
        self.stop_auto_save();
        self.finalize_current_ai_message();

        // Waits out a sweep already in flight.
        let _guard = self.save_lock.lock().await;

        let attempts = self.flush_retries + 1;
        for attempt in 1..=attempts {
            let report = self.sweep().await;
            if self.is_fully_persisted() {
                return Ok(());
            }
            tracing::debug!(key = %self.key, attempt, failed = report.failed, "ledger flush incomplete");
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
            }
        }

        let remaining = self.unpersisted_records().len();
        Err(Error::Storage(format!(
            "{remaining} ledger entries unpersisted after {attempts} attempts"
        )))
    }

    /// Stop auto-save without persisting anything.
    pub fn dispose(&self) {
        self.stop_auto_save();
    }

    pub fn is_fully_persisted(&self) -> bool {
        self.state
            .lock()
            .entries
            .iter()
            .all(|e| e.persisted && !e.dirty)
    }

    /// Records the store doesn't have (or has stale), for the commit
    /// transaction to write.
    pub fn unpersisted_records(&self) -> Vec<MessageRecord> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| !e.persisted || e.dirty)
            .map(|e| e.to_record(&self.key))
            .collect()
    }

    /// The commit wrote everything; mark it so.
    pub fn mark_all_persisted(&self) {
        for entry in self.state.lock().entries.iter_mut() {
            entry.persisted = true;
            entry.dirty = false;
        }
    }

    // ── Inspection ────────────────────────────────────────────────────

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.state.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tool_entry(&self, tool_call_id: &str) -> Option<LedgerEntry> {
        let state = self.state.lock();
        state
            .by_tool_call
            .get(tool_call_id)
            .map(|&idx| state.entries[idx].clone())
    }

    /// Ids of tool entries whose status is still `executing`.
    pub fn open_tool_call_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| {
                e.tool_call_meta
                    .as_ref()
                    .is_some_and(|m| !m.status.is_terminal())
            })
            .filter_map(|e| e.tool_call_id.clone())
            .collect()
    }
}

impl Drop for MessageAggregator {
    fn drop(&mut self) {
        self.stop_auto_save();
    }
}
