//! Row tables shared by both backends. Pure data, no I/O.

use std::collections::HashMap;

use chrono::Utc;
use sr_domain::error::{Error, Result};
use sr_domain::invocation::{
    CommitOutcome, ErrorType, FinalCommit, InvocationKey, InvocationRecord, InvocationStatus,
    Step, WorkflowNodeUpdate,
};
use sr_domain::message::{MessageRecord, ToolCallRecord};

#[derive(Default)]
pub(crate) struct Tables {
    pub invocations: HashMap<InvocationKey, InvocationRecord>,
    /// Insertion order is kept so reads come back in ledger order.
    pub messages: Vec<MessageRecord>,
    message_index: HashMap<String, usize>,
    pub steps: HashMap<InvocationKey, Vec<Step>>,
    pub workflow_nodes: HashMap<String, WorkflowNodeUpdate>,
    /// Engine run ids are only unique within one invocation.
    pub tool_calls: HashMap<(InvocationKey, String), ToolCallRecord>,
}

impl Tables {
    pub fn has_message(&self, message_id: &str) -> bool {
        self.message_index.contains_key(message_id)
    }

    /// Insert records with unseen ids. Returns the ones actually inserted.
    pub fn insert_messages(&mut self, records: &[MessageRecord]) -> Vec<MessageRecord> {
        let mut inserted = Vec::new();
        for rec in records {
            if self.has_message(&rec.message_id) {
                continue;
            }
            self.message_index
                .insert(rec.message_id.clone(), self.messages.len());
            self.messages.push(rec.clone());
            inserted.push(rec.clone());
        }
        inserted
    }

    pub fn upsert_message(&mut self, record: &MessageRecord) {
        match self.message_index.get(&record.message_id) {
            Some(&i) => self.messages[i] = record.clone(),
            None => {
                self.message_index
                    .insert(record.message_id.clone(), self.messages.len());
                self.messages.push(record.clone());
            }
        }
    }

    pub fn messages_for(&self, key: &InvocationKey) -> Vec<MessageRecord> {
        self.messages
            .iter()
            .filter(|m| m.result_id == key.result_id && m.version == key.version)
            .cloned()
            .collect()
    }

    pub fn upsert_invocation(&mut self, record: &InvocationRecord) {
        let key = record.key();
        let mut record = record.clone();
        if let Some(existing) = self.invocations.get(&key) {
            record.created_at = existing.created_at;
        }
        self.invocations.insert(key, record);
    }

    /// Mark an executing row as user-aborted. Terminal rows are left alone.
    pub fn mark_user_abort(&mut self, key: &InvocationKey) {
        if let Some(row) = self.invocations.get_mut(key) {
            if row.status == InvocationStatus::Executing {
                row.error_type = Some(ErrorType::UserAbort);
                row.updated_at = Utc::now();
            }
        }
    }

    /// Check whether `commit` may be applied.
    pub fn check_commit(&self, commit: &FinalCommit) -> Result<CommitOutcome> {
        match self.invocations.get(&commit.key) {
            None => Err(Error::Storage(format!(
                "no invocation row for {}",
                commit.key
            ))),
            Some(row) if row.status.is_terminal() => Ok(CommitOutcome::AlreadyTerminal),
            Some(_) => Ok(CommitOutcome::Applied),
        }
    }

    /// Apply `commit` if the row is still open.
    pub fn apply_commit(&mut self, commit: &FinalCommit) -> Result<CommitOutcome> {
        if self.check_commit(commit)? == CommitOutcome::AlreadyTerminal {
            return Ok(CommitOutcome::AlreadyTerminal);
        }
        self.apply_commit_body(commit);
        Ok(CommitOutcome::Applied)
    }

    /// Re-apply a commit read back from disk. Its steps and messages always
    /// land; the row keeps any later terminal write (e.g. a title update).
    pub fn replay_commit(&mut self, commit: &FinalCommit) -> Result<()> {
        match self.check_commit(commit)? {
            CommitOutcome::Applied => self.apply_commit_body(commit),
            CommitOutcome::AlreadyTerminal => self.apply_commit_data(commit),
        }
        Ok(())
    }

    fn apply_commit_body(&mut self, commit: &FinalCommit) {
        self.apply_commit_data(commit);
        if let Some(row) = self.invocations.get_mut(&commit.key) {
            row.status = commit.status;
            row.error_type = commit.error_type;
            row.errors = commit.errors.clone();
            row.updated_at = commit.committed_at;
        }
    }

    fn apply_commit_data(&mut self, commit: &FinalCommit) {
        self.steps
            .entry(commit.key.clone())
            .or_default()
            .extend(commit.steps.iter().cloned());
        for rec in &commit.messages {
            self.upsert_message(rec);
        }
        if let Some(ref node) = commit.workflow_node {
            self.workflow_nodes
                .insert(node.node_execution_id.clone(), node.clone());
        }
    }

    pub fn persist_tool_call(&mut self, record: &ToolCallRecord) {
        let mut record = record.clone();
        let id = (
            InvocationKey::new(record.result_id.clone(), record.version),
            record.tool_call_id.clone(),
        );
        if let Some(existing) = self.tool_calls.get(&id) {
            record.created_at = existing.created_at;
        }
        self.tool_calls.insert(id, record);
    }

    pub fn tool_call(&self, key: &InvocationKey, tool_call_id: &str) -> Option<&ToolCallRecord> {
        self.tool_calls.get(&(key.clone(), tool_call_id.to_owned()))
    }
}
