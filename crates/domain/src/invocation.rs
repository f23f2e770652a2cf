//! Invocation identity, terminal status, and the durable records written
//! when an invocation is committed.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::MessageRecord;
use crate::usage::TokenUsage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Identity & status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `(result_id, version)`: one versioned run of a skill.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InvocationKey {
    pub result_id: String,
    pub version: u32,
}

impl InvocationKey {
    pub fn new(result_id: impl Into<String>, version: u32) -> Self {
        Self {
            result_id: result_id.into(),
            version,
        }
    }
}

impl fmt::Display for InvocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.result_id, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Executing,
    Finish,
    Failed,
}

impl InvocationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finish | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorType {
    SystemError,
    UserAbort,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Invocation row
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub result_id: String,
    pub version: u32,
    pub uid: String,
    pub status: InvocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InvocationRecord {
    pub fn executing(key: &InvocationKey, uid: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            result_id: key.result_id.clone(),
            version: key.version,
            uid: uid.into(),
            status: InvocationStatus::Executing,
            error_type: None,
            errors: Vec::new(),
            title: None,
            model: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> InvocationKey {
        InvocationKey::new(self.result_id.clone(), self.version)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Steps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accumulated output of one skill step, produced by the result aggregator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub result_id: String,
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub reasoning_content: String,
    #[serde(default)]
    pub tool_call_ids: Vec<String>,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Status mirror for the workflow node that launched this invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowNodeUpdate {
    pub node_execution_id: String,
    pub status: InvocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Final commit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the finalize stage writes in one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalCommit {
    pub key: InvocationKey,
    pub status: InvocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Ledger entries not yet durable. Applied as upserts.
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_node: Option<WorkflowNodeUpdate>,
    pub committed_at: DateTime<Utc>,
}

/// Result of applying a [`FinalCommit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    /// The row for this key was already terminal; nothing was written.
    AlreadyTerminal,
}
