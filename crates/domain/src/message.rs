use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::invocation::InvocationKey;
use crate::usage::TokenUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Ai,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Executing,
    Completed,
    Failed,
}

impl ToolCallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Tool-call details attached to a tool ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallMeta {
    /// Canonical display name (toolset prefix stripped).
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolset_id: Option<String>,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ToolCallMeta {
    pub fn executing(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            toolset_id: None,
            status: ToolCallStatus::Executing,
            input: None,
            output: None,
            error: None,
            started_at: None,
            ended_at: None,
        }
    }

    /// Overlay `update` on top of `self`. Status always follows the update;
    /// optional fields are only replaced when the update carries a value.
    pub fn merge_from(&mut self, update: ToolCallMeta) {
        if !update.tool_name.is_empty() {
            self.tool_name = update.tool_name;
        }
        self.status = update.status;
        if update.toolset_id.is_some() {
            self.toolset_id = update.toolset_id;
        }
        if update.input.is_some() {
            self.input = update.input;
        }
        if update.output.is_some() {
            self.output = update.output;
        }
        if update.error.is_some() {
            self.error = update.error;
        }
        if update.started_at.is_some() {
            self.started_at = update.started_at;
        }
        if update.ended_at.is_some() {
            self.ended_at = update.ended_at;
        }
    }
}

/// Durable form of a ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub result_id: String,
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub reasoning_content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_meta: Option<ToolCallMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn key(&self) -> InvocationKey {
        InvocationKey::new(self.result_id.clone(), self.version)
    }
}

/// The externally owned tool-call row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub result_id: String,
    pub version: u32,
    pub tool_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolset_id: Option<String>,
    pub status: ToolCallStatus,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
