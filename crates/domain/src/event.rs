use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::invocation::{ErrorType, InvocationKey, InvocationStatus};
use crate::usage::TokenUsage;

/// One event on an invocation's live output channel.
///
/// Serialized flat: `{"event": "stream", "result_id": .., "version": .., ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillEvent {
    pub result_id: String,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(flatten)]
    pub payload: SkillEventPayload,
}

impl SkillEvent {
    pub fn new(key: &InvocationKey, step: Option<String>, payload: SkillEventPayload) -> Self {
        Self {
            result_id: key.result_id.clone(),
            version: key.version,
            step,
            payload,
        }
    }

    pub fn name(&self) -> &'static str {
        self.payload.name()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SkillEventPayload {
    /// The invocation began executing.
    Start,

    /// Incremental AI output, tagged with the ledger message it belongs to.
    Stream {
        message_id: String,
        #[serde(default)]
        content: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        reasoning_content: String,
    },

    ToolCallStart {
        message_id: String,
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        input: Value,
    },

    ToolCallEnd {
        message_id: String,
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        output: Value,
    },

    ToolCallError {
        message_id: String,
        tool_call_id: String,
        tool_name: String,
        error: String,
    },

    TokenUsage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        model: String,
        usage: TokenUsage,
    },

    /// A sanitized, user-facing error. `origin` carries the raw error text
    /// for diagnostics.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
    },

    /// Terminal event; nothing follows it.
    End {
        status: InvocationStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_type: Option<ErrorType>,
    },
}

impl SkillEventPayload {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stream { .. } => "stream",
            Self::ToolCallStart { .. } => "tool_call_start",
            Self::ToolCallEnd { .. } => "tool_call_end",
            Self::ToolCallError { .. } => "tool_call_error",
            Self::TokenUsage { .. } => "token_usage",
            Self::Error { .. } => "error",
            Self::End { .. } => "end",
        }
    }
}
