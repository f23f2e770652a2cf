use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

/// A boxed async stream, used for execution-engine event streams.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Which step of the skill an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRef {
    pub name: String,
    #[serde(default)]
    pub index: u32,
}

impl StepRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index: 0,
        }
    }
}

/// A file a tool produced, to be attached to the canvas as a new node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub name: String,
    pub storage_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Events produced by the execution engine for one invocation.
///
/// The set is closed: the orchestrator matches exhaustively, and a new kind
/// of engine output means a new variant here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A model call began.
    ChatStart {
        run_id: String,
        #[serde(default)]
        step: Option<StepRef>,
        #[serde(default)]
        model: Option<String>,
    },

    /// Incremental model output.
    ChatStream {
        run_id: String,
        #[serde(default)]
        step: Option<StepRef>,
        #[serde(default)]
        content: String,
        #[serde(default)]
        reasoning: String,
    },

    /// A model call finished. `usage` is the provider's raw usage metadata.
    ChatEnd {
        run_id: String,
        #[serde(default)]
        step: Option<StepRef>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        usage: Option<Value>,
        /// Tool calls the model requested in this message.
        #[serde(default)]
        tool_calls: Vec<Value>,
    },

    /// A tool began executing.
    ToolStart {
        #[serde(default)]
        run_id: Option<String>,
        #[serde(default)]
        step: Option<StepRef>,
        tool_name: String,
        #[serde(default)]
        toolset_id: Option<String>,
        #[serde(default)]
        input: Value,
    },

    /// A tool returned. The output may still signal an application-level
    /// error (`is_error`, `status: "error"`).
    ToolEnd {
        #[serde(default)]
        run_id: Option<String>,
        #[serde(default)]
        step: Option<StepRef>,
        tool_name: String,
        #[serde(default)]
        toolset_id: Option<String>,
        #[serde(default)]
        output: Value,
        #[serde(default)]
        files: Vec<GeneratedFile>,
    },

    /// A tool raised.
    ToolError {
        #[serde(default)]
        run_id: Option<String>,
        #[serde(default)]
        step: Option<StepRef>,
        tool_name: String,
        #[serde(default)]
        toolset_id: Option<String>,
        error: String,
    },

    /// Provider side-channel carrying metadata the main events omit.
    Custom {
        run_id: String,
        name: String,
        #[serde(default)]
        data: Value,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChatStart { .. } => "chat_start",
            Self::ChatStream { .. } => "chat_stream",
            Self::ChatEnd { .. } => "chat_end",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::ToolError { .. } => "tool_error",
            Self::Custom { .. } => "custom",
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::ChatStart { run_id, .. }
            | Self::ChatStream { run_id, .. }
            | Self::ChatEnd { run_id, .. }
            | Self::Custom { run_id, .. } => Some(run_id.as_str()),
            Self::ToolStart { run_id, .. }
            | Self::ToolEnd { run_id, .. }
            | Self::ToolError { run_id, .. } => run_id.as_deref(),
        }
    }

    pub fn step(&self) -> Option<&StepRef> {
        match self {
            Self::ChatStart { step, .. }
            | Self::ChatStream { step, .. }
            | Self::ChatEnd { step, .. }
            | Self::ToolStart { step, .. }
            | Self::ToolEnd { step, .. }
            | Self::ToolError { step, .. } => step.as_ref(),
            Self::Custom { .. } => None,
        }
    }
}
