use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Structured trace events emitted across all skillrun crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    InvocationStarted {
        result_id: String,
        version: u32,
        model: String,
        trace_id: String,
    },
    LlmCompleted {
        result_id: String,
        run_id: String,
        model: String,
        duration_ms: Option<u64>,
        input_tokens: u64,
        output_tokens: u64,
        cache_read_tokens: u64,
    },
    ToolCallStarted {
        result_id: String,
        tool_call_id: String,
        tool_name: String,
    },
    ToolCallFinished {
        result_id: String,
        tool_call_id: String,
        tool_name: String,
        failed: bool,
        duration_ms: Option<u64>,
    },
    LedgerSaved {
        result_id: String,
        inserted: usize,
        updated: usize,
        failed: usize,
    },
    AbortDetected {
        result_id: String,
        version: u32,
        source: String,
        message: String,
    },
    InvocationCommitted {
        result_id: String,
        version: u32,
        status: String,
        error_type: Option<String>,
        steps: usize,
        messages: usize,
    },
    CreditsBilled {
        result_id: String,
        uid: String,
        models: usize,
        credits: u64,
        requires_recharge: bool,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "sr_event");
    }
}

/// Trace correlation carried explicitly across job/queue boundaries.
///
/// Producers attach it to anything handed to another process; consumers
/// restore it from the payload instead of relying on ambient context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationContext {
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub baggage: BTreeMap<String, String>,
}

impl CorrelationContext {
    /// Start a fresh trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().simple().to_string(),
            span_id: None,
            baggage: BTreeMap::new(),
        }
    }

    /// Same trace, new span. Baggage is inherited.
    pub fn child(&self) -> Self {
        let span = uuid::Uuid::new_v4().simple().to_string();
        Self {
            trace_id: self.trace_id.clone(),
            span_id: Some(span[..16].to_string()),
            baggage: self.baggage.clone(),
        }
    }

    pub fn with_baggage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.baggage.insert(key.into(), value.into());
        self
    }
}
