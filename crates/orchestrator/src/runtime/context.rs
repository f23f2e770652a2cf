//! Invocation context builder.
//!
//! Turns a caller's [`InvocationInput`] into the immutable
//! [`InvocationContext`] handed to the execution engine: model routing,
//! locale, tool display names and trace correlation are all resolved here,
//! once, before the stream starts.

use serde::{Deserialize, Serialize};
use sr_domain::config::Config;
use sr_domain::error::{Error, Result};
use sr_domain::invocation::InvocationKey;
use sr_domain::trace::CorrelationContext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Engine-facing name, possibly `<toolset_id>_<name>`.
    pub name: String,
    #[serde(default)]
    pub toolset_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// What a caller supplies to start an invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationInput {
    pub result_id: String,
    pub version: u32,
    pub uid: String,
    pub query: String,
    /// Requested model; empty or the auto alias goes through routing.
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryMessage>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub workflow_node_execution_id: Option<String>,
    #[serde(default)]
    pub canvas_target: Option<String>,
    #[serde(default)]
    pub auto_name: bool,
    /// Correlation handed over by an upstream producer; a fresh root trace
    /// is started when absent.
    #[serde(default)]
    pub correlation: Option<CorrelationContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedTool {
    pub name: String,
    pub toolset_id: Option<String>,
    pub display_name: String,
    pub description: Option<String>,
}

/// Immutable per-invocation configuration.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationContext {
    pub key: InvocationKey,
    pub uid: String,
    pub query: String,
    pub history: Vec<HistoryMessage>,
    pub tools: Vec<ResolvedTool>,
    /// Model that will actually execute.
    pub model: String,
    /// Provider prefix of `model` (`openai/gpt-4o` → `openai`), if any.
    pub provider: String,
    /// Model whose credit rate applies when routing replaced the request.
    pub rate_model: Option<String>,
    pub locale: String,
    pub correlation: CorrelationContext,
    pub workflow_node_execution_id: Option<String>,
    pub canvas_target: Option<String>,
    pub auto_name: bool,
    /// Characters of prompt material, for usage estimates.
    pub prompt_chars: usize,
}

pub struct ContextBuilder<'a> {
    config: &'a Config,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn build(&self, input: InvocationInput) -> Result<InvocationContext> {
        if input.result_id.trim().is_empty() {
            return Err(Error::InvalidInput("result_id must not be empty".into()));
        }
        if input.uid.trim().is_empty() {
            return Err(Error::InvalidInput("uid must not be empty".into()));
        }

        let routing = &self.config.routing;
        let requested = if input.model.is_empty() {
            routing.auto_alias.clone()
        } else {
            input.model
        };
        let (model, rate_model) = routing.resolve(&requested);
        if model == routing.auto_alias {
            return Err(Error::Config(format!(
                "model '{model}' requested but routing.default_model is not set"
            )));
        }
        let provider = model
            .split_once('/')
            .map(|(p, _)| p.to_owned())
            .unwrap_or_default();

        let tools = input
            .tools
            .into_iter()
            .map(|t| ResolvedTool {
                display_name: canonical_tool_name(&t.name, t.toolset_id.as_deref()),
                name: t.name,
                toolset_id: t.toolset_id,
                description: t.description,
            })
            .collect();

        let locale = input
            .locale
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| self.config.orchestrator.default_locale.clone());

        let correlation = match input.correlation {
            Some(upstream) => upstream.child(),
            None => CorrelationContext::new_root(),
        }
        .with_baggage("uid", input.uid.clone())
        .with_baggage("result_id", input.result_id.clone());

        let prompt_chars = input.query.chars().count()
            + input
                .history
                .iter()
                .map(|m| m.content.chars().count())
                .sum::<usize>();

        Ok(InvocationContext {
            key: InvocationKey::new(input.result_id, input.version),
            uid: input.uid,
            query: input.query,
            history: input.history,
            tools,
            model,
            provider,
            rate_model,
            locale,
            correlation,
            workflow_node_execution_id: input.workflow_node_execution_id,
            canvas_target: input.canvas_target,
            auto_name: input.auto_name,
            prompt_chars,
        })
    }
}

/// Display name for a tool: `<toolset_id>_<name>` loses its prefix and is
/// lower-cased. Without a known toolset id the name is only lower-cased.
pub fn canonical_tool_name(name: &str, toolset_id: Option<&str>) -> String {
    if let Some(ts) = toolset_id.filter(|t| !t.is_empty()) {
        if let Some(rest) = name.strip_prefix(ts).and_then(|r| r.strip_prefix('_')) {
            if !rest.is_empty() {
                return rest.to_lowercase();
            }
        }
    }
    name.to_lowercase()
}
