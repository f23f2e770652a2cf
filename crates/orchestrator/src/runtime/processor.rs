//! Per-event handling of the engine stream.
//!
//! [`StreamProcessor`] turns each [`EngineEvent`] into ledger mutations,
//! tool-call table writes and live [`SkillEvent`]s. It is owned by the
//! invocation task, so its bookkeeping needs no locks.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sr_domain::event::{SkillEvent, SkillEventPayload};
use sr_domain::message::{ToolCallMeta, ToolCallRecord, ToolCallStatus};
use sr_domain::stream::{EngineEvent, GeneratedFile, StepRef};
use sr_domain::trace::TraceEvent;
use sr_domain::usage::{TokenUsage, UsageItem};
use sr_store::ToolCallStore;
use tokio::sync::mpsc;
use tracing::Instrument;

use super::abort::AbortCoordinator;
use super::context::{canonical_tool_name, InvocationContext};
use super::effects::{Effects, UsageReportJob, UsageReportKind};
use super::ledger::MessageAggregator;
use super::results::ResultAggregator;
use super::tool_output::{output_error_message, output_signals_error, ToolOutputNormalizer};
use super::usage::{extract_token_usage, parse_cache_hint, CacheHint};
use crate::state::AppState;

/// A tool call between its start and terminal events.
struct ActiveTool {
    tool_name: String,
    toolset_id: Option<String>,
    step_name: Option<String>,
    input: Value,
    started_at: DateTime<Utc>,
    started: Instant,
}

enum ToolOutcome {
    Output {
        output: Value,
        files: Vec<GeneratedFile>,
    },
    Error(String),
}

pub struct StreamProcessor {
    ctx: Arc<InvocationContext>,
    ledger: Arc<MessageAggregator>,
    results: Arc<dyn ResultAggregator>,
    tool_calls: Arc<dyn ToolCallStore>,
    effects: Effects,
    coordinator: Arc<AbortCoordinator>,
    tx: mpsc::Sender<SkillEvent>,
    normalizer: ToolOutputNormalizer,
    report_usage: bool,

    chat_started: HashMap<String, Instant>,
    cache_hints: HashMap<String, CacheHint>,
    active_tools: HashMap<String, ActiveTool>,
    /// Ids generated for tool starts that carried none, FIFO per tool name.
    anonymous: HashMap<String, VecDeque<String>>,
    skipped: usize,
}

impl StreamProcessor {
    pub fn new(
        state: &AppState,
        ctx: Arc<InvocationContext>,
        ledger: Arc<MessageAggregator>,
        results: Arc<dyn ResultAggregator>,
        coordinator: Arc<AbortCoordinator>,
        tx: mpsc::Sender<SkillEvent>,
    ) -> Self {
        Self {
            ctx,
            ledger,
            results,
            tool_calls: state.tool_calls.clone(),
            effects: state.effects.clone(),
            coordinator,
            tx,
            normalizer: ToolOutputNormalizer::new(&state.config.orchestrator.tool_output),
            report_usage: state.config.orchestrator.report_usage,
            chat_started: HashMap::new(),
            cache_hints: HashMap::new(),
            active_tools: HashMap::new(),
            anonymous: HashMap::new(),
            skipped: 0,
        }
    }

    /// Events dropped because they arrived after the abort signal.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn open_tool_calls(&self) -> usize {
        self.active_tools.len()
    }

    pub async fn handle(&mut self, event: EngineEvent) {
        if self.coordinator.token().is_cancelled() {
            self.skipped += 1;
            tracing::debug!(kind = event.kind(), "event after abort skipped");
            return;
        }

        match event {
            EngineEvent::ChatStart { run_id, step, .. } => {
                self.chat_started.insert(run_id, Instant::now());
                self.ledger.start_ai_message(step_name(step));
            }

            EngineEvent::ChatStream {
                step,
                content,
                reasoning,
                ..
            } => {
                let step = step_name(step);
                let message_id = match self.ledger.current_message_id() {
                    Some(id) => id,
                    None => self.ledger.start_ai_message(step.clone()),
                };
                self.ledger.append_to_ai_message(&content, &reasoning);
                self.emit(
                    step,
                    SkillEventPayload::Stream {
                        message_id,
                        content,
                        reasoning_content: reasoning,
                    },
                )
                .await;
            }

            EngineEvent::ChatEnd {
                run_id,
                step,
                model,
                usage,
                tool_calls,
            } => {
                self.on_chat_end(run_id, step_name(step), model, usage, tool_calls)
                    .await;
            }

            EngineEvent::ToolStart {
                run_id,
                step,
                tool_name,
                toolset_id,
                input,
            } => {
                let span = tool_span(&run_id, &tool_name);
                self.on_tool_start(run_id, step_name(step), tool_name, toolset_id, input)
                    .instrument(span)
                    .await;
            }

            EngineEvent::ToolEnd {
                run_id,
                step,
                tool_name,
                toolset_id,
                output,
                files,
            } => {
                let span = tool_span(&run_id, &tool_name);
                self.on_tool_terminal(
                    run_id,
                    step_name(step),
                    tool_name,
                    toolset_id,
                    ToolOutcome::Output { output, files },
                )
                .instrument(span)
                .await;
            }

            EngineEvent::ToolError {
                run_id,
                step,
                tool_name,
                toolset_id,
                error,
            } => {
                let span = tool_span(&run_id, &tool_name);
                self.on_tool_terminal(
                    run_id,
                    step_name(step),
                    tool_name,
                    toolset_id,
                    ToolOutcome::Error(error),
                )
                .instrument(span)
                .await;
            }

            EngineEvent::Custom { run_id, name, data } => match parse_cache_hint(&data) {
                Some(hint) => {
                    self.cache_hints.insert(run_id, hint);
                }
                None => tracing::debug!(name = %name, "custom event ignored"),
            },
        }
    }

    // ── LLM calls ─────────────────────────────────────────────────────

    async fn on_chat_end(
        &mut self,
        run_id: String,
        step: Option<String>,
        model: Option<String>,
        raw_usage: Option<Value>,
        tool_calls: Vec<Value>,
    ) {
        let hint = self.cache_hints.remove(&run_id);
        let usage = raw_usage
            .as_ref()
            .and_then(|raw| extract_token_usage(raw, hint.as_ref()));
        let duration_ms = self
            .chat_started
            .remove(&run_id)
            .map(|t| t.elapsed().as_millis() as u64);

        let message_id = self
            .ledger
            .complete_ai_message(step.clone(), usage, tool_calls);

        let Some(usage) = usage else {
            tracing::debug!(run_id = %run_id, "chat_end without usage");
            return;
        };
        let model = model.unwrap_or_else(|| self.ctx.model.clone());

        self.results.add_usage_item(
            step.as_deref(),
            UsageItem {
                model: model.clone(),
                provider: self.ctx.provider.clone(),
                rate_model: self.ctx.rate_model.clone(),
                usage,
                estimated: false,
            },
        );

        TraceEvent::LlmCompleted {
            result_id: self.ctx.key.result_id.clone(),
            run_id,
            model: model.clone(),
            duration_ms,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_tokens,
        }
        .emit();

        if self.report_usage {
            self.report(UsageReportKind::Call, Some(model.clone()), usage)
                .await;
        }

        self.emit(
            step,
            SkillEventPayload::TokenUsage {
                message_id,
                model,
                usage,
            },
        )
        .await;
    }

    async fn report(&self, kind: UsageReportKind, model: Option<String>, usage: TokenUsage) {
        let job = UsageReportJob::new(&self.ctx, kind, model, usage);
        if let Err(e) = self.effects.usage.enqueue(job).await {
            tracing::warn!(error = %e, "failed to enqueue usage report");
        }
    }

    // ── Tool calls ────────────────────────────────────────────────────

    async fn on_tool_start(
        &mut self,
        run_id: Option<String>,
        step: Option<String>,
        tool_name: String,
        toolset_id: Option<String>,
        input: Value,
    ) {
        let display_name = canonical_tool_name(&tool_name, toolset_id.as_deref());
        let tool_call_id = match run_id {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                self.anonymous
                    .entry(display_name.clone())
                    .or_default()
                    .push_back(id.clone());
                id
            }
        };
        if self.active_tools.contains_key(&tool_call_id) {
            tracing::debug!(tool_call_id = %tool_call_id, "duplicate tool_start ignored");
            return;
        }

        let now = Utc::now();
        self.active_tools.insert(
            tool_call_id.clone(),
            ActiveTool {
                tool_name: display_name.clone(),
                toolset_id: toolset_id.clone(),
                step_name: step.clone(),
                input: input.clone(),
                started_at: now,
                started: Instant::now(),
            },
        );

        let record = ToolCallRecord {
            result_id: self.ctx.key.result_id.clone(),
            version: self.ctx.key.version,
            tool_call_id: tool_call_id.clone(),
            step_name: step.clone(),
            tool_name: display_name.clone(),
            toolset_id: toolset_id.clone(),
            status: ToolCallStatus::Executing,
            input: input.clone(),
            output: Value::Null,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.tool_calls.persist(&record).await {
            tracing::warn!(tool_call_id = %tool_call_id, error = %e, "failed to persist tool call");
        }

        let mut meta = ToolCallMeta::executing(display_name.clone());
        meta.toolset_id = toolset_id;
        meta.input = Some(input.clone());
        meta.started_at = Some(now);
        let message_id = self.ledger.add_tool_message(&tool_call_id, step.clone(), meta);

        TraceEvent::ToolCallStarted {
            result_id: self.ctx.key.result_id.clone(),
            tool_call_id: tool_call_id.clone(),
            tool_name: display_name.clone(),
        }
        .emit();

        self.emit(
            step,
            SkillEventPayload::ToolCallStart {
                message_id,
                tool_call_id,
                tool_name: display_name,
                input,
            },
        )
        .await;
    }

    /// Id for a terminal event: its own, else the oldest anonymous start of
    /// the same tool.
    fn terminal_id(&mut self, run_id: Option<String>, display_name: &str) -> String {
        if let Some(id) = run_id {
            return id;
        }
        if let Some(id) = self
            .anonymous
            .get_mut(display_name)
            .and_then(VecDeque::pop_front)
        {
            return id;
        }
        tracing::warn!(tool = %display_name, "terminal tool event without a matching start");
        uuid::Uuid::new_v4().to_string()
    }

    async fn on_tool_terminal(
        &mut self,
        run_id: Option<String>,
        step: Option<String>,
        tool_name: String,
        toolset_id: Option<String>,
        outcome: ToolOutcome,
    ) {
        let display_name = canonical_tool_name(&tool_name, toolset_id.as_deref());
        let tool_call_id = self.terminal_id(run_id, &display_name);
        let active = self.active_tools.remove(&tool_call_id);

        let (output, error_message, files) = match outcome {
            ToolOutcome::Output { output, files } => {
                if output_signals_error(&output) {
                    let msg = output_error_message(&output);
                    (self.normalizer.normalize(&output), Some(msg), files)
                } else {
                    (self.normalizer.normalize(&output), None, files)
                }
            }
            ToolOutcome::Error(error) => (Value::Null, Some(error), Vec::new()),
        };
        let failed = error_message.is_some();
        let status = if failed {
            ToolCallStatus::Failed
        } else {
            ToolCallStatus::Completed
        };

        let step = step.or_else(|| active.as_ref().and_then(|a| a.step_name.clone()));
        let toolset_id = toolset_id.or_else(|| active.as_ref().and_then(|a| a.toolset_id.clone()));
        let now = Utc::now();

        let record = ToolCallRecord {
            result_id: self.ctx.key.result_id.clone(),
            version: self.ctx.key.version,
            tool_call_id: tool_call_id.clone(),
            step_name: step.clone(),
            tool_name: display_name.clone(),
            toolset_id: toolset_id.clone(),
            status,
            input: active
                .as_ref()
                .map(|a| a.input.clone())
                .unwrap_or(Value::Null),
            output: output.clone(),
            error_message: error_message.clone(),
            created_at: active.as_ref().map(|a| a.started_at).unwrap_or(now),
            updated_at: now,
        };
        if let Err(e) = self.tool_calls.persist(&record).await {
            tracing::warn!(tool_call_id = %tool_call_id, error = %e, "failed to persist tool call");
        }

        let mut meta = ToolCallMeta::executing(display_name.clone());
        meta.status = status;
        meta.toolset_id = toolset_id;
        meta.output = (!output.is_null()).then(|| output.clone());
        meta.error = error_message.clone();
        meta.ended_at = Some(now);
        let message_id = self.ledger.add_tool_message(&tool_call_id, step.clone(), meta);

        TraceEvent::ToolCallFinished {
            result_id: self.ctx.key.result_id.clone(),
            tool_call_id: tool_call_id.clone(),
            tool_name: display_name.clone(),
            failed,
            duration_ms: active.as_ref().map(|a| a.started.elapsed().as_millis() as u64),
        }
        .emit();

        let payload = match error_message {
            Some(error) => SkillEventPayload::ToolCallError {
                message_id,
                tool_call_id: tool_call_id.clone(),
                tool_name: display_name,
                error,
            },
            None => SkillEventPayload::ToolCallEnd {
                message_id,
                tool_call_id: tool_call_id.clone(),
                tool_name: display_name,
                output,
            },
        };
        self.emit(step, payload).await;

        self.release(&tool_call_id).await;

        if !failed && !files.is_empty() {
            if let Err(e) = self
                .effects
                .canvas
                .attach_files(
                    self.ctx.canvas_target.as_deref(),
                    &self.ctx.key,
                    &tool_call_id,
                    &files,
                )
                .await
            {
                tracing::warn!(
                    tool_call_id = %tool_call_id,
                    files = files.len(),
                    error = %e,
                    "failed to attach generated files"
                );
            }
        }
    }

    /// Mark every tool call still in flight as failed with `reason`.
    /// Runs after the abort signal, so it bypasses the skip check.
    pub async fn abandon_open_tool_calls(&mut self, reason: &str) -> usize {
        let open: Vec<(String, ActiveTool)> = self.active_tools.drain().collect();
        self.anonymous.clear();
        let count = open.len();

        for (tool_call_id, tool) in open {
            let now = Utc::now();
            let record = ToolCallRecord {
                result_id: self.ctx.key.result_id.clone(),
                version: self.ctx.key.version,
                tool_call_id: tool_call_id.clone(),
                step_name: tool.step_name.clone(),
                tool_name: tool.tool_name.clone(),
                toolset_id: tool.toolset_id.clone(),
                status: ToolCallStatus::Failed,
                input: tool.input,
                output: Value::Null,
                error_message: Some(reason.to_owned()),
                created_at: tool.started_at,
                updated_at: now,
            };
            if let Err(e) = self.tool_calls.persist(&record).await {
                tracing::warn!(tool_call_id = %tool_call_id, error = %e, "failed to persist abandoned tool call");
            }

            let mut meta = ToolCallMeta::executing(tool.tool_name.clone());
            meta.status = ToolCallStatus::Failed;
            meta.error = Some(reason.to_owned());
            meta.ended_at = Some(now);
            let message_id = self
                .ledger
                .add_tool_message(&tool_call_id, tool.step_name.clone(), meta);

            self.emit(
                tool.step_name,
                SkillEventPayload::ToolCallError {
                    message_id,
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool.tool_name,
                    error: reason.to_owned(),
                },
            )
            .await;

            self.release(&tool_call_id).await;
        }

        if count > 0 {
            tracing::info!(count, reason, "abandoned open tool calls");
        }
        count
    }

    async fn release(&self, tool_call_id: &str) {
        if let Err(e) = self
            .tool_calls
            .release_tool_call_id(&self.ctx.key, tool_call_id)
            .await
        {
            tracing::warn!(tool_call_id, error = %e, "failed to release tool call id");
        }
    }

    async fn emit(&self, step: Option<String>, payload: SkillEventPayload) {
        let event = SkillEvent::new(&self.ctx.key, step, payload);
        self.results.add_skill_event(&event);
        self.coordinator.mark_output_observed();
        if self.tx.send(event).await.is_err() {
            tracing::trace!("output receiver dropped");
        }
    }
}

fn step_name(step: Option<StepRef>) -> Option<String> {
    step.map(|s| s.name)
}

fn tool_span(run_id: &Option<String>, tool_name: &str) -> tracing::Span {
    tracing::debug_span!(
        "tool.call",
        run_id = run_id.as_deref().unwrap_or("-"),
        tool = %tool_name,
    )
}
