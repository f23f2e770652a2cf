//! Terminal sequence of an invocation.
//!
//! Runs exactly once per invocation, whatever way the stream ended:
//!
//! 1. stop the abort timers
//! 2. drop the execution registration (and a queued job, on abort)
//! 3. flush the ledger
//! 4. collect steps
//! 5. decide status and error type
//! 6. commit steps, leftover ledger records, the workflow-node mirror and
//!    the terminal row in one unit, then clear the abort flag
//! 7. emit `end`, then fire best-effort side effects and bill credits
//! 8. surface an exhausted credit balance as [`Error::QuotaExceeded`]
//!
//! If the commit itself fails the client gets an `error` and a failed
//! `end` instead of the planned status, and nothing in step 7 runs.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sr_domain::error::{Error, Result};
use sr_domain::event::{SkillEvent, SkillEventPayload};
use sr_domain::invocation::{
    CommitOutcome, ErrorType, FinalCommit, InvocationKey, InvocationStatus, WorkflowNodeUpdate,
};
use sr_domain::trace::TraceEvent;
use sr_domain::usage::{TokenUsage, UsageItem};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::abort::AbortCoordinator;
use super::cancel::AbortReason;
use super::context::InvocationContext;
use super::effects::{build_credit_batch, UsageReportJob, UsageReportKind};
use super::errors::{categorize, resolve_error_type, CategorizedError, FailureCategory};
use super::ledger::MessageAggregator;
use super::results::ResultAggregator;
use crate::state::AppState;

/// How the stream phase ended.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub failure: Option<CategorizedError>,
    pub errors: Vec<String>,
    pub abort_reason: Option<AbortReason>,
    /// Error type the invocation row carried before this run started.
    pub existing_error_type: Option<ErrorType>,
    pub skipped_events: usize,
}

/// What an invocation ended as.
#[derive(Debug)]
pub struct InvocationSummary {
    pub key: InvocationKey,
    pub status: InvocationStatus,
    pub error_type: Option<ErrorType>,
    pub errors: Vec<String>,
    pub commit: CommitOutcome,
    pub steps: usize,
    pub credits: u64,
    pub skipped_events: usize,
    /// Side effects still running after the commit.
    pub background: Vec<JoinHandle<()>>,
}

impl InvocationSummary {
    /// Wait for the post-commit side effects.
    pub async fn wait_background(&mut self) {
        for handle in self.background.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "side effect task failed");
            }
        }
    }
}

pub(crate) struct Finalizer<'a> {
    pub state: &'a AppState,
    pub ctx: &'a Arc<InvocationContext>,
    pub coordinator: &'a AbortCoordinator,
    pub ledger: &'a MessageAggregator,
    pub results: &'a Arc<dyn ResultAggregator>,
    pub tx: &'a mpsc::Sender<SkillEvent>,
}

impl Finalizer<'_> {
    pub async fn run(self, outcome: RunOutcome) -> Result<InvocationSummary> {
        let key = &self.ctx.key;

        // ── 1-2. Timers and registration ──────────────────────────────
        self.coordinator.cleanup();
        self.state
            .cancel_map
            .remove(&key.result_id, self.coordinator.token());
        if let Err(e) = self.state.aborts.unregister_execution(key).await {
            tracing::warn!(error = %e, "failed to unregister execution");
        }
        if outcome.abort_reason.is_some() {
            if let Err(e) = self.state.aborts.delete_queued_job(key).await {
                tracing::warn!(error = %e, "failed to delete queued job");
            }
        }

        // ── 3-4. Ledger and steps ─────────────────────────────────────
        if let Err(e) = self.ledger.flush().await {
            tracing::warn!(error = %e, "ledger flush incomplete; leftovers go with the commit");
        }
        let steps = self.results.get_steps(key);
        let usage_items = self.results.usage_items();

        // ── 5. Status ─────────────────────────────────────────────────
        let status = if outcome.failure.is_some() {
            InvocationStatus::Failed
        } else {
            InvocationStatus::Finish
        };
        let error_type = match &outcome.failure {
            None => None,
            Some(failure) => {
                let recovered = if failure.category == FailureCategory::Abort {
                    self.recover_error_type().await
                } else {
                    None
                };
                Some(resolve_error_type(
                    recovered,
                    outcome.abort_reason.as_ref(),
                    outcome.existing_error_type,
                ))
            }
        };

        // ── 6. Commit ─────────────────────────────────────────────────
        let messages = self.ledger.unpersisted_records();
        let message_count = messages.len();
        let commit = FinalCommit {
            key: key.clone(),
            status,
            error_type,
            errors: outcome.errors.clone(),
            steps: steps.clone(),
            messages,
            workflow_node: self.ctx.workflow_node_execution_id.as_ref().map(|id| {
                WorkflowNodeUpdate {
                    node_execution_id: id.clone(),
                    status,
                    error_type,
                }
            }),
            committed_at: Utc::now(),
        };
        let committed = self.state.invocations.commit(&commit).await;
        if let Err(e) = self.state.aborts.clear_abort(key).await {
            tracing::warn!(error = %e, "failed to clear abort flag");
        }

        // ── 7. End and side effects ───────────────────────────────────
        let commit_outcome = match committed {
            Ok(CommitOutcome::Applied) => {
                self.ledger.mark_all_persisted();
                TraceEvent::InvocationCommitted {
                    result_id: key.result_id.clone(),
                    version: key.version,
                    status: wire_name(&status),
                    error_type: error_type.as_ref().map(wire_name),
                    steps: steps.len(),
                    messages: message_count,
                }
                .emit();
                CommitOutcome::Applied
            }
            Ok(CommitOutcome::AlreadyTerminal) => {
                tracing::warn!("invocation already terminal; commit skipped");
                CommitOutcome::AlreadyTerminal
            }
            Err(e) => {
                tracing::error!(error = %e, "terminal commit failed");
                self.emit_commit_failure(&e).await;
                self.results.clear_cache();
                return Err(e);
            }
        };
        self.emit_end(status, error_type).await;

        let background = self.spawn_side_effects(status, &usage_items);
        let (credits, requires_recharge) = self.bill(&usage_items).await;
        self.results.clear_cache();

        let error_label = error_type.as_ref().map(wire_name).unwrap_or_else(|| "-".into());
        tracing::info!(
            status = %wire_name(&status),
            error_type = %error_label,
            steps = steps.len(),
            credits,
            skipped_events = outcome.skipped_events,
            "invocation finished"
        );

        // ── 8. Quota ──────────────────────────────────────────────────
        if requires_recharge {
            return Err(Error::QuotaExceeded {
                uid: self.ctx.uid.clone(),
            });
        }

        Ok(InvocationSummary {
            key: key.clone(),
            status,
            error_type,
            errors: outcome.errors,
            commit: commit_outcome,
            steps: steps.len(),
            credits,
            skipped_events: outcome.skipped_events,
            background,
        })
    }

    /// Engines often report an abort with the reason lost; the row may
    /// already carry the abort type a sibling process recorded. Best effort
    /// only: a stale or missing row falls through to the abort reason.
    async fn recover_error_type(&self) -> Option<ErrorType> {
        match self.state.invocations.get_invocation(&self.ctx.key).await {
            Ok(row) => row.and_then(|r| r.error_type),
            Err(e) => {
                tracing::warn!(error = %e, "could not re-read invocation row");
                None
            }
        }
    }

    async fn emit_end(&self, status: InvocationStatus, error_type: Option<ErrorType>) {
        let end = SkillEvent::new(
            &self.ctx.key,
            None,
            SkillEventPayload::End { status, error_type },
        );
        if self.tx.send(end).await.is_err() {
            tracing::trace!("output receiver dropped before end");
        }
    }

    /// The run's outcome never reached the store; tell the client so
    /// instead of reporting the planned status.
    async fn emit_commit_failure(&self, err: &Error) {
        let failure = categorize(err);
        let error = SkillEvent::new(
            &self.ctx.key,
            None,
            SkillEventPayload::Error {
                message: failure.user_message,
                origin: Some(failure.origin),
            },
        );
        if self.tx.send(error).await.is_err() {
            tracing::trace!("output receiver dropped before error");
            return;
        }
        self.emit_end(InvocationStatus::Failed, Some(ErrorType::SystemError))
            .await;
    }

    fn spawn_side_effects(
        &self,
        status: InvocationStatus,
        usage_items: &[UsageItem],
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let key = self.ctx.key.clone();

        if let Some(target) = self.ctx.canvas_target.clone() {
            let canvas = self.state.effects.canvas.clone();
            let key = key.clone();
            handles.push(tokio::spawn(
                async move {
                    if let Err(e) = canvas.sync_status(&target, &key, status).await {
                        tracing::warn!(error = %e, "canvas status sync failed");
                    }
                }
                .instrument(tracing::debug_span!("effect.canvas")),
            ));
        }

        if self.ctx.auto_name {
            let titles = self.state.effects.titles.clone();
            let store = self.state.invocations.clone();
            let query = self.ctx.query.clone();
            let locale = self.ctx.locale.clone();
            let key = key.clone();
            handles.push(tokio::spawn(
                async move {
                    let title = match titles.generate_title(&query, &locale).await {
                        Ok(Some(t)) => t,
                        Ok(None) => return,
                        Err(e) => {
                            tracing::warn!(error = %e, "title generation failed");
                            return;
                        }
                    };
                    let renamed = async {
                        if let Some(mut row) = store.get_invocation(&key).await? {
                            row.title = Some(title);
                            row.updated_at = Utc::now();
                            store.upsert_invocation(&row).await?;
                        }
                        Ok::<(), Error>(())
                    };
                    if let Err(e) = renamed.await {
                        tracing::warn!(error = %e, "failed to store generated title");
                    }
                }
                .instrument(tracing::debug_span!("effect.title")),
            ));
        }

        if self.state.config.orchestrator.report_usage {
            let mut total = TokenUsage::default();
            for item in usage_items {
                total.add(&item.usage);
            }
            if !total.is_empty() {
                let job = UsageReportJob::new(
                    self.ctx,
                    UsageReportKind::Invocation,
                    Some(self.ctx.model.clone()),
                    total,
                );
                let reporter = self.state.effects.usage.clone();
                handles.push(tokio::spawn(
                    async move {
                        if let Err(e) = reporter.enqueue(job).await {
                            tracing::warn!(error = %e, "failed to enqueue usage summary");
                        }
                    }
                    .instrument(tracing::debug_span!("effect.usage")),
                ));
            }
        }

        handles
    }

    /// Returns `(credits, requires_recharge)`. Billing failures are logged
    /// and treated as nothing billed.
    async fn bill(&self, usage_items: &[UsageItem]) -> (u64, bool) {
        let billing = &self.state.config.billing;
        if !billing.enabled {
            return (0, false);
        }
        let batch = build_credit_batch(&self.ctx.uid, &self.ctx.key, usage_items, billing);
        if batch.is_empty() {
            return (0, false);
        }
        let credits = batch.total_credits();
        match self
            .state
            .effects
            .billing
            .sync_batch_token_credit_usage(&batch)
            .await
        {
            Ok(requires_recharge) => {
                TraceEvent::CreditsBilled {
                    result_id: self.ctx.key.result_id.clone(),
                    uid: self.ctx.uid.clone(),
                    models: batch.lines.len(),
                    credits,
                    requires_recharge,
                }
                .emit();
                (credits, requires_recharge)
            }
            Err(e) => {
                tracing::warn!(error = %e, credits, "credit billing failed");
                (0, false)
            }
        }
    }
}

/// Serialized name of a unit enum variant (`finish`, `userAbort`, ...).
fn wire_name<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_default()
}
