//! Starting, driving and aborting invocations.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use sr_domain::error::{Error, Result};
use sr_domain::event::{SkillEvent, SkillEventPayload};
use sr_domain::invocation::{ErrorType, InvocationKey, InvocationRecord};
use sr_domain::trace::TraceEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::abort::AbortCoordinator;
use super::cancel::{AbortReason, CancelToken};
use super::context::{ContextBuilder, InvocationContext, InvocationInput};
use super::errors::{categorize, categorize_abort, estimate_partial_usage, FailureCategory};
use super::finalize::{Finalizer, InvocationSummary, RunOutcome};
use super::ledger::MessageAggregator;
use super::processor::StreamProcessor;
use super::results::{ResultAggregator, StepAggregator};
use crate::state::AppState;

/// A running invocation: its live output and its eventual summary.
pub struct InvocationHandle {
    pub key: InvocationKey,
    pub events: mpsc::Receiver<SkillEvent>,
    pub join: JoinHandle<Result<InvocationSummary>>,
}

impl InvocationHandle {
    /// Drain the live output, then wait for the terminal sequence.
    pub async fn collect(mut self) -> (Vec<SkillEvent>, Result<InvocationSummary>) {
        let mut events = Vec::new();
        while let Some(ev) = self.events.recv().await {
            events.push(ev);
        }
        let result = match self.join.await {
            Ok(r) => r,
            Err(e) => Err(Error::Other(format!("invocation task join: {e}"))),
        };
        (events, result)
    }
}

/// Validate the input, create the executing row and spawn the invocation.
pub async fn start_invocation(state: AppState, input: InvocationInput) -> Result<InvocationHandle> {
    let ctx = Arc::new(ContextBuilder::new(&state.config).build(input)?);
    let key = ctx.key.clone();

    let existing = state.invocations.get_invocation(&key).await?;
    if let Some(ref row) = existing {
        if row.status.is_terminal() {
            return Err(Error::InvalidInput(format!("invocation {key} already finished")));
        }
    }
    let existing_error_type = existing.as_ref().and_then(|r| r.error_type);

    let mut row = match existing {
        Some(row) => row,
        None => InvocationRecord::executing(&key, ctx.uid.clone()),
    };
    row.model = Some(ctx.model.clone());
    row.updated_at = chrono::Utc::now();
    state.invocations.upsert_invocation(&row).await?;

    let token = CancelToken::new();
    state.cancel_map.register(&key.result_id, token.clone());
    if let Err(e) = state.aborts.register_execution(&key, &state.node_id).await {
        tracing::warn!(key = %key, error = %e, "failed to register execution");
    }

    let (tx, rx) = mpsc::channel(state.config.orchestrator.output_channel_capacity.max(1));
    let span = tracing::info_span!(
        "invocation",
        result_id = %key.result_id,
        version = key.version,
        model = %ctx.model,
        trace_id = %ctx.correlation.trace_id,
    );
    let join = tokio::spawn(run_invocation(state, ctx, token, tx, existing_error_type).instrument(span));

    Ok(InvocationHandle {
        key,
        events: rx,
        join,
    })
}

/// Abort an invocation. The durable flag is always set so whichever
/// process runs it will see it; a local run is also tripped immediately.
/// Returns `true` when the invocation was running in this process.
pub async fn abort_invocation(state: &AppState, key: &InvocationKey, message: &str) -> Result<bool> {
    state.aborts.request_abort(key, message).await?;
    let local = state
        .cancel_map
        .abort(&key.result_id, AbortReason::explicit(message));
    tracing::info!(key = %key, local, "abort requested");
    Ok(local)
}

async fn run_invocation(
    state: AppState,
    ctx: Arc<InvocationContext>,
    token: CancelToken,
    tx: mpsc::Sender<SkillEvent>,
    existing_error_type: Option<ErrorType>,
) -> Result<InvocationSummary> {
    let cfg = &state.config.orchestrator;
    let key = ctx.key.clone();

    TraceEvent::InvocationStarted {
        result_id: key.result_id.clone(),
        version: key.version,
        model: ctx.model.clone(),
        trace_id: ctx.correlation.trace_id.clone(),
    }
    .emit();

    let coordinator = AbortCoordinator::start(key.clone(), token.clone(), state.aborts.clone(), cfg);
    let ledger = Arc::new(MessageAggregator::new(
        key.clone(),
        state.ledger.clone(),
        token.clone(),
        cfg.flush_retries,
    ));
    ledger.start_auto_save(Duration::from_millis(cfg.autosave_interval_ms.max(1)));
    let results: Arc<dyn ResultAggregator> = Arc::new(StepAggregator::new(&key));
    let mut processor = StreamProcessor::new(
        &state,
        ctx.clone(),
        ledger.clone(),
        results.clone(),
        coordinator.clone(),
        tx.clone(),
    );

    let start = SkillEvent::new(&key, None, SkillEventPayload::Start);
    results.add_skill_event(&start);
    if tx.send(start).await.is_err() {
        tracing::trace!("output receiver dropped before start");
    }

    let driven = AssertUnwindSafe(drive_stream(&state, &ctx, &token, &mut processor))
        .catch_unwind()
        .await;

    let (stream_error, interrupted) = match driven {
        Ok(Ok(StreamEnd::Completed)) => (None, false),
        Ok(Ok(StreamEnd::Cancelled)) => (None, true),
        Ok(Err(e)) => (Some(e), false),
        Err(panic) => {
            let msg = panic_message(panic.as_ref());
            tracing::error!(panic = %msg, "engine stream panicked");
            (Some(Error::Engine(format!("panic: {msg}"))), false)
        }
    };

    // A tripped token explains the failure better than whatever the engine
    // reported afterwards. An abort landing after a clean finish is moot.
    let abort_reason = if interrupted || stream_error.is_some() {
        token.reason()
    } else {
        None
    };
    let failure = match (&abort_reason, &stream_error) {
        (Some(reason), _) => Some(categorize_abort(reason)),
        (None, Some(err)) => Some(categorize(err)),
        (None, None) if interrupted => Some(categorize(&Error::Aborted("Aborted".into()))),
        (None, None) => None,
    };

    let mut errors = Vec::new();
    if let Some(ref failure) = failure {
        errors.push(failure.origin.clone());
        tracing::warn!(
            category = ?failure.category,
            origin = %failure.origin,
            "invocation failed"
        );

        if failure.category == FailureCategory::Abort || abort_reason.is_some() {
            if let Some(item) = ledger
                .open_segment_text()
                .and_then(|text| estimate_partial_usage(&ctx, &text))
            {
                results.add_usage_item(None, item);
            }
        }

        let reason = abort_reason
            .as_ref()
            .map(|r| r.message.clone())
            .unwrap_or_else(|| failure.user_message.clone());
        processor.abandon_open_tool_calls(&reason).await;

        let error = SkillEvent::new(
            &key,
            None,
            SkillEventPayload::Error {
                message: failure.user_message.clone(),
                origin: Some(failure.origin.clone()),
            },
        );
        if tx.send(error).await.is_err() {
            tracing::trace!("output receiver dropped before error");
        }
    }

    let outcome = RunOutcome {
        failure,
        errors,
        abort_reason,
        existing_error_type,
        skipped_events: processor.skipped(),
    };
    drop(processor);

    Finalizer {
        state: &state,
        ctx: &ctx,
        coordinator: &coordinator,
        ledger: &ledger,
        results: &results,
        tx: &tx,
    }
    .run(outcome)
    .await
}

enum StreamEnd {
    Completed,
    Cancelled,
}

/// Pull events until the stream ends, errors, or the token trips. The
/// event in hand when the token trips is still handled to completion.
async fn drive_stream(
    state: &AppState,
    ctx: &Arc<InvocationContext>,
    token: &CancelToken,
    processor: &mut StreamProcessor,
) -> Result<StreamEnd> {
    let mut stream = state.engine.stream(ctx.clone(), token.clone()).await?;
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(StreamEnd::Cancelled),
            item = stream.next() => item,
        };
        match next {
            None => return Ok(StreamEnd::Completed),
            Some(Ok(event)) => processor.handle(event).await,
            Some(Err(e)) => return Err(e),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
