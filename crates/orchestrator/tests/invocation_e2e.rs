//! End-to-end invocation runs against scripted engines and in-memory
//! collaborators.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use sr_domain::config::{Config, CreditRate, StorageBackend};
use sr_domain::event::{SkillEvent, SkillEventPayload};
use async_trait::async_trait;
use sr_domain::error::{Error as DomainError, Result as DomainResult};
use sr_domain::invocation::{
    CommitOutcome, ErrorType, FinalCommit, InvocationKey, InvocationRecord, InvocationStatus,
};
use sr_domain::message::{MessageType, ToolCallStatus};
use sr_domain::stream::{EngineEvent, GeneratedFile, StepRef};
use sr_domain::usage::TokenUsage;
use sr_orchestrator::bootstrap::{build_app_state, in_memory_state};
use sr_orchestrator::runtime::effects::{
    Effects, MemoryBilling, MemoryCanvas, MemoryUsageReporter, QueryTitles, UsageReportKind,
};
use sr_orchestrator::runtime::engine::{FailKind, ScriptStep};
use sr_orchestrator::runtime::{
    abort_invocation, start_invocation, InvocationHandle, InvocationInput, ScriptedEngine,
};
use sr_store::{AbortStore, InvocationStore, JsonlStore, MemoryStore};

// ── Helpers ──────────────────────────────────────────────────────────

fn test_config() -> Config {
    let mut config = Config::default();
    config.orchestrator.abort_poll_interval_ms = 20;
    config.orchestrator.autosave_interval_ms = 20;
    config
}

fn input(result_id: &str) -> InvocationInput {
    InvocationInput {
        result_id: result_id.into(),
        version: 1,
        uid: "u1".into(),
        query: "Summarize the report\nwith details".into(),
        model: "gpt-4o".into(),
        ..Default::default()
    }
}

fn ev(event: EngineEvent) -> ScriptStep {
    ScriptStep::Event(event)
}

fn chat_start(run: &str) -> ScriptStep {
    ev(EngineEvent::ChatStart {
        run_id: run.into(),
        step: None,
        model: None,
    })
}

fn chat_stream(run: &str, text: &str) -> ScriptStep {
    ev(EngineEvent::ChatStream {
        run_id: run.into(),
        step: None,
        content: text.into(),
        reasoning: String::new(),
    })
}

fn chat_end(run: &str, usage: Option<Value>) -> ScriptStep {
    ev(EngineEvent::ChatEnd {
        run_id: run.into(),
        step: None,
        model: None,
        usage,
        tool_calls: Vec::new(),
    })
}

fn tool_start(id: &str, name: &str) -> ScriptStep {
    ev(EngineEvent::ToolStart {
        run_id: Some(id.into()),
        step: Some(StepRef::new("research")),
        tool_name: name.into(),
        toolset_id: None,
        input: json!({ "q": "rust" }),
    })
}

fn tool_end(id: &str, name: &str, files: Vec<GeneratedFile>) -> ScriptStep {
    ev(EngineEvent::ToolEnd {
        run_id: Some(id.into()),
        step: Some(StepRef::new("research")),
        tool_name: name.into(),
        toolset_id: None,
        output: json!({ "output": "found it", "debug": "dropped" }),
        files,
    })
}

fn tool_error(id: &str, name: &str, error: &str) -> ScriptStep {
    ev(EngineEvent::ToolError {
        run_id: Some(id.into()),
        step: Some(StepRef::new("research")),
        tool_name: name.into(),
        toolset_id: None,
        error: error.into(),
    })
}

fn delay(ms: u64) -> ScriptStep {
    ScriptStep::Delay { delay_ms: ms }
}

struct Harness {
    store: Arc<MemoryStore>,
    usage: Arc<MemoryUsageReporter>,
    canvas: Arc<MemoryCanvas>,
    billing: Arc<MemoryBilling>,
    state: sr_orchestrator::state::AppState,
}

fn harness(config: Config, steps: Vec<ScriptStep>) -> Harness {
    let usage = Arc::new(MemoryUsageReporter::new());
    let canvas = Arc::new(MemoryCanvas::new());
    let billing = Arc::new(MemoryBilling::new(config.billing.initial_balance));
    let effects = Effects {
        billing: billing.clone(),
        canvas: canvas.clone(),
        usage: usage.clone(),
        titles: Arc::new(QueryTitles),
    };
    let (state, store) = in_memory_state(config, Arc::new(ScriptedEngine::new(steps)), effects);
    Harness {
        store,
        usage,
        canvas,
        billing,
        state,
    }
}

async fn run_to_end(
    handle: InvocationHandle,
) -> (Vec<SkillEvent>, sr_domain::error::Result<sr_orchestrator::runtime::InvocationSummary>) {
    tokio::time::timeout(Duration::from_secs(10), handle.collect())
        .await
        .expect("invocation did not finish in time")
}

/// Read live events until `pred` matches; returns the events seen so far.
async fn read_until(handle: &mut InvocationHandle, pred: impl Fn(&SkillEvent) -> bool) -> Vec<SkillEvent> {
    let mut seen = Vec::new();
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(5), handle.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed early");
        let done = pred(&ev);
        seen.push(ev);
        if done {
            return seen;
        }
    }
}

fn names(events: &[SkillEvent]) -> Vec<&'static str> {
    events.iter().map(SkillEvent::name).collect()
}

fn end_of(events: &[SkillEvent]) -> (InvocationStatus, Option<ErrorType>) {
    match events.last().map(|e| &e.payload) {
        Some(SkillEventPayload::End { status, error_type }) => (*status, *error_type),
        other => panic!("last event is not end: {other:?}"),
    }
}

// ── Happy path ───────────────────────────────────────────────────────

#[tokio::test]
async fn hello_world_lands_in_one_ledger_entry() {
    let h = harness(
        test_config(),
        vec![
            chat_start("llm-1"),
            chat_stream("llm-1", "Hel"),
            chat_stream("llm-1", "lo "),
            chat_stream("llm-1", "world"),
            chat_end("llm-1", Some(json!({ "input_tokens": 5, "output_tokens": 3 }))),
        ],
    );
    let handle = start_invocation(h.state.clone(), input("r-hello")).await.unwrap();
    let key = handle.key.clone();
    let (events, result) = run_to_end(handle).await;
    let mut summary = result.unwrap();
    summary.wait_background().await;

    assert_eq!(
        names(&events),
        vec!["start", "stream", "stream", "stream", "token_usage", "end"]
    );
    assert_eq!(end_of(&events), (InvocationStatus::Finish, None));
    assert_eq!(summary.commit, CommitOutcome::Applied);

    let messages = h.store.messages(&key);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].kind, MessageType::Ai);
    assert_eq!(messages[0].content, "Hello world");
    let usage = messages[0].usage.unwrap();
    assert_eq!((usage.input_tokens, usage.output_tokens), (5, 3));

    let row = h.store.invocation(&key).unwrap();
    assert_eq!(row.status, InvocationStatus::Finish);
    assert!(row.error_type.is_none());
    assert_eq!(h.store.commit_count(), 1);
    assert!(!h.store.is_execution_registered(&key));

    let steps = h.store.steps(&key);
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].content, "Hello world");
}

#[tokio::test]
async fn usage_reports_carry_the_invocation_trace() {
    let h = harness(
        test_config(),
        vec![
            chat_start("llm-1"),
            chat_stream("llm-1", "ok"),
            chat_end(
                "llm-1",
                Some(json!({
                    "usageMetadata": {
                        "promptTokenCount": 130,
                        "cachedContentTokenCount": 30,
                        "candidatesTokenCount": 7
                    }
                })),
            ),
        ],
    );
    let handle = start_invocation(h.state.clone(), input("r-usage")).await.unwrap();
    let (events, result) = run_to_end(handle).await;
    result.unwrap().wait_background().await;

    let usage = events
        .iter()
        .find_map(|e| match &e.payload {
            SkillEventPayload::TokenUsage { usage, .. } => Some(*usage),
            _ => None,
        })
        .unwrap();
    assert_eq!(usage.input_tokens, 100);
    assert_eq!(usage.cache_read_tokens, 30);
    assert_eq!(usage.total_tokens(), 137);

    let jobs = h.usage.jobs();
    let call = jobs.iter().find(|j| j.kind == UsageReportKind::Call).unwrap();
    let total = jobs
        .iter()
        .find(|j| j.kind == UsageReportKind::Invocation)
        .unwrap();
    assert_eq!(call.usage, usage);
    assert_eq!(total.usage, usage);
    assert_eq!(call.correlation.trace_id, total.correlation.trace_id);
}

#[tokio::test]
async fn rerunning_a_finished_version_is_rejected() {
    let h = harness(test_config(), vec![chat_stream("llm-1", "done")]);
    let handle = start_invocation(h.state.clone(), input("r-twice")).await.unwrap();
    let (_, result) = run_to_end(handle).await;
    result.unwrap();

    let again = start_invocation(h.state.clone(), input("r-twice")).await;
    assert!(matches!(again, Err(sr_domain::error::Error::InvalidInput(_))));
}

#[tokio::test]
async fn workflow_node_and_canvas_mirror_the_terminal_status() {
    let h = harness(test_config(), vec![chat_stream("llm-1", "hi")]);
    let mut inp = input("r-mirror");
    inp.workflow_node_execution_id = Some("node-7".into());
    inp.canvas_target = Some("canvas-1".into());
    let handle = start_invocation(h.state.clone(), inp).await.unwrap();
    let key = handle.key.clone();
    let (_, result) = run_to_end(handle).await;
    result.unwrap().wait_background().await;

    let node = h.store.workflow_node("node-7").unwrap();
    assert_eq!(node.status, InvocationStatus::Finish);
    assert_eq!(
        h.canvas.statuses(),
        vec![("canvas-1".to_string(), key, InvocationStatus::Finish)]
    );
}

#[tokio::test]
async fn auto_name_stores_a_title_after_the_commit() {
    let h = harness(test_config(), vec![chat_stream("llm-1", "hi")]);
    let mut inp = input("r-title");
    inp.auto_name = true;
    let handle = start_invocation(h.state.clone(), inp).await.unwrap();
    let key = handle.key.clone();
    let (_, result) = run_to_end(handle).await;
    result.unwrap().wait_background().await;

    let row = h.store.invocation(&key).unwrap();
    assert_eq!(row.title.as_deref(), Some("Summarize the report"));
    assert_eq!(row.status, InvocationStatus::Finish);
}

// ── Tool calls ───────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_tool_start_keeps_one_ledger_entry() {
    let h = harness(
        test_config(),
        vec![
            tool_start("call-1", "search"),
            tool_start("call-1", "search"),
            tool_error("call-1", "search", "quota hit"),
        ],
    );
    let handle = start_invocation(h.state.clone(), input("r-dup")).await.unwrap();
    let key = handle.key.clone();
    let (events, result) = run_to_end(handle).await;
    result.unwrap();

    assert_eq!(
        names(&events)
            .iter()
            .filter(|n| **n == "tool_call_start")
            .count(),
        1
    );
    assert!(names(&events).contains(&"tool_call_error"));
    assert_eq!(end_of(&events).0, InvocationStatus::Finish);

    let tool_entries: Vec<_> = h
        .store
        .messages(&key)
        .into_iter()
        .filter(|m| m.kind == MessageType::Tool)
        .collect();
    assert_eq!(tool_entries.len(), 1);
    assert_eq!(
        tool_entries[0].tool_call_meta.as_ref().unwrap().status,
        ToolCallStatus::Failed
    );
    assert_eq!(h.store.tool_call(&key, "call-1").unwrap().status, ToolCallStatus::Failed);
    assert_eq!(h.store.released_tool_call_ids(), vec!["call-1".to_string()]);
}

#[tokio::test]
async fn tool_output_is_normalized_and_files_attached() {
    let file = GeneratedFile {
        name: "chart.png".into(),
        storage_key: "static/chart.png".into(),
        mime_type: Some("image/png".into()),
    };
    let h = harness(
        test_config(),
        vec![
            tool_start("call-1", "plot"),
            tool_end("call-1", "plot", vec![file.clone()]),
        ],
    );
    let handle = start_invocation(h.state.clone(), input("r-files")).await.unwrap();
    let (events, result) = run_to_end(handle).await;
    result.unwrap();

    let output = events
        .iter()
        .find_map(|e| match &e.payload {
            SkillEventPayload::ToolCallEnd { output, .. } => Some(output.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(output, json!({ "output": "found it" }));

    let record = h
        .store
        .tool_call(&InvocationKey::new("r-files", 1), "call-1")
        .unwrap();
    assert_eq!(record.status, ToolCallStatus::Completed);
    assert_eq!(h.canvas.attachments().len(), 1);
    assert_eq!(h.canvas.attachments()[0].files, vec![file]);
}

#[tokio::test]
async fn attach_failure_does_not_fail_the_invocation() {
    let h = harness(
        test_config(),
        vec![
            tool_start("call-1", "plot"),
            tool_end(
                "call-1",
                "plot",
                vec![GeneratedFile {
                    name: "a.csv".into(),
                    storage_key: "k/a.csv".into(),
                    mime_type: None,
                }],
            ),
        ],
    );
    h.canvas.set_fail_attach(true);
    let handle = start_invocation(h.state.clone(), input("r-attach")).await.unwrap();
    let (events, result) = run_to_end(handle).await;
    let summary = result.unwrap();

    assert_eq!(summary.status, InvocationStatus::Finish);
    assert_eq!(end_of(&events), (InvocationStatus::Finish, None));
    let record = h
        .store
        .tool_call(&InvocationKey::new("r-attach", 1), "call-1")
        .unwrap();
    assert_eq!(record.status, ToolCallStatus::Completed);
    assert!(h.canvas.attachments().is_empty());
}

fn tool_end_with(id: Option<&str>, name: &str, output: Value) -> ScriptStep {
    ev(EngineEvent::ToolEnd {
        run_id: id.map(Into::into),
        step: Some(StepRef::new("research")),
        tool_name: name.into(),
        toolset_id: None,
        output,
        files: Vec::new(),
    })
}

fn anonymous_tool_start(name: &str, q: &str) -> ScriptStep {
    ev(EngineEvent::ToolStart {
        run_id: None,
        step: Some(StepRef::new("research")),
        tool_name: name.into(),
        toolset_id: None,
        input: json!({ "q": q }),
    })
}

fn tool_errors(events: &[SkillEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            SkillEventPayload::ToolCallError {
                tool_call_id,
                error,
                ..
            } => Some((tool_call_id.clone(), error.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn tool_output_flagged_as_error_fails_the_call() {
    let h = harness(
        test_config(),
        vec![
            tool_start("call-1", "search"),
            tool_end_with(
                Some("call-1"),
                "search",
                json!({ "is_error": true, "error": "rate limited" }),
            ),
            tool_start("call-2", "fetch"),
            tool_end_with(
                Some("call-2"),
                "fetch",
                json!({ "status": "failed", "message": "upstream 502" }),
            ),
        ],
    );
    let handle = start_invocation(h.state.clone(), input("r-tool-flag")).await.unwrap();
    let key = handle.key.clone();
    let (events, result) = run_to_end(handle).await;
    result.unwrap();

    assert!(!names(&events).contains(&"tool_call_end"));
    assert_eq!(
        tool_errors(&events),
        vec![
            ("call-1".to_string(), "rate limited".to_string()),
            ("call-2".to_string(), "upstream 502".to_string()),
        ]
    );
    // A failing tool does not fail the invocation.
    assert_eq!(end_of(&events), (InvocationStatus::Finish, None));

    for id in ["call-1", "call-2"] {
        let record = h.store.tool_call(&key, id).unwrap();
        assert_eq!(record.status, ToolCallStatus::Failed);
        assert!(record.error_message.is_some());
    }
    let metas: Vec<_> = h
        .store
        .messages(&key)
        .into_iter()
        .filter_map(|m| m.tool_call_meta)
        .collect();
    assert_eq!(metas.len(), 2);
    assert!(metas.iter().all(|m| m.status == ToolCallStatus::Failed));
    assert_eq!(metas[0].error.as_deref(), Some("rate limited"));
}

#[tokio::test]
async fn anonymous_tool_starts_match_terminals_in_order() {
    let h = harness(
        test_config(),
        vec![
            anonymous_tool_start("search", "first"),
            anonymous_tool_start("search", "second"),
            tool_end_with(None, "search", json!({ "output": "one" })),
            tool_end_with(None, "search", json!({ "output": "two" })),
        ],
    );
    let handle = start_invocation(h.state.clone(), input("r-anon")).await.unwrap();
    let key = handle.key.clone();
    let (events, result) = run_to_end(handle).await;
    result.unwrap();

    let started: Vec<String> = events
        .iter()
        .filter_map(|e| match &e.payload {
            SkillEventPayload::ToolCallStart { tool_call_id, .. } => Some(tool_call_id.clone()),
            _ => None,
        })
        .collect();
    let ended: Vec<(String, Value)> = events
        .iter()
        .filter_map(|e| match &e.payload {
            SkillEventPayload::ToolCallEnd {
                tool_call_id,
                output,
                ..
            } => Some((tool_call_id.clone(), output.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(started.len(), 2);
    assert_ne!(started[0], started[1]);
    assert_eq!(
        ended,
        vec![
            (started[0].clone(), json!({ "output": "one" })),
            (started[1].clone(), json!({ "output": "two" })),
        ]
    );

    let first = h.store.tool_call(&key, &started[0]).unwrap();
    assert_eq!(first.status, ToolCallStatus::Completed);
    assert_eq!(first.input, json!({ "q": "first" }));
    let tool_entries = h
        .store
        .messages(&key)
        .into_iter()
        .filter(|m| m.kind == MessageType::Tool)
        .count();
    assert_eq!(tool_entries, 2);
}

#[tokio::test]
async fn terminal_without_a_start_still_lands_in_the_ledger() {
    let h = harness(
        test_config(),
        vec![tool_end_with(None, "fetch", json!({ "output": "orphan" }))],
    );
    let handle = start_invocation(h.state.clone(), input("r-orphan")).await.unwrap();
    let key = handle.key.clone();
    let (events, result) = run_to_end(handle).await;
    result.unwrap();

    assert_eq!(names(&events), vec!["start", "tool_call_end", "end"]);
    let meta = h
        .store
        .messages(&key)
        .into_iter()
        .find_map(|m| m.tool_call_meta)
        .unwrap();
    assert_eq!(meta.tool_name, "fetch");
    assert_eq!(meta.status, ToolCallStatus::Completed);
}

#[tokio::test]
async fn toolset_prefix_is_stripped_everywhere() {
    let h = harness(
        test_config(),
        vec![
            ev(EngineEvent::ToolStart {
                run_id: Some("call-1".into()),
                step: Some(StepRef::new("research")),
                tool_name: "web_Search".into(),
                toolset_id: Some("web".into()),
                input: json!({ "q": "rust" }),
            }),
            ev(EngineEvent::ToolEnd {
                run_id: Some("call-1".into()),
                step: None,
                tool_name: "web_Search".into(),
                toolset_id: Some("web".into()),
                output: json!({ "output": "found it" }),
                files: Vec::new(),
            }),
        ],
    );
    let handle = start_invocation(h.state.clone(), input("r-toolset")).await.unwrap();
    let key = handle.key.clone();
    let (events, result) = run_to_end(handle).await;
    result.unwrap();

    let live_names: Vec<&str> = events
        .iter()
        .filter_map(|e| match &e.payload {
            SkillEventPayload::ToolCallStart { tool_name, .. }
            | SkillEventPayload::ToolCallEnd { tool_name, .. } => Some(tool_name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(live_names, vec!["search", "search"]);

    let record = h.store.tool_call(&key, "call-1").unwrap();
    assert_eq!(record.tool_name, "search");
    assert_eq!(record.toolset_id.as_deref(), Some("web"));
    assert_eq!(record.step_name.as_deref(), Some("research"));

    let meta = h
        .store
        .messages(&key)
        .into_iter()
        .find_map(|m| m.tool_call_meta)
        .unwrap();
    assert_eq!(meta.tool_name, "search");
    assert_eq!(meta.toolset_id.as_deref(), Some("web"));
    assert_eq!(meta.status, ToolCallStatus::Completed);
}

// ── Usage ────────────────────────────────────────────────────────────

#[tokio::test]
async fn cache_hint_applies_to_the_next_chat_end_only() {
    let h = harness(
        test_config(),
        vec![
            chat_start("llm-1"),
            ev(EngineEvent::Custom {
                run_id: "llm-1".into(),
                name: "cache_usage".into(),
                data: json!({ "cache_read_tokens": 40, "cache_write_tokens": 7 }),
            }),
            chat_stream("llm-1", "first"),
            chat_end("llm-1", Some(json!({ "input_tokens": 10, "output_tokens": 5 }))),
            chat_start("llm-1"),
            chat_stream("llm-1", "second"),
            chat_end("llm-1", Some(json!({ "input_tokens": 12, "output_tokens": 6 }))),
        ],
    );
    let handle = start_invocation(h.state.clone(), input("r-cache")).await.unwrap();
    let (events, result) = run_to_end(handle).await;
    result.unwrap();

    let usages: Vec<TokenUsage> = events
        .iter()
        .filter_map(|e| match &e.payload {
            SkillEventPayload::TokenUsage { usage, .. } => Some(*usage),
            _ => None,
        })
        .collect();
    assert_eq!(usages.len(), 2);
    assert_eq!(usages[0].input_tokens, 10);
    assert_eq!(usages[0].cache_read_tokens, 40);
    assert_eq!(usages[0].cache_write_tokens, 7);
    assert_eq!(usages[1].input_tokens, 12);
    assert_eq!(usages[1].cache_read_tokens, 0);
    assert_eq!(usages[1].cache_write_tokens, 0);
}

// ── Aborts and timeouts ──────────────────────────────────────────────

#[tokio::test]
async fn cross_process_abort_fails_open_tool_and_releases_it() {
    let h = harness(
        test_config(),
        vec![
            chat_start("llm-1"),
            chat_stream("llm-1", "Looking that up"),
            tool_start("call-1", "search"),
            delay(5_000),
            chat_stream("llm-1", "late"),
        ],
    );
    let mut handle = start_invocation(h.state.clone(), input("r-xabort")).await.unwrap();
    let key = handle.key.clone();

    let mut events = read_until(&mut handle, |e| e.name() == "tool_call_start").await;
    h.store.request_abort(&key, "Stopped from another tab").await.unwrap();

    let (rest, result) = run_to_end(handle).await;
    events.extend(rest);
    let summary = result.unwrap();

    assert_eq!(summary.status, InvocationStatus::Failed);
    assert_eq!(summary.error_type, Some(ErrorType::UserAbort));
    assert_eq!(
        end_of(&events),
        (InvocationStatus::Failed, Some(ErrorType::UserAbort))
    );
    let n = events.len();
    assert_eq!(events[n - 2].name(), "error");
    assert!(!events.iter().any(|e| matches!(
        &e.payload,
        SkillEventPayload::Stream { content, .. } if content == "late"
    )));

    let row = h.store.invocation(&key).unwrap();
    assert_eq!(row.status, InvocationStatus::Failed);
    assert_eq!(row.error_type, Some(ErrorType::UserAbort));

    let tool_entries: Vec<_> = h
        .store
        .messages(&key)
        .into_iter()
        .filter(|m| m.kind == MessageType::Tool)
        .collect();
    assert_eq!(tool_entries.len(), 1);
    assert_eq!(
        tool_entries[0].tool_call_meta.as_ref().unwrap().status,
        ToolCallStatus::Failed
    );
    assert_eq!(h.store.tool_call(&key, "call-1").unwrap().status, ToolCallStatus::Failed);
    assert!(h.store.released_tool_call_ids().contains(&"call-1".to_string()));
    assert_eq!(h.store.deleted_jobs(), vec![key.clone()]);
    assert!(!h.store.is_execution_registered(&key));
}

#[tokio::test]
async fn local_abort_trips_the_running_invocation() {
    let h = harness(
        test_config(),
        vec![chat_stream("llm-1", "thinking"), delay(5_000)],
    );
    let mut handle = start_invocation(h.state.clone(), input("r-local")).await.unwrap();
    let key = handle.key.clone();
    read_until(&mut handle, |e| e.name() == "stream").await;

    let local = abort_invocation(&h.state, &key, "Aborted by user").await.unwrap();
    assert!(local);

    let (events, result) = run_to_end(handle).await;
    let summary = result.unwrap();
    assert_eq!(summary.error_type, Some(ErrorType::UserAbort));
    assert_eq!(
        end_of(&events),
        (InvocationStatus::Failed, Some(ErrorType::UserAbort))
    );
}

#[tokio::test]
async fn abort_bills_an_estimate_for_partial_output() {
    let mut config = test_config();
    config.billing.rates.insert(
        "gpt-4o".into(),
        CreditRate {
            input_per_1m: 1_000_000.0,
            output_per_1m: 1_000_000.0,
            cache_read_per_1m: None,
            cache_write_per_1m: None,
        },
    );
    let h = harness(
        config,
        vec![
            chat_start("llm-1"),
            chat_stream("llm-1", "sixteen chars.."),
            delay(5_000),
        ],
    );
    let mut handle = start_invocation(h.state.clone(), input("r-estimate")).await.unwrap();
    let key = handle.key.clone();
    read_until(&mut handle, |e| e.name() == "stream").await;
    abort_invocation(&h.state, &key, "Aborted by user").await.unwrap();

    let (_, result) = run_to_end(handle).await;
    let summary = result.unwrap();
    assert!(summary.credits > 0);

    let batches = h.billing.batches();
    assert_eq!(batches.len(), 1);
    assert!(batches[0].lines.iter().all(|l| l.estimated));
}

#[tokio::test]
async fn idle_timeout_fails_as_system_error() {
    let mut config = test_config();
    config.orchestrator.stream_idle_timeout_ms = 60;
    config.orchestrator.idle_check_interval_ms = 10;
    let h = harness(config, vec![delay(5_000), chat_stream("llm-1", "too late")]);
    let handle = start_invocation(h.state.clone(), input("r-idle")).await.unwrap();
    let key = handle.key.clone();
    let (events, result) = run_to_end(handle).await;
    let summary = result.unwrap();

    assert_eq!(summary.status, InvocationStatus::Failed);
    assert_eq!(summary.error_type, Some(ErrorType::SystemError));
    assert_eq!(names(&events), vec!["start", "error", "end"]);
    assert_eq!(
        h.store.invocation(&key).unwrap().error_type,
        Some(ErrorType::SystemError)
    );
}

#[tokio::test]
async fn idle_timeout_never_fires_after_first_delta() {
    let mut config = test_config();
    config.orchestrator.stream_idle_timeout_ms = 40;
    config.orchestrator.idle_check_interval_ms = 10;
    let h = harness(
        config,
        vec![
            chat_stream("llm-1", "first"),
            delay(200),
            chat_stream("llm-1", " second"),
        ],
    );
    let handle = start_invocation(h.state.clone(), input("r-idle-ok")).await.unwrap();
    let (events, result) = run_to_end(handle).await;

    assert_eq!(result.unwrap().status, InvocationStatus::Finish);
    assert_eq!(end_of(&events), (InvocationStatus::Finish, None));
}

// ── Stream failures ──────────────────────────────────────────────────

#[tokio::test]
async fn network_failure_is_categorized_with_origin() {
    let h = harness(
        test_config(),
        vec![
            chat_stream("llm-1", "partial"),
            ScriptStep::Fail {
                fail: "connection reset by peer".into(),
                error: Some(FailKind::Network),
            },
        ],
    );
    let handle = start_invocation(h.state.clone(), input("r-net")).await.unwrap();
    let key = handle.key.clone();
    let (events, result) = run_to_end(handle).await;
    let summary = result.unwrap();

    assert_eq!(summary.status, InvocationStatus::Failed);
    assert_eq!(summary.error_type, Some(ErrorType::SystemError));
    let (message, origin) = events
        .iter()
        .find_map(|e| match &e.payload {
            SkillEventPayload::Error { message, origin } => Some((message.clone(), origin.clone())),
            _ => None,
        })
        .unwrap();
    assert!(!message.contains("connection reset"));
    assert!(origin.unwrap().contains("connection reset"));

    // The partial delta still reached the ledger.
    assert_eq!(h.store.messages(&key)[0].content, "partial");
}

#[tokio::test]
async fn engine_panic_becomes_a_failed_invocation() {
    let h = harness(
        test_config(),
        vec![
            chat_stream("llm-1", "about to"),
            ScriptStep::Panic {
                panic: "engine exploded".into(),
            },
        ],
    );
    let handle = start_invocation(h.state.clone(), input("r-panic")).await.unwrap();
    let key = handle.key.clone();
    let (events, result) = run_to_end(handle).await;
    let summary = result.unwrap();

    assert_eq!(summary.status, InvocationStatus::Failed);
    assert_eq!(end_of(&events).0, InvocationStatus::Failed);
    let row = h.store.invocation(&key).unwrap();
    assert!(row.errors.iter().any(|e| e.contains("engine exploded")));
}

// ── Billing ──────────────────────────────────────────────────────────

#[tokio::test]
async fn exhausted_balance_surfaces_quota_exceeded_after_commit() {
    let mut config = test_config();
    config.billing.initial_balance = 50;
    config.billing.rates.insert(
        "gpt-4o".into(),
        CreditRate {
            input_per_1m: 1_000_000.0,
            output_per_1m: 0.0,
            cache_read_per_1m: None,
            cache_write_per_1m: None,
        },
    );
    let h = harness(
        config,
        vec![
            chat_start("llm-1"),
            chat_stream("llm-1", "expensive"),
            chat_end("llm-1", Some(json!({ "input_tokens": 100, "output_tokens": 1 }))),
        ],
    );
    let handle = start_invocation(h.state.clone(), input("r-quota")).await.unwrap();
    let key = handle.key.clone();
    let (events, result) = run_to_end(handle).await;

    let err = result.unwrap_err();
    assert!(err.is_quota_exceeded());
    assert_eq!(end_of(&events), (InvocationStatus::Finish, None));
    assert_eq!(h.store.invocation(&key).unwrap().status, InvocationStatus::Finish);
    assert_eq!(h.billing.balance("u1"), -50);
}

// ── Cross-process over the jsonl backend ─────────────────────────────

#[tokio::test]
async fn jsonl_abort_from_a_second_store_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.storage.backend = StorageBackend::Jsonl;
    config.storage.state_path = dir.path().to_path_buf();

    let engine = ScriptedEngine::new(vec![
        chat_stream("llm-1", "working"),
        tool_start("call-1", "search"),
        delay(5_000),
    ]);
    let state = build_app_state(Arc::new(config), Arc::new(engine)).unwrap();
    let mut handle = start_invocation(state, input("r-jsonl")).await.unwrap();
    let key = InvocationKey::new("r-jsonl", 1);
    read_until(&mut handle, |e| e.name() == "tool_call_start").await;

    // A separate process opens the same directory.
    let other = JsonlStore::open(dir.path()).unwrap();
    other.request_abort(&key, "Stopped elsewhere").await.unwrap();

    let (events, result) = run_to_end(handle).await;
    let summary = result.unwrap();
    assert_eq!(summary.error_type, Some(ErrorType::UserAbort));
    assert_eq!(
        end_of(&events),
        (InvocationStatus::Failed, Some(ErrorType::UserAbort))
    );

    let reopened = JsonlStore::open(dir.path()).unwrap();
    let tool = reopened
        .messages(&key)
        .into_iter()
        .find(|m| m.kind == MessageType::Tool)
        .unwrap();
    assert_eq!(tool.tool_call_meta.unwrap().status, ToolCallStatus::Failed);
}

#[tokio::test]
async fn jsonl_engine_abort_recovers_the_flag_set_elsewhere() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.storage.backend = StorageBackend::Jsonl;
    config.storage.state_path = dir.path().to_path_buf();
    // The poller never gets a chance; only the flag file records the abort.
    config.orchestrator.abort_poll_interval_ms = 60_000;

    let engine = ScriptedEngine::new(vec![
        chat_stream("llm-1", "working"),
        delay(300),
        ScriptStep::Fail {
            fail: "Aborted".into(),
            error: Some(FailKind::Abort),
        },
    ]);
    let state = build_app_state(Arc::new(config), Arc::new(engine)).unwrap();
    let mut handle = start_invocation(state, input("r-engine-abort")).await.unwrap();
    let key = handle.key.clone();
    read_until(&mut handle, |e| e.name() == "stream").await;

    let other = JsonlStore::open(dir.path()).unwrap();
    other.request_abort(&key, "Stopped elsewhere").await.unwrap();

    let (events, result) = run_to_end(handle).await;
    assert_eq!(result.unwrap().error_type, Some(ErrorType::UserAbort));
    assert_eq!(
        end_of(&events),
        (InvocationStatus::Failed, Some(ErrorType::UserAbort))
    );

    let reopened = JsonlStore::open(dir.path()).unwrap();
    let row = reopened.get_invocation(&key).await.unwrap().unwrap();
    assert_eq!(row.status, InvocationStatus::Failed);
    assert_eq!(row.error_type, Some(ErrorType::UserAbort));
    // Cleared once the terminal row is in.
    assert!(!reopened.is_abort_requested(&key).await.unwrap());
}

/// Delegates to the memory store but refuses every terminal commit.
struct RefusingCommits(Arc<MemoryStore>);

#[async_trait]
impl InvocationStore for RefusingCommits {
    async fn get_invocation(&self, key: &InvocationKey) -> DomainResult<Option<InvocationRecord>> {
        self.0.get_invocation(key).await
    }

    async fn upsert_invocation(&self, record: &InvocationRecord) -> DomainResult<()> {
        self.0.upsert_invocation(record).await
    }

    async fn commit(&self, _commit: &FinalCommit) -> DomainResult<CommitOutcome> {
        Err(DomainError::Storage("db down".into()))
    }
}

#[tokio::test]
async fn failed_commit_never_reports_the_planned_status() {
    let h = harness(
        test_config(),
        vec![chat_stream("llm-1", "done"), chat_end("llm-1", None)],
    );
    let mut state = h.state.clone();
    state.invocations = Arc::new(RefusingCommits(h.store.clone()));

    let handle = start_invocation(state, input("r-db-down")).await.unwrap();
    let key = handle.key.clone();
    let (events, result) = run_to_end(handle).await;

    assert!(result.is_err());
    assert!(!events.iter().any(|e| matches!(
        e.payload,
        SkillEventPayload::End {
            status: InvocationStatus::Finish,
            ..
        }
    )));
    let error = events
        .iter()
        .find_map(|e| match &e.payload {
            SkillEventPayload::Error { message, .. } => Some(message.clone()),
            _ => None,
        })
        .expect("an error event");
    assert!(!error.contains("db down"));
    assert_eq!(
        end_of(&events),
        (InvocationStatus::Failed, Some(ErrorType::SystemError))
    );

    assert_eq!(h.store.invocation(&key).unwrap().status, InvocationStatus::Executing);
}
