//! `skillrun replay`: drive one invocation from a scripted engine.
//!
//! Streams AI deltas to stdout (tool activity and errors to stderr), or
//! collects every output event and prints them as JSON with `--json`.
//! Ctrl-C aborts the invocation the same way `skillrun abort` would.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use sr_domain::config::Config;
use sr_domain::event::{SkillEvent, SkillEventPayload};
use sr_domain::invocation::InvocationStatus;

use crate::bootstrap;
use crate::runtime::{abort_invocation, start_invocation, InvocationInput, ScriptedEngine};

pub struct ReplayArgs {
    pub script: String,
    pub result_id: Option<String>,
    pub version: u32,
    pub uid: String,
    pub query: String,
    pub model: String,
    pub auto_name: bool,
    pub json: bool,
}

/// Returns the process exit code: `0` finished, `1` failed, `2` out of credits.
pub async fn run(config: Arc<Config>, args: ReplayArgs) -> anyhow::Result<i32> {
    // 1. Load the script and boot the runtime around it.
    let raw = std::fs::read_to_string(&args.script)
        .with_context(|| format!("reading script {}", args.script))?;
    let engine = ScriptedEngine::from_jsonl(&raw)
        .with_context(|| format!("parsing script {}", args.script))?;
    tracing::debug!(steps = engine.len(), "script loaded");
    let state = bootstrap::build_app_state(config, Arc::new(engine))?;

    // 2. Start the invocation.
    let input = InvocationInput {
        result_id: args
            .result_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        version: args.version,
        uid: args.uid,
        query: args.query,
        model: args.model,
        auto_name: args.auto_name,
        ..Default::default()
    };
    let mut handle = start_invocation(state.clone(), input).await?;
    let key = handle.key.clone();
    eprintln!("\x1b[2minvocation {key}\x1b[0m");

    // 3. Drain the output, aborting on Ctrl-C.
    let mut exit_code: i32 = 0;
    let mut collected: Vec<SkillEvent> = Vec::new();
    let mut interrupted = false;

    loop {
        let event = tokio::select! {
            ev = handle.events.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                tracing::info!("received SIGINT, aborting invocation");
                if let Err(e) = abort_invocation(&state, &key, "Aborted by user").await {
                    eprintln!("abort failed: {e}");
                }
                continue;
            }
        };

        if args.json {
            collected.push(event);
            continue;
        }
        match &event.payload {
            SkillEventPayload::Stream { content, .. } => {
                print!("{content}");
                std::io::stdout().flush().ok();
            }
            SkillEventPayload::ToolCallStart { tool_name, .. } => {
                eprintln!("\x1b[2m[tool: {tool_name}]\x1b[0m");
            }
            SkillEventPayload::ToolCallError {
                tool_name, error, ..
            } => {
                eprintln!("\x1b[2m[tool {tool_name} failed: {error}]\x1b[0m");
            }
            SkillEventPayload::Error { message, .. } => {
                eprintln!("error: {message}");
                exit_code = 1;
            }
            SkillEventPayload::End { status, .. } => {
                println!();
                if *status == InvocationStatus::Failed {
                    exit_code = 1;
                }
            }
            _ => {}
        }
    }

    // 4. Wait for the terminal sequence and its side effects.
    let result = match handle.join.await {
        Ok(r) => r,
        Err(e) => anyhow::bail!("invocation task join: {e}"),
    };

    if args.json {
        let json = serde_json::to_string_pretty(&collected)
            .map_err(|e| anyhow::anyhow!("serializing events: {e}"))?;
        println!("{json}");
    }

    match result {
        Ok(mut summary) => {
            summary.wait_background().await;
            if summary.status == InvocationStatus::Failed {
                exit_code = 1;
            }
        }
        Err(e) if e.is_quota_exceeded() => {
            eprintln!("credit balance exhausted: {e}");
            exit_code = 2;
        }
        Err(e) => return Err(e.into()),
    }

    Ok(exit_code)
}
