//! The execution-engine seam, plus a scripted engine for replays and tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sr_domain::error::{Error, Result};
use sr_domain::stream::{BoxStream, EngineEvent};

use super::cancel::CancelToken;
use super::context::InvocationContext;

/// Produces the ordered event stream for one invocation. The stream ends
/// normally or with an `Err` item; the engine should stop promptly once
/// `cancel` trips.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn stream(
        &self,
        ctx: Arc<InvocationContext>,
        cancel: CancelToken,
    ) -> Result<BoxStream<'static, Result<EngineEvent>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailKind {
    Timeout,
    Network,
    Abort,
    Engine,
}

/// One line of a replay script.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptStep {
    /// Sleep, waking early if cancelled.
    Delay { delay_ms: u64 },
    /// End the stream with an error.
    Fail {
        fail: String,
        #[serde(default)]
        error: Option<FailKind>,
    },
    /// Panic inside the stream.
    Panic { panic: String },
    Event(EngineEvent),
}

/// Plays back a fixed list of steps. Cancellation surfaces the way real
/// engines report it: a bare "Aborted" error with the reason lost.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    steps: Vec<ScriptStep>,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self { steps }
    }

    /// Parse a JSONL script. Blank lines and `#` comments are ignored.
    pub fn from_jsonl(raw: &str) -> Result<Self> {
        let mut steps = Vec::new();
        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let step = serde_json::from_str::<ScriptStep>(line).map_err(|e| {
                Error::InvalidInput(format!("script line {}: {e}", lineno + 1))
            })?;
            steps.push(step);
        }
        Ok(Self { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn fail_error(kind: Option<FailKind>, message: String) -> Error {
    match kind {
        Some(FailKind::Timeout) => Error::Timeout(message),
        Some(FailKind::Network) => Error::Network(message),
        Some(FailKind::Abort) => Error::Aborted(message),
        Some(FailKind::Engine) | None => Error::Engine(message),
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    async fn stream(
        &self,
        _ctx: Arc<InvocationContext>,
        cancel: CancelToken,
    ) -> Result<BoxStream<'static, Result<EngineEvent>>> {
        let steps = self.steps.clone();
        let s = async_stream::stream! {
            for step in steps {
                if cancel.is_cancelled() {
                    yield Err(Error::Aborted("Aborted".into()));
                    return;
                }
                match step {
                    ScriptStep::Delay { delay_ms } => {
                        let cancelled = tokio::select! {
                            _ = cancel.cancelled() => true,
                            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => false,
                        };
                        if cancelled {
                            yield Err(Error::Aborted("Aborted".into()));
                            return;
                        }
                    }
                    ScriptStep::Fail { fail, error } => {
                        yield Err(fail_error(error, fail));
                        return;
                    }
                    ScriptStep::Panic { panic } => {
                        panic!("{panic}");
                    }
                    ScriptStep::Event(ev) => yield Ok(ev),
                }
            }
        };
        Ok(Box::pin(s))
    }
}
