//! Side-effect collaborators touched at the end of (and during) an
//! invocation: credit billing, canvas sync, usage reporting and auto-naming.
//!
//! Each is a trait so deployments plug in their own backends; the in-memory
//! implementations here back the CLI and the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sr_domain::config::BillingConfig;
use sr_domain::error::{Error, Result};
use sr_domain::invocation::{InvocationKey, InvocationStatus};
use sr_domain::stream::GeneratedFile;
use sr_domain::trace::CorrelationContext;
use sr_domain::usage::{TokenUsage, UsageItem};

use super::context::InvocationContext;
use super::truncate_str;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Credit billing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Usage for one executed model, priced at its billing model's rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditLine {
    pub model: String,
    pub billing_model: String,
    pub usage: TokenUsage,
    pub credits: u64,
    pub estimated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditBatch {
    pub uid: String,
    pub result_id: String,
    pub version: u32,
    pub lines: Vec<CreditLine>,
}

impl CreditBatch {
    pub fn total_credits(&self) -> u64 {
        self.lines.iter().map(|l| l.credits).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Group usage items per (executed model, billing model) and price each
/// group. Models without a configured rate cost nothing.
pub fn build_credit_batch(
    uid: &str,
    key: &InvocationKey,
    items: &[UsageItem],
    billing: &BillingConfig,
) -> CreditBatch {
    let mut groups: BTreeMap<(String, String), (TokenUsage, bool)> = BTreeMap::new();
    for item in items {
        let entry = groups
            .entry((item.model.clone(), item.billing_model().to_owned()))
            .or_default();
        entry.0.add(&item.usage);
        entry.1 |= item.estimated;
    }

    let lines = groups
        .into_iter()
        .filter(|(_, (usage, _))| !usage.is_empty())
        .map(|((model, billing_model), (usage, estimated))| {
            let credits = match billing.rate_for(&billing_model) {
                Some(rate) => rate.credits(&usage),
                None => {
                    tracing::debug!(model = %billing_model, "no credit rate configured");
                    0
                }
            };
            CreditLine {
                model,
                billing_model,
                usage,
                credits,
                estimated,
            }
        })
        .collect();

    CreditBatch {
        uid: uid.to_owned(),
        result_id: key.result_id.clone(),
        version: key.version,
        lines,
    }
}

#[async_trait]
pub trait CreditBilling: Send + Sync {
    /// Charge a batch. Returns `true` when the user's balance is exhausted
    /// and a recharge is required.
    async fn sync_batch_token_credit_usage(&self, batch: &CreditBatch) -> Result<bool>;
}

pub struct NoopBilling;

#[async_trait]
impl CreditBilling for NoopBilling {
    async fn sync_batch_token_credit_usage(&self, _batch: &CreditBatch) -> Result<bool> {
        Ok(false)
    }
}

/// Per-user credit balances held in memory.
pub struct MemoryBilling {
    initial_balance: i64,
    balances: RwLock<HashMap<String, i64>>,
    batches: Mutex<Vec<CreditBatch>>,
}

impl MemoryBilling {
    pub fn new(initial_balance: i64) -> Self {
        Self {
            initial_balance,
            balances: RwLock::new(HashMap::new()),
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn set_balance(&self, uid: &str, balance: i64) {
        self.balances.write().insert(uid.to_owned(), balance);
    }

    pub fn balance(&self, uid: &str) -> i64 {
        self.balances
            .read()
            .get(uid)
            .copied()
            .unwrap_or(self.initial_balance)
    }

    pub fn batches(&self) -> Vec<CreditBatch> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl CreditBilling for MemoryBilling {
    async fn sync_batch_token_credit_usage(&self, batch: &CreditBatch) -> Result<bool> {
        let charge = i64::try_from(batch.total_credits())
            .map_err(|_| Error::Other("credit total overflows balance".into()))?;
        let remaining = {
            let mut balances = self.balances.write();
            let balance = balances
                .entry(batch.uid.clone())
                .or_insert(self.initial_balance);
            *balance -= charge;
            *balance
        };
        self.batches.lock().push(batch.clone());
        Ok(remaining < 0)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Canvas sync
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait CanvasSync: Send + Sync {
    /// Mirror the invocation's terminal status onto its canvas node.
    async fn sync_status(
        &self,
        target: &str,
        key: &InvocationKey,
        status: InvocationStatus,
    ) -> Result<()>;

    /// Attach files a tool produced as new canvas nodes.
    async fn attach_files(
        &self,
        target: Option<&str>,
        key: &InvocationKey,
        tool_call_id: &str,
        files: &[GeneratedFile],
    ) -> Result<()>;
}

pub struct NoopCanvas;

#[async_trait]
impl CanvasSync for NoopCanvas {
    async fn sync_status(&self, _: &str, _: &InvocationKey, _: InvocationStatus) -> Result<()> {
        Ok(())
    }

    async fn attach_files(
        &self,
        _: Option<&str>,
        _: &InvocationKey,
        _: &str,
        _: &[GeneratedFile],
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttachedFiles {
    pub key: InvocationKey,
    pub tool_call_id: String,
    pub files: Vec<GeneratedFile>,
}

/// Records canvas calls. `fail_attach` makes every attach return an error.
#[derive(Default)]
pub struct MemoryCanvas {
    statuses: Mutex<Vec<(String, InvocationKey, InvocationStatus)>>,
    attachments: Mutex<Vec<AttachedFiles>>,
    fail_attach: AtomicBool,
}

impl MemoryCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_attach(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::Relaxed);
    }

    pub fn statuses(&self) -> Vec<(String, InvocationKey, InvocationStatus)> {
        self.statuses.lock().clone()
    }

    pub fn attachments(&self) -> Vec<AttachedFiles> {
        self.attachments.lock().clone()
    }
}

#[async_trait]
impl CanvasSync for MemoryCanvas {
    async fn sync_status(
        &self,
        target: &str,
        key: &InvocationKey,
        status: InvocationStatus,
    ) -> Result<()> {
        self.statuses
            .lock()
            .push((target.to_owned(), key.clone(), status));
        Ok(())
    }

    async fn attach_files(
        &self,
        _target: Option<&str>,
        key: &InvocationKey,
        tool_call_id: &str,
        files: &[GeneratedFile],
    ) -> Result<()> {
        if self.fail_attach.load(Ordering::Relaxed) {
            return Err(Error::Other("canvas unavailable".into()));
        }
        self.attachments.lock().push(AttachedFiles {
            key: key.clone(),
            tool_call_id: tool_call_id.to_owned(),
            files: files.to_vec(),
        });
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Usage reporting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageReportKind {
    /// One LLM call.
    Call,
    /// The whole invocation.
    Invocation,
}

/// A usage-report job. Carries its trace correlation explicitly so the
/// consumer can continue the producer's trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReportJob {
    pub kind: UsageReportKind,
    pub uid: String,
    pub result_id: String,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub usage: TokenUsage,
    pub correlation: CorrelationContext,
    pub created_at: DateTime<Utc>,
}

impl UsageReportJob {
    pub fn new(
        ctx: &InvocationContext,
        kind: UsageReportKind,
        model: Option<String>,
        usage: TokenUsage,
    ) -> Self {
        Self {
            kind,
            uid: ctx.uid.clone(),
            result_id: ctx.key.result_id.clone(),
            version: ctx.key.version,
            model,
            usage,
            correlation: ctx.correlation.child(),
            created_at: Utc::now(),
        }
    }

    /// Span a consumer enters while handling the job, carrying the
    /// producer's trace id.
    pub fn consumer_span(&self) -> tracing::Span {
        tracing::info_span!(
            "usage.report",
            trace_id = %self.correlation.trace_id,
            parent_span = self.correlation.span_id.as_deref().unwrap_or(""),
            result_id = %self.result_id,
            kind = ?self.kind,
        )
    }
}

#[async_trait]
pub trait UsageReporter: Send + Sync {
    async fn enqueue(&self, job: UsageReportJob) -> Result<()>;
}

/// Handles jobs inline by logging them under the restored trace.
pub struct LogUsageReporter;

#[async_trait]
impl UsageReporter for LogUsageReporter {
    async fn enqueue(&self, job: UsageReportJob) -> Result<()> {
        let _guard = job.consumer_span().entered();
        tracing::info!(
            uid = %job.uid,
            model = job.model.as_deref().unwrap_or("-"),
            input_tokens = job.usage.input_tokens,
            output_tokens = job.usage.output_tokens,
            total_tokens = job.usage.total_tokens(),
            "usage reported"
        );
        Ok(())
    }
}

/// Queues jobs in memory for a consumer to drain.
#[derive(Default)]
pub struct MemoryUsageReporter {
    jobs: Mutex<Vec<UsageReportJob>>,
}

impl MemoryUsageReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<UsageReportJob> {
        self.jobs.lock().clone()
    }

    pub fn drain(&self) -> Vec<UsageReportJob> {
        std::mem::take(&mut *self.jobs.lock())
    }
}

#[async_trait]
impl UsageReporter for MemoryUsageReporter {
    async fn enqueue(&self, job: UsageReportJob) -> Result<()> {
        self.jobs.lock().push(job);
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auto-naming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait TitleGenerator: Send + Sync {
    async fn generate_title(&self, query: &str, locale: &str) -> Result<Option<String>>;
}

pub struct NoopTitles;

#[async_trait]
impl TitleGenerator for NoopTitles {
    async fn generate_title(&self, _: &str, _: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

const TITLE_MAX_CHARS: usize = 60;

/// Titles from the first non-empty line of the query.
pub struct QueryTitles;

#[async_trait]
impl TitleGenerator for QueryTitles {
    async fn generate_title(&self, query: &str, _locale: &str) -> Result<Option<String>> {
        Ok(query
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(|l| truncate_str(l, TITLE_MAX_CHARS)))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bundle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct Effects {
    pub billing: Arc<dyn CreditBilling>,
    pub canvas: Arc<dyn CanvasSync>,
    pub usage: Arc<dyn UsageReporter>,
    pub titles: Arc<dyn TitleGenerator>,
}

impl Effects {
    pub fn noop() -> Self {
        Self {
            billing: Arc::new(NoopBilling),
            canvas: Arc::new(NoopCanvas),
            usage: Arc::new(MemoryUsageReporter::new()),
            titles: Arc::new(NoopTitles),
        }
    }
}
