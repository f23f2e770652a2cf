//! Abort & idle-timeout coordinator.
//!
//! Two timers feed the invocation's [`CancelToken`]:
//!
//! - the cross-process poller asks the [`AbortStore`] whether another
//!   process requested an abort, every `abort_poll_interval_ms`;
//! - the idle watchdog (only when `stream_idle_timeout_ms > 0`) aborts if
//!   no output has been observed within the window. The first observed
//!   output disarms it for good.
//!
//! Both are torn down by [`AbortCoordinator::cleanup`], which runs from the
//! token's own abort listener and again from finalize; only the first call
//! does anything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sr_domain::config::OrchestratorConfig;
use sr_domain::invocation::InvocationKey;
use sr_domain::trace::TraceEvent;
use sr_store::AbortStore;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::cancel::{AbortReason, CancelToken};

/// Timer tasks owned by one coordinator. Stopping is one-shot.
#[derive(Default)]
struct TimerSet {
    stopped: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TimerSet {
    fn add(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock();
        if self.stopped.load(Ordering::Acquire) {
            handle.abort();
        } else {
            handles.push(handle);
        }
    }

    fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
        true
    }
}

pub struct AbortCoordinator {
    key: InvocationKey,
    token: CancelToken,
    output_observed: Arc<AtomicBool>,
    timers: Arc<TimerSet>,
}

impl AbortCoordinator {
    /// Spawn the poller (and the idle watchdog if enabled) for `key`.
    pub fn start(
        key: InvocationKey,
        token: CancelToken,
        abort_store: Arc<dyn AbortStore>,
        cfg: &OrchestratorConfig,
    ) -> Arc<Self> {
        let coord = Arc::new(Self {
            key,
            token,
            output_observed: Arc::new(AtomicBool::new(false)),
            timers: Arc::new(TimerSet::default()),
        });

        let timers = coord.timers.clone();
        let key = coord.key.clone();
        coord.token.on_abort(move |reason| {
            if timers.stop() {
                tracing::debug!(
                    key = %key,
                    source = reason.source.as_str(),
                    "abort timers stopped by abort listener"
                );
            }
        });

        let span = tracing::debug_span!("abort.poll", key = %coord.key);
        let poll = tokio::spawn(
            poll_loop(
                coord.key.clone(),
                coord.token.clone(),
                abort_store,
                Duration::from_millis(cfg.abort_poll_interval_ms.max(1)),
            )
            .instrument(span),
        );
        coord.timers.add(poll);

        if cfg.stream_idle_timeout_ms > 0 {
            let span = tracing::debug_span!("abort.idle", key = %coord.key);
            let idle = tokio::spawn(
                idle_loop(
                    coord.token.clone(),
                    coord.output_observed.clone(),
                    Instant::now(),
                    Duration::from_millis(cfg.stream_idle_timeout_ms),
                    Duration::from_millis(cfg.idle_check_interval_ms.max(1)),
                )
                .instrument(span),
            );
            coord.timers.add(idle);
        }

        coord
    }

    /// Output reached the caller; the idle watchdog stands down permanently.
    pub fn mark_output_observed(&self) {
        self.output_observed.store(true, Ordering::Release);
    }

    pub fn output_observed(&self) -> bool {
        self.output_observed.load(Ordering::Acquire)
    }

    /// Abort on behalf of the caller.
    pub fn abort_explicit(&self, message: impl Into<String>) -> bool {
        self.token.abort(AbortReason::explicit(message))
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Stop both timers. Returns `true` only for the call that did it.
    pub fn cleanup(&self) -> bool {
        self.timers.stop()
    }
}

async fn poll_loop(
    key: InvocationKey,
    token: CancelToken,
    store: Arc<dyn AbortStore>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match store.is_abort_requested(&key).await {
            Ok(true) => {
                let reason = AbortReason::cross_process("Aborted by user");
                TraceEvent::AbortDetected {
                    result_id: key.result_id.clone(),
                    version: key.version,
                    source: reason.source.as_str().into(),
                    message: reason.message.clone(),
                }
                .emit();
                token.abort(reason);
                break;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "abort flag query failed; still polling");
            }
        }
    }
}

async fn idle_loop(
    token: CancelToken,
    observed: Arc<AtomicBool>,
    started: Instant,
    timeout: Duration,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if observed.load(Ordering::Acquire) {
            tracing::debug!("output observed; idle watchdog disarmed");
            break;
        }
        if started.elapsed() >= timeout {
            let reason = AbortReason::idle_timeout(format!(
                "Stream idle timeout: no output for {}ms",
                timeout.as_millis()
            ));
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "stream idle timeout");
            token.abort(reason);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::cancel::AbortSource;
    use sr_domain::invocation::InvocationRecord;
    use sr_store::{InvocationStore, MemoryStore};

    fn cfg(poll_ms: u64, idle_ms: u64, check_ms: u64) -> OrchestratorConfig {
        OrchestratorConfig {
            abort_poll_interval_ms: poll_ms,
            stream_idle_timeout_ms: idle_ms,
            idle_check_interval_ms: check_ms,
            ..Default::default()
        }
    }

    async fn wait_cancelled(token: &CancelToken, ms: u64) -> bool {
        tokio::time::timeout(Duration::from_millis(ms), token.cancelled())
            .await
            .is_ok()
    }

    #[tokio::test]
    async fn poller_detects_cross_process_flag() {
        let store = Arc::new(MemoryStore::new());
        let key = InvocationKey::new("r1", 1);
        store
            .upsert_invocation(&InvocationRecord::executing(&key, "u"))
            .await
            .unwrap();
        let token = CancelToken::new();
        let coord = AbortCoordinator::start(key.clone(), token.clone(), store.clone(), &cfg(10, 0, 10));

        store.request_abort(&key, "stop").await.unwrap();
        assert!(wait_cancelled(&token, 2_000).await);
        assert_eq!(token.reason().unwrap().source, AbortSource::CrossProcess);
        // The abort listener already tore the timers down.
        assert!(!coord.cleanup());
    }

    #[tokio::test]
    async fn poll_errors_do_not_abort() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_abort_queries(true);
        let key = InvocationKey::new("r1", 1);
        let token = CancelToken::new();
        let coord = AbortCoordinator::start(key.clone(), token.clone(), store.clone(), &cfg(10, 0, 10));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!token.is_cancelled());

        store.set_fail_abort_queries(false);
        store.request_abort(&key, "stop").await.unwrap();
        assert!(wait_cancelled(&token, 2_000).await);
        coord.cleanup();
    }

    #[tokio::test]
    async fn idle_timeout_fires_without_output() {
        let store = Arc::new(MemoryStore::new());
        let token = CancelToken::new();
        let _coord = AbortCoordinator::start(
            InvocationKey::new("r1", 1),
            token.clone(),
            store,
            &cfg(1_000, 40, 10),
        );
        assert!(wait_cancelled(&token, 2_000).await);
        let reason = token.reason().unwrap();
        assert_eq!(reason.source, AbortSource::IdleTimeout);
        assert!(reason.message.contains("40ms"));
    }

    #[tokio::test]
    async fn idle_timeout_never_fires_after_output() {
        let store = Arc::new(MemoryStore::new());
        let token = CancelToken::new();
        let coord = AbortCoordinator::start(
            InvocationKey::new("r1", 1),
            token.clone(),
            store,
            &cfg(1_000, 40, 10),
        );
        coord.mark_output_observed();
        assert!(!wait_cancelled(&token, 200).await);
        coord.cleanup();
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let token = CancelToken::new();
        let coord = AbortCoordinator::start(
            InvocationKey::new("r1", 1),
            token.clone(),
            store,
            &cfg(10, 30, 10),
        );
        assert!(coord.cleanup());
        assert!(!coord.cleanup());
        // Timers are gone: the idle window passes without an abort.
        assert!(!wait_cancelled(&token, 150).await);
        // A later abort still trips the token; the listener finds nothing to stop.
        assert!(coord.abort_explicit("stop"));
        assert!(token.is_cancelled());
    }
}
