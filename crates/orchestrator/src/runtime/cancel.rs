//! Per-invocation cancellation signal.
//!
//! Each running invocation gets one [`CancelToken`]. Any number of
//! producers (explicit abort, the cross-process poller, the idle watchdog)
//! may call [`CancelToken::abort`]; the first one wins and its reason is the
//! one every listener sees. The signal never resets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use sr_domain::invocation::ErrorType;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortSource {
    /// Requested in-process (caller or sibling service).
    Explicit,
    /// Abort flag found in shared state by the poller.
    CrossProcess,
    /// The engine produced no output within the idle window.
    IdleTimeout,
}

impl AbortSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::CrossProcess => "cross_process",
            Self::IdleTimeout => "idle_timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortReason {
    pub source: AbortSource,
    pub message: String,
}

impl AbortReason {
    pub fn explicit(message: impl Into<String>) -> Self {
        Self {
            source: AbortSource::Explicit,
            message: message.into(),
        }
    }

    pub fn cross_process(message: impl Into<String>) -> Self {
        Self {
            source: AbortSource::CrossProcess,
            message: message.into(),
        }
    }

    pub fn idle_timeout(message: impl Into<String>) -> Self {
        Self {
            source: AbortSource::IdleTimeout,
            message: message.into(),
        }
    }

    /// User-initiated aborts are `userAbort`; the watchdog is a system fault.
    pub fn error_type(&self) -> ErrorType {
        match self.source {
            AbortSource::Explicit | AbortSource::CrossProcess => ErrorType::UserAbort,
            AbortSource::IdleTimeout => ErrorType::SystemError,
        }
    }
}

type Listener = Box<dyn FnOnce(&AbortReason) + Send>;

struct Inner {
    cancelled: AtomicBool,
    reason: Mutex<Option<AbortReason>>,
    listeners: Mutex<Vec<Listener>>,
    notify: Notify,
}

/// A cancellation signal shared by everything working on one invocation.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Trip the signal. Returns `false` if it was already tripped, in which
    /// case `reason` is discarded.
    pub fn abort(&self, reason: AbortReason) -> bool {
        {
            let mut slot = self.inner.reason.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason.clone());
            self.inner.cancelled.store(true, Ordering::Release);
        }
        self.inner.notify.notify_waiters();

        let listeners = std::mem::take(&mut *self.inner.listeners.lock());
        for listener in listeners {
            listener(&reason);
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.inner.reason.lock().clone()
    }

    /// True when both handles share one signal.
    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `listener` once when the signal trips. If it already has, the
    /// listener runs immediately on the calling thread.
    pub fn on_abort<F>(&self, listener: F)
    where
        F: FnOnce(&AbortReason) + Send + 'static,
    {
        let mut listeners = self.inner.listeners.lock();
        // Checked under the listener lock: `abort` drains the list after
        // publishing the reason, so a listener is either drained or fired
        // here, never both.
        let tripped = self.inner.reason.lock().clone();
        match tripped {
            Some(reason) => {
                drop(listeners);
                listener(&reason);
            }
            None => listeners.push(Box::new(listener)),
        }
    }

    /// Resolves once the signal has tripped.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks active cancellation tokens per result id, so an explicit abort
/// request handled in this process can reach the running invocation.
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl Default for CancelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelMap {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Register `token` for a result id, replacing any previous one.
    pub fn register(&self, result_id: &str, token: CancelToken) {
        self.tokens.lock().insert(result_id.to_owned(), token);
    }

    /// Abort the running invocation for a result id. Returns true if a
    /// token was found (whether or not it was already tripped).
    pub fn abort(&self, result_id: &str, reason: AbortReason) -> bool {
        let token = self.tokens.lock().get(result_id).cloned();
        match token {
            Some(t) => {
                t.abort(reason);
                true
            }
            None => false,
        }
    }

    /// Remove the token for a result id (called when an invocation
    /// finalizes). A newer version may have registered its own token for
    /// the same result id since; that entry is left alone.
    pub fn remove(&self, result_id: &str, token: &CancelToken) {
        let mut tokens = self.tokens.lock();
        if tokens.get(result_id).is_some_and(|t| t.same_as(token)) {
            tokens.remove(result_id);
        }
    }

    pub fn is_running(&self, result_id: &str) -> bool {
        self.tokens.lock().contains_key(result_id)
    }
}
