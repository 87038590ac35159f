//! One-shot request state machine and its write-once response handle.
//!
//! A [`Request`] may be completed by whichever actor gets there first: the
//! connection reader delivering a response, the timer wheel firing the
//! deadline, or the caller cancelling. The transition out of `Pending` is a
//! single compare-and-swap, so exactly one of them wins and every other
//! attempt is a no-op.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

use crate::error::{CoreError, Result};

/// Process-wide unique identifier of a request, used for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    /// Wraps a raw id.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    /// Not completed yet.
    Pending = 0,
    /// Completed with a value.
    Succeeded = 1,
    /// Completed with an error.
    Failed = 2,
}

impl RequestState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RequestState::Succeeded,
            2 => RequestState::Failed,
            _ => RequestState::Pending,
        }
    }
}

type Hook<T> = Box<dyn FnOnce(&Result<T>) + Send>;

struct Shared<T> {
    id: RequestId,
    opaque: u32,
    timeout: Duration,
    state: AtomicU8,
    outcome: Mutex<Option<Result<T>>>,
    // Set under the `outcome` lock once every hook has run; waiters gate on it.
    published: AtomicBool,
    ready: Condvar,
    notify: Notify,
    // `None` once the hooks have been taken by the winning completion.
    hooks: Mutex<Option<Vec<Hook<T>>>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A unit of work with a deadline and a write-once outcome.
///
/// Cloning is cheap and every clone refers to the same request.
pub struct Request<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.shared.id)
            .field("opaque", &self.shared.opaque)
            .field("timeout", &self.shared.timeout)
            .field(
                "state",
                &RequestState::from_u8(self.shared.state.load(Ordering::Acquire)),
            )
            .finish()
    }
}

impl<T: Clone + Send + 'static> Request<T> {
    /// Creates a pending request.
    pub fn new(id: RequestId, opaque: u32, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                opaque,
                timeout,
                state: AtomicU8::new(RequestState::Pending as u8),
                outcome: Mutex::new(None),
                published: AtomicBool::new(false),
                ready: Condvar::new(),
                notify: Notify::new(),
                hooks: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    /// Attempts the one-shot transition out of `Pending`.
    ///
    /// Returns `true` if this call won. The winner stores the outcome, runs
    /// the completion hooks on the calling thread and only then wakes the
    /// waiters, so a waiter never observes an outcome whose timer or
    /// correlation entry is still live.
    pub fn complete(&self, outcome: Result<T>) -> bool {
        let target = if outcome.is_ok() {
            RequestState::Succeeded
        } else {
            RequestState::Failed
        };
        if self
            .shared
            .state
            .compare_exchange(
                RequestState::Pending as u8,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            trace!(request_id = %self.shared.id, "completion lost the race");
            return false;
        }

        let observed = outcome.clone();
        *lock(&self.shared.outcome) = Some(outcome);

        let hooks = lock(&self.shared.hooks).take().unwrap_or_default();
        for hook in hooks {
            hook(&observed);
        }

        {
            let _outcome = lock(&self.shared.outcome);
            self.shared.published.store(true, Ordering::Release);
        }
        self.shared.ready.notify_all();
        self.shared.notify.notify_waiters();
        true
    }

    /// Completes the request successfully.
    pub fn succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Completes the request with a failure.
    pub fn fail(&self, error: CoreError) -> bool {
        self.complete(Err(error))
    }

    /// Fails the request with [`CoreError::Cancelled`].
    pub fn cancel(&self) -> bool {
        self.fail(CoreError::Cancelled)
    }

    /// Registers a hook invoked exactly once with the final outcome.
    ///
    /// If the request is already complete the hook runs immediately.
    pub fn on_complete<F>(&self, hook: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        {
            let mut hooks = lock(&self.shared.hooks);
            if let Some(pending) = hooks.as_mut() {
                pending.push(Box::new(hook));
                return;
            }
        }
        // Hooks are taken only after the outcome is stored.
        let outcome = lock(&self.shared.outcome).clone();
        if let Some(outcome) = outcome {
            hook(&outcome);
        }
    }

    /// Returns a handle observing the outcome.
    pub fn response(&self) -> ResponseHandle<T> {
        ResponseHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Request<T> {
    /// Diagnostic id.
    pub fn id(&self) -> RequestId {
        self.shared.id
    }

    /// Correlation key carried in the wire header.
    pub fn opaque(&self) -> u32 {
        self.shared.opaque
    }

    /// Relative timeout after which the request is failed.
    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// Current state.
    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Returns `true` once the request left `Pending`.
    pub fn is_terminal(&self) -> bool {
        self.state() != RequestState::Pending
    }

    /// Returns `true` if the request completed with a value.
    pub fn is_success(&self) -> bool {
        self.state() == RequestState::Succeeded
    }

    /// Returns `true` if the request completed with an error.
    pub fn is_failure(&self) -> bool {
        self.state() == RequestState::Failed
    }
}

/// Write-once view of a request outcome.
pub struct ResponseHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ResponseHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> ResponseHandle<T> {
    /// Returns the outcome if already available.
    pub fn try_get(&self) -> Option<Result<T>> {
        let outcome = lock(&self.shared.outcome);
        if self.shared.published.load(Ordering::Acquire) {
            outcome.clone()
        } else {
            None
        }
    }

    /// Blocks the current thread until the outcome is available.
    pub fn wait(&self) -> Result<T> {
        let guard = lock(&self.shared.outcome);
        let guard = self
            .shared
            .ready
            .wait_while(guard, |_| !self.shared.published.load(Ordering::Acquire))
            .unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(outcome) => outcome.clone(),
            None => Err(CoreError::Cancelled),
        }
    }

    /// Blocks for at most `timeout`, returning `None` if still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let guard = lock(&self.shared.outcome);
        let (guard, _) = self
            .shared
            .ready
            .wait_timeout_while(guard, timeout, |_| {
                !self.shared.published.load(Ordering::Acquire)
            })
            .unwrap_or_else(PoisonError::into_inner);
        if self.shared.published.load(Ordering::Acquire) {
            guard.clone()
        } else {
            None
        }
    }

    /// Waits asynchronously for the outcome.
    pub async fn recv(&self) -> Result<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.try_get() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Attaches a continuation, see [`Request::on_complete`].
    pub fn on_complete<F>(&self, hook: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        Request {
            shared: Arc::clone(&self.shared),
        }
        .on_complete(hook)
    }
}

/// Type-erased view of a request used by the timer wheel and the
/// correlation table.
pub trait Completable: Send + Sync + 'static {
    /// Diagnostic id.
    fn request_id(&self) -> RequestId;

    /// Relative timeout.
    fn timeout(&self) -> Duration;

    /// Fails the request; returns `true` if this call completed it.
    fn fail(&self, error: CoreError) -> bool;

    /// Returns `true` once the request is complete.
    fn is_terminal(&self) -> bool;

    /// Registers a hook run once the request completes by any path.
    fn add_completion_hook(&self, hook: Box<dyn FnOnce() + Send>);
}

impl<T: Clone + Send + 'static> Completable for Request<T> {
    fn request_id(&self) -> RequestId {
        self.id()
    }

    fn timeout(&self) -> Duration {
        Request::timeout(self)
    }

    fn fail(&self, error: CoreError) -> bool {
        Request::fail(self, error)
    }

    fn is_terminal(&self) -> bool {
        Request::is_terminal(self)
    }

    fn add_completion_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        self.on_complete(move |_| hook());
    }
}
