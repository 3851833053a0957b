//! One-shot completion handles.
//!
//! An [`AsyncHandle`] is produced by whoever starts a piece of work, completed
//! exactly once by the worker that finishes it, and observed by any number of
//! callers. Completion is a compare-and-set: when two completions race, one is
//! accepted and the other gets its value handed back as
//! [`Completion::Rejected`] so the loser can release whatever it produced.
//!
//! ```ignore
//! let handle = AsyncHandle::<u32>::new();
//! let worker = handle.clone();
//! std::thread::spawn(move || {
//!     worker.complete(Ok(42));
//! });
//!
//! handle.wait(Some(Duration::from_secs(1)))?;
//! assert_eq!(handle.take()?, 42);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::sync::lock;

static HANDLE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Callback run on the completing thread once a handle resolves.
pub type Callback<T> = Box<dyn FnOnce(&AsyncHandle<T>) + Send + 'static>;

/// Observable state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Work is still in progress.
    Pending,
    /// Completed with a value.
    Complete,
    /// Completed with an error.
    Failed,
}

/// Outcome of a [`AsyncHandle::complete`] call.
#[must_use = "a rejected completion hands back a value that may need releasing"]
pub enum Completion<T> {
    /// This call resolved the handle.
    Accepted,
    /// The handle was already resolved; the offered result is returned.
    Rejected(Result<T>),
}

impl<T> Completion<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Completion::Accepted)
    }
}

enum Outcome<T> {
    Pending,
    Value(Option<T>),
    Failed(Error),
}

struct Shared<T> {
    id: u64,
    completing: AtomicBool,
    done: AtomicBool,
    cancelled: AtomicBool,
    outcome: Mutex<Outcome<T>>,
    completed: Condvar,
    callback: Mutex<Option<Callback<T>>>,
}

/// A one-shot future completed by a worker thread.
pub struct AsyncHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for AsyncHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for AsyncHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl<T> Default for AsyncHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AsyncHandle<T> {
    /// Create a pending handle without a callback.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a pending handle whose callback runs on the completing thread.
    ///
    /// A panic inside the callback is not caught: it unwinds the thread that
    /// completed the handle.
    pub fn with_callback<F>(callback: F) -> Self
    where
        F: FnOnce(&AsyncHandle<T>) + Send + 'static,
    {
        Self::build(Some(Box::new(callback)))
    }

    pub(crate) fn with_optional_callback(callback: Option<Callback<T>>) -> Self {
        Self::build(callback)
    }

    fn build(callback: Option<Callback<T>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: HANDLE_COUNTER.fetch_add(1, Ordering::Relaxed),
                completing: AtomicBool::new(false),
                done: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                outcome: Mutex::new(Outcome::Pending),
                completed: Condvar::new(),
                callback: Mutex::new(callback),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Resolve the handle. Only the first call is accepted.
    pub fn complete(&self, result: Result<T>) -> Completion<T> {
        if self
            .shared
            .completing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Completion::Rejected(result);
        }

        {
            let mut outcome = lock(&self.shared.outcome);
            *outcome = match result {
                Ok(value) => Outcome::Value(Some(value)),
                Err(error) => {
                    if error.is_cancelled() {
                        self.shared.cancelled.store(true, Ordering::Release);
                    }
                    Outcome::Failed(error)
                }
            };
            self.shared.done.store(true, Ordering::Release);
        }
        self.shared.completed.notify_all();

        let callback = lock(&self.shared.callback).take();
        if let Some(callback) = callback {
            callback(self);
        }
        Completion::Accepted
    }

    /// Whether the handle has resolved. Never blocks.
    pub fn is_completed(&self) -> bool {
        self.shared.done.load(Ordering::Acquire)
    }

    /// Whether the handle resolved with [`Error::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    pub fn state(&self) -> HandleState {
        if !self.is_completed() {
            return HandleState::Pending;
        }
        match &*lock(&self.shared.outcome) {
            Outcome::Pending => HandleState::Pending,
            Outcome::Value(_) => HandleState::Complete,
            Outcome::Failed(_) => HandleState::Failed,
        }
    }

    /// Block until the handle resolves or `timeout` elapses.
    ///
    /// `None` waits forever. Timing out only stops the wait; the work keeps
    /// running.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        if self.is_completed() {
            return Ok(());
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut outcome = lock(&self.shared.outcome);
        while matches!(*outcome, Outcome::Pending) {
            match deadline {
                None => {
                    outcome = self
                        .shared
                        .completed
                        .wait(outcome)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout { operation: "wait" });
                    }
                    let (guard, _) = self
                        .shared
                        .completed
                        .wait_timeout(outcome, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    outcome = guard;
                }
            }
        }
        Ok(())
    }

    /// Consume the result.
    ///
    /// The value is handed out once. A stored error is returned to every
    /// caller.
    pub fn take(&self) -> Result<T> {
        let mut outcome = lock(&self.shared.outcome);
        match &mut *outcome {
            Outcome::Pending => Err(Error::invalid_state("handle has not completed")),
            Outcome::Value(value) => value
                .take()
                .ok_or_else(|| Error::invalid_state("handle result already consumed")),
            Outcome::Failed(error) => Err(error.clone()),
        }
    }

    /// The stored error, if the handle failed.
    pub fn error(&self) -> Option<Error> {
        match &*lock(&self.shared.outcome) {
            Outcome::Failed(error) => Some(error.clone()),
            _ => None,
        }
    }

    pub(crate) fn downgrade(&self) -> WeakHandle<T> {
        WeakHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

/// Non-owning reference to a handle.
///
/// Lets a request reach its outstanding handles without keeping an unclaimed
/// result (and the stream inside it) alive.
pub(crate) struct WeakHandle<T> {
    shared: Weak<Shared<T>>,
}

impl<T> WeakHandle<T> {
    pub(crate) fn upgrade(&self) -> Option<AsyncHandle<T>> {
        self.shared.upgrade().map(|shared| AsyncHandle { shared })
    }

    pub(crate) fn refers_to(&self, handle: &AsyncHandle<T>) -> bool {
        std::ptr::eq(self.shared.as_ptr(), Arc::as_ptr(&handle.shared))
    }
}
