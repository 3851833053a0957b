//! Runs one blocking operation at a time on a worker, with progress events,
//! a single completion event and cooperative cancellation.
//!
//! The facade is a latch, not a queue: starting a second operation while one
//! is running fails with [`Error::InvalidState`] and leaves the running one
//! alone.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use filewire_core::{lock, Dispatch, Error, Latch, Request, Result};

use crate::progress::{ProgressEvent, UserToken};

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

type ProgressHandler = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;
type CompletionHandler<R> = Box<dyn FnOnce(CompletionEvent<R>) + Send>;

/// Terminal event of an operation. Delivered exactly once.
///
/// A cancelled operation carries neither a result nor an error.
#[derive(Debug)]
pub struct CompletionEvent<R> {
    pub result: Option<R>,
    pub error: Option<Error>,
    pub cancelled: bool,
    pub token: UserToken,
}

/// Event sinks for one operation.
pub struct Handlers<R> {
    progress: Option<ProgressHandler>,
    complete: Option<CompletionHandler<R>>,
}

impl<R> Handlers<R> {
    pub fn new() -> Self {
        Self {
            progress: None,
            complete: None,
        }
    }

    pub fn on_progress<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(handler));
        self
    }

    pub fn on_complete<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(CompletionEvent<R>) + Send + 'static,
    {
        self.complete = Some(Box::new(handler));
        self
    }
}

impl<R> Default for Handlers<R> {
    fn default() -> Self {
        Self::new()
    }
}

struct ActiveRun {
    id: u64,
    cancelled: Latch,
    requests: Mutex<Vec<Request>>,
}

impl ActiveRun {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: RUN_COUNTER.fetch_add(1, Ordering::Relaxed),
            cancelled: Latch::new(),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self) {
        if !self.cancelled.trigger() {
            return;
        }
        info!(run = self.id, "operation cancelled");
        let requests = std::mem::take(&mut *lock(&self.requests));
        for request in requests {
            request.abort();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

type BusySlot = Arc<Mutex<Option<Arc<ActiveRun>>>>;

/// Handed to the work closure of a run.
pub struct OperationContext {
    run: Arc<ActiveRun>,
    progress: Option<ProgressHandler>,
    token: UserToken,
}

impl OperationContext {
    pub fn token(&self) -> &UserToken {
        &self.token
    }

    /// Emit a progress event to the run's progress handler.
    pub fn report_progress(&self, units_done: u64, units_total: Option<u64>) {
        if let Some(progress) = &self.progress {
            progress(&ProgressEvent::new(
                units_done,
                units_total,
                self.token.clone(),
            ));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.run.cancelled.is_set()
    }

    /// Fail with [`Error::Cancelled`] once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Tie a request to the run so that cancelling the run aborts it.
    pub fn register_request(&self, request: &Request) {
        if self.is_cancelled() {
            request.abort();
            return;
        }
        lock(&self.run.requests).push(request.clone());
        // cancel may have drained the list between the check and the push
        if self.is_cancelled() {
            request.abort();
        }
    }
}

/// Holds the busy latch until dropped.
#[must_use = "the facade is only busy while the guard is alive"]
pub struct BusyGuard {
    slot: BusySlot,
    run: Arc<ActiveRun>,
}

impl BusyGuard {
    fn acquire(slot: &BusySlot) -> Result<Self> {
        let mut busy = lock(slot);
        if busy.is_some() {
            return Err(Error::invalid_state(
                "client does not support concurrent operations",
            ));
        }
        let run = ActiveRun::new();
        *busy = Some(Arc::clone(&run));
        Ok(Self {
            slot: Arc::clone(slot),
            run,
        })
    }

    /// A context for work done under this guard on the calling thread.
    pub fn context(&self) -> OperationContext {
        OperationContext {
            run: Arc::clone(&self.run),
            progress: None,
            token: UserToken::none(),
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut busy = lock(&self.slot);
        if busy.as_ref().is_some_and(|run| Arc::ptr_eq(run, &self.run)) {
            *busy = None;
        }
    }
}

/// Single-flight runner for blocking operations.
pub struct AsyncOperationFacade {
    busy: BusySlot,
    dispatcher: Arc<dyn Dispatch>,
}

impl AsyncOperationFacade {
    pub fn new(dispatcher: Arc<dyn Dispatch>) -> Self {
        Self {
            busy: Arc::new(Mutex::new(None)),
            dispatcher,
        }
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.busy).is_some()
    }

    /// Mark the facade busy for work done on the calling thread.
    pub fn busy_guard(&self) -> Result<BusyGuard> {
        BusyGuard::acquire(&self.busy)
    }

    /// Start `work` on the operation pool and return immediately.
    ///
    /// Busy is cleared right before the completion handler runs, so the
    /// handler may start the next operation. A panic in `work` is reported
    /// as an error completion; a panic in the handler itself is not caught.
    ///
    /// Only an [`Error::Cancelled`] outcome is reported as cancelled. A
    /// result or a different error that the work produced before noticing
    /// the cancel is delivered as is.
    pub fn run<R, W>(&self, token: UserToken, work: W, handlers: Handlers<R>) -> Result<()>
    where
        R: Send + 'static,
        W: FnOnce(&OperationContext) -> Result<R> + Send + 'static,
    {
        let guard = self.busy_guard()?;
        let run_id = guard.run.id;
        let context = OperationContext {
            run: Arc::clone(&guard.run),
            progress: handlers.progress,
            token,
        };
        let complete = handlers.complete;

        let job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&context)))
                .unwrap_or_else(|payload| {
                    let message = panic_message(payload.as_ref());
                    error!(run = run_id, panic = message, "operation panicked");
                    Err(Error::invalid_state(format!("operation panicked: {}", message)))
                });
            let event = match outcome {
                Ok(value) => CompletionEvent {
                    result: Some(value),
                    error: None,
                    cancelled: false,
                    token: context.token.clone(),
                },
                Err(e) if e.is_cancelled() => CompletionEvent {
                    result: None,
                    error: None,
                    cancelled: true,
                    token: context.token.clone(),
                },
                Err(e) => CompletionEvent {
                    result: None,
                    error: Some(e),
                    cancelled: false,
                    token: context.token.clone(),
                },
            };
            debug!(run = run_id, cancelled = event.cancelled, failed = event.error.is_some(), "operation finished");
            drop(guard);
            if let Some(complete) = complete {
                complete(event);
            }
        });

        self.dispatcher.dispatch(job)?;
        debug!(run = run_id, "operation started");
        Ok(())
    }

    /// Ask the running operation to stop.
    ///
    /// Returns `false` when nothing is running. Advisory: an operation that
    /// already succeeded still reports its result.
    pub fn cancel(&self) -> bool {
        let run = lock(&self.busy).clone();
        match run {
            Some(run) => {
                run.cancel();
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for AsyncOperationFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncOperationFacade")
            .field("busy", &self.is_busy())
            .finish()
    }
}
