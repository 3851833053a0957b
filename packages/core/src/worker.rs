//! Bounded worker pools for running blocking work off the calling thread.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use lazy_static::lazy_static;

use crate::error::{Error, Result};
use crate::sync::lock;

/// A unit of work submitted to a dispatcher.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run a job on another thread.
pub trait Dispatch: Send + Sync {
    /// Submit a job. Returns once the job is queued, not once it has run.
    fn dispatch(&self, job: Job) -> Result<()>;
}

lazy_static! {
    static ref DEFAULT_POOL: Result<Arc<WorkerPool>> =
        WorkerPool::new("filewire-worker", default_pool_size()).map(Arc::new);
}

fn default_pool_size() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
        .max(4)
}

/// The process-wide pool used when a request is built without a dispatcher.
pub fn default_pool() -> Result<Arc<WorkerPool>> {
    DEFAULT_POOL.clone()
}

struct PoolShared {
    name: String,
    receiver: Mutex<Receiver<Job>>,
    live_workers: AtomicUsize,
    spawned: AtomicUsize,
}

/// Fixed-size pool of worker threads fed from a shared queue.
///
/// A job that panics takes its worker thread down with it; the pool starts a
/// replacement so its capacity stays constant.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    sender: Mutex<Option<Sender<Job>>>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool named `name` with `size` worker threads.
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config {
                message: "worker pool needs at least one thread".to_string(),
            });
        }

        let (sender, receiver) = mpsc::channel();
        let shared = Arc::new(PoolShared {
            name: name.into(),
            receiver: Mutex::new(receiver),
            live_workers: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
        });

        for _ in 0..size {
            spawn_worker(Arc::clone(&shared))?;
        }
        tracing::debug!(pool = %shared.name, size, "worker pool started");

        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn live_workers(&self) -> usize {
        self.shared.live_workers.load(Ordering::Acquire)
    }

    /// Stop accepting jobs. Queued jobs still run; idle workers exit.
    pub fn shutdown(&self) {
        if lock(&self.sender).take().is_some() {
            tracing::debug!(pool = %self.shared.name, "worker pool shutting down");
        }
    }
}

impl Dispatch for WorkerPool {
    fn dispatch(&self, job: Job) -> Result<()> {
        let sender = lock(&self.sender);
        let sender = sender.as_ref().ok_or_else(|| Error::Dispatch {
            message: format!("pool '{}' is shut down", self.shared.name),
        })?;
        sender.send(job).map_err(|_| Error::Dispatch {
            message: format!("pool '{}' has no workers", self.shared.name),
        })
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("size", &self.size)
            .field("live_workers", &self.live_workers())
            .finish()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Replaces its worker if the worker unwinds.
struct Sentinel {
    shared: Arc<PoolShared>,
}

impl Drop for Sentinel {
    fn drop(&mut self) {
        self.shared.live_workers.fetch_sub(1, Ordering::AcqRel);
        if thread::panicking() {
            tracing::warn!(pool = %self.shared.name, "worker panicked; starting a replacement");
            if let Err(e) = spawn_worker(Arc::clone(&self.shared)) {
                tracing::warn!(pool = %self.shared.name, error = %e, "replacement worker failed to start");
            }
        }
    }
}

fn spawn_worker(shared: Arc<PoolShared>) -> Result<()> {
    let index = shared.spawned.fetch_add(1, Ordering::Relaxed);
    let thread_name = format!("{}-{}", shared.name, index);
    shared.live_workers.fetch_add(1, Ordering::AcqRel);

    let worker_shared = Arc::clone(&shared);
    let spawned = thread::Builder::new()
        .name(thread_name)
        .spawn(move || run_worker(worker_shared));

    if let Err(e) = spawned {
        shared.live_workers.fetch_sub(1, Ordering::AcqRel);
        return Err(Error::Dispatch {
            message: format!("failed to start worker for '{}': {}", shared.name, e),
        });
    }
    Ok(())
}

fn run_worker(shared: Arc<PoolShared>) {
    let sentinel = Sentinel { shared };
    loop {
        let job = {
            let receiver = lock(&sentinel.shared.receiver);
            receiver.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}
