//! Fixed-size worker pool for offloaded request processing.
//!
//! Threads are plain OS threads, created once and named
//! `trans-pool-<pool>-thread-<n>`. Tasks flow through a bounded channel:
//! submission never blocks the connection task, and a full queue hands the
//! task back to the caller inside [`Rejected`] so it can still be answered
//! and its buffer released.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, warn};

/// Process-wide pool counter, used only for thread names.
static POOL_NUMBER: AtomicUsize = AtomicUsize::new(1);

/// Why a pool could not be created or a task not accepted.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool size must be at least 1")]
    InvalidSize,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker pool queue is full ({capacity} pending tasks)")]
    Saturated { capacity: usize },
    #[error("worker pool has been shut down")]
    ShutDown,
}

/// A task the pool refused, returned to the submitter.
#[derive(Debug)]
pub struct Rejected<T> {
    pub task: T,
    pub reason: PoolError,
}

/// Bounded pool of long-lived worker threads running one handler.
pub struct WorkerPool<T: Send + 'static> {
    tx: ArcSwapOption<mpsc::Sender<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    name_prefix: String,
    size: usize,
    queue_capacity: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawns `size` workers sharing a queue of `queue_capacity` tasks.
    /// Every task is passed to `handler` on one of the workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidSize` for a zero-sized pool and
    /// `PoolError::Spawn` if the OS refuses a thread. Workers spawned before
    /// a failure exit once the partially built pool is dropped.
    pub fn start<H>(size: usize, queue_capacity: usize, handler: H) -> Result<Self, PoolError>
    where
        H: Fn(T) + Send + Sync + 'static,
    {
        if size == 0 {
            return Err(PoolError::InvalidSize);
        }
        let queue_capacity = queue_capacity.max(1);
        let name_prefix = format!(
            "trans-pool-{}-thread-",
            POOL_NUMBER.fetch_add(1, Ordering::Relaxed)
        );

        let (tx, rx) = mpsc::channel::<T>(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let handler = Arc::new(handler);

        let mut workers = Vec::with_capacity(size);
        for n in 1..=size {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            let handle = thread::Builder::new()
                .name(format!("{name_prefix}{n}"))
                .spawn(move || worker_loop(&rx, handler.as_ref()))?;
            workers.push(handle);
        }

        debug!(size, queue_capacity, prefix = %name_prefix, "worker pool started");

        Ok(Self {
            tx: ArcSwapOption::from_pointee(tx),
            workers: Mutex::new(workers),
            name_prefix,
            size,
            queue_capacity,
        })
    }

    /// Queues a task without blocking.
    ///
    /// # Errors
    ///
    /// Hands the task back with `PoolError::Saturated` when the queue is
    /// full, or `PoolError::ShutDown` after [`shutdown`](Self::shutdown).
    pub fn submit(&self, task: T) -> Result<(), Rejected<T>> {
        let Some(tx) = self.tx.load_full() else {
            return Err(Rejected {
                task,
                reason: PoolError::ShutDown,
            });
        };

        tx.try_send(task).map_err(|err| match err {
            TrySendError::Full(task) => Rejected {
                task,
                reason: PoolError::Saturated {
                    capacity: self.queue_capacity,
                },
            },
            TrySendError::Closed(task) => Rejected {
                task,
                reason: PoolError::ShutDown,
            },
        })
    }

    /// Stops accepting tasks, lets the workers drain the queue and joins
    /// them. Blocks the calling thread; idempotent.
    pub fn shutdown(&self) {
        self.tx.store(None);
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        for handle in workers {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                warn!(worker = %name, "worker thread terminated by panic");
            }
        }
        debug!(prefix = %self.name_prefix, "worker pool stopped");
    }

    /// Number of worker threads.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Thread name prefix, e.g. `trans-pool-3-thread-`.
    #[must_use]
    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }
}

impl<T: Send + 'static> std::fmt::Debug for WorkerPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name_prefix", &self.name_prefix)
            .field("size", &self.size)
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

fn worker_loop<T, H>(rx: &Mutex<mpsc::Receiver<T>>, handler: &H)
where
    H: Fn(T),
{
    loop {
        // The guard only lives for this statement; whichever idle worker
        // holds it is the one parked in `blocking_recv`.
        let next = rx.lock().blocking_recv();
        let Some(task) = next else {
            break;
        };
        if catch_unwind(AssertUnwindSafe(|| handler(task))).is_err() {
            error!(
                worker = thread::current().name().unwrap_or("worker"),
                "task panicked; worker continues"
            );
        }
    }
}
