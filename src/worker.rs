//! Bounded pool of named worker threads for CPU-bound decoding.
//!
//! - Jobs travel over a flume channel; results come back on a oneshot
//! - Workers poll a shutdown flag between jobs
//! - Dropping the pool joins every worker

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, Sender};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Maximum number of worker threads.
const MAX_WORKERS: usize = 8;

/// How often an idle worker re-checks the shutdown flag.
const IDLE_POLL: Duration = Duration::from_millis(100);

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Failure to run a job on a [`WorkerPool`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WorkerError {
    #[error("worker pool is shut down")]
    Shutdown,
    #[error("worker dropped the job")]
    Dropped,
}

/// Fixed set of named OS threads running blocking jobs.
pub struct WorkerPool {
    name: &'static str,
    job_tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawn `workers` threads, at least one and at most `MAX_WORKERS`,
    /// named `{name}-{index}`.
    pub fn new(name: &'static str, workers: usize) -> Self {
        let num_workers = workers.clamp(1, MAX_WORKERS);
        let (job_tx, job_rx) = flume::unbounded::<Job>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let rx = job_rx.clone();
            let shutdown = Arc::clone(&shutdown);
            let active = Arc::clone(&active);

            match thread::Builder::new()
                .name(format!("{}-{}", name, worker_id))
                .spawn(move || worker_loop(worker_id, rx, shutdown, active))
            {
                Ok(handle) => handles.push(handle),
                Err(e) => error!(name, worker_id, error = ?e, "Failed to spawn worker"),
            }
        }

        debug!(name, num_workers = handles.len(), "Started worker pool");

        Self {
            name,
            job_tx: Some(job_tx),
            workers: handles,
            shutdown,
            active,
        }
    }

    /// Queue `job` and await its result.
    pub async fn run<T, F>(&self, job: F) -> Result<T, WorkerError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let rx = self.submit(job)?;
        rx.await.map_err(|_| WorkerError::Dropped)
    }

    /// Queue `job`; the receiver resolves when a worker has run it.
    pub fn submit<T, F>(&self, job: F) -> Result<oneshot::Receiver<T>, WorkerError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let tx = self.job_tx.as_ref().ok_or(WorkerError::Shutdown)?;
        if self.workers.is_empty() {
            return Err(WorkerError::Shutdown);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let boxed: Job = Box::new(move || {
            // The requester may have given up; nothing to do then.
            let _ = reply_tx.send(job());
        });
        tx.send(boxed).map_err(|_| WorkerError::Shutdown)?;
        Ok(reply_rx)
    }

    /// Jobs currently running.
    pub fn active_worker_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Close the queue and join every thread. Also done on drop.
    pub fn shutdown(&mut self) {
        debug!(name = self.name, "Shutting down worker pool");
        self.shutdown.store(true, Ordering::SeqCst);
        self.job_tx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!(name = self.name, "Worker panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::Relaxed) {
            self.shutdown();
        }
    }
}

fn worker_loop(
    worker_id: usize,
    rx: Receiver<Job>,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        match rx.recv_timeout(IDLE_POLL) {
            Ok(job) => {
                active.fetch_add(1, Ordering::Relaxed);
                job();
                active.fetch_sub(1, Ordering::Relaxed);
            }
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(worker_id, "Worker stopped");
}
