//! A fixed-size worker pool with per-job completion handles.
//!
//! Writers fan chunk compression and shard packing out across the pool and
//! rejoin on the returned [`Completion`] handles before their flush returns.
//! Work items are independent; the pool imposes no ordering between them
//! beyond FIFO dispatch from a single submitter.

use std::panic::AssertUnwindSafe;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::debug;
use thiserror::Error;

/// A thread pool failure.
#[derive(Debug, Error)]
pub enum ThreadPoolError {
    /// The pool cannot be constructed.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    /// A job reported an error.
    #[error("{0}")]
    Job(String),
    /// A job's result was lost (the job panicked or the pool shut down).
    #[error("job result lost: worker terminated before completion")]
    Lost,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// The completion handle of one submitted job.
///
/// Dropping the handle without waiting is allowed; the job still runs.
#[derive(Debug)]
pub struct Completion<T> {
    result: Receiver<Result<T, String>>,
}

impl<T> Completion<T> {
    /// Block until the job completes and return its result.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadPoolError::Job`] if the job reported an error and
    /// [`ThreadPoolError::Lost`] if the job panicked.
    pub fn wait(self) -> Result<T, ThreadPoolError> {
        match self.result.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(ThreadPoolError::Job(message)),
            Err(_) => Err(ThreadPoolError::Lost),
        }
    }
}

/// A fixed-size pool of worker threads.
///
/// Dropping the pool closes the job queue and joins every worker, so
/// outstanding work drains before the pool is gone.
#[derive(Debug)]
pub struct ThreadPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Create a pool of `num_threads` workers (at least 1).
    ///
    /// # Errors
    ///
    /// Returns [`ThreadPoolError::Spawn`] if a worker thread cannot be
    /// created.
    pub fn new(num_threads: usize) -> Result<Self, ThreadPoolError> {
        let num_threads = num_threads.max(1);
        let (jobs, queue) = unbounded::<Job>();
        let workers = (0..num_threads)
            .map(|index| {
                let queue = queue.clone();
                std::thread::Builder::new()
                    .name(format!("zarr-sink-{index}"))
                    .spawn(move || worker(&queue))
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!("thread pool started with {num_threads} workers");
        Ok(Self {
            jobs: Some(jobs),
            workers,
        })
    }

    /// The number of workers.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Submit a job, returning its completion handle.
    ///
    /// Never blocks; the queue is unbounded.
    pub fn submit<T, F>(&self, job: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, String> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let job: Job = Box::new(move || {
            // A send failure means the handle was dropped; the work still ran.
            let _ = tx.send(job());
        });
        self.jobs
            .as_ref()
            .expect("job queue open until drop")
            .send(job)
            .expect("workers outlive the sender");
        Completion { result: rx }
    }

    /// Wait on every handle, returning the collected results.
    ///
    /// All handles are drained even after a failure; the first error wins.
    ///
    /// # Errors
    ///
    /// Returns the first [`ThreadPoolError`] reported by any job.
    pub fn join_all<T>(
        completions: impl IntoIterator<Item = Completion<T>>,
    ) -> Result<Vec<T>, ThreadPoolError> {
        let mut results = Vec::new();
        let mut first_error = None;
        for completion in completions {
            match completion.wait() {
                Ok(value) => results.push(value),
                Err(error) => first_error = first_error.or(Some(error)),
            }
        }
        match first_error {
            None => Ok(results),
            Some(error) => Err(error),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.jobs.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker(queue: &Receiver<Job>) {
    while let Ok(job) = queue.recv() {
        // Contain panics to the job that raised them; its completion handle
        // reports the loss and the worker stays alive.
        let _ = std::panic::catch_unwind(AssertUnwindSafe(job));
    }
}
