//! Bounded worker pools for per-object fan-out.
//!
//! A pool owns `size` worker tasks pulling jobs from a bounded queue, so the
//! listing that feeds it waits whenever the workers fall behind. Every job is
//! run under `catch_unwind`: an error or a panic is logged with the pool
//! class, the worker id and the object label, and the other jobs carry on.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Identity of the worker running a task, stable for the pool's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "W{}", self.0)
    }
}

type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

struct Job {
    label: String,
    run: Box<dyn FnOnce(WorkerId) -> TaskFuture + Send>,
}

#[derive(Default)]
struct Counters {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

/// Totals of one drained pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rejected: usize,
}

pub struct WorkerPool {
    class: &'static str,
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
    limit: Option<usize>,
    submitted: usize,
    rejected: usize,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn worker_loop(
    class: &'static str,
    worker: WorkerId,
    queue: Arc<Mutex<mpsc::Receiver<Job>>>,
    counters: Arc<Counters>,
) {
    loop {
        let job = { queue.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };

        let Job { label, run } = job;
        let outcome = AssertUnwindSafe(async move { run(worker).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
                crate::metrics::task_finished(class, "succeeded");
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                crate::metrics::task_finished(class, "failed");
                tracing::error!(class, worker = %worker, object = %label, error = %e, "Task failed");
            }
            Err(panic) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                crate::metrics::task_finished(class, "failed");
                tracing::error!(
                    class,
                    worker = %worker,
                    object = %label,
                    panic = %panic_message(panic.as_ref()),
                    "Task panicked"
                );
            }
        }
    }
    tracing::trace!(class, worker = %worker, "Worker stopped");
}

impl WorkerPool {
    /// Spawn `size` workers. `limit` caps accepted submissions (dry runs).
    pub fn new(class: &'static str, size: usize, limit: Option<usize>) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>(size * 2);
        let queue = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let workers = (0..size)
            .map(|n| {
                tokio::spawn(worker_loop(
                    class,
                    WorkerId(n),
                    queue.clone(),
                    counters.clone(),
                ))
            })
            .collect();

        tracing::debug!(class, workers = size, ?limit, "Worker pool started");
        Self {
            class,
            sender: Some(sender),
            workers,
            counters,
            limit,
            submitted: 0,
            rejected: 0,
        }
    }

    /// True once the submission cap has been reached.
    pub fn is_full(&self) -> bool {
        self.limit.is_some_and(|limit| self.submitted >= limit)
    }

    /// Queue a task. Waits while the queue is full. Returns false when the
    /// submission cap has been reached and the task was dropped.
    pub async fn submit<F, Fut>(&mut self, label: impl Into<String>, task: F) -> bool
    where
        F: FnOnce(WorkerId) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let label = label.into();
        if self.is_full() {
            self.rejected += 1;
            crate::metrics::task_finished(self.class, "rejected");
            tracing::debug!(class = self.class, object = %label, "Submission cap reached");
            return false;
        }
        let Some(sender) = &self.sender else {
            return false;
        };

        let job = Job {
            label,
            run: Box::new(move |worker| Box::pin(task(worker)) as TaskFuture),
        };
        if sender.send(job).await.is_err() {
            tracing::error!(class = self.class, "Worker pool closed, task dropped");
            return false;
        }
        self.submitted += 1;
        true
    }

    /// Close the queue and wait for every accepted task to finish.
    pub async fn drain(mut self) -> PoolReport {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(class = self.class, error = %e, "Worker task aborted");
            }
        }
        PoolReport {
            submitted: self.submitted,
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.rejected,
        }
    }
}
