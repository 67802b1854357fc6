//! Bounded execution of inbound request handlers.
//!
//! At most `max_running` handlers run at once; up to `max_waiting` more wait
//! in a queue. Submissions beyond that are rejected immediately, so a flood
//! of requests cannot grow the task count without limit.

use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;

use super::error::{SocketError, SocketResult};

type Job = BoxFuture<'static, ()>;

/// `(max_running, max_waiting)` derived from the available CPUs
pub fn default_limits() -> (usize, usize) {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus * 2, cpus * 8)
}

#[derive(Clone)]
pub struct WorkerPool {
    queue: mpsc::Sender<Job>,
    semaphore: Arc<Semaphore>,
    // 受付済みで未開始のジョブ数（スケジューラが保持中のものも含む）
    waiting: Arc<AtomicUsize>,
    max_running: usize,
    max_waiting: usize,
}

impl WorkerPool {
    /// Pool sized from the CPU count: 2 running and 8 queued per core.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new() -> Self {
        let (max_running, max_waiting) = default_limits();
        Self::with_limits(max_running, max_waiting)
    }

    /// Must be called inside a tokio runtime.
    pub fn with_limits(max_running: usize, max_waiting: usize) -> Self {
        let max_running = max_running.max(1);
        let max_waiting = max_waiting.max(1);
        let (queue, jobs) = mpsc::channel(max_waiting);
        let semaphore = Arc::new(Semaphore::new(max_running));
        let waiting = Arc::new(AtomicUsize::new(0));

        tokio::spawn(Self::run_scheduler(jobs, semaphore.clone(), waiting.clone()));
        log::debug!(
            "Worker pool started (max_running={}, max_waiting={})",
            max_running,
            max_waiting
        );

        Self {
            queue,
            semaphore,
            waiting,
            max_running,
            max_waiting,
        }
    }

    async fn run_scheduler(mut jobs: mpsc::Receiver<Job>, semaphore: Arc<Semaphore>, waiting: Arc<AtomicUsize>) {
        while let Some(job) = jobs.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            waiting.fetch_sub(1, Ordering::SeqCst);
            tokio::spawn(async move {
                job.await;
                drop(permit);
            });
        }
        log::debug!("Worker pool scheduler stopped");
    }

    /// Queue a job without waiting. Fails with `PoolSaturated` when
    /// `max_waiting` jobs are already waiting for a worker.
    pub fn submit<F>(&self, job: F) -> SocketResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let reserved = self
            .waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < self.max_waiting).then_some(n + 1));
        if reserved.is_err() {
            return Err(SocketError::PoolSaturated);
        }

        match self.queue.try_send(Box::pin(job)) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                if let TrySendError::Closed(_) = e {
                    log::error!("Worker pool scheduler is gone, rejecting job");
                }
                Err(SocketError::PoolSaturated)
            }
        }
    }

    /// Jobs currently executing
    pub fn running(&self) -> usize {
        self.max_running - self.semaphore.available_permits()
    }

    /// Jobs queued but not yet started
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running
    }

    pub fn max_waiting(&self) -> usize {
        self.max_waiting
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}
