//! Disk job executors
//!
//! The piece manager never blocks on disk I/O itself. Every backend call is
//! packaged as a job and handed to a `DiskExecutor`, which runs it on some
//! worker and lets the job deliver its own completion.

use tokio::runtime::Handle;

/// A unit of blocking disk work.
pub type DiskJob = Box<dyn FnOnce() + Send + 'static>;

/// Runs disk jobs.
///
/// Implementations must run every submitted job exactly once. Jobs for
/// unrelated slots may run concurrently and complete in any order.
pub trait DiskExecutor: Send + Sync {
    fn submit(&self, job: DiskJob);
}

/// Executor backed by tokio's blocking thread pool.
#[derive(Debug, Clone)]
pub struct TokioDiskExecutor {
    runtime: Handle,
}

impl TokioDiskExecutor {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Uses the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl DiskExecutor for TokioDiskExecutor {
    fn submit(&self, job: DiskJob) {
        // The join handle is dropped; jobs report through their own completion.
        let _ = self.runtime.spawn_blocking(job);
    }
}

/// Executor that runs each job on the submitting thread before returning.
///
/// Deterministic and free of scheduling noise, which makes it the executor of
/// choice for tests and for benchmarking the bookkeeping with
/// `DiscardStorage`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineDiskExecutor;

impl DiskExecutor for InlineDiskExecutor {
    fn submit(&self, job: DiskJob) {
        job();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_inline_executor_runs_immediately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let job_counter = Arc::clone(&counter);

        InlineDiskExecutor.submit(Box::new(move || {
            job_counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tokio_executor_runs_job() {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        let executor = TokioDiskExecutor::current();

        executor.submit(Box::new(move || {
            let _ = sender.send(std::thread::current().name().map(str::to_string));
        }));

        let thread_name = receiver.await.unwrap();
        assert!(thread_name.is_some());
    }
}
