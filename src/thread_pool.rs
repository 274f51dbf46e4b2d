//! A fixed-size worker pool that runs fallible jobs and remembers the first
//! failure.
//!
//! [`rayon::ThreadPool`] itself has no notion of a fallible job — `spawn`
//! takes an `FnOnce()`, not an `FnOnce() -> Result<_, _>`. This wraps one with
//! a shared "first error wins" slot so that flush/compress/write jobs queued
//! from many places can all report failures through one channel, and later
//! calls can check whether the pool has already gone bad before doing more
//! work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use crate::error::StreamingError;

struct FailureSlot {
    failed: AtomicBool,
    first_error: Mutex<Option<StreamingError>>,
}

impl FailureSlot {
    fn new() -> Self {
        Self {
            failed: AtomicBool::new(false),
            first_error: Mutex::new(None),
        }
    }

    fn record(&self, err: StreamingError) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            *self.first_error.lock().unwrap() = Some(err);
        }
    }
}

/// A counting latch: `(count, condvar)` behind one mutex. Rust's standard
/// library has neither `std::latch` nor a counting semaphore, so every place
/// that needs "wait until N things have happened" builds one of these.
struct OutstandingJobs {
    count: Mutex<usize>,
    drained: Condvar,
}

impl OutstandingJobs {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    fn increment(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_for_drain(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.drained.wait(count).unwrap();
        }
    }
}

/// A worker pool that runs jobs returning [`crate::error::Result`] and
/// surfaces the first failure across all of them.
pub struct ThreadPool {
    pool: rayon::ThreadPool,
    failures: std::sync::Arc<FailureSlot>,
    outstanding: std::sync::Arc<OutstandingJobs>,
}

impl ThreadPool {
    /// Build a pool with `num_threads` workers.
    ///
    /// # Errors
    /// Returns [`StreamingError::Internal`] if the underlying rayon pool
    /// fails to spin up its threads.
    pub fn new(num_threads: usize) -> crate::error::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("zarr-streamer-worker-{i}"))
            .build()
            .map_err(|e| StreamingError::Internal(format!("failed to start thread pool: {e}")))?;
        Ok(Self {
            pool,
            failures: std::sync::Arc::new(FailureSlot::new()),
            outstanding: std::sync::Arc::new(OutstandingJobs::new()),
        })
    }

    /// Number of worker threads in the pool.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Queue a fallible job. Jobs run concurrently with no ordering guarantee
    /// relative to one another; callers that need ordering (e.g. shard
    /// rollover writes) must serialize through a separate mechanism such as
    /// [`Self::join_and_check`] barriers.
    ///
    /// If the pool has already recorded a failure, the job still runs — this
    /// mirrors the original engine's "let queued work drain, stop accepting
    /// new work at the call site" behaviour rather than silently dropping
    /// jobs, which would leave sinks in an inconsistent state.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() -> crate::error::Result<()> + Send + 'static,
    {
        let failures = std::sync::Arc::clone(&self.failures);
        let outstanding = std::sync::Arc::clone(&self.outstanding);
        outstanding.increment();
        self.pool.spawn(move || {
            if let Err(err) = job() {
                log::warn!("background job failed: {err}");
                failures.record(err);
            }
            outstanding.decrement();
        });
    }

    /// Block until every job spawned so far has run to completion, then
    /// return the first error recorded, if any.
    ///
    /// # Errors
    /// Returns the first [`StreamingError`] recorded by any job run on this
    /// pool since the last successful call to this method.
    pub fn join_and_check(&self) -> crate::error::Result<()> {
        self.outstanding.wait_for_drain();
        self.take_first_error()
    }

    /// `true` if any job spawned on this pool has failed.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.failures.failed.load(Ordering::SeqCst)
    }

    fn take_first_error(&self) -> crate::error::Result<()> {
        if !self.failures.failed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut slot = self.failures.first_error.lock().unwrap();
        match slot.take() {
            Some(err) => {
                self.failures.failed.store(false, Ordering::SeqCst);
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Run `a` and `b` concurrently on this pool's threads and wait for both,
    /// as `rayon::join` does.
    pub fn join<A, B, RA, RB>(&self, a: A, b: B) -> (RA, RB)
    where
        A: FnOnce() -> RA + Send,
        B: FnOnce() -> RB + Send,
        RA: Send,
        RB: Send,
    {
        self.pool.join(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn successful_jobs_leave_no_error() {
        let pool = ThreadPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        pool.join_and_check().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn first_failure_is_surfaced_once() {
        let pool = ThreadPool::new(2).unwrap();
        pool.spawn(|| Err(StreamingError::Internal("boom".to_string())));
        pool.join_and_check()
            .expect_err("expected the recorded failure");
        // The slot was drained by the previous check.
        pool.join_and_check().unwrap();
    }

    #[test]
    fn has_failed_reflects_outstanding_error() {
        let pool = ThreadPool::new(1).unwrap();
        assert!(!pool.has_failed());
        pool.spawn(|| Err(StreamingError::Overflow("too big".to_string())));
        pool.join_and_check().unwrap_err();
    }
}
