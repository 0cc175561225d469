//! Deferred Job Runner.
//!
//! `run` moves one blocking call onto a worker (`spawn_blocking`) and hands
//! its result back to the dispatch context. The caller gets control back
//! immediately; the callback never runs on the worker.
//!
//! - `run`: a panic in `work` is logged and kills that job; no callback fires.
//! - `run_failable`: `work` returns `Result`. A failure (including a panic)
//!   runs `on_error(err)` and then `on_finally(JobResult::Failure)`. A success
//!   runs only `on_finally(JobResult::Success(value))`.
//!
//! Workers are neither joined nor tracked. There is no way to abort one once
//! it has started; long-running work takes a [`CancellationToken`] and polls
//! it with [`ensure_not_cancelled`] between steps.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::model::JobId;

/// Tagged result delivered to `on_finally`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult<T> {
    Success(T),
    Failure,
}

impl<T> JobResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            JobResult::Success(v) => Some(v),
            JobResult::Failure => None,
        }
    }
}

impl Dispatcher {
    /// Runs `work` on a worker; `on_done(result)` runs on the dispatch context.
    pub fn run<T, W, D>(&self, work: W, on_done: D) -> JobId
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        D: FnOnce(T) + 'static,
    {
        let job = JobId::generate();
        let completer = self.expect_completion(job, on_done);
        debug!(job = %job, "dispatching worker");

        tokio::task::spawn_blocking(move || {
            match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(value) => completer.complete(value),
                Err(panic) => {
                    error!(job = %completer.job(), "worker panicked: {}", panic_message(&*panic));
                    completer.abandon();
                }
            }
        });

        job
    }

    /// Like [`Dispatcher::run`], but every failure reaches `on_error` and
    /// `on_finally` always fires exactly once.
    pub fn run_failable<T, W, E, F>(&self, work: W, on_error: E, on_finally: F) -> JobId
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T> + Send + 'static,
        E: FnOnce(Error) + 'static,
        F: FnOnce(JobResult<T>) + 'static,
    {
        let guarded = move || match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(result) => result,
            Err(panic) => Err(Error::WorkerPanicked(panic_message(&*panic))),
        };

        self.run(guarded, move |result: Result<T>| match result {
            Ok(value) => on_finally(JobResult::Success(value)),
            Err(err) => {
                debug!(error = %err, "job failed");
                on_error(err);
                on_finally(JobResult::Failure);
            }
        })
    }
}

/// Cooperative cancellation point for long-running work.
pub fn ensure_not_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
