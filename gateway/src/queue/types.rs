//! Task and statistics types for the sequential queue.

use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::retry::{run_with_retry, RetryPolicy};
use crate::error::{Error, Result};

/// Snapshot of the queue for status endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks waiting to run (the running task is not counted)
    pub queue_size: usize,
    /// Whether a worker loop is currently active
    pub is_processing: bool,
}

/// A unit of work waiting in the queue.
///
/// The queue only sees this erased form: it can run the task or cancel it,
/// never inspect its payload. Either path settles the caller's handle.
pub(crate) trait QueuedTask: Send {
    fn label(&self) -> &str;

    /// Execute through the retry executor and deliver the outcome.
    ///
    /// Resolves to `true` when the task succeeded.
    fn run(self: Box<Self>) -> BoxFuture<'static, bool>;

    /// Settle the handle with `QueueCancelled` without executing.
    fn cancel(self: Box<Self>);
}

/// Concrete task carrying the caller's closure and completion handle.
pub(crate) struct Task<T, F> {
    pub label: String,
    pub policy: RetryPolicy,
    pub work: F,
    pub done: oneshot::Sender<Result<T>>,
}

impl<T, F, Fut> QueuedTask for Task<T, F>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    fn label(&self) -> &str {
        &self.label
    }

    fn run(self: Box<Self>) -> BoxFuture<'static, bool> {
        let Task {
            label,
            policy,
            work,
            done,
        } = *self;

        async move {
            let outcome = run_with_retry(&label, &policy, work).await;
            let succeeded = outcome.is_ok();
            // The caller may have stopped waiting; nothing to deliver then.
            let _ = done.send(outcome);
            succeeded
        }
        .boxed()
    }

    fn cancel(self: Box<Self>) {
        let _ = self.done.send(Err(Error::QueueCancelled { label: self.label }));
    }
}
