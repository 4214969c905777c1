//! Strictly sequential FIFO task queue.
//!
//! Every enqueued task runs through the retry executor on a single worker
//! loop. The loop is started on demand by `enqueue`, drains the pending
//! sequence with a pacing delay between consecutive tasks, and exits once it
//! observes the sequence empty under the same lock that guards appends.
//! Clearing the queue cuts a pacing wait short, so a cleared queue is idle.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use super::retry::RetryPolicy;
use super::types::{QueueStats, QueuedTask, Task};
use crate::error::{Error, Result};

/// Default pause between two consecutive tasks.
pub const DEFAULT_PACING: Duration = Duration::from_millis(1000);

/// Handle to a shared sequential queue.
///
/// Cloning is cheap; all clones drive the same pending sequence and worker.
#[derive(Clone)]
pub struct SequentialQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    cleared: Notify,
    pacing: Duration,
    default_policy: RetryPolicy,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Box<dyn QueuedTask>>,
    processing: bool,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // No code panics while holding the lock, but never wedge the queue on poison.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SequentialQueue {
    fn default() -> Self {
        Self::new(DEFAULT_PACING, RetryPolicy::default())
    }
}

impl SequentialQueue {
    /// Create an idle queue.
    pub fn new(pacing: Duration, default_policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                cleared: Notify::new(),
                pacing,
                default_policy,
            }),
        }
    }

    /// Policy applied by [`enqueue`](Self::enqueue).
    pub fn default_policy(&self) -> &RetryPolicy {
        &self.inner.default_policy
    }

    /// Pacing delay between consecutive tasks.
    pub fn pacing(&self) -> Duration {
        self.inner.pacing
    }

    /// Append a task using the default retry policy.
    ///
    /// See [`enqueue_with_policy`](Self::enqueue_with_policy).
    pub fn enqueue<T, F, Fut>(&self, label: impl Into<String>, work: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let policy = self.inner.default_policy.clone();
        self.enqueue_with_policy(label, policy, work)
    }

    /// Append a task to the tail of the queue.
    ///
    /// The task is queued before this returns, so the order of calls is the
    /// execution order. `work` is invoked once per attempt. The returned
    /// handle settles exactly once with the task's result or terminal error.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn enqueue_with_policy<T, F, Fut>(
        &self,
        label: impl Into<String>,
        policy: RetryPolicy,
        work: F,
    ) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let label = label.into();
        let (done, rx) = oneshot::channel();

        let task = Box::new(Task {
            label: label.clone(),
            policy,
            work,
            done,
        });

        let start_worker = {
            let mut state = self.inner.lock();
            state.pending.push_back(task);
            info!(label = %label, queue_size = state.pending.len(), "queue_task_enqueued");
            !std::mem::replace(&mut state.processing, true)
        };

        if start_worker {
            tokio::spawn(drain(Arc::clone(&self.inner)));
        }

        TaskHandle { label, rx }
    }

    /// Number of tasks waiting to run.
    pub fn size(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Whether a worker loop is active.
    pub fn is_processing(&self) -> bool {
        self.inner.lock().processing
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.lock();
        QueueStats {
            queue_size: state.pending.len(),
            is_processing: state.processing,
        }
    }

    /// Drop every pending task, settling each with `QueueCancelled`.
    ///
    /// A task that is already running is not affected. Returns the number of
    /// tasks discarded.
    pub fn clear(&self) -> usize {
        let discarded = std::mem::take(&mut self.inner.lock().pending);
        let count = discarded.len();

        for task in discarded {
            task.cancel();
        }
        self.inner.cleared.notify_waiters();

        info!(discarded = count, "queue_cleared");
        count
    }
}

/// Worker loop: runs until the pending sequence is observed empty.
async fn drain(inner: Arc<QueueInner>) {
    info!("queue_worker_started");

    loop {
        let next = {
            let mut state = inner.lock();
            match state.pending.pop_front() {
                Some(task) => Some((task, state.pending.len())),
                None => {
                    state.processing = false;
                    None
                }
            }
        };

        let Some((task, remaining)) = next else {
            info!("queue_drained");
            return;
        };

        let label = task.label().to_string();
        info!(label = %label, remaining = remaining, "queue_task_dequeued");

        let started = Instant::now();
        let succeeded = task.run().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        if succeeded {
            info!(label = %label, duration_ms = duration_ms, "queue_task_succeeded");
        } else {
            warn!(label = %label, duration_ms = duration_ms, "queue_task_failed");
        }

        pace(&inner).await;
    }
}

/// Wait out the pacing delay while tasks are pending.
///
/// Returns early once a `clear()` leaves the sequence empty; tasks enqueued
/// after the clear still wait for the full delay.
async fn pace(inner: &QueueInner) {
    let deadline = Instant::now() + inner.pacing;

    loop {
        // Registered before the check so a concurrent clear() is not missed.
        let cleared = inner.cleared.notified();
        if inner.lock().pending.is_empty() {
            return;
        }

        tokio::select! {
            _ = sleep_until(deadline) => return,
            _ = cleared => {}
        }
    }
}

/// Completion handle returned by [`SequentialQueue::enqueue`].
///
/// Dropping the handle does not cancel the task; it still runs in order.
#[must_use = "the task runs regardless, but its outcome is only observable through the handle"]
pub struct TaskHandle<T> {
    label: String,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Abandoned {
                label: self.label.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}
