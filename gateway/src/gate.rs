//! Composition root: admission first, then the sequential queue.
//!
//! ```text
//! caller → admit(identity, path, recipients) → enqueue → worker → TaskHandle
//! ```
//!
//! Denied requests never reach the queue.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::limit::{AdmissionController, QuotaLookup};
use crate::queue::{QueueStats, SequentialQueue, TaskHandle};

/// Admission-gated send queue shared by every request handler.
#[derive(Clone)]
pub struct Gateway {
    admission: AdmissionController,
    queue: SequentialQueue,
}

impl Gateway {
    pub fn new(admission: AdmissionController, queue: SequentialQueue) -> Self {
        Self { admission, queue }
    }

    /// Build fresh admission state and an idle queue from configuration.
    pub fn from_config(config: &Config, lookup: Arc<dyn QuotaLookup>) -> Self {
        Self::new(
            AdmissionController::new(config.admission(), lookup),
            SequentialQueue::new(config.queue_pacing(), config.retry_policy()),
        )
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn queue(&self) -> &SequentialQueue {
        &self.queue
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Admit a single-recipient request and enqueue its work.
    pub fn submit<T, F, Fut>(
        &self,
        identity: &str,
        path: &str,
        label: impl Into<String>,
        work: F,
    ) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.admission.admit(identity, path, 1)?;
        Ok(self.queue.enqueue(label, work))
    }

    /// Admit a fan-out request once, then enqueue one task per item.
    ///
    /// `fan_out` is the recipient count the request asked for; it decides
    /// whether the bulk tier applies. Items are queued back to back, so they
    /// run in the given order.
    pub fn submit_batch<T, F, Fut>(
        &self,
        identity: &str,
        path: &str,
        fan_out: usize,
        items: Vec<(String, F)>,
    ) -> Result<Vec<TaskHandle<T>>>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.admission.admit(identity, path, fan_out)?;

        Ok(items
            .into_iter()
            .map(|(label, work)| self.queue.enqueue(label, work))
            .collect())
    }

    /// Periodically drop rate windows idle for longer than `grace`.
    pub fn spawn_window_sweeper(&self, every: Duration, grace: Duration) -> JoinHandle<()> {
        let counter = self.admission.counter().clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let removed = counter.sweep_expired(grace);
                if removed > 0 {
                    info!(removed = removed, tracked = counter.len(), "rate_window_sweep");
                }
            }
        })
    }
}
