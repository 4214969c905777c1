//! Bounded retry with a per-attempt timeout.
//!
//! The transport can hang (a stuck automation session) or fail transiently.
//! Each attempt is raced against a timer; a losing attempt is dropped and
//! counted as a failure. Once `max_attempts` attempts have failed the task
//! settles with [`Error::ExhaustedRetries`] wrapping the last failure.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Retry policy attached to a class of tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Values below 1 act as 1.
    pub max_attempts: u32,

    /// Upper bound on a single attempt.
    #[serde(rename = "per_attempt_timeout_ms", serialize_with = "as_millis")]
    pub per_attempt_timeout: Duration,

    /// Pause between a failed attempt and the next one.
    #[serde(rename = "delay_between_attempts_ms", serialize_with = "as_millis")]
    pub delay_between_attempts: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            per_attempt_timeout: Duration::from_secs(30),
            delay_between_attempts: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, per_attempt_timeout: Duration, delay_between_attempts: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            per_attempt_timeout,
            delay_between_attempts,
        }
    }

    /// Same policy with a different attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn attempt_budget(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Run `work` under `policy`, calling it once per attempt.
///
/// Returns on the first successful attempt. A panic inside an attempt is
/// caught and treated like any other transport failure.
pub async fn run_with_retry<T, F, Fut>(label: &str, policy: &RetryPolicy, mut work: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let budget = policy.attempt_budget();
    let timeout_ms = policy.per_attempt_timeout.as_millis() as u64;
    let mut attempt = 1;

    loop {
        info!(
            label = %label,
            attempt = attempt,
            max_attempts = budget,
            "retry_attempt_started"
        );

        let attempt_future = AssertUnwindSafe(async { work().await }).catch_unwind();

        let failure = match timeout(policy.per_attempt_timeout, attempt_future).await {
            Ok(Ok(Ok(value))) => {
                if attempt > 1 {
                    info!(label = %label, attempts = attempt, "retry_attempt_recovered");
                }
                return Ok(value);
            }
            Ok(Ok(Err(e))) => Error::TransportFailure {
                label: label.to_string(),
                attempt,
                message: format!("{e:#}"),
            },
            Ok(Err(panic)) => Error::TransportFailure {
                label: label.to_string(),
                attempt,
                message: panic_message(panic.as_ref()),
            },
            Err(_) => Error::Timeout {
                label: label.to_string(),
                attempt,
                timeout_ms,
            },
        };

        warn!(
            label = %label,
            attempt = attempt,
            max_attempts = budget,
            error = %failure,
            "retry_attempt_failed"
        );

        if attempt >= budget {
            return Err(Error::ExhaustedRetries {
                label: label.to_string(),
                attempts: attempt,
                last: Box::new(failure),
            });
        }

        info!(
            label = %label,
            delay_ms = policy.delay_between_attempts.as_millis() as u64,
            "retry_scheduled"
        );
        sleep(policy.delay_between_attempts).await;
        attempt += 1;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}
