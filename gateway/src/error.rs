//! Error taxonomy shared by the queue, the retry executor and admission.

use thiserror::Error;

use crate::limit::Tier;

/// Result alias for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can settle a caller's request without a successful outcome.
#[derive(Debug, Error)]
pub enum Error {
    /// A single attempt exceeded the per-attempt timeout.
    #[error("{label}: attempt {attempt} timed out after {timeout_ms}ms")]
    Timeout {
        label: String,
        attempt: u32,
        timeout_ms: u64,
    },

    /// The task itself failed (or panicked) during an attempt.
    #[error("{label}: attempt {attempt} failed: {message}")]
    TransportFailure {
        label: String,
        attempt: u32,
        message: String,
    },

    /// Every attempt allowed by the retry policy failed.
    #[error("{label}: failed after {attempts} attempt(s): {last}")]
    ExhaustedRetries {
        label: String,
        attempts: u32,
        last: Box<Error>,
    },

    /// The task was still pending when the queue was cleared.
    #[error("{label}: cancelled before execution")]
    QueueCancelled { label: String },

    /// Admission was denied for the given tier.
    #[error("rate limited on {tier} tier, retry after {retry_after_ms}ms")]
    RateLimited { tier: Tier, retry_after_ms: u64 },

    /// The worker went away without settling the task (runtime shutdown).
    #[error("{label}: abandoned before completion")]
    Abandoned { label: String },
}

impl Error {
    /// Label of the task this error belongs to, if any.
    pub fn label(&self) -> Option<&str> {
        match self {
            Error::Timeout { label, .. }
            | Error::TransportFailure { label, .. }
            | Error::ExhaustedRetries { label, .. }
            | Error::QueueCancelled { label }
            | Error::Abandoned { label } => Some(label),
            Error::RateLimited { .. } => None,
        }
    }

    /// Whether resubmitting the same request later may succeed.
    ///
    /// Only admission denials and cancellations are safe to resubmit blindly;
    /// exhausted retries may already have reached the transport.
    pub fn is_resubmittable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. } | Error::QueueCancelled { .. } | Error::Abandoned { .. }
        )
    }
}
