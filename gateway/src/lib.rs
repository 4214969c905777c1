//! Sendgate - rate-limited, strictly sequential send gateway.
//!
//! The transport behind this gateway (a browser-automation session) can only
//! send one message at a time and may hang or fail. The library provides:
//! - `limit`: per-identity fixed-window admission with general and bulk tiers
//! - `queue`: a single-worker FIFO queue with bounded retries and pacing
//! - `gate`: the composition of both, shared by every request
//! - `web`: the HTTP surface built on top of the gateway
//!
//! ## Architecture
//!
//! ```text
//! HTTP → auth → admission (general, bulk) → sequential queue → retry → transport
//! ```

pub mod config;
pub mod error;
pub mod gate;
pub mod limit;
pub mod queue;
pub mod transport;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use gate::Gateway;
pub use limit::{
    Admission, AdmissionConfig, AdmissionController, ApiKeyRegistry, QuotaConfig, QuotaLookup,
    RateWindowCounter, Tier,
};
pub use queue::{run_with_retry, QueueStats, RetryPolicy, SequentialQueue, TaskHandle};
pub use transport::{Delivery, HttpTransport, Transport};
pub use web::{router, AppState};
