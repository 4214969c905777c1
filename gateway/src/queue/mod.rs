//! Sequential send queue.
//!
//! This module provides:
//! - A retry executor bounding both attempt count and attempt duration
//! - A strictly FIFO queue driving a single worker loop
//!
//! ## Flow
//!
//! ```text
//! enqueue → pending sequence → worker loop → run_with_retry → TaskHandle
//! ```

pub mod retry;
pub mod sequential;
pub mod types;

pub use retry::{run_with_retry, RetryPolicy};
pub use sequential::{SequentialQueue, TaskHandle, DEFAULT_PACING};
pub use types::QueueStats;
