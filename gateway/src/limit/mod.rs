//! Admission control.
//!
//! This module provides:
//! - A fixed-window counter keyed by caller identity
//! - A two-tier (general / bulk) admission controller with pluggable quotas
//! - An API-key registry that resolves per-key quotas

pub mod admission;
pub mod keys;
pub mod window;

pub use admission::{
    identity_preview, Admission, AdmissionConfig, AdmissionController, QuotaConfig, QuotaLookup,
    Tier,
};
pub use keys::{ApiKeyRecord, ApiKeyRegistry, KeyStatistics};
pub use window::{RateWindowCounter, WindowSnapshot};
