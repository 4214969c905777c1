//! Two-tier admission control in front of the send queue.
//!
//! - **general** applies to every non-exempt request, with a quota resolved
//!   per identity through a [`QuotaLookup`].
//! - **bulk** applies only to requests fanning out to more recipients than
//!   the configured threshold, with its own stricter quota and its own bucket
//!   (`bulk:{identity}`).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::window::RateWindowCounter;
use crate::error::{Error, Result};

/// Independently limited traffic classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    General,
    Bulk,
}

impl Tier {
    /// Counter key for `identity` within this tier.
    pub fn bucket_key(self, identity: &str) -> String {
        match self {
            Tier::General => identity.to_string(),
            Tier::Bulk => format!("bulk:{identity}"),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::General => f.write_str("general"),
            Tier::Bulk => f.write_str("bulk"),
        }
    }
}

/// Request quota over a fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaConfig {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl QuotaConfig {
    pub const fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Resolves the quota for an identity.
///
/// Called on every request: implementations must be fast and side-effect
/// free. `None` means the identity is unknown or unauthenticated and the
/// global default applies.
pub trait QuotaLookup: Send + Sync {
    fn lookup_quota(&self, identity: &str) -> Option<QuotaConfig>;
}

impl<F> QuotaLookup for F
where
    F: Fn(&str) -> Option<QuotaConfig> + Send + Sync,
{
    fn lookup_quota(&self, identity: &str) -> Option<QuotaConfig> {
        self(identity)
    }
}

/// Outcome of a single tier check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow { remaining: u32, limit: u32 },
    Deny { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow { .. })
    }

    /// Milliseconds until the caller may retry, for denials.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Admission::Allow { .. } => None,
            Admission::Deny { retry_after } => Some(retry_after.as_millis() as u64),
        }
    }
}

/// Static settings for both tiers.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// General-tier quota when the lookup has nothing for an identity
    pub general_default: QuotaConfig,
    /// Bulk-tier quota, identical for every identity
    pub bulk_quota: QuotaConfig,
    /// Bulk tier applies when a request targets more recipients than this
    pub bulk_threshold: usize,
    /// Paths never subject to the general tier (health/status)
    pub exempt_paths: Vec<String>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            general_default: QuotaConfig::new(100, 900_000),
            bulk_quota: QuotaConfig::new(5, 3_600_000),
            bulk_threshold: 10,
            exempt_paths: vec!["/".to_string(), "/health".to_string()],
        }
    }
}

/// Per-identity, per-tier admission control.
#[derive(Clone)]
pub struct AdmissionController {
    counter: RateWindowCounter,
    lookup: Arc<dyn QuotaLookup>,
    config: Arc<AdmissionConfig>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, lookup: Arc<dyn QuotaLookup>) -> Self {
        Self {
            counter: RateWindowCounter::new(),
            lookup,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Underlying counter, for sweeping and administrative resets.
    pub fn counter(&self) -> &RateWindowCounter {
        &self.counter
    }

    /// Quota that applies to `identity` on `tier`.
    pub fn quota_for(&self, identity: &str, tier: Tier) -> QuotaConfig {
        match tier {
            Tier::General => self
                .lookup
                .lookup_quota(identity)
                .unwrap_or(self.config.general_default),
            Tier::Bulk => self.config.bulk_quota,
        }
    }

    /// Charge one request to `identity` on `tier`.
    pub fn check(&self, identity: &str, tier: Tier) -> Admission {
        let quota = self.quota_for(identity, tier);
        let snap = self.counter.increment(&tier.bucket_key(identity), quota.window());

        if snap.count > quota.max_requests {
            let retry_after = snap.remaining_window(Instant::now());
            warn!(
                identity = %identity_preview(identity),
                tier = %tier,
                count = snap.count,
                limit = quota.max_requests,
                retry_after_ms = retry_after.as_millis() as u64,
                "rate_limit_denied"
            );
            return Admission::Deny { retry_after };
        }

        let remaining = quota.max_requests - snap.count;
        if u64::from(remaining) * 10 < u64::from(quota.max_requests) {
            warn!(
                identity = %identity_preview(identity),
                tier = %tier,
                remaining = remaining,
                limit = quota.max_requests,
                "rate_limit_near_exhaustion"
            );
        } else {
            debug!(
                identity = %identity_preview(identity),
                tier = %tier,
                remaining = remaining,
                limit = quota.max_requests,
                "rate_limit_allowed"
            );
        }

        Admission::Allow {
            remaining,
            limit: quota.max_requests,
        }
    }

    /// Tiers that apply to a request on `path` targeting `recipients`.
    pub fn applicable_tiers(&self, path: &str, recipients: usize) -> Vec<Tier> {
        let mut tiers = Vec::with_capacity(2);
        if !self.config.exempt_paths.iter().any(|p| p == path) {
            tiers.push(Tier::General);
        }
        if recipients > self.config.bulk_threshold {
            tiers.push(Tier::Bulk);
        }
        tiers
    }

    /// Check every applicable tier for one request.
    ///
    /// When a tier denies, slots already charged to earlier tiers for this
    /// request are given back.
    pub fn admit(&self, identity: &str, path: &str, recipients: usize) -> Result<()> {
        let mut charged: Vec<Tier> = Vec::new();

        for tier in self.applicable_tiers(path, recipients) {
            match self.check(identity, tier) {
                Admission::Allow { .. } => charged.push(tier),
                Admission::Deny { retry_after } => {
                    for earlier in charged {
                        self.release(identity, earlier);
                    }
                    return Err(Error::RateLimited {
                        tier,
                        retry_after_ms: retry_after.as_millis() as u64,
                    });
                }
            }
        }

        Ok(())
    }

    /// Give back one slot on `tier`, e.g. when validation rejects the request.
    pub fn release(&self, identity: &str, tier: Tier) {
        self.counter.decrement(&tier.bucket_key(identity));
    }

    /// Clear both tiers for `identity` (key deactivation).
    pub fn reset_identity(&self, identity: &str) {
        self.counter.reset(&Tier::General.bucket_key(identity));
        self.counter.reset(&Tier::Bulk.bucket_key(identity));
    }
}

/// Log-safe prefix of an identity (API keys are secrets).
pub fn identity_preview(identity: &str) -> String {
    match identity.char_indices().nth(15) {
        Some((idx, _)) => format!("{}...", &identity[..idx]),
        None => identity.to_string(),
    }
}
