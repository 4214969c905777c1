//! API-key registry backing authentication and per-key quotas.
//!
//! Keys come from an optional JSON file (an array of records) plus an
//! optional key taken from the environment, which carries every permission
//! and the default quota.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::admission::{identity_preview, QuotaConfig, QuotaLookup};

/// Identifier of the key injected from the environment.
pub const ENV_KEY_ID: &str = "env_key";

/// Permission that implies every other one.
pub const ADMIN_PERMISSION: &str = "admin";

/// One API key and its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Per-key general-tier quota; the global default applies when absent
    #[serde(default)]
    pub rate_limit: Option<QuotaConfig>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Empty means any address is accepted
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

impl ApiKeyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions
            .iter()
            .any(|p| p == permission || p == ADMIN_PERMISSION)
    }

    pub fn is_ip_allowed(&self, ip: &str) -> bool {
        self.allowed_ips.is_empty() || self.allowed_ips.iter().any(|a| a == ip)
    }
}

/// Counts reported by [`ApiKeyRegistry::statistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeyStatistics {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub expired: usize,
}

/// Immutable set of known API keys.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyRegistry {
    keys: Vec<ApiKeyRecord>,
}

impl ApiKeyRegistry {
    pub fn new(keys: Vec<ApiKeyRecord>) -> Self {
        Self { keys }
    }

    /// Parse a JSON array of key records.
    pub fn from_json(json: &str) -> Result<Self> {
        let keys: Vec<ApiKeyRecord> =
            serde_json::from_str(json).context("Failed to parse API key records")?;
        Ok(Self::new(keys))
    }

    /// Load the key file, treating a missing or unreadable file as empty.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!(path = %path.display(), "api_keys_file_absent");
            return Self::default();
        }

        let loaded = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))
            .and_then(|raw| Self::from_json(&raw));

        match loaded {
            Ok(registry) => {
                info!(path = %path.display(), keys = registry.keys.len(), "api_keys_loaded");
                registry
            }
            Err(e) => {
                warn!(path = %path.display(), error = %format!("{e:#}"), "api_keys_load_failed");
                Self::default()
            }
        }
    }

    /// Add the environment key in front of the file keys.
    pub fn with_env_key(mut self, key: &str, quota: QuotaConfig) -> Self {
        self.keys.insert(
            0,
            ApiKeyRecord {
                id: ENV_KEY_ID.to_string(),
                name: "Environment API Key".to_string(),
                key: key.to_string(),
                active: true,
                permissions: ["send", "receive", "status", ADMIN_PERMISSION]
                    .iter()
                    .map(|p| p.to_string())
                    .collect(),
                rate_limit: Some(quota),
                expires_at: None,
                allowed_ips: Vec::new(),
            },
        );
        self
    }

    /// Find an active, unexpired record for `key`.
    pub fn validate(&self, key: &str) -> Option<&ApiKeyRecord> {
        self.validate_at(key, Utc::now())
    }

    fn validate_at(&self, key: &str, now: DateTime<Utc>) -> Option<&ApiKeyRecord> {
        let record = self
            .keys
            .iter()
            .find(|k| k.active && constant_time_compare(&k.key, key))?;

        if record.is_expired(now) {
            warn!(key_id = %record.id, "api_key_expired");
            return None;
        }

        Some(record)
    }

    pub fn statistics(&self) -> KeyStatistics {
        let now = Utc::now();
        let active = self.keys.iter().filter(|k| k.active).count();
        KeyStatistics {
            total: self.keys.len(),
            active,
            inactive: self.keys.len() - active,
            expired: self.keys.iter().filter(|k| k.is_expired(now)).count(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl QuotaLookup for ApiKeyRegistry {
    fn lookup_quota(&self, identity: &str) -> Option<QuotaConfig> {
        let quota = self.validate(identity).and_then(|k| k.rate_limit);
        if quota.is_none() {
            tracing::trace!(identity = %identity_preview(identity), "quota_lookup_default");
        }
        quota
    }
}

/// Constant-time string comparison to prevent timing attacks.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
