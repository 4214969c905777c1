//! Configuration module for environment variable parsing.
//!
//! Every setting has a default; malformed values are logged and ignored.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::limit::{AdmissionConfig, QuotaConfig};
use crate::queue::RetryPolicy;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the web server to listen on
    pub port: u16,

    /// Single key accepted from the environment, with every permission
    pub api_key: Option<String>,

    /// JSON file holding additional API keys
    pub api_keys_file: PathBuf,

    // =========================================================================
    // Admission
    // =========================================================================

    /// General-tier quota for identities without their own
    pub rate_limit: QuotaConfig,

    /// Bulk-tier quota
    pub bulk_rate_limit: QuotaConfig,

    /// Bulk tier applies above this many recipients
    pub bulk_recipient_threshold: usize,

    /// Hard cap on recipients in one bulk request
    pub bulk_max_recipients: usize,

    /// Paths exempt from the general tier
    pub rate_limit_exempt_paths: Vec<String>,

    /// Interval between sweeps of idle rate windows in milliseconds
    pub rate_window_sweep_ms: u64,

    // =========================================================================
    // Queue
    // =========================================================================

    /// Attempts per task, including the first
    pub task_max_attempts: u32,

    /// Per-attempt timeout in milliseconds
    pub task_timeout_ms: u64,

    /// Delay between attempts in milliseconds
    pub task_retry_delay_ms: u64,

    /// Pause between consecutive tasks in milliseconds
    pub queue_pacing_ms: u64,

    /// Endpoint of the automation sidecar
    pub transport_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 3000,
            api_key: None,
            api_keys_file: PathBuf::from("api-keys.json"),
            rate_limit: QuotaConfig::new(100, 900_000),
            bulk_rate_limit: QuotaConfig::new(5, 3_600_000),
            bulk_recipient_threshold: 10,
            bulk_max_recipients: 50,
            rate_limit_exempt_paths: vec!["/".to_string(), "/health".to_string()],
            rate_window_sweep_ms: 60_000,
            task_max_attempts: 3,
            task_timeout_ms: 30_000,
            task_retry_delay_ms: 2_000,
            queue_pacing_ms: 1_000,
            transport_url: "http://127.0.0.1:3001/send".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        Config {
            port: parse_var("PORT", defaults.port),

            api_key: env::var("API_KEY").ok().filter(|k| !k.trim().is_empty()),

            api_keys_file: env::var("API_KEYS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.api_keys_file),

            rate_limit: QuotaConfig::new(
                parse_var("RATE_LIMIT_MAX_REQUESTS", defaults.rate_limit.max_requests),
                parse_var("RATE_LIMIT_WINDOW_MS", defaults.rate_limit.window_ms),
            ),

            bulk_rate_limit: QuotaConfig::new(
                parse_var(
                    "BULK_RATE_LIMIT_MAX_REQUESTS",
                    defaults.bulk_rate_limit.max_requests,
                ),
                parse_var("BULK_RATE_LIMIT_WINDOW_MS", defaults.bulk_rate_limit.window_ms),
            ),

            bulk_recipient_threshold: parse_var(
                "BULK_RECIPIENT_THRESHOLD",
                defaults.bulk_recipient_threshold,
            ),

            bulk_max_recipients: parse_var("BULK_MAX_RECIPIENTS", defaults.bulk_max_recipients),

            rate_limit_exempt_paths: parse_csv("RATE_LIMIT_EXEMPT_PATHS")
                .unwrap_or(defaults.rate_limit_exempt_paths),

            rate_window_sweep_ms: parse_var("RATE_WINDOW_SWEEP_MS", defaults.rate_window_sweep_ms),

            task_max_attempts: parse_var("TASK_MAX_ATTEMPTS", defaults.task_max_attempts).max(1),

            task_timeout_ms: parse_var("TASK_TIMEOUT_MS", defaults.task_timeout_ms),

            task_retry_delay_ms: parse_var("TASK_RETRY_DELAY_MS", defaults.task_retry_delay_ms),

            queue_pacing_ms: parse_var("QUEUE_PACING_MS", defaults.queue_pacing_ms),

            transport_url: env::var("TRANSPORT_URL").unwrap_or(defaults.transport_url),
        }
    }

    /// Retry policy applied to send tasks.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.task_max_attempts,
            Duration::from_millis(self.task_timeout_ms),
            Duration::from_millis(self.task_retry_delay_ms),
        )
    }

    pub fn queue_pacing(&self) -> Duration {
        Duration::from_millis(self.queue_pacing_ms)
    }

    pub fn admission(&self) -> AdmissionConfig {
        AdmissionConfig {
            general_default: self.rate_limit,
            bulk_quota: self.bulk_rate_limit,
            bulk_threshold: self.bulk_recipient_threshold,
            exempt_paths: self.rate_limit_exempt_paths.clone(),
        }
    }
}

/// Parse a variable, falling back to `default` when unset or malformed.
fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid value, using default");
            default
        }
    }
}

/// Parse a comma-separated list of strings.
fn parse_csv(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_valid() {
        env::set_var("TEST_SENDGATE_PORT", " 8080 ");
        assert_eq!(parse_var("TEST_SENDGATE_PORT", 1u16), 8080);
        env::remove_var("TEST_SENDGATE_PORT");
    }

    #[test]
    fn test_parse_var_malformed_uses_default() {
        env::set_var("TEST_SENDGATE_BAD", "lots");
        assert_eq!(parse_var("TEST_SENDGATE_BAD", 42u32), 42);
        env::remove_var("TEST_SENDGATE_BAD");
    }

    #[test]
    fn test_parse_var_default() {
        assert_eq!(parse_var("NONEXISTENT_SENDGATE_VAR", 10u64), 10);
    }

    #[test]
    fn test_parse_csv() {
        env::set_var("TEST_SENDGATE_CSV", "/, /health, ,/status");
        let result = parse_csv("TEST_SENDGATE_CSV");
        assert_eq!(
            result,
            Some(vec!["/".to_string(), "/health".to_string(), "/status".to_string()])
        );
        env::remove_var("TEST_SENDGATE_CSV");
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.queue_pacing(), Duration::from_secs(1));

        let admission = config.admission();
        assert_eq!(admission.general_default, QuotaConfig::new(100, 900_000));
        assert_eq!(admission.bulk_quota, QuotaConfig::new(5, 3_600_000));
        assert_eq!(admission.bulk_threshold, 10);
        assert_eq!(admission.exempt_paths, vec!["/", "/health"]);
    }
}
