//! Driver configuration loaded from environment variables.

use std::time::Duration;

use saga::{CompensationConfig, RetryPolicy};

/// Driver configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `DATABASE_URL`: PostgreSQL connection string (no default)
/// - `MAX_CONNECTIONS`: pool size (default: `10`)
/// - `RETRY_MAX_ATTEMPTS`: attempts per atomic unit (default: `5`)
/// - `RETRY_MIN_BACKOFF_MS` / `RETRY_MAX_BACKOFF_MS`: backoff window (default: `50` / `200`)
/// - `COMPENSATION_INTERVAL_SECS`: pause between rounds (default: `10`)
/// - `COMPENSATION_BUDGET_SECS`: session length, `0` for unbounded (default: `300`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub retry: RetryPolicy,
    pub compensation: CompensationConfig,
    pub log_level: String,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults for
    /// missing or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let retry = RetryPolicy {
            max_attempts: number("RETRY_MAX_ATTEMPTS")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.retry.max_attempts),
            min_backoff: number("RETRY_MIN_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.min_backoff),
            max_backoff: number("RETRY_MAX_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_backoff),
        };

        let compensation = CompensationConfig {
            round_interval: number("COMPENSATION_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.compensation.round_interval),
            session_budget: match number("COMPENSATION_BUDGET_SECS") {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.compensation.session_budget,
            },
            ..defaults.compensation
        };

        Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            max_connections: number("MAX_CONNECTIONS")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.max_connections),
            retry,
            compensation,
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            retry: RetryPolicy::default(),
            compensation: CompensationConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert!(config.database_url.is_none());
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.compensation.round_interval, Duration::from_secs(10));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_empty_environment_uses_defaults() {
        let config = Config::from_lookup(lookup_from(&[]));
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(
            config.compensation.session_budget,
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/workload"),
            ("MAX_CONNECTIONS", "32"),
            ("RETRY_MAX_ATTEMPTS", "8"),
            ("RETRY_MIN_BACKOFF_MS", "10"),
            ("RETRY_MAX_BACKOFF_MS", "40"),
            ("COMPENSATION_INTERVAL_SECS", "2"),
            ("COMPENSATION_BUDGET_SECS", "60"),
            ("RUST_LOG", "debug"),
        ]));

        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/workload")
        );
        assert_eq!(config.max_connections, 32);
        assert_eq!(config.retry.max_attempts, 8);
        assert_eq!(config.retry.min_backoff, Duration::from_millis(10));
        assert_eq!(config.retry.max_backoff, Duration::from_millis(40));
        assert_eq!(config.compensation.round_interval, Duration::from_secs(2));
        assert_eq!(
            config.compensation.session_budget,
            Some(Duration::from_secs(60))
        );
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_zero_budget_means_unbounded() {
        let config = Config::from_lookup(lookup_from(&[("COMPENSATION_BUDGET_SECS", "0")]));
        assert_eq!(config.compensation.session_budget, None);
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let config = Config::from_lookup(lookup_from(&[
            ("MAX_CONNECTIONS", "many"),
            ("RETRY_MAX_ATTEMPTS", "-1"),
            ("DATABASE_URL", ""),
        ]));
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.database_url.is_none());
    }
}
