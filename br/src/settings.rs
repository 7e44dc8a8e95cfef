//! Runtime settings for the orchestrator, read from the environment.

use std::str::FromStr;
use std::time::Duration;

use crate::transport::TransferOptions;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum concurrent per-node calls or transfers within one phase.
    pub fan_out: usize,
    pub call_timeout: Duration,
    pub connect_timeout: Duration,
    pub connect_retries: u32,
    pub retry_backoff: Duration,
    /// Bound on one node upload or download, and on one backend request.
    pub transfer_timeout: Duration,
    pub tolerate_unreachable_storage: bool,
    pub log_level: String,
}

impl Settings {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            fan_out: env_or("BR_FAN_OUT", 8usize).max(1),
            call_timeout: Duration::from_secs(env_or("BR_CALL_TIMEOUT_SECS", 30)),
            connect_timeout: Duration::from_secs(env_or("BR_CONNECT_TIMEOUT_SECS", 5)),
            connect_retries: env_or("BR_CONNECT_RETRIES", 3),
            retry_backoff: Duration::from_millis(env_or("BR_RETRY_BACKOFF_MS", 500)),
            transfer_timeout: Duration::from_secs(env_or("BR_TRANSFER_TIMEOUT_SECS", 3600)),
            tolerate_unreachable_storage: env_or("BR_TOLERATE_UNREACHABLE_STORAGE", false),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        }
    }
}

impl Settings {
    /// Timeouts for the orchestrator's own backend requests (manifests,
    /// locks, listings).
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            connect_timeout: self.connect_timeout,
            transfer_timeout: self.transfer_timeout,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fan_out: 8,
            call_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            connect_retries: 3,
            retry_backoff: Duration::from_millis(500),
            transfer_timeout: Duration::from_secs(3600),
            tolerate_unreachable_storage: false,
            log_level: "info".into(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_parses_and_falls_back() {
        std::env::set_var("BR_TEST_SETTINGS_FAN_OUT", "3");
        std::env::set_var("BR_TEST_SETTINGS_BAD", "not-a-number");
        assert_eq!(env_or("BR_TEST_SETTINGS_FAN_OUT", 8usize), 3);
        assert_eq!(env_or("BR_TEST_SETTINGS_BAD", 8usize), 8);
        assert_eq!(env_or("BR_TEST_SETTINGS_UNSET", 30u64), 30);
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.fan_out, 8);
        assert_eq!(settings.call_timeout, Duration::from_secs(30));
        assert!(!settings.tolerate_unreachable_storage);
        assert_eq!(settings.transfer_options().transfer_timeout, Duration::from_secs(3600));
    }
}
