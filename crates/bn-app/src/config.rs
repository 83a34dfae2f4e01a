use std::env;
use std::str::FromStr;
use std::time::Duration;
use anyhow::Context;
use crate::tracker::TrackerSettings;
use crate::tracker::retry::{Backoff, RetryPolicy};

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    pub api_url: String,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub max_poll_duration: Duration,
    pub max_consecutive_failures: u32,
    pub retry_max_attempts: u32,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:5000".to_string(),
            request_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(3),
            max_poll_duration: Duration::from_secs(300),
            max_consecutive_failures: 3,
            retry_max_attempts: 3,
            retry_initial_backoff: Duration::from_millis(500),
            retry_max_backoff: Duration::from_secs(4),
        }
    }
}

impl TrackerConfig {
    /// Reads the environment, after loading `.env` if one exists.
    pub fn load() -> anyhow::Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            log::debug!("Loaded environment from {}", path.display());
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let config = Self {
            api_url: lookup("BINAA_API_URL").unwrap_or(defaults.api_url),
            request_timeout: millis(&lookup, "BINAA_REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
            poll_interval: millis(&lookup, "BINAA_POLL_INTERVAL_MS", defaults.poll_interval)?,
            max_poll_duration: millis(&lookup, "BINAA_MAX_POLL_DURATION_MS", defaults.max_poll_duration)?,
            max_consecutive_failures: number(
                &lookup,
                "BINAA_MAX_CONSECUTIVE_FAILURES",
                defaults.max_consecutive_failures,
            )?,
            retry_max_attempts: number(&lookup, "BINAA_RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?,
            retry_initial_backoff: millis(
                &lookup,
                "BINAA_RETRY_INITIAL_BACKOFF_MS",
                defaults.retry_initial_backoff,
            )?,
            retry_max_backoff: millis(&lookup, "BINAA_RETRY_MAX_BACKOFF_MS", defaults.retry_max_backoff)?,
        };

        anyhow::ensure!(!config.poll_interval.is_zero(), "BINAA_POLL_INTERVAL_MS must be positive");
        anyhow::ensure!(config.max_consecutive_failures > 0, "BINAA_MAX_CONSECUTIVE_FAILURES must be positive");
        anyhow::ensure!(config.retry_max_attempts > 0, "BINAA_RETRY_MAX_ATTEMPTS must be positive");

        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Backoff::Exponential {
                initial: self.retry_initial_backoff,
                max: self.retry_max_backoff,
            },
        )
    }

    pub fn settings(&self) -> TrackerSettings {
        TrackerSettings {
            poll_interval: self.poll_interval,
            max_poll_duration: self.max_poll_duration,
            max_consecutive_failures: self.max_consecutive_failures,
            retry: self.retry_policy(),
        }
    }
}

fn number<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number, got {:?}", key, raw)),
        None => Ok(default),
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> anyhow::Result<Duration> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    number(lookup, key, default_ms).map(Duration::from_millis)
}
