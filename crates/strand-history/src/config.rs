//! History service configuration.
//!
//! [`Config::from_env`] starts from [`Config::default`] and overrides fields
//! from `STRAND_*` environment variables. Unset or blank variables keep the
//! default; malformed values are rejected with `InvalidArgument`.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strand_core::observability::LogFormat;

use crate::callbacks::{AllowedAddress, CallbackPolicy};
use crate::error::{Error, Result};
use crate::state::RetryDecision;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Number of shards; workflows hash onto `1..=shard_count`.
    pub shard_count: u32,
    /// Upper bound on waiting for a run's lease.
    pub lease_acquire_timeout: Duration,
    /// Callback registration policy.
    pub callbacks: CallbackPolicy,
    /// Callback delivery settings.
    pub delivery: DeliveryConfig,
    /// Cross-cluster replication settings.
    pub replication: ReplicationConfig,
    /// Prometheus listen address; metrics are not exported when unset.
    pub metrics_addr: Option<SocketAddr>,
    /// Log output format.
    #[serde(skip)]
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shard_count: 4,
            lease_acquire_timeout: Duration::from_secs(5),
            callbacks: CallbackPolicy::default(),
            delivery: DeliveryConfig::default(),
            replication: ReplicationConfig::default(),
            metrics_addr: None,
            log_format: LogFormat::default(),
        }
    }
}

/// What happens to in-flight deliveries at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Wait for in-flight deliveries to finish.
    #[default]
    Drain,
    /// Cancel in-flight deliveries. Their attempts stay counted and are
    /// re-dispatched from the transfer queue on the next start.
    Abandon,
}

impl std::str::FromStr for ShutdownMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drain" => Ok(Self::Drain),
            "abandon" => Ok(Self::Abandon),
            other => Err(Error::invalid_argument(format!(
                "shutdown mode must be drain or abandon (got {other})"
            ))),
        }
    }
}

/// Exponential backoff for failed callback attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRetryPolicy {
    /// Delay after the first failed attempt.
    pub initial_interval: Duration,
    /// Growth factor per attempt.
    pub backoff_coefficient: f64,
    /// Upper bound on any single delay.
    pub maximum_interval: Duration,
    /// Attempt budget; `None` retries transient failures forever.
    pub maximum_attempts: Option<u32>,
}

impl Default for CallbackRetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(60),
            maximum_attempts: None,
        }
    }
}

impl CallbackRetryPolicy {
    /// Returns the delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let max = self.maximum_interval.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.maximum_interval
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Decides what follows failed attempt `attempt`.
    #[must_use]
    pub fn decide(&self, attempt: u32, retryable: bool, now: DateTime<Utc>) -> RetryDecision {
        if !retryable || self.maximum_attempts.is_some_and(|max| attempt >= max) {
            return RetryDecision::GiveUp;
        }
        let delay = chrono::Duration::from_std(self.backoff(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        RetryDecision::RetryAt(now + delay)
    }
}

/// Callback delivery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryConfig {
    /// Ceiling on simultaneous HTTP deliveries.
    pub max_concurrent_deliveries: usize,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Backoff and attempt budget.
    pub retry: CallbackRetryPolicy,
    /// Shutdown behavior.
    pub shutdown_mode: ShutdownMode,
    /// How often the outcome transaction is retried on `ConcurrentUpdate`.
    pub conflict_retries: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deliveries: 64,
            request_timeout: Duration::from_secs(10),
            retry: CallbackRetryPolicy::default(),
            shutdown_mode: ShutdownMode::Drain,
            conflict_retries: 3,
        }
    }
}

/// Replication settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationConfig {
    /// Name of this cluster. When set, commits publish replication tasks.
    pub cluster_name: Option<String>,
}

impl Config {
    /// Loads configuration from `STRAND_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for malformed values or a configuration
    /// that fails [`Config::validate`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// See [`Config::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env(lookup);
        let mut config = Self::default();

        if let Some(count) = env.u32("STRAND_SHARD_COUNT")? {
            config.shard_count = count;
        }
        if let Some(ms) = env.u64("STRAND_LEASE_ACQUIRE_TIMEOUT_MS")? {
            config.lease_acquire_timeout = Duration::from_millis(ms);
        }

        let callbacks = &mut config.callbacks;
        if let Some(enabled) = env.bool("STRAND_CALLBACKS_ENABLED")? {
            callbacks.enabled = enabled;
        }
        if let Some(max) = env.usize("STRAND_CALLBACK_URL_MAX_LENGTH")? {
            callbacks.url_max_length = max;
        }
        if let Some(max) = env.usize("STRAND_CALLBACK_HEADER_MAX_SIZE")? {
            callbacks.header_max_size = max;
        }
        if let Some(max) = env.usize("STRAND_CALLBACK_MAX_PER_WORKFLOW")? {
            callbacks.max_per_workflow = max;
        }
        if let Some(raw) = env.string("STRAND_CALLBACK_ALLOWED_ADDRESSES") {
            callbacks.allowed_addresses = parse_allowed_addresses(&raw)?;
        }

        let delivery = &mut config.delivery;
        if let Some(max) = env.usize("STRAND_CALLBACK_MAX_CONCURRENT_DELIVERIES")? {
            delivery.max_concurrent_deliveries = max;
        }
        if let Some(ms) = env.u64("STRAND_CALLBACK_REQUEST_TIMEOUT_MS")? {
            delivery.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env.u64("STRAND_CALLBACK_RETRY_INITIAL_MS")? {
            delivery.retry.initial_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env.u64("STRAND_CALLBACK_RETRY_MAX_MS")? {
            delivery.retry.maximum_interval = Duration::from_millis(ms);
        }
        if let Some(coefficient) = env.f64("STRAND_CALLBACK_RETRY_COEFFICIENT")? {
            delivery.retry.backoff_coefficient = coefficient;
        }
        if let Some(max) = env.u32("STRAND_CALLBACK_MAX_ATTEMPTS")? {
            delivery.retry.maximum_attempts = (max > 0).then_some(max);
        }
        if let Some(mode) = env.string("STRAND_CALLBACK_SHUTDOWN_MODE") {
            delivery.shutdown_mode = mode.parse()?;
        }
        if let Some(retries) = env.u32("STRAND_CALLBACK_CONFLICT_RETRIES")? {
            delivery.conflict_retries = retries;
        }

        config.replication.cluster_name = env.string("STRAND_CLUSTER_NAME");
        if let Some(addr) = env.string("STRAND_METRICS_ADDR") {
            config.metrics_addr = Some(addr.parse().map_err(|e| {
                Error::invalid_argument(format!("STRAND_METRICS_ADDR must be host:port: {e}"))
            })?);
        }
        if let Some(format) = env.string("STRAND_LOG_FORMAT") {
            config.log_format = format.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(Error::invalid_argument("shard count must be at least 1"));
        }
        if self.delivery.max_concurrent_deliveries == 0 {
            return Err(Error::invalid_argument(
                "callback delivery concurrency must be at least 1",
            ));
        }
        let coefficient = self.delivery.retry.backoff_coefficient;
        if !coefficient.is_finite() || coefficient < 1.0 {
            return Err(Error::invalid_argument(
                "callback backoff coefficient must be at least 1.0",
            ));
        }
        if self.delivery.retry.maximum_interval < self.delivery.retry.initial_interval {
            return Err(Error::invalid_argument(
                "callback maximum retry interval is shorter than the initial interval",
            ));
        }
        if self
            .replication
            .cluster_name
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            return Err(Error::invalid_argument("cluster name must not be blank"));
        }
        Ok(())
    }
}

/// Parses `pattern[@insecure],...`.
fn parse_allowed_addresses(raw: &str) -> Result<Vec<AllowedAddress>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.strip_suffix("@insecure") {
            Some(pattern) => AllowedAddress::new(pattern, true),
            None => AllowedAddress::new(entry, false),
        })
        .collect()
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u32(&self, name: &str) -> Result<Option<u32>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u32>()
            .map(Some)
            .map_err(|e| Error::invalid_argument(format!("{name} must be a u32: {e}")))
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::invalid_argument(format!("{name} must be a u64: {e}")))
    }

    fn usize(&self, name: &str) -> Result<Option<usize>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<usize>()
            .map(Some)
            .map_err(|e| Error::invalid_argument(format!("{name} must be a usize: {e}")))
    }

    fn f64(&self, name: &str) -> Result<Option<f64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<f64>()
            .map(Some)
            .map_err(|e| Error::invalid_argument(format!("{name} must be a number: {e}")))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::invalid_argument(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use proptest::prelude::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = load(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert!(!config.callbacks.enabled);
        assert_eq!(config.delivery.shutdown_mode, ShutdownMode::Drain);
    }

    #[test]
    fn overrides_from_variables() {
        let config = load(&[
            ("STRAND_SHARD_COUNT", "16"),
            ("STRAND_CALLBACKS_ENABLED", "true"),
            ("STRAND_CALLBACK_MAX_PER_WORKFLOW", "2"),
            (
                "STRAND_CALLBACK_ALLOWED_ADDRESSES",
                "localhost:*@insecure, *.example.com",
            ),
            ("STRAND_CALLBACK_MAX_ATTEMPTS", "5"),
            ("STRAND_CALLBACK_SHUTDOWN_MODE", "abandon"),
            ("STRAND_CLUSTER_NAME", "east"),
            ("STRAND_METRICS_ADDR", "127.0.0.1:9090"),
            ("STRAND_LOG_FORMAT", "json"),
        ])
        .unwrap();

        assert_eq!(config.shard_count, 16);
        assert!(config.callbacks.enabled);
        assert_eq!(config.callbacks.max_per_workflow, 2);
        assert_eq!(
            config.callbacks.allowed_addresses,
            vec![
                AllowedAddress::new("localhost:*", true).unwrap(),
                AllowedAddress::new("*.example.com", false).unwrap(),
            ]
        );
        assert_eq!(config.delivery.retry.maximum_attempts, Some(5));
        assert_eq!(config.delivery.shutdown_mode, ShutdownMode::Abandon);
        assert_eq!(config.replication.cluster_name.as_deref(), Some("east"));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = load(&[("STRAND_SHARD_COUNT", "many")]).unwrap_err();
        assert!(err.to_string().contains("STRAND_SHARD_COUNT must be a u32"));

        let err = load(&[("STRAND_CALLBACKS_ENABLED", "maybe")]).unwrap_err();
        assert!(err.is_invalid_argument());

        let err = load(&[("STRAND_SHARD_COUNT", "0")]).unwrap_err();
        assert_eq!(err.to_string(), "shard count must be at least 1");
    }

    #[test]
    fn zero_max_attempts_means_unlimited() {
        let config = load(&[("STRAND_CALLBACK_MAX_ATTEMPTS", "0")]).unwrap();
        assert_eq!(config.delivery.retry.maximum_attempts, None);
    }

    #[test]
    fn decide_respects_budget_and_retryability() {
        let now = Utc::now();
        let policy = CallbackRetryPolicy {
            maximum_attempts: Some(2),
            ..CallbackRetryPolicy::default()
        };
        assert_eq!(
            policy.decide(1, true, now),
            RetryDecision::RetryAt(now + chrono::Duration::seconds(1))
        );
        assert_eq!(policy.decide(2, true, now), RetryDecision::GiveUp);
        assert_eq!(policy.decide(1, false, now), RetryDecision::GiveUp);
    }

    proptest! {
        #[test]
        fn backoff_is_bounded_and_non_decreasing(attempt in 1_u32..200) {
            let policy = CallbackRetryPolicy::default();
            let current = policy.backoff(attempt);
            prop_assert!(current <= policy.maximum_interval);
            prop_assert!(current >= policy.initial_interval);
            prop_assert!(policy.backoff(attempt + 1) >= current);
        }
    }
}
