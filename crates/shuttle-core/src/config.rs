//! Configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::domain::RetryPolicy;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Engine configuration.
///
/// Durations are stored in milliseconds so the struct maps one-to-one onto
/// TOML files and `SHUTTLE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker execution slots (bounded concurrency).
    pub worker_slots: usize,
    /// How long a lease stays valid without the worker reporting back.
    pub lease_duration_ms: u64,
    /// Max time one broker dequeue blocks.
    pub dequeue_timeout_ms: u64,
    /// Lease-reclamation sweep period.
    pub sweep_interval_ms: u64,
    /// Max rows reclaimed per sweep.
    pub sweep_batch: usize,
    /// Store/broker reconcile period.
    pub reconcile_interval_ms: u64,
    /// A ready task untouched for this long is assumed to have lost its message.
    ///
    /// Reconcile cannot tell a lost message from one still waiting behind a
    /// backlog, so under a backlog longer than this each waiting task is
    /// republished about once per grace period. The extra copies are acked
    /// as duplicates on delivery; keep this well above the expected queue
    /// wait.
    pub reconcile_grace_ms: u64,
    /// Max rows republished per reconcile pass.
    pub reconcile_batch: usize,
    /// Used when `submit` does not specify max attempts.
    pub default_max_attempts: u32,
    /// Handler wall-clock limit; 0 means the lease is the only limit.
    /// Must not exceed `lease_duration_ms`.
    pub handler_timeout_ms: u64,
    /// Broker reconnect backoff.
    pub broker_backoff_initial_ms: u64,
    pub broker_backoff_max_ms: u64,
    /// Local retries of a transient store failure before giving up.
    pub store_retry_attempts: u32,
    pub store_retry_backoff_ms: u64,
    /// Retry policy.
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter: f64,
    /// Fixed jitter seed (reproducible backoff); random when unset.
    pub jitter_seed: Option<u64>,
    /// Visibility timeout of the default in-memory broker.
    pub visibility_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_slots: 4,
            lease_duration_ms: 30_000,
            dequeue_timeout_ms: 1_000,
            sweep_interval_ms: 5_000,
            sweep_batch: 100,
            reconcile_interval_ms: 10_000,
            reconcile_grace_ms: 60_000,
            reconcile_batch: 100,
            default_max_attempts: 5,
            handler_timeout_ms: 0,
            broker_backoff_initial_ms: 100,
            broker_backoff_max_ms: 10_000,
            store_retry_attempts: 5,
            store_retry_backoff_ms: 50,
            retry_base_delay_ms: 2_000,
            retry_max_delay_ms: 300_000,
            retry_jitter: 0.2,
            jitter_seed: None,
            visibility_timeout_ms: 60_000,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with any `SHUTTLE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from `lookup` (split out so tests need not touch the
    /// process environment).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            slot: &mut T,
        ) -> Result<(), ConfigError>
        where
            T::Err: std::fmt::Display,
        {
            if let Some(raw) = lookup(key) {
                *slot = raw
                    .trim()
                    .parse()
                    .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string()))?;
            }
            Ok(())
        }

        parse(&lookup, "SHUTTLE_WORKER_SLOTS", &mut self.worker_slots)?;
        parse(&lookup, "SHUTTLE_LEASE_DURATION_MS", &mut self.lease_duration_ms)?;
        parse(&lookup, "SHUTTLE_DEQUEUE_TIMEOUT_MS", &mut self.dequeue_timeout_ms)?;
        parse(&lookup, "SHUTTLE_SWEEP_INTERVAL_MS", &mut self.sweep_interval_ms)?;
        parse(&lookup, "SHUTTLE_SWEEP_BATCH", &mut self.sweep_batch)?;
        parse(&lookup, "SHUTTLE_RECONCILE_INTERVAL_MS", &mut self.reconcile_interval_ms)?;
        parse(&lookup, "SHUTTLE_RECONCILE_GRACE_MS", &mut self.reconcile_grace_ms)?;
        parse(&lookup, "SHUTTLE_RECONCILE_BATCH", &mut self.reconcile_batch)?;
        parse(&lookup, "SHUTTLE_DEFAULT_MAX_ATTEMPTS", &mut self.default_max_attempts)?;
        parse(&lookup, "SHUTTLE_HANDLER_TIMEOUT_MS", &mut self.handler_timeout_ms)?;
        parse(&lookup, "SHUTTLE_BROKER_BACKOFF_INITIAL_MS", &mut self.broker_backoff_initial_ms)?;
        parse(&lookup, "SHUTTLE_BROKER_BACKOFF_MAX_MS", &mut self.broker_backoff_max_ms)?;
        parse(&lookup, "SHUTTLE_STORE_RETRY_ATTEMPTS", &mut self.store_retry_attempts)?;
        parse(&lookup, "SHUTTLE_STORE_RETRY_BACKOFF_MS", &mut self.store_retry_backoff_ms)?;
        parse(&lookup, "SHUTTLE_RETRY_BASE_DELAY_MS", &mut self.retry_base_delay_ms)?;
        parse(&lookup, "SHUTTLE_RETRY_MAX_DELAY_MS", &mut self.retry_max_delay_ms)?;
        parse(&lookup, "SHUTTLE_RETRY_JITTER", &mut self.retry_jitter)?;
        parse(&lookup, "SHUTTLE_VISIBILITY_TIMEOUT_MS", &mut self.visibility_timeout_ms)?;
        if let Some(raw) = lookup("SHUTTLE_JITTER_SEED") {
            let seed = raw
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| {
                    ConfigError::invalid("SHUTTLE_JITTER_SEED", e.to_string())
                })?;
            self.jitter_seed = Some(seed);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_slots == 0 {
            return Err(ConfigError::invalid("worker_slots", "must be at least 1"));
        }
        if self.lease_duration_ms == 0 {
            return Err(ConfigError::invalid("lease_duration_ms", "must be positive"));
        }
        if self.handler_timeout_ms > self.lease_duration_ms {
            return Err(ConfigError::invalid(
                "handler_timeout_ms",
                "must not exceed lease_duration_ms",
            ));
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::invalid("default_max_attempts", "must be at least 1"));
        }
        if self.sweep_interval_ms == 0 || self.reconcile_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "sweep_interval_ms/reconcile_interval_ms",
                "must be positive",
            ));
        }
        if !(0.0..1.0).contains(&self.retry_jitter) {
            return Err(ConfigError::invalid("retry_jitter", "must be in [0, 1)"));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::invalid(
                "retry_base_delay_ms",
                "must not exceed retry_max_delay_ms",
            ));
        }
        if self.broker_backoff_initial_ms == 0
            || self.broker_backoff_initial_ms > self.broker_backoff_max_ms
        {
            return Err(ConfigError::invalid(
                "broker_backoff_initial_ms",
                "must be positive and not exceed broker_backoff_max_ms",
            ));
        }
        if self.visibility_timeout_ms < self.lease_duration_ms {
            return Err(ConfigError::invalid(
                "visibility_timeout_ms",
                "must be at least lease_duration_ms",
            ));
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn reconcile_grace(&self) -> Duration {
        Duration::from_millis(self.reconcile_grace_ms)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        (self.handler_timeout_ms > 0).then(|| Duration::from_millis(self.handler_timeout_ms))
    }

    pub fn broker_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.broker_backoff_initial_ms),
            Duration::from_millis(self.broker_backoff_max_ms),
        )
    }

    pub fn store_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.store_retry_backoff_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
            self.retry_jitter,
        )
    }
}
