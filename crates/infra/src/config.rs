//! Relay configuration loaded from environment variables.
//!
//! Every setting has a default except `DATABASE_URL`, which only the Postgres
//! commands need. Values that are present but malformed are errors, never
//! silently replaced by the default.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use jobrelay_core::WorkerId;

use crate::bridge::{BridgeConfig, EventRoutes};
use crate::jobs::{
    BackoffStrategy, DEFAULT_MAX_ATTEMPTS, PoolConfig, QueueConfig, RetryPolicy, WorkerConfig,
};
use crate::stats::StatsConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} is required")]
    Missing { key: &'static str },

    #[error("{key}='{value}' is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub database_url: Option<String>,
    pub db_max_connections: u32,

    pub bridge_poll_interval: Duration,
    pub bridge_batch_size: usize,
    pub routes: EventRoutes,

    /// Prefix for pool members (`{worker_id}-{n}`).
    pub worker_id: WorkerId,
    pub worker_poll_interval: Duration,
    pub worker_batch_size: usize,
    pub concurrency: usize,
    /// Always below `lease_timeout`; defaults to 80% of it.
    pub job_timeout: Duration,
    pub dry_run: bool,

    pub lease_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_strategy: BackoffStrategy,
    pub backoff_base: Duration,
    pub backoff_max: Duration,

    pub heartbeat_interval: Duration,
    pub heartbeat_stale_after: Duration,
    pub pending_alert_threshold: u64,
    pub recent_failures_limit: usize,
}

impl RelayConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let worker_id = match env.get("RELAY_WORKER_ID") {
            Some(raw) => WorkerId::parse(raw.clone()).map_err(|e| ConfigError::Invalid {
                key: "RELAY_WORKER_ID",
                value: raw,
                reason: e.to_string(),
            })?,
            None => default_worker_id(env.get("HOSTNAME"))?,
        };

        let routes = match env.get("RELAY_EVENT_ROUTES") {
            Some(raw) => EventRoutes::parse(&raw).map_err(|e| ConfigError::Invalid {
                key: "RELAY_EVENT_ROUTES",
                value: raw,
                reason: e.to_string(),
            })?,
            None => EventRoutes::new(),
        };

        let lease_timeout = env.secs("RELAY_LEASE_TIMEOUT_SECS", 300)?;
        let job_timeout = env
            .optional::<u64>("RELAY_JOB_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(lease_timeout * 4 / 5);

        let config = Self {
            database_url: env.get("DATABASE_URL"),
            db_max_connections: env.parse("RELAY_DB_MAX_CONNECTIONS", 10)?,

            bridge_poll_interval: env.millis("RELAY_BRIDGE_POLL_INTERVAL_MS", 1000)?,
            bridge_batch_size: env.parse("RELAY_BRIDGE_BATCH_SIZE", 100)?,
            routes,

            worker_id,
            worker_poll_interval: env.millis("RELAY_WORKER_POLL_INTERVAL_MS", 1000)?,
            worker_batch_size: env.parse("RELAY_WORKER_BATCH_SIZE", 10)?,
            concurrency: env.parse("RELAY_WORKER_CONCURRENCY", 1)?,
            job_timeout,
            dry_run: env.flag("RELAY_DRY_RUN", false)?,

            lease_timeout,
            max_attempts: env.parse("RELAY_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
            backoff_strategy: env.parse("RELAY_BACKOFF_STRATEGY", BackoffStrategy::Exponential)?,
            backoff_base: env.millis("RELAY_BACKOFF_BASE_MS", 5_000)?,
            backoff_max: env.millis("RELAY_BACKOFF_MAX_MS", 3_600_000)?,

            heartbeat_interval: env.secs("RELAY_HEARTBEAT_INTERVAL_SECS", 15)?,
            heartbeat_stale_after: env.secs("RELAY_HEARTBEAT_STALE_SECS", 60)?,
            pending_alert_threshold: env.parse("RELAY_PENDING_ALERT_THRESHOLD", 1000)?,
            recent_failures_limit: env.parse("RELAY_RECENT_FAILURES_LIMIT", 20)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("RELAY_DB_MAX_CONNECTIONS", self.db_max_connections as u64),
            ("RELAY_BRIDGE_BATCH_SIZE", self.bridge_batch_size as u64),
            ("RELAY_WORKER_BATCH_SIZE", self.worker_batch_size as u64),
            ("RELAY_WORKER_CONCURRENCY", self.concurrency as u64),
            ("RELAY_MAX_ATTEMPTS", self.max_attempts as u64),
            ("RELAY_LEASE_TIMEOUT_SECS", self.lease_timeout.as_secs()),
            ("RELAY_HEARTBEAT_INTERVAL_SECS", self.heartbeat_interval.as_secs()),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    value: "0".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        // A job still running when its lease expires can be claimed and run
        // a second time by another worker.
        if self.job_timeout.is_zero() || self.job_timeout >= self.lease_timeout {
            return Err(ConfigError::Invalid {
                key: "RELAY_JOB_TIMEOUT_SECS",
                value: self.job_timeout.as_secs().to_string(),
                reason: "must be above zero and below RELAY_LEASE_TIMEOUT_SECS".to_string(),
            });
        }
        if self.backoff_max < self.backoff_base {
            return Err(ConfigError::Invalid {
                key: "RELAY_BACKOFF_MAX_MS",
                value: self.backoff_max.as_millis().to_string(),
                reason: "must not be below RELAY_BACKOFF_BASE_MS".to_string(),
            });
        }
        Ok(())
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing { key: "DATABASE_URL" })
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            lease_timeout: self.lease_timeout,
            retry: RetryPolicy {
                base_delay: self.backoff_base,
                max_delay: self.backoff_max,
                strategy: self.backoff_strategy,
            },
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.worker_poll_interval,
            batch_size: self.worker_batch_size,
            job_timeout: Some(self.job_timeout),
            dry_run: self.dry_run,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            worker_prefix: self.worker_id.clone(),
            concurrency: self.concurrency,
            heartbeat_interval: self.heartbeat_interval,
            worker: self.worker_config(),
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            poll_interval: self.bridge_poll_interval,
            batch_size: self.bridge_batch_size,
            default_max_attempts: self.max_attempts,
        }
    }

    pub fn stats_config(&self) -> StatsConfig {
        StatsConfig {
            heartbeat_stale_after: self.heartbeat_stale_after,
            pending_alert_threshold: self.pending_alert_threshold,
            recent_failures_limit: self.recent_failures_limit,
        }
    }
}

/// `worker-<hostname>`, falling back to `worker-<pid>`.
fn default_worker_id(hostname: Option<String>) -> Result<WorkerId, ConfigError> {
    let suffix = hostname.unwrap_or_else(|| std::process::id().to_string());
    let raw = format!("worker-{suffix}");
    WorkerId::parse(raw.clone()).map_err(|e| ConfigError::Invalid {
        key: "RELAY_WORKER_ID",
        value: raw,
        reason: format!("default identity is unusable ({e}); set RELAY_WORKER_ID"),
    })
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed value; blank counts as unset.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn optional<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                    key,
                    reason: e.to_string(),
                    value: raw,
                })
            })
            .transpose()
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.optional(key)?.unwrap_or(default))
    }

    fn millis(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_millis)
    }

    fn secs(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_secs)
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key,
                    value: raw,
                    reason: "expected true or false".to_string(),
                }),
            },
        }
    }
}
