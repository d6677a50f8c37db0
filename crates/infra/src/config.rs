//! Configuration loading and representation.
//!
//! Values come from `WORKHORSE_*` environment variables. Unset variables fall
//! back to defaults; malformed ones are logged at `warn` and also fall back.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use workhorse_core::{LeaseError, LeaseResult, OwnerId};

use crate::worker::{PollBackoff, RetryPolicy};

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_OWNER: &str = "WORKHORSE_OWNER";
pub const ENV_CONCURRENCY: &str = "WORKHORSE_CONCURRENCY";
pub const ENV_BATCH_SIZE: &str = "WORKHORSE_BATCH_SIZE";
pub const ENV_LEASE_TTL_SECS: &str = "WORKHORSE_LEASE_TTL_SECS";
pub const ENV_HEARTBEAT_SECS: &str = "WORKHORSE_HEARTBEAT_SECS";
pub const ENV_IDLE_MIN_MS: &str = "WORKHORSE_IDLE_MIN_MS";
pub const ENV_IDLE_MAX_MS: &str = "WORKHORSE_IDLE_MAX_MS";
pub const ENV_MAX_ATTEMPTS: &str = "WORKHORSE_MAX_ATTEMPTS";
pub const ENV_SWEEP_INTERVAL_SECS: &str = "WORKHORSE_SWEEP_INTERVAL_SECS";
pub const ENV_MAX_CONNECTIONS: &str = "WORKHORSE_MAX_CONNECTIONS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Worker runtime configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Process identity; each execution unit appends `/<index>`
    pub owner: OwnerId,
    /// Independent execution units
    pub concurrency: usize,
    /// Items claimed per round-trip
    pub batch_size: usize,
    pub lease_ttl: Duration,
    /// How often held items are renewed; must be well below `lease_ttl`
    pub heartbeat_interval: Duration,
    pub idle_backoff: PollBackoff,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "workhorse".to_string(),
            owner: OwnerId::generate(),
            concurrency: 1,
            batch_size: 4,
            lease_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            idle_backoff: PollBackoff::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let owner = lookup(ENV_OWNER)
            .filter(|o| !o.trim().is_empty())
            .map(OwnerId::from)
            .unwrap_or_else(OwnerId::generate);
        let idle_min = parse_or(&lookup, ENV_IDLE_MIN_MS, defaults.idle_backoff.min.as_millis() as u64);
        let idle_max = parse_or(&lookup, ENV_IDLE_MAX_MS, defaults.idle_backoff.max.as_millis() as u64);

        let mut config = Self {
            owner,
            concurrency: parse_or(&lookup, ENV_CONCURRENCY, defaults.concurrency),
            batch_size: parse_or(&lookup, ENV_BATCH_SIZE, defaults.batch_size),
            lease_ttl: Duration::from_secs(parse_or(
                &lookup,
                ENV_LEASE_TTL_SECS,
                defaults.lease_ttl.as_secs(),
            )),
            heartbeat_interval: Duration::from_secs(parse_or(
                &lookup,
                ENV_HEARTBEAT_SECS,
                defaults.heartbeat_interval.as_secs(),
            )),
            idle_backoff: PollBackoff::new(
                Duration::from_millis(idle_min),
                Duration::from_millis(idle_max),
            )
            .with_jitter(defaults.idle_backoff.jitter),
            retry: RetryPolicy {
                max_attempts: parse_or(&lookup, ENV_MAX_ATTEMPTS, defaults.retry.max_attempts),
                ..defaults.retry
            },
            ..defaults
        };

        if config.heartbeat_interval.is_zero() || config.heartbeat_interval >= config.lease_ttl {
            let fallback = config.lease_ttl / 3;
            warn!(
                heartbeat_secs = config.heartbeat_interval.as_secs(),
                lease_ttl_secs = config.lease_ttl.as_secs(),
                "heartbeat must be shorter than the lease ttl; using a third of the ttl"
            );
            config.heartbeat_interval = fallback;
        }

        config
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_owner(mut self, owner: impl Into<OwnerId>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_idle_backoff(mut self, backoff: PollBackoff) -> Self {
        self.idle_backoff = backoff;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reject settings the lease protocol cannot honor.
    pub fn validate(&self) -> LeaseResult<()> {
        if self.concurrency == 0 {
            return Err(LeaseError::invalid("concurrency must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(LeaseError::invalid("batch size must be at least 1"));
        }
        if self.lease_ttl.is_zero() {
            return Err(LeaseError::invalid("lease ttl must be positive"));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.lease_ttl {
            return Err(LeaseError::invalid(format!(
                "heartbeat interval {:?} must be positive and shorter than lease ttl {:?}",
                self.heartbeat_interval, self.lease_ttl
            )));
        }
        Ok(())
    }
}

/// Sweeper binary configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweeperConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub sweep_interval: Duration,
}

impl SweeperConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup(ENV_DATABASE_URL)
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::Missing(ENV_DATABASE_URL))?;

        let mut sweep_secs = parse_or(&lookup, ENV_SWEEP_INTERVAL_SECS, 30u64);
        if sweep_secs == 0 {
            warn!("{ENV_SWEEP_INTERVAL_SECS} must be positive; using 30");
            sweep_secs = 30;
        }

        Ok(Self {
            database_url,
            max_connections: parse_or(&lookup, ENV_MAX_CONNECTIONS, 5u32).max(1),
            sweep_interval: Duration::from_secs(sweep_secs),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Debug,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, default = ?default, "malformed setting; using default");
            default
        }),
    }
}
