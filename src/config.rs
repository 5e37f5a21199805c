use dotenv::dotenv;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::domain::services::change_source::BackoffConfig;
use crate::domain::services::delivery::DeliveryConfig;

const BIND_ADDR: &str = "BIND_ADDR";
const LOG_LEVEL: &str = "LOG_LEVEL";
const AUTH_TOKENS: &str = "AUTH_TOKENS";
const CHECKPOINT_PATH: &str = "CHECKPOINT_PATH";
const BUS_CAPACITY: &str = "BUS_CAPACITY";
const REPLAY_CAPACITY: &str = "REPLAY_CAPACITY";
const QUEUE_CAPACITY: &str = "QUEUE_CAPACITY";
const RETIRED_CONNECTIONS: &str = "RETIRED_CONNECTIONS";
const WRITE_TIMEOUT_MS: &str = "WRITE_TIMEOUT_MS";
const HEARTBEAT_INTERVAL_MS: &str = "HEARTBEAT_INTERVAL_MS";
const IDLE_TIMEOUT_MS: &str = "IDLE_TIMEOUT_MS";
const BACKOFF_INITIAL_MS: &str = "BACKOFF_INITIAL_MS";
const BACKOFF_MAX_MS: &str = "BACKOFF_MAX_MS";
const SOURCE_MAX_RETRIES: &str = "SOURCE_MAX_RETRIES";

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Relay configuration. Every key has a default; `.env` is honoured.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_level: String,
    /// `token=restaurant` pairs, `*` for all restaurants
    pub auth_tokens: String,
    /// Where to persist the change source checkpoint; in memory when unset
    pub checkpoint_path: Option<PathBuf>,
    pub bus_capacity: usize,
    pub replay_capacity: usize,
    pub queue_capacity: usize,
    pub retired_connections: usize,
    pub write_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Zero disables the idle reaper
    pub idle_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Zero retries forever
    pub source_max_retries: u32,
}

impl Config {
    /// Reads the configuration from the environment and `.env`.
    pub fn try_from_env() -> Result<Config, ConfigError> {
        // Load .env file
        dotenv().ok();

        let config = Self::from_lookup(|key| env::var(key).ok())?;
        info!(
            "Loaded configuration: bind {}, replay capacity {}, queue capacity {}",
            config.bind_addr, config.replay_capacity, config.queue_capacity
        );
        Ok(config)
    }

    /// Builds a configuration from any key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let value = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Ok(Config {
            bind_addr: parse_or(&value, BIND_ADDR, defaults.bind_addr)?,
            log_level: value(LOG_LEVEL).unwrap_or(defaults.log_level),
            auth_tokens: value(AUTH_TOKENS).unwrap_or(defaults.auth_tokens),
            checkpoint_path: value(CHECKPOINT_PATH).map(PathBuf::from),
            bus_capacity: parse_or(&value, BUS_CAPACITY, defaults.bus_capacity)?,
            replay_capacity: parse_or(&value, REPLAY_CAPACITY, defaults.replay_capacity)?,
            queue_capacity: parse_or(&value, QUEUE_CAPACITY, defaults.queue_capacity)?,
            retired_connections: parse_or(&value, RETIRED_CONNECTIONS, defaults.retired_connections)?,
            write_timeout: millis_or(&value, WRITE_TIMEOUT_MS, defaults.write_timeout)?,
            heartbeat_interval: millis_or(&value, HEARTBEAT_INTERVAL_MS, defaults.heartbeat_interval)?,
            idle_timeout: millis_or(&value, IDLE_TIMEOUT_MS, defaults.idle_timeout)?,
            backoff_initial: millis_or(&value, BACKOFF_INITIAL_MS, defaults.backoff_initial)?,
            backoff_max: millis_or(&value, BACKOFF_MAX_MS, defaults.backoff_max)?,
            source_max_retries: parse_or(&value, SOURCE_MAX_RETRIES, defaults.source_max_retries)?,
        })
    }

    /// Settings for the delivery manager
    pub fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            queue_capacity: self.queue_capacity,
            write_timeout: self.write_timeout,
            heartbeat_interval: self.heartbeat_interval,
            idle_timeout: (!self.idle_timeout.is_zero()).then_some(self.idle_timeout),
        }
    }

    /// Retry policy for the change source
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.backoff_initial,
            max_delay: self.backoff_max,
            max_retries: (self.source_max_retries > 0).then_some(self.source_max_retries),
            ..BackoffConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            auth_tokens: String::new(),
            checkpoint_path: None,
            bus_capacity: 1024,
            replay_capacity: 1024,
            queue_capacity: 256,
            retired_connections: 1024,
            write_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
            source_max_retries: 10,
        }
    }
}

fn parse_or<T, V>(value: &V, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    V: Fn(&str) -> Option<String>,
{
    match value(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

fn millis_or<V>(value: &V, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    V: Fn(&str) -> Option<String>,
{
    parse_or(value, key, default.as_millis() as u64).map(Duration::from_millis)
}
