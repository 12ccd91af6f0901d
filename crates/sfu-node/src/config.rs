//! SFU node configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::admission::{AdmissionConfig, RateLimit};

/// Default WebSocket gateway and routing RPC bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default base URL peers use to reach this node.
pub const DEFAULT_ADVERTISED_ADDRESS: &str = "http://127.0.0.1:8080";

/// Default routing-context capacity advertised at registration.
pub const DEFAULT_NODE_CAPACITY: u32 = 1000;

/// Default `iat` tolerance in seconds.
pub const DEFAULT_CLOCK_SKEW_SECONDS: u64 = 300;

/// Largest accepted `iat` tolerance in seconds.
pub const MAX_CLOCK_SKEW_SECONDS: u64 = 600;

pub const DEFAULT_WORKER_RESTART_DELAY_MS: u64 = 2000;
pub const DEFAULT_RESOURCE_SAMPLE_INTERVAL_SECONDS: u64 = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 5;
pub const DEFAULT_HEARTBEAT_TTL_SECONDS: u64 = 15;
pub const DEFAULT_ALLOCATION_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_PROBE_INTERVAL_SECONDS: u64 = 25;
pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 60;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Connection admission defaults (per source address).
pub const DEFAULT_CONNECTION_RATE_LIMIT: u32 = 20;
pub const DEFAULT_CONNECTION_RATE_WINDOW_SECONDS: u64 = 60;
pub const DEFAULT_CONNECTION_BLOCK_SECONDS: u64 = 300;

/// Message admission defaults.
pub const DEFAULT_MESSAGE_RATE_LIMIT: u32 = 50;
pub const DEFAULT_MESSAGE_RATE_WINDOW_SECONDS: u64 = 1;
pub const DEFAULT_USER_MESSAGE_RATE_LIMIT: u32 = 150;
pub const DEFAULT_USER_MESSAGE_RATE_WINDOW_SECONDS: u64 = 1;
pub const DEFAULT_MESSAGE_BLOCK_SECONDS: u64 = 10;

pub const DEFAULT_REMOTE_ROOM_RECONCILE_SECONDS: u64 = 5;

/// Default node ID prefix.
pub const DEFAULT_NODE_ID_PREFIX: &str = "sfu";

/// Where cluster coordination state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationBackend {
    Redis,
    /// In-process store; only meaningful for a single node.
    Memory,
}

impl FromStr for CoordinationBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "redis" => Ok(CoordinationBackend::Redis),
            "memory" => Ok(CoordinationBackend::Memory),
            other => Err(ConfigError::InvalidValue(format!(
                "COORDINATION_BACKEND must be 'redis' or 'memory', got '{other}'"
            ))),
        }
    }
}

/// SFU node configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Unique identifier for this node in the cluster registry.
    pub node_id: String,

    pub bind_address: String,

    pub health_bind_address: String,

    /// Base URL peers use for the internal routing RPC.
    pub advertised_address: String,

    pub node_capacity: u32,

    pub coordination_backend: CoordinationBackend,

    /// Coordination store URL, required for the redis backend.
    /// Protected by `SecretString` since it may embed a password.
    pub redis_url: Option<SecretString>,

    /// Ed25519 public key (PEM) for user tokens.
    pub auth_public_key_pem: String,

    pub clock_skew: Duration,

    /// Bearer secret guarding the internal routing RPC.
    pub cluster_secret: SecretString,

    pub worker_count: usize,

    pub worker_restart_delay: Duration,

    pub resource_sample_interval: Duration,

    pub heartbeat_interval: Duration,

    /// Must exceed `heartbeat_interval`.
    pub heartbeat_ttl: Duration,

    pub allocation_timeout: Duration,

    pub probe_interval: Duration,

    pub idle_timeout: Duration,

    pub max_message_bytes: usize,

    pub admission: AdmissionConfig,

    pub remote_room_reconcile_interval: Duration,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("node_id", &self.node_id)
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("advertised_address", &self.advertised_address)
            .field("node_capacity", &self.node_capacity)
            .field("coordination_backend", &self.coordination_backend)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field("clock_skew", &self.clock_skew)
            .field("cluster_secret", &"[REDACTED]")
            .field("worker_count", &self.worker_count)
            .field("worker_restart_delay", &self.worker_restart_delay)
            .field("resource_sample_interval", &self.resource_sample_interval)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_ttl", &self.heartbeat_ttl)
            .field("allocation_timeout", &self.allocation_timeout)
            .field("probe_interval", &self.probe_interval)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_message_bytes", &self.max_message_bytes)
            .field("admission", &self.admission)
            .field(
                "remote_room_reconcile_interval",
                &self.remote_room_reconcile_interval,
            )
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// See [`Config::from_vars`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// `MissingEnvVar` for an absent required variable, `InvalidValue` for a
    /// value that does not parse or violates a bound.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let coordination_backend = match vars.get("COORDINATION_BACKEND") {
            Some(value) => value.parse()?,
            None => CoordinationBackend::Redis,
        };

        let redis_url = vars.get("REDIS_URL").cloned().map(SecretString::from);
        if coordination_backend == CoordinationBackend::Redis && redis_url.is_none() {
            return Err(ConfigError::MissingEnvVar("REDIS_URL".to_string()));
        }

        let auth_public_key_pem = required(vars, "AUTH_PUBLIC_KEY_PEM")?;
        let cluster_secret = SecretString::from(required(vars, "CLUSTER_SECRET")?);

        let bind_address = vars
            .get("SFU_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SFU_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let advertised_address = vars
            .get("SFU_ADVERTISED_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ADVERTISED_ADDRESS.to_string());

        let node_capacity = parse_or(vars, "SFU_NODE_CAPACITY", DEFAULT_NODE_CAPACITY)?;

        let clock_skew_seconds = parse_or(vars, "AUTH_CLOCK_SKEW_SECONDS", DEFAULT_CLOCK_SKEW_SECONDS)?;
        if clock_skew_seconds > MAX_CLOCK_SKEW_SECONDS {
            return Err(ConfigError::InvalidValue(format!(
                "AUTH_CLOCK_SKEW_SECONDS must be at most {MAX_CLOCK_SKEW_SECONDS}, got {clock_skew_seconds}"
            )));
        }

        let worker_count = match vars.get("SFU_WORKER_COUNT") {
            Some(_) => parse_or(vars, "SFU_WORKER_COUNT", 1usize)?,
            None => std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
        };
        if worker_count == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_WORKER_COUNT must be at least 1".to_string(),
            ));
        }

        let heartbeat_interval = seconds(vars, "NODE_HEARTBEAT_INTERVAL_SECONDS", DEFAULT_HEARTBEAT_INTERVAL_SECONDS)?;
        let heartbeat_ttl = seconds(vars, "NODE_HEARTBEAT_TTL_SECONDS", DEFAULT_HEARTBEAT_TTL_SECONDS)?;
        if heartbeat_ttl <= heartbeat_interval {
            return Err(ConfigError::InvalidValue(format!(
                "NODE_HEARTBEAT_TTL_SECONDS ({}) must exceed NODE_HEARTBEAT_INTERVAL_SECONDS ({})",
                heartbeat_ttl.as_secs(),
                heartbeat_interval.as_secs()
            )));
        }

        let probe_interval = seconds(vars, "CONNECTION_PROBE_INTERVAL_SECONDS", DEFAULT_PROBE_INTERVAL_SECONDS)?;
        let idle_timeout = seconds(vars, "CONNECTION_IDLE_TIMEOUT_SECONDS", DEFAULT_IDLE_TIMEOUT_SECONDS)?;

        let message_block = seconds(vars, "MESSAGE_BLOCK_SECONDS", DEFAULT_MESSAGE_BLOCK_SECONDS)?;
        let admission = AdmissionConfig {
            connection: RateLimit {
                limit: parse_or(vars, "CONNECTION_RATE_LIMIT", DEFAULT_CONNECTION_RATE_LIMIT)?,
                window: seconds(vars, "CONNECTION_RATE_WINDOW_SECONDS", DEFAULT_CONNECTION_RATE_WINDOW_SECONDS)?,
                block: seconds(vars, "CONNECTION_BLOCK_SECONDS", DEFAULT_CONNECTION_BLOCK_SECONDS)?,
            },
            connection_messages: RateLimit {
                limit: parse_or(vars, "MESSAGE_RATE_LIMIT", DEFAULT_MESSAGE_RATE_LIMIT)?,
                window: seconds(vars, "MESSAGE_RATE_WINDOW_SECONDS", DEFAULT_MESSAGE_RATE_WINDOW_SECONDS)?,
                block: message_block,
            },
            user_messages: RateLimit {
                limit: parse_or(vars, "USER_MESSAGE_RATE_LIMIT", DEFAULT_USER_MESSAGE_RATE_LIMIT)?,
                window: seconds(vars, "USER_MESSAGE_RATE_WINDOW_SECONDS", DEFAULT_USER_MESSAGE_RATE_WINDOW_SECONDS)?,
                block: message_block,
            },
        };

        // Generate node ID
        let node_id = vars.get("SFU_NODE_ID").cloned().unwrap_or_else(|| {
            let host = vars
                .get("HOSTNAME")
                .cloned()
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
            format!("{DEFAULT_NODE_ID_PREFIX}-{host}")
        });

        Ok(Config {
            node_id,
            bind_address,
            health_bind_address,
            advertised_address,
            node_capacity,
            coordination_backend,
            redis_url,
            auth_public_key_pem,
            clock_skew: Duration::from_secs(clock_skew_seconds),
            cluster_secret,
            worker_count,
            worker_restart_delay: Duration::from_millis(parse_or(
                vars,
                "WORKER_RESTART_DELAY_MS",
                DEFAULT_WORKER_RESTART_DELAY_MS,
            )?),
            resource_sample_interval: seconds(
                vars,
                "RESOURCE_SAMPLE_INTERVAL_SECONDS",
                DEFAULT_RESOURCE_SAMPLE_INTERVAL_SECONDS,
            )?,
            heartbeat_interval,
            heartbeat_ttl,
            allocation_timeout: Duration::from_millis(parse_or(
                vars,
                "ALLOCATION_TIMEOUT_MS",
                DEFAULT_ALLOCATION_TIMEOUT_MS,
            )?),
            probe_interval,
            idle_timeout,
            max_message_bytes: parse_or(vars, "MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES)?,
            admission,
            remote_room_reconcile_interval: seconds(
                vars,
                "REMOTE_ROOM_RECONCILE_SECONDS",
                DEFAULT_REMOTE_ROOM_RECONCILE_SECONDS,
            )?,
        })
    }
}

fn required(vars: &HashMap<String, String>, name: &str) -> Result<String, ConfigError> {
    vars.get(name)
        .filter(|v| !v.trim().is_empty())
        .cloned()
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn parse_or<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(value) => value.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(format!("{name} must be a number, got '{value}'"))
        }),
        None => Ok(default),
    }
}

/// A positive number of seconds.
fn seconds(vars: &HashMap<String, String>, name: &str, default: u64) -> Result<Duration, ConfigError> {
    let value: u64 = parse_or(vars, name, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "{name} must be greater than 0"
        )));
    }
    Ok(Duration::from_secs(value))
}
