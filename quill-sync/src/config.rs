//! Server configuration, read from the environment at startup.
//!
//! | Variable                | Meaning                           | Default        |
//! |-------------------------|-----------------------------------|----------------|
//! | `STORE_PATH`            | RocksDB directory (required)      | none           |
//! | `PORT`                  | sync and control port             | `1234`         |
//! | `BIND_HOST`             | listen host                       | `0.0.0.0`      |
//! | `DEFAULT_ROOM`          | room for connections with no path | `default`      |
//! | `EPHEMERAL_ROOM`        | room never persisted              | `landing-demo` |
//! | `SHUTDOWN_TIMEOUT_SECS` | bound on the shutdown drain       | `10`           |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_PORT: u16 = 1234;
pub const DEFAULT_ROOM: &str = "default";
pub const EPHEMERAL_ROOM: &str = "landing-demo";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("STORE_PATH is not set; refusing to start without a store")]
    MissingStorePath,
    #[error("invalid port in {var}: '{value}'")]
    InvalidPort { var: &'static str, value: String },
    #[error("invalid listen address '{0}'")]
    InvalidAddr(String),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address shared by WebSocket sync and the HTTP control routes
    pub bind_addr: SocketAddr,
    /// RocksDB directory
    pub store_path: PathBuf,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Room used when the request path is empty
    pub default_room: String,
    /// Room excluded from persistence
    pub ephemeral_room: String,
    /// Upper bound on the shutdown drain
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            store_path: PathBuf::from("quill_data"),
            broadcast_capacity: 256,
            default_room: DEFAULT_ROOM.to_string(),
            ephemeral_room: EPHEMERAL_ROOM.to_string(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Build from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let store_path = get("STORE_PATH")
            .map(PathBuf::from)
            .ok_or(ConfigError::MissingStorePath)?;

        let port = match get("PORT") {
            Some(value) => parse_port("PORT", &value)?,
            None => DEFAULT_PORT,
        };

        let host = get("BIND_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let bind_addr = parse_addr(&host, port)?;

        let shutdown_timeout = match get("SHUTDOWN_TIMEOUT_SECS") {
            Some(value) => value
                .parse::<u64>()
                .map(Duration::from_secs)
                .unwrap_or_else(|_| {
                    log::warn!("Ignoring invalid SHUTDOWN_TIMEOUT_SECS '{value}'");
                    defaults.shutdown_timeout
                }),
            None => defaults.shutdown_timeout,
        };

        Ok(Self {
            bind_addr,
            store_path,
            broadcast_capacity: defaults.broadcast_capacity,
            default_room: get("DEFAULT_ROOM").unwrap_or(defaults.default_room),
            ephemeral_room: get("EPHEMERAL_ROOM").unwrap_or(defaults.ephemeral_room),
            shutdown_timeout,
        })
    }

    /// Loopback config on ephemeral ports, for tests.
    pub fn for_testing(store_path: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            store_path: store_path.into(),
            shutdown_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }
}

fn parse_port(var: &'static str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidPort {
        var,
        value: value.to_string(),
    })
}

fn parse_addr(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let candidate = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    candidate
        .parse()
        .map_err(|_| ConfigError::InvalidAddr(candidate))
}
