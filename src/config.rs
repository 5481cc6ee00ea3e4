//! Transport configuration: where the engine socket lives and how long to wait.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::ipc::{connect_with_retry, Client, RetryPolicy, TransportError};

/// Environment variable naming the engine socket path.
pub const SOCKET_ENV: &str = "EE_IPC_SOCKET";
/// Environment variable for the read timeout in milliseconds.
pub const READ_TIMEOUT_ENV: &str = "EE_IPC_READ_TIMEOUT_MS";
/// Environment variable for the write timeout in milliseconds.
pub const WRITE_TIMEOUT_ENV: &str = "EE_IPC_WRITE_TIMEOUT_MS";

const SOCKET_FILE_NAME: &str = "ee.sock";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Resolve the default socket path for the execution engine.
///
/// Resolution order:
/// 1. `$XDG_RUNTIME_DIR/ee.sock` (Linux standard)
/// 2. `~/Library/Caches/ee.sock` (macOS)
/// 3. `/tmp/ee.sock` (fallback)
pub fn default_socket_path() -> PathBuf {
    // Try XDG_RUNTIME_DIR first (Linux standard, per-user)
    if let Some(runtime_dir) = std::env::var("XDG_RUNTIME_DIR")
        .ok()
        .filter(|dir| !dir.is_empty())
    {
        return PathBuf::from(runtime_dir).join(SOCKET_FILE_NAME);
    }

    if let Some(cache_dir) = dirs::cache_dir() {
        return cache_dir.join(SOCKET_FILE_NAME);
    }

    PathBuf::from("/tmp").join(SOCKET_FILE_NAME)
}

/// Everything needed to reach the engine.
///
/// Deserializes from JSON; every field is optional:
///
/// ```json
/// {
///   "socket_path": "/run/user/1000/ee.sock",
///   "read_timeout_ms": 5000,
///   "retry": { "max_attempts": 10 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub socket_path: PathBuf,
    /// `None` or `0` blocks indefinitely.
    pub read_timeout_ms: Option<u64>,
    /// `None` or `0` blocks indefinitely.
    pub write_timeout_ms: Option<u64>,
    pub retry: RetryPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            read_timeout_ms: None,
            write_timeout_ms: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl TransportConfig {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults overridden by `EE_IPC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup(SOCKET_ENV).filter(|p| !p.is_empty()) {
            config.socket_path = PathBuf::from(path);
        }
        if let Some(ms) = parse_millis(&lookup, READ_TIMEOUT_ENV)? {
            config.read_timeout_ms = Some(ms);
        }
        if let Some(ms) = parse_millis(&lookup, WRITE_TIMEOUT_ENV)? {
            config.write_timeout_ms = Some(ms);
        }

        Ok(config)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
    }

    /// Connect to the configured socket, applying retry policy and timeouts.
    pub fn connect(&self) -> Result<Client, TransportError> {
        debug!(path = %self.socket_path.display(), "Connecting to engine");
        let mut client = connect_with_retry(&self.socket_path, &self.retry)?;
        client.set_read_timeout(self.read_timeout())?;
        client.set_write_timeout(self.write_timeout())?;
        Ok(client)
    }
}

fn parse_millis<F>(lookup: &F, var: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
    }
}
