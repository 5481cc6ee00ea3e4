//! Caller-side connect retry with exponential backoff.
//!
//! `Client::connect` never retries, and a failed connect leaves the handle
//! closed, so every attempt here opens a fresh client.

use std::path::Path;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ipc::client::{Client, Transport, TransportError};

/// Backoff schedule for `connect_with_retry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `0` behaves as `1`.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles after each later one.
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no sleeping.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to sleep after failed attempt number `attempt` (1-based).
    ///
    /// Exponential backoff: 100ms, 200ms, 400ms, ... capped at `max_delay_ms`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Open and connect a client, retrying connect failures per `policy`.
///
/// Useful at startup when the engine may still be creating its socket.
/// Only `TransportError::Connect` is retried; descriptor exhaustion is
/// returned immediately.
///
/// # Errors
///
/// Returns the last connection error if all attempts fail.
///
/// # Example
///
/// ```ignore
/// // Try up to 5 times with backoff
/// let client = connect_with_retry(&socket_path, &RetryPolicy::default())?;
/// ```
pub fn connect_with_retry(path: &Path, policy: &RetryPolicy) -> Result<Client, TransportError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let mut client = Client::open()?;
        match client.connect(path) {
            Ok(()) => {
                if attempt > 1 {
                    debug!(attempt, "Connected after retry");
                }
                return Ok(client);
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Connect failed; retrying"
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::os::unix::net::UnixListener;
    use std::path::PathBuf;
    use std::time::Instant;

    fn test_socket_path(test_name: &str) -> PathBuf {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        PathBuf::from(format!(
            "/tmp/ee-ipc-retry-{}-{}-{}.sock",
            test_name,
            std::process::id(),
            timestamp
        ))
    }

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(10), Duration::from_millis(2_000));
        assert_eq!(policy.delay_after(200), Duration::from_millis(2_000));
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let path = test_socket_path("give_up");
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 10,
            max_delay_ms: 100,
        };

        let started = Instant::now();
        let err = connect_with_retry(&path, &policy).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        // 10ms + 20ms of backoff between three attempts
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let path = test_socket_path("zero");
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        let started = Instant::now();
        assert!(connect_with_retry(&path, &policy).is_err());
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_connects_once_listener_appears() {
        let path = test_socket_path("late");
        let bind_path = path.clone();
        let server = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let listener = UnixListener::bind(&bind_path).expect("bind");
            listener.accept().map(|(stream, _)| stream)
        });

        let policy = RetryPolicy {
            max_attempts: 50,
            initial_delay_ms: 10,
            max_delay_ms: 20,
        };
        let client = connect_with_retry(&path, &policy).expect("should connect");
        assert!(client.is_connected());

        let _stream = server.join().unwrap().expect("accept");
        let _ = std::fs::remove_file(&path);
    }
}
