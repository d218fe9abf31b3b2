//! Bounded fixed-delay retry
//!
//! Stat, hash and directory-listing calls can fail transiently, e.g. when
//! another process holds a file open exclusively. [`RetryPolicy::run`]
//! repeats such an operation a bounded number of times with a fixed delay.
//! `NotFound` and `Unsupported` errors are returned at once: a vanished path
//! does not come back, and a special file does not turn into a regular one.

use std::future::Future;
use std::io::{self, ErrorKind};
use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};
use treesync_core::config::ProbeConfig;

/// How often and how patiently to retry a filesystem operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` counts the first try; values below 1 are raised to 1
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn from_config(config: &ProbeConfig) -> Self {
        Self::new(config.max_attempts, config.retry_delay())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs `f` until it succeeds, fails permanently, or attempts run out
    ///
    /// The last error is returned when every attempt failed.
    pub async fn run<F, Fut, T>(&self, operation: &str, path: &Path, mut f: F) -> io::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, path = %path.display(), attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if is_permanent(&err) => return Err(err),
                Err(err) if attempt < self.max_attempts => {
                    warn!(
                        operation,
                        path = %path.display(),
                        attempt,
                        delay_ms = self.delay.as_millis() as u64,
                        error = %err,
                        "Filesystem operation failed, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_permanent(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::NotFound | ErrorKind::Unsupported)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ProbeConfig::default())
    }
}
