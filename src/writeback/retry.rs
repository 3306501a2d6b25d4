//! Retry with exponential backoff and the failure history

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{error, warn};

use crate::remote::RemoteError;

/// Maximum number of permanent failures kept for inspection
const MAX_FAILURE_HISTORY: usize = 64;

/// Backoff schedule for retryable remote errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    /// Execute an operation with retry logic and exponential backoff.
    ///
    /// Only errors for which `RemoteError::is_retryable` holds are retried;
    /// anything else is returned immediately.
    pub async fn run<T, F, Fut>(&self, operation: &str, key: &str, mut f: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    attempt += 1;
                    warn!(
                        operation = operation,
                        key = key,
                        attempt = attempt,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying remote operation"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A write-back operation that could not be applied
#[derive(Debug, Clone)]
pub struct FailureEntry {
    /// Seconds since the epoch
    pub timestamp: u64,
    pub operation: String,
    pub path: String,
    pub error: String,
}

/// Ring buffer of recent permanent failures
#[derive(Default)]
pub struct FailureLog {
    entries: Mutex<VecDeque<FailureEntry>>,
}

impl FailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<FailureEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Log the failure and keep it in the history
    pub fn record(&self, operation: &str, path: &str, err: &RemoteError) {
        error!(
            operation = operation,
            path = path,
            error = %err,
            "Write-back operation failed permanently"
        );

        let entry = FailureEntry {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            operation: operation.to_string(),
            path: path.to_string(),
            error: err.to_string(),
        };

        let mut entries = self.entries();
        if entries.len() >= MAX_FAILURE_HISTORY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Recent failures, oldest first
    pub fn recent(&self) -> Vec<FailureEntry> {
        self.entries().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
