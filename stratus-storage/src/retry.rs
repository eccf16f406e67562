//! Bounded retry with progress-aware reset.
//!
//! A logical operation (one file transfer, one listing) is retried on
//! transient transport failures. The operation receives a [`RetrySignal`];
//! calling [`RetrySignal::reset`] once real progress has been made (for
//! example the first body byte arrived) restarts the attempt budget, so a
//! long transfer that stalls several times is not failed by stalls spread
//! across otherwise productive attempts.

use crate::config::StorageConfig;
use crate::error::StorageResult;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Linear backoff step; the n-th consecutive retry waits `n * delay`.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.retry_attempts, config.retry_delay())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&StorageConfig::default())
    }
}

/// Handed to each attempt to report forward progress.
#[derive(Clone, Debug, Default)]
pub struct RetrySignal {
    progressed: Arc<AtomicBool>,
}

impl RetrySignal {
    /// Marks that the current attempt made real progress.
    pub fn reset(&self) {
        self.progressed.store(true, Ordering::Relaxed);
    }

    pub fn progressed(&self) -> bool {
        self.progressed.load(Ordering::Relaxed)
    }
}

/// Runs `op` until it succeeds, fails permanently, or exhausts the policy.
///
/// Only transient errors are retried; the last error is returned once the
/// budget is spent.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> StorageResult<T>
where
    F: FnMut(RetrySignal) -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let signal = RetrySignal::default();
        match op(signal.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                if signal.progressed() {
                    info!("{what}: progress made before failure, retry budget restarted");
                    attempt = 1;
                }
                if attempt >= policy.max_attempts {
                    warn!("{what}: giving up after {attempt} attempts: {err}");
                    return Err(err);
                }
                warn!(
                    "{what}: {err}. retrying (attempt {}/{})",
                    attempt + 1,
                    policy.max_attempts
                );
                let wait = policy.delay * attempt;
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
}
