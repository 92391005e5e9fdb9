use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::warn;

use crate::config::ExecutionConfig;
use crate::error::ExchangeError;
use crate::exchange::ExchangeResult;

/// Which errors are worth another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Transient faults only; abandoned on shutdown
    Entry,
    /// Everything except a missing position; never abandoned
    Exit,
}

/// How a retried venue call ended without success
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptFailure {
    /// The venue refused the request outright
    Rejected(ExchangeError),
    /// The venue reports nothing left to close
    NoPosition(ExchangeError),
    /// Attempts used up
    Exhausted { attempts: u32, last: ExchangeError },
    /// A fault neither retried nor classed as a rejection
    Fatal(ExchangeError),
    /// Shutdown observed between attempts
    Cancelled,
}

/// `base * 2^(attempt-1)`, capped.
pub fn backoff_delay(config: &ExecutionConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let ms = config
        .base_backoff_ms
        .saturating_mul(1u64 << exp)
        .min(config.max_backoff_ms);
    Duration::from_millis(ms)
}

/// Run `op` until it succeeds or `policy` gives up.
pub async fn with_retry<T, F, Fut>(
    config: &ExecutionConfig,
    policy: RetryPolicy,
    shutdown: &watch::Receiver<bool>,
    what: &str,
    mut op: F,
) -> Result<T, AttemptFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ExchangeResult<T>>,
{
    let max_attempts = config.max_retries.max(1);
    let mut shutdown = shutdown.clone();
    let mut attempt = 0;

    loop {
        if policy == RetryPolicy::Entry && *shutdown.borrow() {
            return Err(AttemptFailure::Cancelled);
        }
        attempt += 1;

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match policy {
            RetryPolicy::Entry if err.is_rejection() => return Err(AttemptFailure::Rejected(err)),
            RetryPolicy::Entry if !err.is_transient() => return Err(AttemptFailure::Fatal(err)),
            RetryPolicy::Exit if matches!(err, ExchangeError::NoPosition(_)) => {
                return Err(AttemptFailure::NoPosition(err))
            }
            _ => {}
        }

        if attempt >= max_attempts {
            return Err(AttemptFailure::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let delay = backoff_delay(config, attempt);
        warn!(
            "{} attempt {}/{} failed: {}. Retrying in {}ms",
            what,
            attempt,
            max_attempts,
            err,
            delay.as_millis()
        );

        if policy == RetryPolicy::Entry {
            tokio::select! {
                _ = sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => return Err(AttemptFailure::Cancelled),
            }
        } else {
            sleep(delay).await;
        }
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // sender gone: shutdown can no longer be requested
            std::future::pending::<()>().await;
        }
    }
}
