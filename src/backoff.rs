//! Backoff pacing for flaky backend calls.
//!
//! Everything this service does over a network falls into one of three
//! shapes, so the pacing lives in one enum instead of per-call-site tuning:
//! a storage connect must fail fast enough that a wrong URL surfaces at
//! startup, a storage query gets a brief second chance before its error
//! reaches the build, and the cache's background reconnection crawls
//! forever, never waiting more than the 3 seconds its degradation contract
//! allows between attempts.

use std::future::Future;

use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Pacing profile for [`with_backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// Initial connection to a storage backend. A handful of attempts
    /// within a few seconds; a misconfigured URL fails startup, it does
    /// not hang it.
    Connect,
    /// One storage operation inside a build or an operator request. Brief
    /// retries, then the caller gets the error.
    Query,
    /// Cache reconnection. Unbounded, 3 s ceiling between attempts, and
    /// only ever run where no caller is blocked on the result.
    Reconnect,
}

impl Pace {
    /// (first delay, delay ceiling, attempt limit)
    fn plan(self) -> (Duration, Duration, Option<u32>) {
        match self {
            Pace::Connect => (Duration::from_millis(250), Duration::from_secs(2), Some(4)),
            Pace::Query => (Duration::from_millis(50), Duration::from_secs(1), Some(3)),
            Pace::Reconnect => (Duration::from_secs(1), Duration::from_secs(3), None),
        }
    }
}

/// Drive `call` until it succeeds or the pace's attempt limit is spent,
/// doubling the delay between attempts up to the pace's ceiling.
///
/// The final error is returned unchanged; intermediate failures are logged
/// at `warn` and otherwise invisible to the caller.
pub async fn with_backoff<F, Fut, T, E>(op: &'static str, pace: Pace, mut call: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let (mut delay, ceiling, limit) = pace.plan();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match call().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(op, attempt, "backend call recovered");
                }
                return Ok(value);
            }
            Err(err) => {
                if limit.is_some_and(|max| attempt >= max) {
                    warn!(op, attempt, error = %err, "backend call failed; giving up");
                    return Err(err);
                }
                warn!(
                    op,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "backend call failed; backing off"
                );
                sleep(delay).await;
                delay = (delay * 2).min(ceiling);
            }
        }
    }
}
