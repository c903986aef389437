//! Fixed-interval retry for the readiness probe.
//!
//! The readiness probe retries on a fixed 3 second cadence; the eviction
//! loop has its own 2 second pause in [`crate::pods`]. The two policies are
//! deliberately kept separate.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{Error, Result};

/// Run `operation` until it succeeds, sleeping `interval` between attempts.
///
/// Returns [`Error::Cancelled`] as soon as the shutdown token fires, whether
/// during an attempt or during the pause between attempts. Every failed
/// attempt is logged and retried; there is no attempt cap.
pub async fn retry_every<F, Fut, T>(
    interval: Duration,
    shutdown: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(error) => {
                warn!(
                    operation = %operation_name,
                    error = %error,
                    "retry predicate returned error"
                );
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
