//! Timeout helper for network-bound futures.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::PwaKitError;

/// Run an operation with a timeout.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> Result<T, PwaKitError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation()).await.map_err(|_| {
        debug!(?timeout, "Operation timed out");
        PwaKitError::Timeout(timeout)
    })
}
