//! Time helpers shared by every cross-context call.

use std::future::Future;
use std::time::Duration;

use crate::error::HostError;

/// Sleep on the tokio timer.
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Race a host round trip against `duration`.
///
/// Expiry surfaces as [`HostError::TimedOut`], indistinguishable for callers
/// from any other failed round trip.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, HostError>
where
    F: Future<Output = Result<T, HostError>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(HostError::TimedOut(duration)),
    }
}
