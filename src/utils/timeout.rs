//! Timeout guard for storage calls

use std::future::Future;
use std::time::Duration;

use crate::types::*;

/// Run a storage call with a time limit.
///
/// Expiry becomes [`ReconError::Timeout`], which batch stages treat as a
/// per-transaction failure.
pub async fn with_timeout<T, F>(limit: Duration, operation: &str, future: F) -> ReconResult<T>
where
    F: Future<Output = ReconResult<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(ReconError::Timeout(format!(
            "{operation} exceeded {}ms",
            limit.as_millis()
        ))),
    }
}
