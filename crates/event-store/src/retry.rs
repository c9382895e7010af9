//! Backoff for transient storage failures.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::{EventStoreError, Result};

/// Backoff used at the store boundary.
///
/// - Min delay: 20ms
/// - Max delay: 1s
/// - Max attempts: 5
/// - Jitter enabled
pub fn storage_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(20))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(5)
        .with_jitter()
}

/// Runs `op`, retrying while it fails with a transient error.
pub async fn with_retry<T, F, Fut>(operation: &'static str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    op.retry(storage_backoff())
        .when(EventStoreError::is_transient)
        .notify(|err, delay| {
            tracing::warn!(operation, error = %err, ?delay, "transient storage failure, retrying");
            metrics::counter!("event_store_retries_total", "operation" => operation).increment(1);
        })
        .await
}
