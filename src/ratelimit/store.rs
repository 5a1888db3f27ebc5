//! Window counter store contract.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors a counter store can report.
///
/// The limiter treats every variant the same way: it admits the request.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or the command failed in transit
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the configured bound
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with something the limiter cannot interpret
    #[error("unexpected store response: {0}")]
    Protocol(String),
}

/// A shared counter store keyed by client.
///
/// Implementations must be safe to call from many concurrent requests.
/// Counters are integers with second-granularity expiry.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Current count for `key`, or `None` when no window is active.
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Create or overwrite the counter and set its expiry.
    async fn set_with_expiry(&self, key: &str, value: u64, ttl_secs: u64)
        -> Result<(), StoreError>;

    /// Add one to an existing counter.
    ///
    /// A missing key is left untouched; this never creates a counter
    /// without an expiry.
    async fn increment(&self, key: &str) -> Result<(), StoreError>;

    /// Seconds until the counter expires. Zero when the key is already gone.
    async fn ttl(&self, key: &str) -> Result<u64, StoreError>;
}
