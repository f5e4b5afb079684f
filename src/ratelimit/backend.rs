//! Store trait for abstracting shared and in-process window storage.

use async_trait::async_trait;
use thiserror::Error;

use super::bucket::BucketKey;

/// Result of one atomic evict/count/conditional-append on a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether an entry was recorded for this request
    pub admitted: bool,
    /// Entries counted in the window before this request
    pub count: u64,
    /// Oldest entry still counted, after any append
    pub oldest_ms: Option<i64>,
}

/// The shared store could not serve a request.
///
/// Always recoverable: the limiter falls back to in-process counting.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),
    #[error("store call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

/// Trait for sliding window storage.
///
/// Implementations must make `try_admit` atomic per bucket: two concurrent
/// calls for the same key never both observe a free slot when only one
/// remains.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Short name for logs and health output.
    fn name(&self) -> &'static str;

    /// Evict entries with `ts <= now_ms - window_ms`, count the rest, and
    /// record `now_ms` if the count is below `limit`.
    async fn try_admit(
        &self,
        key: &BucketKey,
        now_ms: i64,
        window_ms: i64,
        limit: u64,
    ) -> Result<WindowOutcome, StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}
