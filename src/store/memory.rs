//! In-process window store.
//!
//! Counts are local to this process. Used as the degraded-mode fallback and
//! as the only store in single-instance deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::ratelimit::{BucketKey, SlidingWindow, StoreError, WindowOutcome, WindowStore};

/// Sliding window logs keyed by bucket.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: DashMap<BucketKey, SlidingWindow>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evict and count under the bucket's entry lock.
    pub fn admit(&self, key: &BucketKey, now_ms: i64, window_ms: i64, limit: u64) -> WindowOutcome {
        let mut window = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| SlidingWindow::new(window_ms));
        window.try_admit(now_ms, window_ms, limit)
    }

    /// Drop expired entries everywhere and forget buckets left empty.
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&self, now_ms: i64) -> usize {
        let mut removed = 0;
        self.buckets.retain(|_, window| {
            removed += window.evict(now_ms);
            !window.is_empty()
        });

        if removed > 0 {
            debug!(removed, buckets = self.buckets.len(), "Purged expired rate limit entries");
        }
        removed
    }

    /// Number of buckets currently tracked.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of entries recorded for a bucket, without evicting.
    #[cfg(test)]
    pub(crate) fn entry_count(&self, key: &BucketKey) -> usize {
        self.buckets.get(key).map_or(0, |w| w.len())
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn try_admit(
        &self,
        key: &BucketKey,
        now_ms: i64,
        window_ms: i64,
        limit: u64,
    ) -> Result<WindowOutcome, StoreError> {
        Ok(self.admit(key, now_ms, window_ms, limit))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Classification;
    use std::sync::Arc;

    fn key(client: &str) -> BucketKey {
        BucketKey::new(Classification::Auth, client)
    }

    #[test]
    fn test_buckets_are_independent() {
        let store = MemoryStore::new();

        assert!(store.admit(&key("a"), 0, 1_000, 1).admitted);
        assert!(!store.admit(&key("a"), 10, 1_000, 1).admitted);
        assert!(store.admit(&key("b"), 10, 1_000, 1).admitted);

        let other_class = BucketKey::new(Classification::Search, "a");
        assert!(store.admit(&other_class, 10, 1_000, 1).admitted);
        assert_eq!(store.bucket_count(), 3);
    }

    #[test]
    fn test_purge_expired() {
        let store = MemoryStore::new();
        store.admit(&key("a"), 0, 1_000, 10);
        store.admit(&key("a"), 500, 1_000, 10);
        store.admit(&key("b"), 900, 5_000, 10);

        assert_eq!(store.purge_expired(1_200), 1);
        assert_eq!(store.entry_count(&key("a")), 1);

        assert_eq!(store.purge_expired(2_000), 1);
        assert_eq!(store.bucket_count(), 1);
        assert_eq!(store.entry_count(&key("b")), 1);
    }

    #[tokio::test]
    async fn test_trait_impl() {
        let store = MemoryStore::new();
        tokio_test::assert_ok!(store.ping().await);

        let outcome = store.try_admit(&key("a"), 0, 1_000, 2).await.unwrap();
        assert!(outcome.admitted);
        assert_eq!(store.name(), "memory");
    }

    #[test]
    fn test_concurrent_admissions_bounded() {
        let store = Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.admit(&key("shared"), 100, 60_000, 5).admitted)
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&a| a)
            .count();

        assert_eq!(admitted, 5);
        assert_eq!(store.entry_count(&key("shared")), 5);
    }
}
