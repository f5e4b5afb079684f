//! Sliding window log for a single bucket.

use std::collections::VecDeque;

use super::backend::WindowOutcome;

/// Ordered log of admitted request timestamps (milliseconds) for one bucket.
///
/// Not synchronized; callers hold the bucket lock for the whole
/// evict/count/append sequence.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindow {
    /// Admitted timestamps, oldest first
    entries: VecDeque<i64>,
    /// Window length this log was last evaluated with
    window_ms: i64,
}

impl SlidingWindow {
    /// Create an empty window log.
    pub fn new(window_ms: i64) -> Self {
        Self {
            entries: VecDeque::new(),
            window_ms,
        }
    }

    /// Drop every entry with `ts <= now - window`. Returns how many were removed.
    pub fn evict(&mut self, now_ms: i64) -> usize {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        let before = self.entries.len();

        while self.entries.front().is_some_and(|&ts| ts <= cutoff) {
            self.entries.pop_front();
        }

        before - self.entries.len()
    }

    /// Evict expired entries, then record `now` if fewer than `limit` remain.
    pub fn try_admit(&mut self, now_ms: i64, window_ms: i64, limit: u64) -> WindowOutcome {
        self.window_ms = window_ms;
        self.evict(now_ms);

        let count = self.entries.len() as u64;
        let admitted = count < limit;

        if admitted {
            // Keep the log ordered even if the caller's clock stepped back.
            let ts = self.entries.back().map_or(now_ms, |&last| last.max(now_ms));
            self.entries.push_back(ts);
        }

        WindowOutcome {
            admitted,
            count,
            oldest_ms: self.oldest(),
        }
    }

    /// Oldest counted timestamp.
    pub fn oldest(&self) -> Option<i64> {
        self.entries.front().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
