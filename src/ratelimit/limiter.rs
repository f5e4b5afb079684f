//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::backend::{StoreError, WindowOutcome, WindowStore};
use super::bucket::BucketKey;
use super::classify::{Classification, Classifier};
use super::rules::{RateLimitRule, RuleTable};
use crate::error::Result;
use crate::store::MemoryStore;

/// Default bound on a single shared store round trip.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(100);
/// Default minimum spacing between probes of a degraded shared store.
const DEFAULT_REPROBE_INTERVAL: Duration = Duration::from_secs(1);
/// Default bound on an out-of-band health probe.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which store is currently counting requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Counting in the shared store
    Shared,
    /// Shared store unreachable, counting in-process
    Degraded,
    /// No shared store configured
    Local,
}

/// Tuning for shared store calls.
#[derive(Debug, Clone, Copy)]
pub struct LimiterOptions {
    /// Upper bound on one shared store call before falling back
    pub store_timeout: Duration,
    /// While degraded, probe the shared store at most this often
    pub reprobe_interval: Duration,
    /// Upper bound on [`RateLimiter::probe`], which runs outside the request path
    pub probe_timeout: Duration,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            reprobe_interval: DEFAULT_REPROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Outcome of a rate limit check. Computed, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// The classification the request was counted under
    pub classification: Classification,
    /// Whether the request may proceed
    pub allowed: bool,
    /// The rule's `max_requests`
    pub limit: u64,
    /// Slots left in the current window; 0 when rejected
    pub remaining: u64,
    /// When the oldest counted entry expires
    pub reset_at: DateTime<Utc>,
    /// Seconds until a retry can succeed; 0 when allowed
    pub retry_after_seconds: u64,
}

impl RateLimitDecision {
    /// `reset_at` as unix seconds, rounded up.
    pub fn reset_unix(&self) -> i64 {
        ceil_div(self.reset_at.timestamp_millis(), 1000)
    }
}

#[derive(Debug)]
struct ModeState {
    degraded: bool,
    /// Last failed or attempted probe while degraded
    last_probe: Option<Instant>,
}

/// Sliding window log rate limiter.
///
/// Counts in the shared store when one is configured and reachable, and in
/// an in-process [`MemoryStore`] otherwise. Safe to share across tasks.
pub struct RateLimiter {
    rules: RuleTable,
    classifier: Classifier,
    primary: Option<Arc<dyn WindowStore>>,
    fallback: MemoryStore,
    options: LimiterOptions,
    state: Mutex<ModeState>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rules", &self.rules)
            .field("classifier", &self.classifier)
            .field("primary", &self.primary.as_ref().map(|p| p.name()))
            .field("mode", &self.mode())
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter.
    ///
    /// Fails with a configuration error if any classification the
    /// classifier can produce lacks a valid rule.
    pub fn new(
        rules: RuleTable,
        classifier: Classifier,
        primary: Option<Arc<dyn WindowStore>>,
        options: LimiterOptions,
    ) -> Result<Self> {
        rules.validate(&classifier)?;

        Ok(Self {
            rules,
            classifier,
            primary,
            fallback: MemoryStore::new(),
            options,
            state: Mutex::new(ModeState {
                degraded: false,
                last_probe: None,
            }),
        })
    }

    /// Create a rate limiter that only counts in-process.
    pub fn local(rules: RuleTable, classifier: Classifier) -> Result<Self> {
        Self::new(rules, classifier, None, LimiterOptions::default())
    }

    /// Classify a request path.
    pub fn classify(&self, path: &str) -> Classification {
        self.classifier.classify(path)
    }

    /// Classify `path` and check it for `client`.
    pub async fn check_request(
        &self,
        path: &str,
        client: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision> {
        self.check_and_record(self.classify(path), client, now).await
    }

    /// Check a request against its classification's rule, recording it if
    /// admitted. Rejected requests do not consume quota.
    pub async fn check_and_record(
        &self,
        classification: Classification,
        client: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision> {
        let rule = *self.rules.get(classification)?;
        let key = BucketKey::new(classification, client);
        let now_ms = now.timestamp_millis();

        trace!(key = %key, now_ms, "Checking rate limit");

        let outcome = self
            .admit(&key, now_ms, rule.window_ms(), rule.max_requests)
            .await;
        let decision = decide(classification, &rule, &outcome, now_ms, now);

        if !decision.allowed {
            warn!(
                classification = %classification,
                client_identifier = %key.client,
                current_count = outcome.count,
                limit = rule.max_requests,
                retry_after = decision.retry_after_seconds,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Current store mode, for health reporting.
    pub fn mode(&self) -> StoreMode {
        if self.primary.is_none() {
            return StoreMode::Local;
        }
        if self.state.lock().degraded {
            StoreMode::Degraded
        } else {
            StoreMode::Shared
        }
    }

    /// Probe the shared store outside the request path.
    ///
    /// Updates the mode the same way a request would.
    pub async fn probe(&self) -> StoreMode {
        if let Some(primary) = &self.primary {
            match tokio::time::timeout(self.options.probe_timeout, primary.ping()).await {
                Ok(Ok(())) => self.mark_healthy(primary.as_ref()),
                Ok(Err(e)) => self.mark_degraded(primary.as_ref(), &e),
                Err(_) => self.mark_degraded(
                    primary.as_ref(),
                    &StoreError::Timeout(self.options.probe_timeout),
                ),
            }
        }
        self.mode()
    }

    /// Sweep expired entries from the in-process store.
    pub fn purge_fallback(&self, now: DateTime<Utc>) -> usize {
        self.fallback.purge_expired(now.timestamp_millis())
    }

    /// The in-process store.
    pub fn fallback(&self) -> &MemoryStore {
        &self.fallback
    }

    async fn admit(&self, key: &BucketKey, now_ms: i64, window_ms: i64, limit: u64) -> WindowOutcome {
        if let Some(primary) = &self.primary {
            if self.should_try_primary() {
                let call = primary.try_admit(key, now_ms, window_ms, limit);
                match tokio::time::timeout(self.options.store_timeout, call).await {
                    Ok(Ok(outcome)) => {
                        self.mark_healthy(primary.as_ref());
                        return outcome;
                    }
                    Ok(Err(e)) => self.mark_degraded(primary.as_ref(), &e),
                    Err(_) => self.mark_degraded(
                        primary.as_ref(),
                        &StoreError::Timeout(self.options.store_timeout),
                    ),
                }
            }
        }

        self.fallback.admit(key, now_ms, window_ms, limit)
    }

    /// Shared mode always uses the primary. Degraded mode lets one caller
    /// through per reprobe interval.
    fn should_try_primary(&self) -> bool {
        let mut state = self.state.lock();
        if !state.degraded {
            return true;
        }

        let due = state
            .last_probe
            .map_or(true, |at| at.elapsed() >= self.options.reprobe_interval);
        if due {
            state.last_probe = Some(Instant::now());
        }
        due
    }

    fn mark_healthy(&self, primary: &dyn WindowStore) {
        let mut state = self.state.lock();
        if state.degraded {
            info!(store = primary.name(), "Shared rate limit store recovered, resuming shared counting");
        }
        state.degraded = false;
        state.last_probe = None;
    }

    fn mark_degraded(&self, primary: &dyn WindowStore, error: &StoreError) {
        let mut state = self.state.lock();
        if state.degraded {
            debug!(store = primary.name(), error = %error, "Shared rate limit store still unavailable");
        } else {
            warn!(
                store = primary.name(),
                error = %error,
                "Shared rate limit store unavailable, falling back to in-process counting"
            );
        }
        state.degraded = true;
        state.last_probe = Some(Instant::now());
    }
}

fn decide(
    classification: Classification,
    rule: &RateLimitRule,
    outcome: &WindowOutcome,
    now_ms: i64,
    now: DateTime<Utc>,
) -> RateLimitDecision {
    let window_ms = rule.window_ms();
    let reset_ms = outcome.oldest_ms.unwrap_or(now_ms).saturating_add(window_ms);
    let reset_at = DateTime::from_timestamp_millis(reset_ms).unwrap_or(now);

    let (remaining, retry_after_seconds) = if outcome.admitted {
        (rule.max_requests.saturating_sub(outcome.count + 1), 0)
    } else {
        // Clamped so a clock stepping backwards never yields a negative wait.
        let wait_ms = reset_ms.saturating_sub(now_ms).max(0);
        (0, ceil_div(wait_ms, 1000) as u64)
    };

    RateLimitDecision {
        classification,
        allowed: outcome.admitted,
        limit: rule.max_requests,
        remaining,
        reset_at,
        retry_after_seconds,
    }
}

fn ceil_div(value: i64, divisor: i64) -> i64 {
    let quotient = value.div_euclid(divisor);
    if value.rem_euclid(divisor) == 0 {
        quotient
    } else {
        quotient + 1
    }
}
