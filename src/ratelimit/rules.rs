//! Rate limit rules configuration and validation.
//!
//! One rule per classification. The table is loaded and validated once at
//! startup and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::classify::{Classification, Classifier};
use crate::error::{RateGateError, Result};

/// Longest window a rule may use: one year.
pub const MAX_WINDOW_SECONDS: u64 = 366 * 24 * 60 * 60;

/// The policy for one classification of endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Number of requests admitted per window
    pub max_requests: u64,
    /// Length of the sliding window in seconds
    pub window_seconds: u64,
}

impl RateLimitRule {
    pub const fn new(max_requests: u64, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }

    /// The window in milliseconds, the resolution stores work in.
    pub fn window_ms(&self) -> i64 {
        i64::try_from(self.window_seconds.saturating_mul(1000)).unwrap_or(i64::MAX)
    }
}

/// Mapping of classification to rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTable {
    rules: BTreeMap<Classification, RateLimitRule>,
}

impl RuleTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    /// Build a table from explicit rules.
    pub fn from_rules(rules: impl IntoIterator<Item = (Classification, RateLimitRule)>) -> Self {
        Self {
            rules: rules.into_iter().collect(),
        }
    }

    /// Look up the rule for a classification.
    pub fn get(&self, classification: Classification) -> Result<&RateLimitRule> {
        self.rules.get(&classification).ok_or_else(|| {
            RateGateError::Config(format!(
                "no rate limit rule configured for classification '{}'",
                classification
            ))
        })
    }

    /// Insert or replace a rule.
    pub fn insert(&mut self, classification: Classification, rule: RateLimitRule) {
        self.rules.insert(classification, rule);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Classification, &RateLimitRule)> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Check that every classification the classifier can produce has a
    /// usable rule.
    pub fn validate(&self, classifier: &Classifier) -> Result<()> {
        for classification in classifier.reachable() {
            self.get(classification)?;
        }

        for (classification, rule) in &self.rules {
            if rule.max_requests == 0 {
                return Err(RateGateError::Config(format!(
                    "rule '{}': max_requests must be positive",
                    classification
                )));
            }
            if rule.window_seconds == 0 {
                return Err(RateGateError::Config(format!(
                    "rule '{}': window_seconds must be positive",
                    classification
                )));
            }
            if rule.window_seconds > MAX_WINDOW_SECONDS {
                return Err(RateGateError::Config(format!(
                    "rule '{}': window_seconds must be at most {}",
                    classification, MAX_WINDOW_SECONDS
                )));
            }
        }

        Ok(())
    }
}

impl Default for RuleTable {
    /// The platform's historical limits.
    fn default() -> Self {
        Self::from_rules([
            (Classification::Global, RateLimitRule::new(100, 3600)),
            (Classification::Auth, RateLimitRule::new(5, 300)),
            (Classification::Upload, RateLimitRule::new(50, 3600)),
            (Classification::Search, RateLimitRule::new(100, 3600)),
            (Classification::Session, RateLimitRule::new(20, 3600)),
            (Classification::Api, RateLimitRule::new(1000, 3600)),
        ])
    }
}
