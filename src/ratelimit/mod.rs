//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod classify;
mod limiter;
mod rules;
mod window;

pub use backend::{StoreError, WindowOutcome, WindowStore};
pub use bucket::{BucketKey, KEY_PREFIX, UNKNOWN_CLIENT};
pub use classify::{Classification, Classifier};
pub use limiter::{LimiterOptions, RateLimitDecision, RateLimiter, StoreMode};
pub use rules::{RateLimitRule, RuleTable, MAX_WINDOW_SECONDS};
pub use window::SlidingWindow;
