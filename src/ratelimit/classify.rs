//! Endpoint classification.
//!
//! Every request path maps to exactly one [`Classification`], which selects
//! the rate limit rule applied to it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RateGateError;

/// A named category of endpoint with its own rate limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// Catch-all policy, usable as the default classification
    Global,
    /// Login, registration and password flows
    Auth,
    /// Media and file uploads
    Upload,
    /// Search queries
    Search,
    /// Session management
    Session,
    /// Every other API call
    Api,
}

impl Classification {
    /// All recognized classifications.
    pub const ALL: [Classification; 6] = [
        Classification::Global,
        Classification::Auth,
        Classification::Upload,
        Classification::Search,
        Classification::Session,
        Classification::Api,
    ];

    /// The lowercase name used in configuration and store keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Global => "global",
            Classification::Auth => "auth",
            Classification::Upload => "upload",
            Classification::Search => "search",
            Classification::Session => "session",
            Classification::Api => "api",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = RateGateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Classification::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| RateGateError::Config(format!("unknown classification '{}'", s)))
    }
}

/// Segment patterns in priority order. The first match wins.
const SEGMENT_RULES: &[(&[&str], Classification)] = &[
    (&["auth"], Classification::Auth),
    (&["upload", "uploads", "media"], Classification::Upload),
    (&["search"], Classification::Search),
    (&["session", "sessions"], Classification::Session),
];

/// Maps request paths to classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classifier {
    default: Classification,
}

impl Classifier {
    /// Create a classifier that falls through to `default`.
    pub fn new(default: Classification) -> Self {
        Self { default }
    }

    /// The classification given to unmatched paths.
    pub fn default_classification(&self) -> Classification {
        self.default
    }

    /// Classify a request path. Total and deterministic.
    pub fn classify(&self, path: &str) -> Classification {
        let Some(segment) = first_resource_segment(path) else {
            return self.default;
        };

        SEGMENT_RULES
            .iter()
            .find(|(names, _)| names.iter().any(|n| n.eq_ignore_ascii_case(segment)))
            .map(|(_, classification)| *classification)
            .unwrap_or(self.default)
    }

    /// Every classification `classify` can return.
    pub fn reachable(&self) -> Vec<Classification> {
        let mut out: Vec<Classification> = SEGMENT_RULES.iter().map(|(_, c)| *c).collect();
        if !out.contains(&self.default) {
            out.push(self.default);
        }
        out
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(Classification::Api)
    }
}

/// Skip an `/api` or `/api/v{n}` prefix and return the first remaining segment.
fn first_resource_segment(path: &str) -> Option<&str> {
    // Query strings are not part of the path, but tolerate callers that pass them.
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();

    if segments.peek().is_some_and(|s| s.eq_ignore_ascii_case("api")) {
        segments.next();
        if segments.peek().is_some_and(|s| is_version_segment(s)) {
            segments.next();
        }
    }

    segments.next()
}

fn is_version_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    matches!(chars.next(), Some('v' | 'V'))
        && segment.len() > 1
        && chars.all(|c| c.is_ascii_digit())
}
