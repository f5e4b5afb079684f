//! Bucket key generation and handling.

use super::classify::Classification;

/// Prefix shared by every key the limiter writes to the shared store.
pub const KEY_PREFIX: &str = "rate_limit";

/// Identifier used when the caller's address cannot be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// A key that uniquely identifies one independent quota pool.
///
/// The key is composed of the endpoint classification and the client
/// identifier (typically the caller's network address).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// The classification whose rule applies
    pub classification: Classification,
    /// The client identifier, never empty
    pub client: String,
}

impl BucketKey {
    /// Create a new bucket key. Blank identifiers map to [`UNKNOWN_CLIENT`].
    pub fn new(classification: Classification, client: &str) -> Self {
        let client = client.trim();
        let client = if client.is_empty() { UNKNOWN_CLIENT } else { client };

        Self {
            classification,
            client: client.to_string(),
        }
    }

    /// Render the shared store key.
    ///
    /// Format: `rate_limit:{classification}:{client_identifier}`
    pub fn store_key(&self) -> String {
        format!("{}:{}:{}", KEY_PREFIX, self.classification, self.client)
    }

    /// Parse a shared store key.
    ///
    /// Client identifiers may contain `:` (IPv6), so only the first two
    /// separators are significant.
    pub fn parse(key: &str) -> Option<Self> {
        let mut parts = key.splitn(3, ':');
        if parts.next()? != KEY_PREFIX {
            return None;
        }

        let classification = parts.next()?.parse().ok()?;
        let client = parts.next()?;
        if client.is_empty() {
            return None;
        }

        Some(Self {
            classification,
            client: client.to_string(),
        })
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.store_key())
    }
}
