//! Response cache shared by all API clients of a dashboard
//!
//! Entries are looked up by a request fingerprint: the CRC32 of the URL
//! followed by the CRC32 of the JSON-serialized arguments, hex encoded.
//! Equal requests map to equal keys regardless of which tile issued them.
//! Each entry also keeps the full request text, and a lookup whose request
//! differs from the stored one is a miss.

use std::fmt;

use dashmap::DashMap;
use serde::Serialize;

use super::ApiError;

/// Cache key of one request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestKey {
    fingerprint: String,
    request: String,
}

impl RequestKey {
    /// Key for a request of `args` to `url`
    ///
    /// # Errors
    ///
    /// Fails if `args` cannot be serialized.
    pub fn new<A: Serialize + ?Sized>(url: &str, args: &A) -> Result<Self, ApiError> {
        let encoded = serde_json::to_string(args)?;
        Ok(Self {
            fingerprint: fingerprint(url, &encoded),
            request: format!("{url} {encoded}"),
        })
    }

    /// Hex fingerprint used for lookup
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// URL and serialized arguments
    #[must_use]
    pub fn request(&self) -> &str {
        &self.request
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint)
    }
}

/// Key-value store for decoded responses
pub trait ResponseCache: Send + Sync {
    /// Cached value for `key`
    fn get(&self, key: &RequestKey) -> Option<serde_json::Value>;

    /// Store `value` under `key`
    fn set(&self, key: &RequestKey, value: serde_json::Value);
}

#[derive(Debug)]
struct Entry {
    request: String,
    value: serde_json::Value,
}

/// In-process cache
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached responses
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ResponseCache for MemoryCache {
    fn get(&self, key: &RequestKey) -> Option<serde_json::Value> {
        let entry = self.entries.get(key.fingerprint())?;
        if entry.request != key.request() {
            tracing::debug!(fingerprint = %key, "fingerprint collision, treated as miss");
            return None;
        }
        Some(entry.value.clone())
    }

    fn set(&self, key: &RequestKey, value: serde_json::Value) {
        self.entries.insert(
            key.fingerprint().to_string(),
            Entry {
                request: key.request().to_string(),
                value,
            },
        );
    }
}

/// Cache that stores nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl ResponseCache for NoCache {
    fn get(&self, _key: &RequestKey) -> Option<serde_json::Value> {
        None
    }

    fn set(&self, _key: &RequestKey, _value: serde_json::Value) {}
}

fn fingerprint(url: &str, encoded: &str) -> String {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&crc32fast::hash(url.as_bytes()).to_be_bytes());
    key[4..].copy_from_slice(&crc32fast::hash(encoded.as_bytes()).to_be_bytes());
    hex::encode(key)
}
