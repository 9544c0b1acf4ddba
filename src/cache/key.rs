//! Cache key type and deterministic key derivation.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// An opaque string identifying one cached value, unique across a store.
///
/// # Examples
///
/// ```
/// use rttp_cache::cache::CacheKey;
///
/// let key = CacheKey::new("users:42");
/// assert_eq!(key.as_str(), "users:42");
///
/// let hashed = CacheKey::hashed("search", &("rust", 2)).unwrap();
/// assert!(hashed.as_str().starts_with("search:"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derives a stable key from any serializable value.
    ///
    /// The value is normalized through [`serde_json::Value`] (object keys are
    /// sorted), hashed with SHA-256 and hex encoded. A non-empty `prefix` is
    /// prepended as `prefix:`.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if `value` cannot be represented as JSON.
    pub fn hashed<T>(prefix: &str, value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize + ?Sized,
    {
        let normalized = serde_json::to_vec(&serde_json::to_value(value)?)?;
        let digest = hex::encode(Sha256::digest(&normalized));
        let key = if prefix.is_empty() {
            digest
        } else {
            format!("{prefix}:{digest}")
        };
        debug!(key = %key, "hash computed");
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}
