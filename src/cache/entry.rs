//! Cache keys and entries.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::api::{normalize_endpoint, Params};

/// Upper bound for a TTL so `created_at + ttl` cannot overflow.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Deterministic key for a logical read: `(endpoint, normalized params)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  key: String,
  endpoint: String,
}

impl CacheKey {
  /// Build the key for `endpoint` with `params`.
  ///
  /// Without params the key is the normalized endpoint itself. With params it
  /// is `endpoint|<sha256 of the sorted params>`, which keeps the endpoint a
  /// substring of the key for pattern invalidation.
  pub fn new(endpoint: &str, params: &Params) -> Self {
    let endpoint = normalize_endpoint(endpoint);
    if params.is_empty() {
      return Self {
        key: endpoint.clone(),
        endpoint,
      };
    }

    // Params is a BTreeMap, so serialization order is already sorted
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(params).unwrap_or_default());
    let digest = hex::encode(hasher.finalize());

    Self {
      key: format!("{}|{}", endpoint, digest),
      endpoint,
    }
  }

  pub fn as_str(&self) -> &str {
    &self.key
  }

  /// Endpoint family the key belongs to.
  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }
}

impl std::fmt::Display for CacheKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.key)
  }
}

/// A cached response body with its expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: String,
  pub source_endpoint: String,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(key: &CacheKey, payload: Value, ttl: Duration) -> Self {
    let created_at = Utc::now();
    let ttl = chrono::Duration::from_std(ttl.min(MAX_TTL)).unwrap_or_else(|_| chrono::Duration::zero());
    Self {
      key: key.as_str().to_string(),
      source_endpoint: key.endpoint().to_string(),
      payload,
      created_at,
      expires_at: created_at + ttl,
    }
  }

  /// An entry is live strictly before `expires_at`.
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }

  pub fn is_expired(&self) -> bool {
    self.is_expired_at(Utc::now())
  }

  /// Whether the key or the source endpoint contains `pattern`.
  pub fn matches(&self, pattern: &str) -> bool {
    self.key.contains(pattern) || self.source_endpoint.contains(pattern)
  }

  /// Rough serialized size in bytes.
  pub fn approximate_size(&self) -> usize {
    self.key.len() + self.source_endpoint.len() + self.payload.to_string().len() + 16
  }
}
