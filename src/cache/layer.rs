//! Two-tier cache: an in-memory map over a persistent store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;

use super::entry::{CacheEntry, CacheKey};
use super::storage::CacheStorage;

/// Cache layer holding the hot in-memory tier and the persistent tier.
///
/// Reads check memory first, then storage, promoting storage hits back into
/// memory. Writes and invalidations hit both tiers. The first storage error
/// is logged and switches the layer to memory-only for the rest of the
/// session; cache operations themselves never fail.
pub struct CacheLayer {
  memory: Mutex<HashMap<String, CacheEntry>>,
  storage: Arc<dyn CacheStorage>,
  persistent: AtomicBool,
}

/// Observability snapshot; not needed for correctness.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheMetrics {
  pub total_entries: usize,
  pub live_entries: usize,
  pub expired_entries: usize,
  /// Approximate serialized size of all entries
  pub size_bytes: usize,
  pub oldest_entry: Option<DateTime<Utc>>,
  pub newest_entry: Option<DateTime<Utc>>,
  pub average_age_secs: f64,
  /// Entry count per first endpoint segment
  pub endpoints: BTreeMap<String, usize>,
}

impl CacheLayer {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
    Self {
      memory: Mutex::new(HashMap::new()),
      storage,
      persistent: AtomicBool::new(true),
    }
  }

  /// Whether a storage failure has switched the cache to memory-only.
  pub fn is_degraded(&self) -> bool {
    !self.persistent.load(Ordering::Relaxed)
  }

  fn memory(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
    self.memory.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Run a storage operation unless degraded; the first failure degrades.
  fn persist<T>(&self, op: &str, f: impl FnOnce(&dyn CacheStorage) -> Result<T>) -> Option<T> {
    if self.is_degraded() {
      return None;
    }
    match f(self.storage.as_ref()) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!("Cache storage failed during {}, continuing memory-only: {}", op, e);
        self.persistent.store(false, Ordering::Relaxed);
        None
      }
    }
  }

  /// Live entry for `key`, or `None`.
  ///
  /// Expired entries are treated as absent and dropped from both tiers.
  pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
    let now = Utc::now();

    {
      let mut memory = self.memory();
      if let Some(entry) = memory.get(key.as_str()) {
        if !entry.is_expired_at(now) {
          debug!("Cache hit (memory): {}", key);
          return Some(entry.clone());
        }
        memory.remove(key.as_str());
      }
    }

    match self.persist("load", |s| s.load(key.as_str())).flatten() {
      Some(entry) if !entry.is_expired_at(now) => {
        debug!("Cache hit (storage): {}", key);
        self
          .memory()
          .insert(key.as_str().to_string(), entry.clone());
        Some(entry)
      }
      Some(_) => {
        debug!("Cache entry expired: {}", key);
        self.persist("remove", |s| s.remove(key.as_str()));
        None
      }
      None => {
        debug!("Cache miss: {}", key);
        None
      }
    }
  }

  /// Store `payload` under `key`, replacing any previous entry.
  pub fn set(&self, key: &CacheKey, payload: Value, ttl: Duration) -> CacheEntry {
    let entry = CacheEntry::new(key, payload, ttl);
    self
      .memory()
      .insert(entry.key.clone(), entry.clone());
    self.persist("store", |s| s.store(&entry));
    entry
  }

  /// Remove entries whose key or source endpoint contains `pattern`, or
  /// everything when `pattern` is `None`. Returns the number removed.
  pub fn invalidate(&self, pattern: Option<&str>) -> usize {
    let from_memory = {
      let mut memory = self.memory();
      let before = memory.len();
      match pattern {
        Some(pattern) => memory.retain(|_, entry| !entry.matches(pattern)),
        None => memory.clear(),
      }
      before - memory.len()
    };

    let from_storage = match pattern {
      Some(pattern) => self.persist("invalidate", |s| s.remove_matching(pattern)),
      None => self.persist("clear", |s| s.clear()),
    }
    .unwrap_or(0);

    // Every memory entry is also persisted unless degraded
    let removed = from_memory.max(from_storage);
    debug!("Invalidated {} cache entries for {:?}", removed, pattern);
    removed
  }

  /// Physically remove expired entries from both tiers.
  pub fn purge_expired(&self) -> usize {
    let now = Utc::now();
    let from_memory = {
      let mut memory = self.memory();
      let before = memory.len();
      memory.retain(|_, entry| !entry.is_expired_at(now));
      before - memory.len()
    };
    let from_storage = self
      .persist("purge", |s| s.remove_expired(now))
      .unwrap_or(0);
    from_memory.max(from_storage)
  }

  /// Counts, size and age statistics across both tiers.
  pub fn metrics(&self) -> CacheMetrics {
    let mut entries: HashMap<String, CacheEntry> = self
      .persist("metrics", |s| s.entries())
      .unwrap_or_default()
      .into_iter()
      .map(|entry| (entry.key.clone(), entry))
      .collect();
    for (key, entry) in self.memory().iter() {
      entries.insert(key.clone(), entry.clone());
    }

    let now = Utc::now();
    let mut metrics = CacheMetrics {
      total_entries: entries.len(),
      ..CacheMetrics::default()
    };
    if entries.is_empty() {
      return metrics;
    }

    let mut total_age_ms: i64 = 0;
    for entry in entries.values() {
      if entry.is_expired_at(now) {
        metrics.expired_entries += 1;
      } else {
        metrics.live_entries += 1;
      }
      metrics.size_bytes += entry.approximate_size();
      total_age_ms += (now - entry.created_at).num_milliseconds();

      metrics.oldest_entry = Some(match metrics.oldest_entry {
        Some(oldest) => oldest.min(entry.created_at),
        None => entry.created_at,
      });
      metrics.newest_entry = Some(match metrics.newest_entry {
        Some(newest) => newest.max(entry.created_at),
        None => entry.created_at,
      });

      let family = entry
        .source_endpoint
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string();
      *metrics.endpoints.entry(family).or_insert(0) += 1;
    }
    metrics.average_age_secs = total_age_ms as f64 / entries.len() as f64 / 1000.0;

    metrics
  }
}
