//! Persistent tier of the response cache.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{from_millis, to_millis, Database};
use crate::error::Result;

use super::entry::CacheEntry;

/// Trait for persistent cache backends.
///
/// Backends store entries verbatim; expiry is decided by the caller.
pub trait CacheStorage: Send + Sync {
  /// Load the entry stored under `key`, expired or not.
  fn load(&self, key: &str) -> Result<Option<CacheEntry>>;

  /// Insert or overwrite an entry.
  fn store(&self, entry: &CacheEntry) -> Result<()>;

  fn remove(&self, key: &str) -> Result<()>;

  /// Remove entries whose key or source endpoint contains `pattern`.
  fn remove_matching(&self, pattern: &str) -> Result<usize>;

  fn clear(&self) -> Result<usize>;

  /// Remove entries that expired at or before `now`.
  fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize>;

  fn entries(&self) -> Result<Vec<CacheEntry>>;
}

/// Storage implementation that doesn't persist anything.
/// Used when the database is unavailable - the cache runs memory-only.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn load(&self, _key: &str) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn store(&self, _entry: &CacheEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn remove_matching(&self, _pattern: &str) -> Result<usize> {
    Ok(0)
  }

  fn clear(&self) -> Result<usize> {
    Ok(0)
  }

  fn remove_expired(&self, _now: DateTime<Utc>) -> Result<usize> {
    Ok(0)
  }

  fn entries(&self) -> Result<Vec<CacheEntry>> {
    Ok(Vec::new())
  }
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

const SELECT_ENTRY: &str =
  "SELECT cache_key, source_endpoint, payload, created_at, expires_at FROM cache_entries";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<(CacheEntry, Vec<u8>)> {
  let payload: Vec<u8> = row.get(2)?;
  let entry = CacheEntry {
    key: row.get(0)?,
    source_endpoint: row.get(1)?,
    payload: serde_json::Value::Null,
    created_at: from_millis(row.get(3)?),
    expires_at: from_millis(row.get(4)?),
  };
  Ok((entry, payload))
}

fn decode((mut entry, payload): (CacheEntry, Vec<u8>)) -> Result<CacheEntry> {
  entry.payload = serde_json::from_slice(&payload)?;
  Ok(entry)
}

impl CacheStorage for SqliteStorage {
  fn load(&self, key: &str) -> Result<Option<CacheEntry>> {
    let row = self.db.with_conn(|conn| {
      conn
        .query_row(
          &format!("{} WHERE cache_key = ?", SELECT_ENTRY),
          params![key],
          entry_from_row,
        )
        .optional()
    })?;

    row.map(decode).transpose()
  }

  fn store(&self, entry: &CacheEntry) -> Result<()> {
    let payload = serde_json::to_vec(&entry.payload)?;
    self.db.with_conn(|conn| {
      conn.execute(
        "INSERT OR REPLACE INTO cache_entries
           (cache_key, source_endpoint, payload, created_at, expires_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          entry.key,
          entry.source_endpoint,
          payload,
          to_millis(entry.created_at),
          to_millis(entry.expires_at)
        ],
      )
    })?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.db.with_conn(|conn| {
      conn.execute("DELETE FROM cache_entries WHERE cache_key = ?", params![key])
    })?;
    Ok(())
  }

  fn remove_matching(&self, pattern: &str) -> Result<usize> {
    // instr() keeps the pattern literal, unlike LIKE
    self.db.with_conn(|conn| {
      conn.execute(
        "DELETE FROM cache_entries
         WHERE instr(cache_key, ?1) > 0 OR instr(source_endpoint, ?1) > 0",
        params![pattern],
      )
    })
  }

  fn clear(&self) -> Result<usize> {
    self
      .db
      .with_conn(|conn| conn.execute("DELETE FROM cache_entries", []))
  }

  fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize> {
    self.db.with_conn(|conn| {
      conn.execute(
        "DELETE FROM cache_entries WHERE expires_at <= ?",
        params![to_millis(now)],
      )
    })
  }

  fn entries(&self) -> Result<Vec<CacheEntry>> {
    let rows = self.db.with_conn(|conn| {
      let mut stmt = conn.prepare(SELECT_ENTRY)?;
      let rows = stmt
        .query_map([], entry_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(rows)
    })?;

    rows.into_iter().map(decode).collect()
  }
}
