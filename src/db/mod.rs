pub mod schema;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{GatewayError, Result};

/// Shared SQLite connection backing both the cache and the offline queue.
#[derive(Clone)]
pub struct Database {
  conn: Arc<Mutex<Connection>>,
}

impl Database {
  /// Open or create the database at the given path
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        GatewayError::Storage(format!("Failed to create database directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      GatewayError::Storage(format!(
        "Failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_connection(conn)
  }

  /// Open a private database that lives as long as this handle
  pub fn open_in_memory() -> Result<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self.with_conn(|conn| conn.execute_batch(schema::SCHEMA))
  }

  /// Run `f` with exclusive access to the connection.
  pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
    let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
    Ok(f(&conn)?)
  }

  /// Run `f` inside a transaction, committing only if it succeeds.
  pub fn transaction<T>(
    &self,
    f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
  ) -> Result<T> {
    let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
    let tx = conn.transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
  }
}

/// Timestamps are stored as Unix milliseconds.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
  at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
  Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_migrations_are_idempotent() {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().unwrap();
    let tables: i64 = db
      .with_conn(|conn| {
        conn.query_row(
          "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
           AND name IN ('cache_entries', 'offline_operations')",
          [],
          |row| row.get(0),
        )
      })
      .unwrap();
    assert_eq!(tables, 2);
  }

  #[test]
  fn test_open_creates_parent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("gateway.db");
    Database::open(&path).unwrap();
    assert!(path.exists());
  }

  #[test]
  fn test_millis_round_trip_keeps_precision() {
    let at = from_millis(1_700_000_000_123);
    assert_eq!(to_millis(at), 1_700_000_000_123);
  }
}
