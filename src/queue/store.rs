//! SQLite-backed offline operation queue.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::api::{normalize_endpoint, WriteMethod};
use crate::db::{from_millis, to_millis, Database};
use crate::error::{GatewayError, Result};

use super::operation::{OfflineOperation, OperationStatus};

/// Persistent FIFO of mutations captured while offline.
///
/// All state lives in the database; nothing is trusted from memory, so an
/// operation left `processing` by a crash is recovered on the next drain.
#[derive(Clone)]
pub struct OfflineQueue {
  db: Database,
}

const SELECT_OPERATION: &str = "SELECT id, endpoint, method, payload, status, enqueued_at,
  updated_at, result, error FROM offline_operations";

struct RawOperation {
  id: i64,
  endpoint: String,
  method: String,
  payload: Vec<u8>,
  status: String,
  enqueued_at: i64,
  updated_at: i64,
  result: Option<Vec<u8>>,
  error: Option<String>,
}

impl RawOperation {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      endpoint: row.get(1)?,
      method: row.get(2)?,
      payload: row.get(3)?,
      status: row.get(4)?,
      enqueued_at: row.get(5)?,
      updated_at: row.get(6)?,
      result: row.get(7)?,
      error: row.get(8)?,
    })
  }

  fn decode(self) -> Result<OfflineOperation> {
    let method = self
      .method
      .parse::<WriteMethod>()
      .map_err(GatewayError::Storage)?;
    let status = self
      .status
      .parse::<OperationStatus>()
      .map_err(GatewayError::Storage)?;
    let result = self
      .result
      .map(|bytes| serde_json::from_slice::<Value>(&bytes))
      .transpose()?;

    Ok(OfflineOperation {
      id: self.id,
      endpoint: self.endpoint,
      method,
      payload: serde_json::from_slice(&self.payload)?,
      status,
      enqueued_at: from_millis(self.enqueued_at),
      updated_at: from_millis(self.updated_at),
      result,
      error: self.error,
    })
  }
}

impl OfflineQueue {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Persist a new pending operation and return its id.
  pub fn enqueue(&self, endpoint: &str, method: WriteMethod, payload: &Value) -> Result<i64> {
    let endpoint = normalize_endpoint(endpoint);
    let payload = serde_json::to_vec(payload)?;
    let now = to_millis(Utc::now());

    let id = self.db.with_conn(|conn| {
      conn.execute(
        "INSERT INTO offline_operations
           (endpoint, method, payload, status, enqueued_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          endpoint,
          method.as_str(),
          payload,
          OperationStatus::Pending.as_str(),
          now,
          now
        ],
      )?;
      Ok(conn.last_insert_rowid())
    })?;

    info!("Queued offline operation {}: {} {}", id, method, endpoint);
    Ok(id)
  }

  pub fn get(&self, id: i64) -> Result<Option<OfflineOperation>> {
    let raw = self.db.with_conn(|conn| {
      conn
        .query_row(
          &format!("{} WHERE id = ?", SELECT_OPERATION),
          params![id],
          RawOperation::from_row,
        )
        .optional()
    })?;
    raw.map(RawOperation::decode).transpose()
  }

  /// Operations with `status`, oldest id first.
  pub fn list_by_status(&self, status: OperationStatus) -> Result<Vec<OfflineOperation>> {
    let rows = self.db.with_conn(|conn| {
      let mut stmt = conn.prepare(&format!(
        "{} WHERE status = ? ORDER BY id ASC",
        SELECT_OPERATION
      ))?;
      let rows = stmt
        .query_map(params![status.as_str()], RawOperation::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(rows)
    })?;
    rows.into_iter().map(RawOperation::decode).collect()
  }

  /// All pending operations in replay order.
  pub fn list_pending(&self) -> Result<Vec<OfflineOperation>> {
    self.list_by_status(OperationStatus::Pending)
  }

  pub fn count_by_status(&self, status: OperationStatus) -> Result<usize> {
    self.db.with_conn(|conn| {
      conn.query_row(
        "SELECT COUNT(*) FROM offline_operations WHERE status = ?",
        params![status.as_str()],
        |row| row.get::<_, i64>(0),
      )
    })
    .map(|count| count as usize)
  }

  pub fn pending_count(&self) -> Result<usize> {
    self.count_by_status(OperationStatus::Pending)
  }

  pub fn mark_processing(&self, id: i64) -> Result<()> {
    self.transition(id, OperationStatus::Pending, OperationStatus::Processing, None, None)
  }

  pub fn mark_completed(&self, id: i64, result: &Value) -> Result<()> {
    let result = serde_json::to_vec(result)?;
    self.transition(
      id,
      OperationStatus::Processing,
      OperationStatus::Completed,
      Some(result),
      None,
    )
  }

  pub fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
    self.transition(
      id,
      OperationStatus::Processing,
      OperationStatus::Failed,
      None,
      Some(error),
    )
  }

  /// Put a processing operation back to pending for a later drain.
  pub fn requeue(&self, id: i64) -> Result<()> {
    self.transition(id, OperationStatus::Processing, OperationStatus::Pending, None, None)
  }

  fn transition(
    &self,
    id: i64,
    from: OperationStatus,
    to: OperationStatus,
    result: Option<Vec<u8>>,
    error: Option<&str>,
  ) -> Result<()> {
    let now = to_millis(Utc::now());
    self.db.transaction(|tx| {
      let updated = tx.execute(
        "UPDATE offline_operations
         SET status = ?, updated_at = ?, result = COALESCE(?, result), error = ?
         WHERE id = ? AND status = ?",
        params![to.as_str(), now, result, error, id, from.as_str()],
      )?;
      if updated == 1 {
        debug!("Offline operation {}: {} -> {}", id, from, to);
        return Ok(());
      }

      let exists: Option<i64> = tx
        .query_row(
          "SELECT id FROM offline_operations WHERE id = ?",
          params![id],
          |row| row.get(0),
        )
        .optional()?;
      match exists {
        Some(_) => Err(GatewayError::InvalidTransition { id, to: to.as_str() }),
        None => Err(GatewayError::OperationNotFound(id)),
      }
    })
  }

  /// Reset operations left `processing` by an interrupted drain.
  pub fn recover_interrupted(&self) -> Result<usize> {
    let now = to_millis(Utc::now());
    let recovered = self.db.with_conn(|conn| {
      conn.execute(
        "UPDATE offline_operations SET status = ?, updated_at = ? WHERE status = ?",
        params![
          OperationStatus::Pending.as_str(),
          now,
          OperationStatus::Processing.as_str()
        ],
      )
    })?;
    if recovered > 0 {
      info!("Recovered {} interrupted offline operations", recovered);
    }
    Ok(recovered)
  }

  /// Move failed operations back to pending so the next drain retries them.
  pub fn retry_failed(&self) -> Result<usize> {
    let now = to_millis(Utc::now());
    self.db.with_conn(|conn| {
      conn.execute(
        "UPDATE offline_operations SET status = ?, updated_at = ?, error = NULL
         WHERE status = ?",
        params![
          OperationStatus::Pending.as_str(),
          now,
          OperationStatus::Failed.as_str()
        ],
      )
    })
  }

  /// Delete failed operations; they are otherwise kept indefinitely.
  pub fn clear_failed(&self) -> Result<usize> {
    self.db.with_conn(|conn| {
      conn.execute(
        "DELETE FROM offline_operations WHERE status = ?",
        params![OperationStatus::Failed.as_str()],
      )
    })
  }

  /// Delete completed operations last updated longer than `retention` ago.
  ///
  /// A window reaching past the earliest representable time keeps everything.
  pub fn cleanup(&self, retention: Duration) -> Result<usize> {
    let cutoff = chrono::Duration::from_std(retention)
      .ok()
      .and_then(|retention| Utc::now().checked_sub_signed(retention));
    let Some(cutoff) = cutoff else {
      debug!("Retention window {:?} keeps every completed operation", retention);
      return Ok(0);
    };
    let cutoff = to_millis(cutoff);

    let removed = self.db.with_conn(|conn| {
      conn.execute(
        "DELETE FROM offline_operations WHERE status = ? AND updated_at < ?",
        params![OperationStatus::Completed.as_str(), cutoff],
      )
    })?;
    if removed > 0 {
      debug!("Cleaned up {} completed offline operations", removed);
    }
    Ok(removed)
  }
}
