use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::api::{ApiRequest, WriteMethod};

/// Lifecycle of a queued mutation.
///
/// `Pending -> Processing -> Completed | Failed`; a processing operation
/// interrupted by a connectivity loss or a crash goes back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
  Pending,
  Processing,
  Completed,
  Failed,
}

impl OperationStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Processing => "processing",
      Self::Completed => "completed",
      Self::Failed => "failed",
    }
  }
}

impl fmt::Display for OperationStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for OperationStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(Self::Pending),
      "processing" => Ok(Self::Processing),
      "completed" => Ok(Self::Completed),
      "failed" => Ok(Self::Failed),
      other => Err(format!("unknown operation status: {}", other)),
    }
  }
}

/// A mutating request captured while offline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfflineOperation {
  /// Assigned at enqueue time; replay order
  pub id: i64,
  pub endpoint: String,
  pub method: WriteMethod,
  pub payload: Value,
  pub status: OperationStatus,
  pub enqueued_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  /// Server response, once completed
  pub result: Option<Value>,
  /// Failure reason, once failed
  pub error: Option<String>,
}

impl OfflineOperation {
  /// The request this operation replays.
  pub fn to_request(&self) -> ApiRequest {
    ApiRequest::write(self.method, &self.endpoint, self.payload.clone())
  }
}
