//! Error taxonomy for the gateway.
//!
//! Connectivity and storage failures are absorbed wherever a fallback exists
//! (cached read, queued write). Everything else reaches the caller.

use serde_json::Value;
use thiserror::Error;

use crate::api::WriteMethod;

/// Errors surfaced by the gateway.
///
/// The type is `Clone` so a single credential-refresh outcome can be handed
/// to every request waiting on it.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
  /// No reachable network: DNS failure, refused connection, timeout.
  #[error("network unreachable: {0}")]
  Connectivity(String),

  /// Credentials were rejected and could not be refreshed.
  #[error("session expired")]
  AuthExpired,

  /// The server rejected the request (validation, conflict, forbidden).
  #[error("request rejected by server ({status}): {body}")]
  Rejected { status: u16, body: Value },

  /// Local persistence failed.
  #[error("local storage failure: {0}")]
  Storage(String),

  /// A write would have been queued but nothing knows how to replay it.
  #[error("no offline replay registered for {method} {endpoint}")]
  UnsupportedOffline {
    method: WriteMethod,
    endpoint: String,
  },

  #[error("offline operation {0} not found")]
  OperationNotFound(i64),

  #[error("offline operation {id} cannot move to {to}")]
  InvalidTransition { id: i64, to: &'static str },

  /// Anything else, including 5xx responses.
  #[error("{0}")]
  Unknown(String),
}

impl GatewayError {
  /// Whether the error means the server could not be reached at all.
  pub fn is_connectivity(&self) -> bool {
    matches!(self, Self::Connectivity(_))
  }

  pub fn is_auth_expired(&self) -> bool {
    matches!(self, Self::AuthExpired)
  }
}

impl From<rusqlite::Error> for GatewayError {
  fn from(e: rusqlite::Error) -> Self {
    Self::Storage(e.to_string())
  }
}

impl From<serde_json::Error> for GatewayError {
  fn from(e: serde_json::Error) -> Self {
    Self::Storage(format!("failed to (de)serialize stored payload: {}", e))
  }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
