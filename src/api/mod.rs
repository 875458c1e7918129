//! Boundary to the remote HTTP API.

mod client;
mod types;

use async_trait::async_trait;

use crate::error::Result;

pub use client::{HttpRefresher, HttpTransport};
pub use types::{
  normalize_endpoint, ApiRequest, ApiResponse, Method, Params, StatusCategory, WriteMethod,
};

/// Sends logical requests to the remote API.
///
/// Any HTTP status is a successful transport round trip and comes back as
/// `Ok`; only failures to reach the server at all (DNS, refused connection,
/// timeout) are `Err(GatewayError::Connectivity)`.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn execute(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse>;
}
