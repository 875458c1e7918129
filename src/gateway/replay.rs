use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::api::WriteMethod;
use crate::config::ReplayRouteConfig;
use crate::error::{GatewayError, Result};
use crate::queue::OfflineOperation;

use super::Gateway;

/// Re-executes a queued operation once connectivity is back.
///
/// The returned value is stored as the operation's result. A connectivity
/// error halts the drain; any other error fails only this operation.
#[async_trait]
pub trait ReplayHandler: Send + Sync {
  async fn replay(&self, gateway: &Gateway, operation: &OfflineOperation) -> Result<Value>;
}

/// Resends the stored request unchanged through the authenticated pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

#[async_trait]
impl ReplayHandler for Passthrough {
  async fn replay(&self, gateway: &Gateway, operation: &OfflineOperation) -> Result<Value> {
    gateway.send(&operation.to_request()).await
  }
}

struct ReplayRoute {
  pattern: String,
  method: WriteMethod,
  handler: Arc<dyn ReplayHandler>,
}

/// Handlers keyed by `(endpoint pattern, method)`.
///
/// Writes are only queued offline when a handler resolves for them, so an
/// unreplayable write is refused up front instead of failing at drain time.
#[derive(Default)]
pub struct ReplayRegistry {
  routes: Vec<ReplayRoute>,
}

impl fmt::Debug for ReplayRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list()
      .entries(self.routes.iter().map(|r| (r.method, &r.pattern)))
      .finish()
  }
}

impl ReplayRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(
    mut self,
    pattern: &str,
    method: WriteMethod,
    handler: Arc<dyn ReplayHandler>,
  ) -> Self {
    self.routes.push(ReplayRoute {
      pattern: pattern.trim().trim_start_matches('/').to_string(),
      method,
      handler,
    });
    self
  }

  pub fn passthrough(self, pattern: &str, method: WriteMethod) -> Self {
    self.register(pattern, method, Arc::new(Passthrough))
  }

  /// Passthrough routes for every configured endpoint.
  pub fn from_config(routes: &[ReplayRouteConfig]) -> Self {
    routes
      .iter()
      .fold(Self::new(), |registry, route| {
        registry.passthrough(&route.endpoint, route.method)
      })
  }

  /// Handler for `method` on `endpoint`; the longest matching pattern wins.
  pub fn resolve(&self, endpoint: &str, method: WriteMethod) -> Option<Arc<dyn ReplayHandler>> {
    self
      .routes
      .iter()
      .filter(|route| route.method == method && endpoint.contains(route.pattern.as_str()))
      .max_by_key(|route| route.pattern.len())
      .map(|route| Arc::clone(&route.handler))
  }

  pub fn supports(&self, endpoint: &str, method: WriteMethod) -> bool {
    self.resolve(endpoint, method).is_some()
  }

  pub fn len(&self) -> usize {
    self.routes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.routes.is_empty()
  }
}

/// Outcome of one drain of the offline queue.
#[derive(Debug, Default)]
pub struct SyncReport {
  pub completed: usize,
  pub failed: usize,
  /// Pending operations left after the drain
  pub remaining: usize,
  /// Set when the drain stopped early
  pub halted_by: Option<GatewayError>,
}

impl SyncReport {
  pub fn is_complete(&self) -> bool {
    self.halted_by.is_none()
  }
}

impl fmt::Display for SyncReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} completed, {} failed, {} pending",
      self.completed, self.failed, self.remaining
    )?;
    if let Some(error) = &self.halted_by {
      write!(f, " (halted: {})", error)?;
    }
    Ok(())
  }
}
