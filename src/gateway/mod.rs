//! Request gateway: cache-first reads, offline-aware writes and replay.
//!
//! - Reads are served from the cache without touching the network on a hit
//! - A read that cannot reach the server falls back to whatever is cached
//! - Writes made while offline are queued and reported as [`WriteOutcome::Queued`]
//! - Successful writes invalidate the cache patterns they make stale
//! - 401 responses are retried once after a single-flight token refresh

mod builder;
mod replay;

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::{
  normalize_endpoint, ApiRequest, ApiResponse, Params, StatusCategory, Transport, WriteMethod,
};
use crate::auth::RefreshCoordinator;
use crate::cache::{CacheKey, CacheLayer, CacheMetrics, CachePolicy, InvalidationMap};
use crate::connectivity::{tick_period, ConnectivityMonitor, ConnectivityState, Subscription};
use crate::error::{GatewayError, Result};
use crate::queue::{OfflineOperation, OfflineQueue, OperationStatus};

pub use builder::GatewayBuilder;
pub use replay::{Passthrough, ReplayHandler, ReplayRegistry, SyncReport};

#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
  /// Consult and populate the cache
  pub use_cache: bool,
  /// Skip the cache lookup and go to the network first
  pub force_refresh: bool,
  /// Overrides the policy TTL for this response
  pub ttl: Option<Duration>,
}

impl Default for ReadOptions {
  fn default() -> Self {
    Self {
      use_cache: true,
      force_refresh: false,
      ttl: None,
    }
  }
}

impl ReadOptions {
  pub fn fresh() -> Self {
    Self {
      force_refresh: true,
      ..Self::default()
    }
  }

  pub fn uncached() -> Self {
    Self {
      use_cache: false,
      ..Self::default()
    }
  }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
  /// Queue the write instead of failing when the server is unreachable
  pub queue_when_offline: bool,
}

impl Default for WriteOptions {
  fn default() -> Self {
    Self {
      queue_when_offline: true,
    }
  }
}

/// Where a read's data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
  Network,
  Cache,
  /// Cached data served because the network call failed
  Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadResponse {
  pub data: Value,
  pub source: ResponseSource,
}

/// Result of a write: done now, or queued for replay.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WriteOutcome {
  Completed { data: Value },
  Queued { id: i64 },
}

impl WriteOutcome {
  pub fn is_queued(&self) -> bool {
    matches!(self, Self::Queued { .. })
  }
}

/// What one maintenance pass removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
  pub expired_entries: usize,
  pub completed_operations: usize,
}

/// Client-side gateway in front of the remote API.
///
/// Construct with [`GatewayBuilder`] or [`Gateway::from_config`]. Background
/// work (probing, replay on reconnect, maintenance) only runs after
/// [`Gateway::start`].
pub struct Gateway {
  transport: Arc<dyn Transport>,
  cache: CacheLayer,
  policy: CachePolicy,
  invalidation: InvalidationMap,
  caching_enabled: bool,
  queue: OfflineQueue,
  replay: ReplayRegistry,
  connectivity: Arc<ConnectivityMonitor>,
  auth: RefreshCoordinator,
  sync_lock: tokio::sync::Mutex<()>,
  sync_runs: AtomicU64,
  retention: Duration,
  maintenance_interval: Duration,
}

impl Gateway {
  pub fn builder(transport: Arc<dyn Transport>) -> GatewayBuilder {
    GatewayBuilder::new(transport)
  }

  /// Read `endpoint`, preferring a live cache entry over the network.
  pub async fn read(&self, endpoint: &str, params: Params, options: ReadOptions) -> Result<ReadResponse> {
    let key = CacheKey::new(endpoint, &params);
    let use_cache = self.caching_enabled && options.use_cache;

    if use_cache && !options.force_refresh {
      if let Some(entry) = self.cache.get(&key) {
        return Ok(ReadResponse {
          data: entry.payload,
          source: ResponseSource::Cache,
        });
      }
    }

    let request = ApiRequest::get(endpoint, params);
    match self.send(&request).await {
      Ok(data) => {
        if use_cache {
          let ttl = options
            .ttl
            .unwrap_or_else(|| self.policy.ttl_for(key.endpoint()));
          self.cache.set(&key, data.clone(), ttl);
        }
        Ok(ReadResponse {
          data,
          source: ResponseSource::Network,
        })
      }
      Err(e) if e.is_connectivity() && use_cache => match self.cache.get(&key) {
        Some(entry) => {
          info!("Serving cached {} while unreachable", key);
          Ok(ReadResponse {
            data: entry.payload,
            source: ResponseSource::Offline,
          })
        }
        None => Err(e),
      },
      Err(e) => Err(e),
    }
  }

  /// Send a mutation, queueing it when the server cannot be reached.
  pub async fn write(
    &self,
    endpoint: &str,
    method: WriteMethod,
    body: Value,
    options: WriteOptions,
  ) -> Result<WriteOutcome> {
    let endpoint = normalize_endpoint(endpoint);

    if options.queue_when_offline && self.connectivity.is_offline() {
      return self.enqueue(&endpoint, method, &body);
    }

    let request = ApiRequest::write(method, &endpoint, body);
    match self.send(&request).await {
      Ok(data) => {
        self.invalidate_related(&endpoint);
        Ok(WriteOutcome::Completed { data })
      }
      Err(e) if e.is_connectivity() && options.queue_when_offline => {
        warn!("{} {} could not reach the server, queueing", method, endpoint);
        let body = request.body.unwrap_or(Value::Null);
        self.enqueue(&endpoint, method, &body)
      }
      Err(e) => Err(e),
    }
  }

  fn enqueue(&self, endpoint: &str, method: WriteMethod, body: &Value) -> Result<WriteOutcome> {
    if !self.replay.supports(endpoint, method) {
      return Err(GatewayError::UnsupportedOffline {
        method,
        endpoint: endpoint.to_string(),
      });
    }
    let id = self.queue.enqueue(endpoint, method, body)?;
    Ok(WriteOutcome::Queued { id })
  }

  fn invalidate_related(&self, endpoint: &str) {
    let removed: usize = self
      .invalidation
      .patterns_for(endpoint)
      .iter()
      .map(|pattern| self.cache.invalidate(Some(pattern)))
      .sum();
    if removed > 0 {
      debug!("Invalidated {} cache entries after {}", removed, endpoint);
    }
  }

  /// Execute `request` with the current bearer token and map the response.
  ///
  /// A 401 triggers one shared token refresh and exactly one retry; a second
  /// 401 is terminal. No cache or queue is involved.
  pub async fn send(&self, request: &ApiRequest) -> Result<Value> {
    let token = self.auth.credentials().access_token();
    let mut response = self.execute(request, token.as_deref()).await?;

    // Without a refresher the coordinator clears the credentials and reports AuthExpired
    if response.category() == StatusCategory::Unauthorized {
      debug!("{} {} unauthorized, refreshing", request.method, request.endpoint);
      let fresh = self.auth.refresh(token.as_deref()).await?;
      response = self.execute(request, Some(&fresh)).await?;
    }

    match response.category() {
      StatusCategory::Success => Ok(response.body),
      StatusCategory::Unauthorized => Err(GatewayError::AuthExpired),
      StatusCategory::ClientError => Err(GatewayError::Rejected {
        status: response.status,
        body: response.body,
      }),
      StatusCategory::ServerError | StatusCategory::Other => Err(GatewayError::Unknown(format!(
        "{} {} failed with status {}",
        request.method, request.endpoint, response.status
      ))),
    }
  }

  /// Transport call that feeds its outcome to the connectivity monitor.
  async fn execute(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse> {
    match self.transport.execute(request, bearer).await {
      Ok(response) => {
        self.connectivity.report_reachable();
        Ok(response)
      }
      Err(e) => {
        if e.is_connectivity() {
          self.connectivity.report_unreachable();
        }
        Err(e)
      }
    }
  }

  /// Replay pending operations in id order, one at a time.
  ///
  /// Stops at the first connectivity error, leaving that operation and
  /// everything after it pending. Any other error, session expiry included,
  /// fails only the operation that raised it.
  pub async fn force_sync(&self) -> Result<SyncReport> {
    let _drain = self.sync_lock.lock().await;
    self.sync_runs.fetch_add(1, Ordering::SeqCst);
    self.queue.recover_interrupted()?;

    let mut report = SyncReport::default();
    for operation in self.queue.list_pending()? {
      self.queue.mark_processing(operation.id)?;

      let Some(handler) = self.replay.resolve(&operation.endpoint, operation.method) else {
        warn!(
          "No replay handler for {} {}",
          operation.method, operation.endpoint
        );
        self.queue.mark_failed(operation.id, "no replay handler registered")?;
        report.failed += 1;
        continue;
      };

      match handler.replay(self, &operation).await {
        Ok(result) => {
          self.queue.mark_completed(operation.id, &result)?;
          self.invalidate_related(&operation.endpoint);
          report.completed += 1;
        }
        Err(e) if e.is_connectivity() => {
          info!("Offline sync halted at operation {}: {}", operation.id, e);
          self.queue.requeue(operation.id)?;
          report.halted_by = Some(e);
          break;
        }
        Err(e) => {
          warn!("Offline operation {} failed: {}", operation.id, e);
          self.queue.mark_failed(operation.id, &e.to_string())?;
          report.failed += 1;
        }
      }
    }

    report.remaining = self.queue.pending_count()?;
    info!("Offline sync finished: {}", report);
    Ok(report)
  }

  /// Drop cache entries matching `pattern`, or everything.
  pub fn clear_cache(&self, pattern: Option<&str>) -> usize {
    self.cache.invalidate(pattern)
  }

  pub fn cache_metrics(&self) -> CacheMetrics {
    self.cache.metrics()
  }

  pub fn pending_offline_count(&self) -> Result<usize> {
    self.queue.pending_count()
  }

  /// Poll a queued write.
  pub fn operation(&self, id: i64) -> Result<Option<OfflineOperation>> {
    self.queue.get(id)
  }

  pub fn pending_operations(&self) -> Result<Vec<OfflineOperation>> {
    self.queue.list_pending()
  }

  pub fn failed_operations(&self) -> Result<Vec<OfflineOperation>> {
    self.queue.list_by_status(OperationStatus::Failed)
  }

  /// Move failed operations back to pending.
  pub fn retry_failed(&self) -> Result<usize> {
    self.queue.retry_failed()
  }

  pub fn clear_failed(&self) -> Result<usize> {
    self.queue.clear_failed()
  }

  pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
    &self.connectivity
  }

  pub fn connectivity_state(&self) -> ConnectivityState {
    self.connectivity.state()
  }

  pub fn on_connectivity_change<F>(&self, callback: F) -> Subscription
  where
    F: Fn(ConnectivityState) + Send + Sync + 'static,
  {
    self.connectivity.subscribe(callback)
  }

  pub async fn check_connectivity(&self) -> bool {
    self.connectivity.check_now().await
  }

  pub fn refresh_attempts(&self) -> u64 {
    self.auth.attempts()
  }

  /// Number of queue drains started so far.
  pub fn sync_runs(&self) -> u64 {
    self.sync_runs.load(Ordering::SeqCst)
  }

  /// Purge expired cache entries and completed operations past retention.
  pub fn maintain(&self) -> Result<MaintenanceReport> {
    let report = MaintenanceReport {
      expired_entries: self.cache.purge_expired(),
      completed_operations: self.queue.cleanup(self.retention)?,
    };
    debug!("Maintenance: {:?}", report);
    Ok(report)
  }

  /// Spawn the probe loop, reconnect replay and periodic maintenance.
  ///
  /// The tasks hold only weak references and are aborted when the returned
  /// [`GatewayTasks`] is dropped.
  pub fn start(self: &Arc<Self>) -> GatewayTasks {
    let probe = self.connectivity.spawn_probe_loop();
    let sync = self.spawn_reconnect_sync();
    let maintenance = self.spawn_maintenance();
    GatewayTasks {
      handles: vec![probe, sync, maintenance],
    }
  }

  fn spawn_reconnect_sync(self: &Arc<Self>) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = self.connectivity.subscribe(move |state| {
      let _ = tx.send(state);
    });
    let gateway = Arc::downgrade(self);

    tokio::spawn(async move {
      let _subscription = subscription;
      let mut previous = ConnectivityState::Unknown;
      while let Some(state) = rx.recv().await {
        let reconnected = state.is_online() && !previous.is_online();
        previous = state;
        if !reconnected {
          continue;
        }

        let Some(gateway) = gateway.upgrade() else {
          break;
        };
        if let Err(e) = gateway.force_sync().await {
          warn!("Offline sync after reconnect failed: {}", e);
        }
      }
    })
  }

  fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
    let gateway = Arc::downgrade(self);
    let period = tick_period(self.maintenance_interval);

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let Some(gateway) = gateway.upgrade() else {
          break;
        };
        if let Err(e) = gateway.maintain() {
          warn!("Maintenance failed: {}", e);
        }
      }
    })
  }
}

/// Background tasks started by [`Gateway::start`]; aborted on drop.
pub struct GatewayTasks {
  handles: Vec<JoinHandle<()>>,
}

impl GatewayTasks {
  pub fn shutdown(self) {
    drop(self);
  }
}

impl Drop for GatewayTasks {
  fn drop(&mut self) {
    for handle in &self.handles {
      handle.abort();
    }
  }
}
