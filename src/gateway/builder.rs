use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::api::{HttpRefresher, HttpTransport, Transport};
use crate::auth::{CredentialStore, Credentials, RefreshCoordinator, TokenRefresher};
use crate::cache::{CacheLayer, CachePolicy, CacheStorage, InvalidationMap, NoopStorage, SqliteStorage};
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, HealthCheck, Probe};
use crate::db::Database;
use crate::error::{GatewayError, Result};
use crate::queue::OfflineQueue;

use super::{Gateway, ReplayRegistry};

/// Assembles a [`Gateway`] from its collaborators.
///
/// Only the transport is required. Without a database the gateway keeps its
/// cache and queue in a private in-memory SQLite database.
pub struct GatewayBuilder {
  transport: Arc<dyn Transport>,
  probe: Option<Arc<dyn Probe>>,
  database: Option<Database>,
  cache_storage: Option<Arc<dyn CacheStorage>>,
  refresher: Option<Arc<dyn TokenRefresher>>,
  credentials: Option<Credentials>,
  policy: CachePolicy,
  invalidation: InvalidationMap,
  replay: ReplayRegistry,
  caching_enabled: bool,
  retention: Duration,
  maintenance_interval: Duration,
  probe_interval: Duration,
  probe_timeout: Duration,
  health_endpoint: String,
}

impl GatewayBuilder {
  pub fn new(transport: Arc<dyn Transport>) -> Self {
    Self {
      transport,
      probe: None,
      database: None,
      cache_storage: None,
      refresher: None,
      credentials: None,
      policy: CachePolicy::default(),
      invalidation: InvalidationMap::builtin(),
      replay: ReplayRegistry::new(),
      caching_enabled: true,
      retention: Duration::from_secs(24 * 60 * 60),
      maintenance_interval: Duration::from_secs(60 * 60),
      probe_interval: Duration::from_secs(30),
      probe_timeout: Duration::from_secs(5),
      health_endpoint: "health-check".to_string(),
    }
  }

  /// Liveness probe; defaults to `HEAD` on the health endpoint via the transport.
  pub fn probe(mut self, probe: Arc<dyn Probe>) -> Self {
    self.probe = Some(probe);
    self
  }

  pub fn database(mut self, database: Database) -> Self {
    self.database = Some(database);
    self
  }

  /// Persistent cache tier; defaults to SQLite in the gateway database.
  pub fn cache_storage(mut self, storage: Arc<dyn CacheStorage>) -> Self {
    self.cache_storage = Some(storage);
    self
  }

  pub fn refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
    self.refresher = Some(refresher);
    self
  }

  pub fn credentials(mut self, credentials: Credentials) -> Self {
    self.credentials = Some(credentials);
    self
  }

  pub fn policy(mut self, policy: CachePolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn invalidation(mut self, invalidation: InvalidationMap) -> Self {
    self.invalidation = invalidation;
    self
  }

  pub fn replay(mut self, replay: ReplayRegistry) -> Self {
    self.replay = replay;
    self
  }

  pub fn replay_with(mut self, f: impl FnOnce(ReplayRegistry) -> ReplayRegistry) -> Self {
    self.replay = f(self.replay);
    self
  }

  pub fn caching_enabled(mut self, enabled: bool) -> Self {
    self.caching_enabled = enabled;
    self
  }

  /// How long completed operations are kept.
  pub fn retention(mut self, retention: Duration) -> Self {
    self.retention = retention;
    self
  }

  pub fn maintenance_interval(mut self, interval: Duration) -> Self {
    self.maintenance_interval = interval;
    self
  }

  pub fn probe_interval(mut self, interval: Duration) -> Self {
    self.probe_interval = interval;
    self
  }

  pub fn probe_timeout(mut self, timeout: Duration) -> Self {
    self.probe_timeout = timeout;
    self
  }

  pub fn health_endpoint(mut self, endpoint: &str) -> Self {
    self.health_endpoint = endpoint.to_string();
    self
  }

  pub fn build(self) -> Result<Gateway> {
    let database = match self.database {
      Some(database) => database,
      None => Database::open_in_memory()?,
    };
    let storage: Arc<dyn CacheStorage> = match self.cache_storage {
      Some(storage) => storage,
      None => Arc::new(SqliteStorage::new(database.clone())),
    };
    let probe: Arc<dyn Probe> = match self.probe {
      Some(probe) => probe,
      None => Arc::new(HealthCheck::new(
        Arc::clone(&self.transport),
        &self.health_endpoint,
      )),
    };

    let connectivity = ConnectivityMonitor::new(probe, self.probe_interval, self.probe_timeout);
    let credentials = Arc::new(CredentialStore::new(self.credentials));

    Ok(Gateway {
      transport: self.transport,
      cache: CacheLayer::new(storage),
      policy: self.policy,
      invalidation: self.invalidation,
      caching_enabled: self.caching_enabled,
      queue: OfflineQueue::new(database),
      replay: self.replay,
      connectivity: Arc::new(connectivity),
      auth: RefreshCoordinator::new(credentials, self.refresher),
      sync_lock: tokio::sync::Mutex::new(()),
      sync_runs: AtomicU64::new(0),
      retention: self.retention,
      maintenance_interval: self.maintenance_interval,
    })
  }
}

impl Gateway {
  /// Build an HTTP-backed gateway from configuration.
  ///
  /// If the database cannot be opened the gateway still starts, with a
  /// memory-only cache and an in-memory queue that does not survive restarts.
  pub fn from_config(config: &Config, credentials: Option<Credentials>) -> Result<Self> {
    let transport = Arc::new(HttpTransport::new(&config.api)?);
    let refresher = Arc::new(HttpRefresher::new(&config.api)?);

    let mut builder = GatewayBuilder::new(transport)
      .refresher(refresher)
      .policy(CachePolicy::from_config(&config.cache))
      .invalidation(InvalidationMap::from_config(&config.cache))
      .replay(ReplayRegistry::from_config(&config.offline.replay))
      .caching_enabled(config.cache.enabled)
      .retention(config.offline.retention())
      .maintenance_interval(config.offline.maintenance_interval())
      .probe_interval(config.connectivity.probe_interval())
      .probe_timeout(config.connectivity.probe_timeout())
      .health_endpoint(&config.api.health_endpoint);

    let opened = config
      .storage
      .database_path()
      .map_err(|e| GatewayError::Storage(e.to_string()))
      .and_then(|path| {
        info!("Opening gateway database at {}", path.display());
        Database::open(&path)
      });
    builder = match opened {
      Ok(database) => builder.database(database),
      Err(e) => {
        warn!("{}; continuing without persistence", e);
        builder.cache_storage(Arc::new(NoopStorage))
      }
    };

    if let Some(credentials) = credentials {
      builder = builder.credentials(credentials);
    }
    builder.build()
  }
}
