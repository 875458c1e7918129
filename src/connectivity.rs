//! Online/offline tracking from passive signals and an active probe.
//!
//! State machine: `Unknown -> Online <-> Offline`. A passive "down" signal is
//! trusted immediately; a passive "up" signal only counts once the probe
//! confirms the server is reachable.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::api::{ApiRequest, StatusCategory, Transport};
use crate::config::ConnectivityConfig;
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
  Unknown,
  Online,
  Offline,
}

impl ConnectivityState {
  pub fn is_online(&self) -> bool {
    matches!(self, Self::Online)
  }

  pub fn is_offline(&self) -> bool {
    matches!(self, Self::Offline)
  }
}

impl std::fmt::Display for ConnectivityState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Self::Unknown => "unknown",
      Self::Online => "online",
      Self::Offline => "offline",
    };
    f.write_str(name)
  }
}

/// A cheap liveness check against the server.
#[async_trait]
pub trait Probe: Send + Sync {
  async fn probe(&self) -> Result<()>;
}

/// Probe issuing `HEAD` to the health endpoint; anything but 2xx is a failure.
pub struct HealthCheck {
  transport: Arc<dyn Transport>,
  endpoint: String,
}

impl HealthCheck {
  pub fn new(transport: Arc<dyn Transport>, endpoint: &str) -> Self {
    Self {
      transport,
      endpoint: endpoint.to_string(),
    }
  }
}

#[async_trait]
impl Probe for HealthCheck {
  async fn probe(&self) -> Result<()> {
    let response = self
      .transport
      .execute(&ApiRequest::head(&self.endpoint), None)
      .await?;
    match response.category() {
      StatusCategory::Success => Ok(()),
      _ => Err(GatewayError::Unknown(format!(
        "health check returned status {}",
        response.status
      ))),
    }
  }
}

/// Shortest period for background loops; `tokio::time::interval` rejects zero.
const MIN_TICK: Duration = Duration::from_secs(1);

/// `period` raised to at least [`MIN_TICK`].
pub(crate) fn tick_period(period: Duration) -> Duration {
  period.max(MIN_TICK)
}

type Callback = Box<dyn Fn(ConnectivityState) + Send + Sync>;

/// A registered callback and the newest state generation it has seen.
struct Listener {
  callback: Callback,
  delivered: Mutex<Option<u64>>,
}

impl Listener {
  fn new(callback: Callback) -> Self {
    Self {
      callback,
      delivered: Mutex::new(None),
    }
  }

  /// Run the callback unless a state at least as new already reached it.
  fn deliver(&self, state: ConnectivityState, generation: u64) {
    let mut delivered = self.delivered.lock().unwrap_or_else(PoisonError::into_inner);
    if delivered.is_some_and(|seen| seen >= generation) {
      return;
    }
    *delivered = Some(generation);
    (self.callback)(state);
  }
}

/// Registered callbacks plus a counter bumped on every published transition.
#[derive(Default)]
struct Listeners {
  next_id: u64,
  generation: u64,
  callbacks: BTreeMap<u64, Arc<Listener>>,
}

/// Handle returned by [`ConnectivityMonitor::subscribe`]; dropping it unsubscribes.
#[must_use = "the listener is removed when the subscription is dropped"]
pub struct Subscription {
  listeners: Weak<Mutex<Listeners>>,
  id: u64,
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(listeners) = self.listeners.upgrade() {
      listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .callbacks
        .remove(&self.id);
    }
  }
}

pub struct ConnectivityMonitor {
  probe: Arc<dyn Probe>,
  probe_interval: Duration,
  probe_timeout: Duration,
  state: watch::Sender<ConnectivityState>,
  listeners: Arc<Mutex<Listeners>>,
}

impl ConnectivityMonitor {
  pub fn new(probe: Arc<dyn Probe>, probe_interval: Duration, probe_timeout: Duration) -> Self {
    let (state, _) = watch::channel(ConnectivityState::Unknown);
    Self {
      probe,
      probe_interval,
      probe_timeout,
      state,
      listeners: Arc::new(Mutex::new(Listeners::default())),
    }
  }

  pub fn from_config(probe: Arc<dyn Probe>, config: &ConnectivityConfig) -> Self {
    Self::new(probe, config.probe_interval(), config.probe_timeout())
  }

  pub fn state(&self) -> ConnectivityState {
    *self.state.borrow()
  }

  pub fn is_offline(&self) -> bool {
    self.state().is_offline()
  }

  /// Receiver that observes every confirmed transition.
  pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
    self.state.subscribe()
  }

  /// Register `callback`; it runs now with the current state and again on
  /// every transition until the returned [`Subscription`] is dropped.
  ///
  /// Each callback sees states in order: a transition racing the initial call
  /// is never followed by the older state. Callbacks must not change the
  /// connectivity state themselves.
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(ConnectivityState) + Send + Sync + 'static,
  {
    let listener = Arc::new(Listener::new(Box::new(callback)));
    let (id, state, generation) = {
      let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
      let id = listeners.next_id;
      listeners.next_id += 1;
      listeners.callbacks.insert(id, Arc::clone(&listener));
      (id, self.state(), listeners.generation)
    };

    listener.deliver(state, generation);

    Subscription {
      listeners: Arc::downgrade(&self.listeners),
      id,
    }
  }

  /// Run the probe once, bounded by the probe timeout, and broadcast the result.
  pub async fn check_now(&self) -> bool {
    let reachable = match tokio::time::timeout(self.probe_timeout, self.probe.probe()).await {
      Ok(Ok(())) => true,
      Ok(Err(e)) => {
        debug!("Connectivity probe failed: {}", e);
        false
      }
      Err(_) => {
        debug!("Connectivity probe timed out after {:?}", self.probe_timeout);
        false
      }
    };

    self.broadcast(if reachable {
      ConnectivityState::Online
    } else {
      ConnectivityState::Offline
    });
    reachable
  }

  /// Passive signal: the network interface went away.
  pub fn network_down(&self) {
    self.broadcast(ConnectivityState::Offline);
  }

  /// Passive signal: the network interface came back. Not trusted until probed.
  pub async fn network_up(&self) -> bool {
    self.check_now().await
  }

  /// A live request got a response, so the server is reachable.
  pub fn report_reachable(&self) {
    self.broadcast(ConnectivityState::Online);
  }

  /// A live request could not reach the server.
  pub fn report_unreachable(&self) {
    self.broadcast(ConnectivityState::Offline);
  }

  /// Publish `next` if it differs from the current state. Returns whether it did.
  fn broadcast(&self, next: ConnectivityState) -> bool {
    let (previous, generation, callbacks) = {
      let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
      let mut previous = next;
      let changed = self.state.send_if_modified(|state| {
        previous = *state;
        if *state == next {
          return false;
        }
        *state = next;
        true
      });
      if !changed {
        return false;
      }
      listeners.generation += 1;
      let callbacks: Vec<Arc<Listener>> = listeners.callbacks.values().cloned().collect();
      (previous, listeners.generation, callbacks)
    };

    info!("Connectivity changed: {} -> {}", previous, next);
    for listener in callbacks {
      listener.deliver(next, generation);
    }
    true
  }

  /// Probe on a fixed interval, starting immediately. The task ends once the
  /// monitor is dropped.
  pub fn spawn_probe_loop(self: &Arc<Self>) -> JoinHandle<()> {
    let monitor = Arc::downgrade(self);
    let period = tick_period(self.probe_interval);

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let Some(monitor) = monitor.upgrade() else {
          break;
        };
        monitor.check_now().await;
      }
    })
  }
}
