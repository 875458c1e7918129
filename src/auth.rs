//! Bearer credentials and single-flight token refresh.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
  pub access_token: String,
  pub refresh_token: Option<String>,
}

/// Exchanges a refresh token for new credentials.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
  async fn refresh(&self, refresh_token: &str) -> Result<Credentials>;
}

/// Current credentials, shared by every request.
#[derive(Debug, Default)]
pub struct CredentialStore {
  current: RwLock<Option<Credentials>>,
}

impl CredentialStore {
  pub fn new(credentials: Option<Credentials>) -> Self {
    Self {
      current: RwLock::new(credentials),
    }
  }

  pub fn set(&self, credentials: Credentials) {
    *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(credentials);
  }

  pub fn clear(&self) {
    *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
  }

  pub fn get(&self) -> Option<Credentials> {
    self
      .current
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn access_token(&self) -> Option<String> {
    self.get().map(|c| c.access_token)
  }

  pub fn refresh_token(&self) -> Option<String> {
    self.get().and_then(|c| c.refresh_token)
  }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<String>>>;

/// Ensures at most one refresh runs at a time.
///
/// Every caller that hits a 401 while a refresh is running awaits that
/// same attempt and receives its outcome.
pub struct RefreshCoordinator {
  credentials: Arc<CredentialStore>,
  refresher: Option<Arc<dyn TokenRefresher>>,
  in_flight: Mutex<Option<SharedRefresh>>,
  attempts: AtomicU64,
}

impl RefreshCoordinator {
  pub fn new(credentials: Arc<CredentialStore>, refresher: Option<Arc<dyn TokenRefresher>>) -> Self {
    Self {
      credentials,
      refresher,
      in_flight: Mutex::new(None),
      attempts: AtomicU64::new(0),
    }
  }

  pub fn credentials(&self) -> &Arc<CredentialStore> {
    &self.credentials
  }

  /// Whether a 401 can be recovered from at all.
  pub fn can_refresh(&self) -> bool {
    self.refresher.is_some()
  }

  /// Number of refresh calls actually issued.
  pub fn attempts(&self) -> u64 {
    self.attempts.load(Ordering::SeqCst)
  }

  /// Obtain a fresh access token after `rejected_token` got a 401.
  ///
  /// If the stored token already differs from the rejected one, another
  /// caller refreshed in the meantime and the stored token is returned.
  /// A refresh that fails for any reason other than connectivity clears the
  /// credentials and yields [`GatewayError::AuthExpired`].
  pub async fn refresh(&self, rejected_token: Option<&str>) -> Result<String> {
    let attempt = {
      let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
      match in_flight.as_ref() {
        Some(running) => {
          debug!("Joining in-flight token refresh");
          running.clone()
        }
        None => {
          let current = self.credentials.access_token();
          if let (Some(rejected), Some(current)) = (rejected_token, current.as_ref()) {
            if rejected != current {
              return Ok(current.clone());
            }
          }

          let attempt = self.start_refresh()?;
          *in_flight = Some(attempt.clone());
          attempt
        }
      }
    };

    let outcome = attempt.clone().await;

    let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
    if in_flight.as_ref().is_some_and(|running| running.ptr_eq(&attempt)) {
      *in_flight = None;
    }
    outcome
  }

  fn start_refresh(&self) -> Result<SharedRefresh> {
    let (Some(refresher), Some(refresh_token)) =
      (self.refresher.clone(), self.credentials.refresh_token())
    else {
      warn!("Credentials rejected and no refresh is possible");
      self.credentials.clear();
      return Err(GatewayError::AuthExpired);
    };

    self.attempts.fetch_add(1, Ordering::SeqCst);
    let credentials = Arc::clone(&self.credentials);

    let attempt = async move {
      match refresher.refresh(&refresh_token).await {
        Ok(fresh) => {
          info!("Access token refreshed");
          let access_token = fresh.access_token.clone();
          credentials.set(Credentials {
            access_token: fresh.access_token,
            refresh_token: fresh.refresh_token.or(Some(refresh_token)),
          });
          Ok(access_token)
        }
        Err(e) if e.is_connectivity() => {
          warn!("Token refresh could not reach the server: {}", e);
          Err(e)
        }
        Err(e) => {
          warn!("Token refresh failed, session expired: {}", e);
          credentials.clear();
          Err(GatewayError::AuthExpired)
        }
      }
    };

    Ok(attempt.boxed().shared())
  }
}
