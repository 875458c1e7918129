use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use resilient_gateway::api::ApiResponse;
use resilient_gateway::cache::{CacheKey, CachePolicy, CacheStorage, SqliteStorage};
use resilient_gateway::db::Database;
use resilient_gateway::{
  ApiRequest, Credentials, Gateway, GatewayBuilder, GatewayError, Method, OperationStatus, Params,
  ReadOptions, ResponseSource, Result, TokenRefresher, Transport, WriteMethod, WriteOptions,
  WriteOutcome,
};

#[derive(Debug, Clone)]
struct Call {
  method: Method,
  endpoint: String,
  bearer: Option<String>,
  body: Option<Value>,
}

type Handler = dyn Fn(&ApiRequest, Option<&str>) -> ApiResponse + Send + Sync;

/// Scripted remote API. Health checks answer 200 while `up`; every other
/// request is recorded, then fails with a connectivity error if the server
/// is down or the body matches `unreachable_body`.
struct FakeServer {
  up: AtomicBool,
  unreachable_body: Mutex<Option<Value>>,
  log: Mutex<Vec<Call>>,
  handler: Box<Handler>,
}

impl FakeServer {
  fn new(
    handler: impl Fn(&ApiRequest, Option<&str>) -> ApiResponse + Send + Sync + 'static,
  ) -> Arc<Self> {
    Arc::new(Self {
      up: AtomicBool::new(true),
      unreachable_body: Mutex::new(None),
      log: Mutex::new(Vec::new()),
      handler: Box::new(handler),
    })
  }

  fn echo() -> Arc<Self> {
    Self::new(|request, _| ApiResponse::ok(json!({ "endpoint": request.endpoint })))
  }

  fn set_up(&self, up: bool) {
    self.up.store(up, Ordering::SeqCst);
  }

  fn fail_body(&self, body: Option<Value>) {
    *self.unreachable_body.lock().unwrap() = body;
  }

  fn calls(&self) -> Vec<Call> {
    self.log.lock().unwrap().clone()
  }

  fn calls_to(&self, endpoint: &str) -> usize {
    self.calls().iter().filter(|c| c.endpoint == endpoint).count()
  }

  fn posted_bodies(&self) -> Vec<Value> {
    self
      .calls()
      .into_iter()
      .filter(|c| c.method == Method::Post)
      .filter_map(|c| c.body)
      .collect()
  }
}

#[async_trait]
impl Transport for FakeServer {
  async fn execute(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse> {
    let up = self.up.load(Ordering::SeqCst);
    if request.method == Method::Head {
      return if up {
        Ok(ApiResponse::ok(Value::Null))
      } else {
        Err(GatewayError::Connectivity("health check unreachable".into()))
      };
    }

    self.log.lock().unwrap().push(Call {
      method: request.method,
      endpoint: request.endpoint.clone(),
      bearer: bearer.map(str::to_string),
      body: request.body.clone(),
    });

    let blocked = self.unreachable_body.lock().unwrap().clone();
    if !up || (blocked.is_some() && blocked == request.body) {
      return Err(GatewayError::Connectivity("connection refused".into()));
    }
    Ok((self.handler)(request, bearer))
  }
}

struct CountingRefresher {
  calls: AtomicUsize,
  grant: Option<&'static str>,
}

impl CountingRefresher {
  fn granting(token: &'static str) -> Arc<Self> {
    Arc::new(Self {
      calls: AtomicUsize::new(0),
      grant: Some(token),
    })
  }

  fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl TokenRefresher for CountingRefresher {
  async fn refresh(&self, _refresh_token: &str) -> Result<Credentials> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(30)).await;
    match self.grant {
      Some(token) => Ok(Credentials {
        access_token: token.to_string(),
        refresh_token: None,
      }),
      None => Err(GatewayError::AuthExpired),
    }
  }
}

fn builder(server: &Arc<FakeServer>) -> GatewayBuilder {
  Gateway::builder(server.clone()).replay_with(|replay| {
    replay
      .passthrough("orders", WriteMethod::Post)
      .passthrough("lottery/tickets/purchase", WriteMethod::Post)
  })
}

fn gateway(server: &Arc<FakeServer>) -> Gateway {
  builder(server).build().unwrap()
}

fn session(access: &str) -> Credentials {
  Credentials {
    access_token: access.to_string(),
    refresh_token: Some("refresh".to_string()),
  }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
  for _ in 0..300 {
    if condition() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("condition not reached in time");
}

#[tokio::test]
async fn test_cold_read_hits_network_and_caches_with_policy_ttl() {
  let server = FakeServer::echo();
  let db = Database::open_in_memory().unwrap();
  let gateway = builder(&server)
    .database(db.clone())
    .policy(CachePolicy::new(Duration::from_secs(60)).with_rule("catalog", Duration::from_secs(86_400)))
    .build()
    .unwrap();

  let response = gateway.read("/catalog", Params::new(), ReadOptions::default()).await.unwrap();
  assert_eq!(response.source, ResponseSource::Network);
  assert_eq!(response.data, json!({"endpoint": "/catalog"}));
  assert_eq!(server.calls_to("/catalog"), 1);

  let key = CacheKey::new("/catalog", &Params::new());
  let stored = SqliteStorage::new(db).load(key.as_str()).unwrap().unwrap();
  assert_eq!(
    stored.expires_at - stored.created_at,
    chrono::Duration::seconds(86_400)
  );
}

#[tokio::test]
async fn test_warm_read_never_touches_network() {
  let server = FakeServer::echo();
  let gateway = gateway(&server);

  gateway.read("/catalog", Params::new(), ReadOptions::default()).await.unwrap();
  let response = gateway.read("/catalog", Params::new(), ReadOptions::default()).await.unwrap();

  assert_eq!(response.source, ResponseSource::Cache);
  assert_eq!(response.data, json!({"endpoint": "/catalog"}));
  assert_eq!(server.calls_to("/catalog"), 1);
}

#[tokio::test]
async fn test_offline_write_is_queued_without_network_call() {
  let server = FakeServer::echo();
  let gateway = gateway(&server);
  gateway.connectivity().network_down();

  let outcome = gateway
    .write("/orders", WriteMethod::Post, json!({"sku": 7}), WriteOptions::default())
    .await
    .unwrap();

  let WriteOutcome::Queued { id } = outcome else {
    panic!("expected queued outcome, got {:?}", outcome);
  };
  assert!(server.calls().is_empty());
  let operation = gateway.operation(id).unwrap().unwrap();
  assert_eq!(operation.status, OperationStatus::Pending);
  assert_eq!(operation.payload, json!({"sku": 7}));
  assert_eq!(gateway.pending_offline_count().unwrap(), 1);
}

#[tokio::test]
async fn test_reconnect_replays_queue_and_invalidates_cache() {
  let server = FakeServer::echo();
  let gateway = Arc::new(
    builder(&server)
      .probe_interval(Duration::from_secs(3600))
      .build()
      .unwrap(),
  );

  gateway.read("/orders", Params::new(), ReadOptions::default()).await.unwrap();
  assert_eq!(gateway.cache_metrics().live_entries, 1);

  server.set_up(false);
  gateway.connectivity().network_down();
  let outcome = gateway
    .write("/orders", WriteMethod::Post, json!({"sku": 7}), WriteOptions::default())
    .await
    .unwrap();
  let WriteOutcome::Queued { id } = outcome else {
    panic!("expected queued outcome");
  };

  server.set_up(true);
  let _tasks = gateway.start();
  wait_for(|| {
    gateway
      .operation(id)
      .unwrap()
      .is_some_and(|op| op.status == OperationStatus::Completed)
  })
  .await;

  let operation = gateway.operation(id).unwrap().unwrap();
  assert_eq!(operation.result, Some(json!({"endpoint": "/orders"})));
  assert_eq!(gateway.cache_metrics().total_entries, 0);

  let response = gateway.read("/orders", Params::new(), ReadOptions::default()).await.unwrap();
  assert_eq!(response.source, ResponseSource::Network);
}

#[tokio::test]
async fn test_refresh_in_flight_is_shared_and_request_retried_once() {
  let server = FakeServer::new(|request, bearer| match bearer {
    Some("fresh") => ApiResponse::ok(json!({ "endpoint": request.endpoint })),
    _ => ApiResponse::new(401, json!({"detail": "token expired"})),
  });
  let refresher = CountingRefresher::granting("fresh");
  let gateway = builder(&server)
    .credentials(session("stale"))
    .refresher(refresher.clone())
    .build()
    .unwrap();

  let endpoints = ["/wallet", "/tickets", "/profile", "/draws"];
  let reads = endpoints
    .iter()
    .map(|endpoint| gateway.read(endpoint, Params::new(), ReadOptions::uncached()));
  let results = futures::future::join_all(reads).await;

  assert!(results.iter().all(|r| r.is_ok()));
  assert_eq!(refresher.calls(), 1);
  assert_eq!(gateway.refresh_attempts(), 1);
  for endpoint in endpoints {
    let bearers: Vec<_> = server
      .calls()
      .into_iter()
      .filter(|c| c.endpoint == endpoint)
      .map(|c| c.bearer)
      .collect();
    assert_eq!(
      bearers,
      vec![Some("stale".to_string()), Some("fresh".to_string())]
    );
  }
}

#[tokio::test]
async fn test_second_unauthorized_is_terminal() {
  let server = FakeServer::new(|_, _| ApiResponse::new(401, Value::Null));
  let refresher = CountingRefresher::granting("still-bad");
  let gateway = builder(&server)
    .credentials(session("stale"))
    .refresher(refresher.clone())
    .build()
    .unwrap();

  let err = gateway
    .read("/wallet", Params::new(), ReadOptions::uncached())
    .await
    .unwrap_err();
  assert!(err.is_auth_expired());
  assert_eq!(refresher.calls(), 1);
  assert_eq!(server.calls_to("/wallet"), 2);
}

#[tokio::test]
async fn test_failed_refresh_expires_every_waiter() {
  let server = FakeServer::new(|_, _| ApiResponse::new(401, Value::Null));
  let refresher = Arc::new(CountingRefresher {
    calls: AtomicUsize::new(0),
    grant: None,
  });
  let gateway = builder(&server)
    .credentials(session("stale"))
    .refresher(refresher.clone())
    .build()
    .unwrap();

  let reads = (0..3).map(|i| {
    let endpoint = format!("/r{}", i);
    let gateway = &gateway;
    async move { gateway.read(&endpoint, Params::new(), ReadOptions::uncached()).await }
  });
  let results = futures::future::join_all(reads).await;

  assert!(results
    .iter()
    .all(|r| matches!(r, Err(GatewayError::AuthExpired))));
  assert_eq!(refresher.calls(), 1);
}

#[tokio::test]
async fn test_replay_preserves_enqueue_order() {
  let server = FakeServer::echo();
  let gateway = gateway(&server);
  gateway.connectivity().network_down();

  for n in 1..=5 {
    gateway
      .write("/orders", WriteMethod::Post, json!({ "n": n }), WriteOptions::default())
      .await
      .unwrap();
  }

  let report = gateway.force_sync().await.unwrap();
  assert_eq!(report.completed, 5);
  assert!(report.is_complete());
  assert_eq!(
    server.posted_bodies(),
    (1..=5).map(|n| json!({ "n": n })).collect::<Vec<_>>()
  );
}

#[tokio::test]
async fn test_connectivity_failure_halts_replay_in_order() {
  let server = FakeServer::echo();
  let gateway = gateway(&server);
  gateway.connectivity().network_down();

  let mut ids = Vec::new();
  for n in 1..=4 {
    let outcome = gateway
      .write("/orders", WriteMethod::Post, json!({ "n": n }), WriteOptions::default())
      .await
      .unwrap();
    let WriteOutcome::Queued { id } = outcome else {
      panic!("expected queued outcome");
    };
    ids.push(id);
  }

  server.fail_body(Some(json!({"n": 3})));
  let report = gateway.force_sync().await.unwrap();
  assert_eq!(report.completed, 2);
  assert_eq!(report.remaining, 2);
  assert!(report.halted_by.as_ref().is_some_and(GatewayError::is_connectivity));

  let statuses: Vec<_> = ids
    .iter()
    .map(|id| gateway.operation(*id).unwrap().unwrap().status)
    .collect();
  assert_eq!(
    statuses,
    vec![
      OperationStatus::Completed,
      OperationStatus::Completed,
      OperationStatus::Pending,
      OperationStatus::Pending
    ]
  );
  assert!(!server.posted_bodies().contains(&json!({"n": 4})));

  server.fail_body(None);
  let report = gateway.force_sync().await.unwrap();
  assert_eq!(report.completed, 2);
  assert_eq!(report.remaining, 0);
  assert_eq!(
    server.posted_bodies(),
    vec![
      json!({"n": 1}),
      json!({"n": 2}),
      json!({"n": 3}),
      json!({"n": 3}),
      json!({"n": 4})
    ]
  );
}

#[tokio::test]
async fn test_rejected_replay_fails_only_that_operation() {
  let server = FakeServer::new(|request, _| match &request.body {
    Some(body) if body["n"] == json!(2) => ApiResponse::new(422, json!({"n": "invalid"})),
    _ => ApiResponse::ok(json!({"ok": true})),
  });
  let gateway = gateway(&server);
  gateway.connectivity().network_down();

  for n in 1..=3 {
    gateway
      .write("/orders", WriteMethod::Post, json!({ "n": n }), WriteOptions::default())
      .await
      .unwrap();
  }

  let report = gateway.force_sync().await.unwrap();
  assert_eq!((report.completed, report.failed, report.remaining), (2, 1, 0));

  let failed = gateway.failed_operations().unwrap();
  assert_eq!(failed.len(), 1);
  assert_eq!(failed[0].payload, json!({"n": 2}));
  assert!(failed[0].error.as_deref().is_some_and(|e| e.contains("422")));

  assert_eq!(gateway.retry_failed().unwrap(), 1);
  assert_eq!(gateway.pending_offline_count().unwrap(), 1);
}

#[tokio::test]
async fn test_successful_write_invalidates_related_reads() {
  let server = FakeServer::echo();
  let gateway = gateway(&server);

  gateway
    .read("/lottery/tickets", Params::new(), ReadOptions::default())
    .await
    .unwrap();
  gateway
    .read("/payments/wallet", Params::new(), ReadOptions::default())
    .await
    .unwrap();
  gateway
    .read("/lottery/games", Params::new(), ReadOptions::default())
    .await
    .unwrap();

  let outcome = gateway
    .write(
      "/lottery/tickets/purchase",
      WriteMethod::Post,
      json!({"numbers": [1, 2, 3]}),
      WriteOptions::default(),
    )
    .await
    .unwrap();
  assert!(!outcome.is_queued());

  let tickets = gateway
    .read("/lottery/tickets", Params::new(), ReadOptions::default())
    .await
    .unwrap();
  let wallet = gateway
    .read("/payments/wallet", Params::new(), ReadOptions::default())
    .await
    .unwrap();
  let games = gateway
    .read("/lottery/games", Params::new(), ReadOptions::default())
    .await
    .unwrap();

  assert_eq!(tickets.source, ResponseSource::Network);
  assert_eq!(wallet.source, ResponseSource::Network);
  assert_eq!(games.source, ResponseSource::Cache);
}

#[tokio::test]
async fn test_forced_refresh_falls_back_to_cache_when_unreachable() {
  let server = FakeServer::echo();
  let gateway = gateway(&server);
  gateway.read("/catalog", Params::new(), ReadOptions::default()).await.unwrap();

  server.set_up(false);
  let response = gateway.read("/catalog", Params::new(), ReadOptions::fresh()).await.unwrap();
  assert_eq!(response.source, ResponseSource::Offline);
  assert_eq!(response.data, json!({"endpoint": "/catalog"}));
  assert!(gateway.connectivity().is_offline());

  let err = gateway
    .read("/uncached", Params::new(), ReadOptions::default())
    .await
    .unwrap_err();
  assert!(err.is_connectivity());
}

#[tokio::test]
async fn test_write_that_cannot_connect_is_queued() {
  let server = FakeServer::echo();
  let gateway = gateway(&server);
  server.set_up(false);

  let outcome = gateway
    .write("/orders", WriteMethod::Post, json!({}), WriteOptions::default())
    .await
    .unwrap();
  assert!(outcome.is_queued());
  assert_eq!(server.calls_to("/orders"), 1);
  assert!(gateway.connectivity().is_offline());
}

#[tokio::test]
async fn test_rejected_write_is_surfaced_not_queued() {
  let server = FakeServer::new(|_, _| ApiResponse::new(400, json!({"sku": "required"})));
  let gateway = gateway(&server);

  let err = gateway
    .write("/orders", WriteMethod::Post, json!({}), WriteOptions::default())
    .await
    .unwrap_err();
  assert!(matches!(err, GatewayError::Rejected { status: 400, .. }));
  assert_eq!(gateway.pending_offline_count().unwrap(), 0);
}

#[tokio::test]
async fn test_offline_write_without_replay_route_is_refused() {
  let server = FakeServer::echo();
  let gateway = gateway(&server);
  gateway.connectivity().network_down();

  let err = gateway
    .write("/profile/avatar", WriteMethod::Put, json!({}), WriteOptions::default())
    .await
    .unwrap_err();
  assert!(matches!(err, GatewayError::UnsupportedOffline { .. }));
  assert_eq!(gateway.pending_offline_count().unwrap(), 0);
}

#[tokio::test]
async fn test_connectivity_listener_sees_request_driven_transitions() {
  let server = FakeServer::echo();
  let gateway = gateway(&server);
  let seen = Arc::new(Mutex::new(Vec::new()));
  let sink = Arc::clone(&seen);
  let _subscription = gateway.on_connectivity_change(move |state| sink.lock().unwrap().push(state));

  server.set_up(false);
  assert!(!gateway.check_connectivity().await);
  server.set_up(true);
  gateway.read("/catalog", Params::new(), ReadOptions::default()).await.unwrap();

  use resilient_gateway::ConnectivityState::*;
  assert_eq!(*seen.lock().unwrap(), vec![Unknown, Offline, Online]);
}

#[tokio::test]
async fn test_expired_session_during_replay_fails_only_that_operation() {
  let server = FakeServer::new(|request, _| match &request.body {
    Some(body) if body["n"] == json!(1) => ApiResponse::new(401, json!({"detail": "token expired"})),
    _ => ApiResponse::ok(json!({"ok": true})),
  });
  let gateway = builder(&server).credentials(session("stale")).build().unwrap();
  gateway.connectivity().network_down();

  let mut ids = Vec::new();
  for n in 1..=3 {
    let outcome = gateway
      .write("/orders", WriteMethod::Post, json!({ "n": n }), WriteOptions::default())
      .await
      .unwrap();
    let WriteOutcome::Queued { id } = outcome else {
      panic!("expected queued outcome");
    };
    ids.push(id);
  }

  let report = gateway.force_sync().await.unwrap();
  assert_eq!((report.completed, report.failed, report.remaining), (2, 1, 0));
  assert!(report.halted_by.is_none());

  let statuses: Vec<_> = ids
    .iter()
    .map(|id| gateway.operation(*id).unwrap().unwrap().status)
    .collect();
  assert_eq!(
    statuses,
    vec![
      OperationStatus::Failed,
      OperationStatus::Completed,
      OperationStatus::Completed
    ]
  );
  assert_eq!(
    server.posted_bodies(),
    vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]
  );
}

#[tokio::test]
async fn test_unauthorized_without_refresher_clears_session() {
  let server = FakeServer::new(|_, _| ApiResponse::new(401, Value::Null));
  let gateway = builder(&server).credentials(session("stale")).build().unwrap();

  let err = gateway
    .read("/wallet", Params::new(), ReadOptions::uncached())
    .await
    .unwrap_err();
  assert!(err.is_auth_expired());
  assert_eq!(gateway.refresh_attempts(), 0);

  let err = gateway
    .read("/wallet", Params::new(), ReadOptions::uncached())
    .await
    .unwrap_err();
  assert!(err.is_auth_expired());

  let bearers: Vec<_> = server.calls().into_iter().map(|c| c.bearer).collect();
  assert_eq!(bearers, vec![Some("stale".to_string()), None]);
}

#[tokio::test]
async fn test_reconnect_drains_once_per_transition() {
  let server = FakeServer::echo();
  let gateway = Arc::new(
    builder(&server)
      .probe_interval(Duration::from_secs(3600))
      .build()
      .unwrap(),
  );

  let _tasks = gateway.start();
  wait_for(|| gateway.sync_runs() == 1).await;

  for _ in 0..5 {
    assert!(gateway.check_connectivity().await);
  }
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert_eq!(gateway.sync_runs(), 1);

  server.set_up(false);
  assert!(!gateway.check_connectivity().await);
  tokio::time::sleep(Duration::from_millis(20)).await;
  assert_eq!(gateway.sync_runs(), 1);

  server.set_up(true);
  assert!(gateway.check_connectivity().await);
  wait_for(|| gateway.sync_runs() == 2).await;
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert_eq!(gateway.sync_runs(), 2);
}

#[tokio::test]
async fn test_queue_from_previous_run_drains_on_startup() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("gateway.db");
  let server = FakeServer::echo();

  let id = {
    let gateway = builder(&server)
      .database(Database::open(&path).unwrap())
      .build()
      .unwrap();
    gateway.connectivity().network_down();
    let outcome = gateway
      .write("/orders", WriteMethod::Post, json!({"sku": 7}), WriteOptions::default())
      .await
      .unwrap();
    let WriteOutcome::Queued { id } = outcome else {
      panic!("expected queued outcome");
    };
    id
  };
  assert!(server.calls().is_empty());

  let gateway = Arc::new(
    builder(&server)
      .database(Database::open(&path).unwrap())
      .probe_interval(Duration::from_secs(3600))
      .build()
      .unwrap(),
  );
  assert_eq!(gateway.pending_offline_count().unwrap(), 1);

  let _tasks = gateway.start();
  wait_for(|| {
    gateway
      .operation(id)
      .unwrap()
      .is_some_and(|op| op.status == OperationStatus::Completed)
  })
  .await;
  assert_eq!(server.posted_bodies(), vec![json!({"sku": 7})]);
}

#[tokio::test]
async fn test_zero_intervals_and_unbounded_retention_are_tolerated() {
  let server = FakeServer::echo();
  let gateway = Arc::new(
    builder(&server)
      .probe_interval(Duration::ZERO)
      .maintenance_interval(Duration::ZERO)
      .retention(Duration::MAX)
      .build()
      .unwrap(),
  );

  let tasks = gateway.start();
  wait_for(|| gateway.connectivity_state().is_online()).await;

  let report = gateway.maintain().unwrap();
  assert_eq!(report.completed_operations, 0);
  tasks.shutdown();
}
