//! Resilient client-side gateway for a remote HTTP API.
//!
//! Reads are cache-first with stale fallback when the server is unreachable,
//! writes made offline are queued in SQLite and replayed in order once
//! connectivity returns, and concurrent 401s share a single token refresh.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod gateway;
pub mod queue;

pub use api::{ApiRequest, ApiResponse, Method, Params, Transport, WriteMethod};
pub use auth::{Credentials, TokenRefresher};
pub use config::Config;
pub use connectivity::{ConnectivityState, Probe, Subscription};
pub use error::{GatewayError, Result};
pub use gateway::{
  Gateway, GatewayBuilder, GatewayTasks, Passthrough, ReadOptions, ReadResponse, ReplayHandler,
  ReplayRegistry, ResponseSource, SyncReport, WriteOptions, WriteOutcome,
};
pub use queue::{OfflineOperation, OperationStatus};
