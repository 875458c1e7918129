//! Request and response types exchanged with the remote API.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Query parameters. A `BTreeMap` keeps them sorted, which is what makes
/// cache keys independent of the order callers insert parameters in.
pub type Params = BTreeMap<String, Value>;

/// HTTP verbs the gateway issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Head => "HEAD",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl From<Method> for reqwest::Method {
  fn from(method: Method) -> Self {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Head => reqwest::Method::HEAD,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

/// The mutating subset of [`Method`]; only these can be queued offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WriteMethod {
  Post,
  Put,
  Patch,
  Delete,
}

impl WriteMethod {
  pub fn as_str(&self) -> &'static str {
    Method::from(*self).as_str()
  }
}

impl From<WriteMethod> for Method {
  fn from(method: WriteMethod) -> Self {
    match method {
      WriteMethod::Post => Method::Post,
      WriteMethod::Put => Method::Put,
      WriteMethod::Patch => Method::Patch,
      WriteMethod::Delete => Method::Delete,
    }
  }
}

impl fmt::Display for WriteMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for WriteMethod {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_uppercase().as_str() {
      "POST" => Ok(Self::Post),
      "PUT" => Ok(Self::Put),
      "PATCH" => Ok(Self::Patch),
      "DELETE" => Ok(Self::Delete),
      other => Err(format!("not a mutating method: {}", other)),
    }
  }
}

/// A logical request: `(endpoint, method, params | body)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  pub method: Method,
  pub endpoint: String,
  pub params: Params,
  pub body: Option<Value>,
}

impl ApiRequest {
  pub fn get(endpoint: &str, params: Params) -> Self {
    Self {
      method: Method::Get,
      endpoint: normalize_endpoint(endpoint),
      params,
      body: None,
    }
  }

  pub fn head(endpoint: &str) -> Self {
    Self {
      method: Method::Head,
      endpoint: normalize_endpoint(endpoint),
      params: Params::new(),
      body: None,
    }
  }

  pub fn write(method: WriteMethod, endpoint: &str, body: Value) -> Self {
    Self {
      method: method.into(),
      endpoint: normalize_endpoint(endpoint),
      params: Params::new(),
      body: Some(body),
    }
  }
}

/// Coarse classification of an HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
  Success,
  Unauthorized,
  ClientError,
  ServerError,
  Other,
}

impl StatusCategory {
  pub fn from_status(status: u16) -> Self {
    match status {
      200..=299 => Self::Success,
      401 => Self::Unauthorized,
      400..=499 => Self::ClientError,
      500..=599 => Self::ServerError,
      _ => Self::Other,
    }
  }
}

/// A response as seen by the gateway: `(status, body)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
  pub status: u16,
  pub body: Value,
}

impl ApiResponse {
  pub fn new(status: u16, body: Value) -> Self {
    Self { status, body }
  }

  pub fn ok(body: Value) -> Self {
    Self::new(200, body)
  }

  pub fn category(&self) -> StatusCategory {
    StatusCategory::from_status(self.status)
  }
}

/// Normalize an endpoint to a single leading `/` with surrounding whitespace removed.
pub fn normalize_endpoint(endpoint: &str) -> String {
  let trimmed = endpoint.trim().trim_start_matches('/');
  format!("/{}", trimmed)
}
