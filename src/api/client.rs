use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::auth::{Credentials, TokenRefresher};
use crate::config::ApiConfig;
use crate::error::{GatewayError, Result};

use super::types::{ApiRequest, ApiResponse, Params, StatusCategory};
use super::Transport;

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpTransport {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(config.timeout())
      .build()
      .map_err(|e| GatewayError::Unknown(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url: parse_base_url(&config.base_url)?,
    })
  }

  /// Resolve an endpoint against the base URL.
  fn url_for(&self, endpoint: &str) -> Result<Url> {
    self
      .base_url
      .join(endpoint.trim_start_matches('/'))
      .map_err(|e| GatewayError::Unknown(format!("Invalid endpoint {}: {}", endpoint, e)))
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn execute(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse> {
    let url = self.url_for(&request.endpoint)?;

    let mut builder = self
      .client
      .request(request.method.into(), url)
      .header(reqwest::header::CACHE_CONTROL, "no-cache");
    if !request.params.is_empty() {
      builder = builder.query(&query_pairs(&request.params));
    }
    if let Some(token) = bearer {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await.map_err(classify_error)?;
    let status = response.status().as_u16();
    let bytes = response.bytes().await.map_err(classify_error)?;

    Ok(ApiResponse::new(status, parse_body(&bytes)))
  }
}

/// Exchanges a refresh token for fresh credentials at the configured endpoint.
#[derive(Clone)]
pub struct HttpRefresher {
  transport: HttpTransport,
  endpoint: String,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
  access: String,
  refresh: Option<String>,
}

impl HttpRefresher {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    Ok(Self {
      transport: HttpTransport::new(config)?,
      endpoint: config.refresh_endpoint.clone(),
    })
  }
}

#[async_trait]
impl TokenRefresher for HttpRefresher {
  async fn refresh(&self, refresh_token: &str) -> Result<Credentials> {
    let request = ApiRequest::write(
      crate::api::WriteMethod::Post,
      &self.endpoint,
      serde_json::json!({ "refresh": refresh_token }),
    );

    let response = self.transport.execute(&request, None).await?;
    match response.category() {
      StatusCategory::Success => {
        let parsed: RefreshResponse = serde_json::from_value(response.body)
          .map_err(|e| GatewayError::Unknown(format!("Malformed refresh response: {}", e)))?;
        Ok(Credentials {
          access_token: parsed.access,
          refresh_token: parsed.refresh,
        })
      }
      StatusCategory::Unauthorized | StatusCategory::ClientError => Err(GatewayError::AuthExpired),
      _ => Err(GatewayError::Unknown(format!(
        "Token refresh failed with status {}",
        response.status
      ))),
    }
  }
}

fn parse_base_url(base_url: &str) -> Result<Url> {
  // Without a trailing slash `Url::join` would replace the last path segment
  let normalized = if base_url.ends_with('/') {
    base_url.to_string()
  } else {
    format!("{}/", base_url)
  };
  Url::parse(&normalized)
    .map_err(|e| GatewayError::Unknown(format!("Invalid base URL {}: {}", base_url, e)))
}

/// Flatten params into query pairs; strings are sent without JSON quoting.
fn query_pairs(params: &Params) -> Vec<(String, String)> {
  params
    .iter()
    .map(|(key, value)| {
      let value = match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
      };
      (key.clone(), value)
    })
    .collect()
}

fn parse_body(bytes: &[u8]) -> Value {
  if bytes.is_empty() {
    return Value::Null;
  }
  serde_json::from_slice(bytes)
    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Anything that kept us from getting a response is a connectivity failure.
fn classify_error(e: reqwest::Error) -> GatewayError {
  if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
    GatewayError::Connectivity(e.to_string())
  } else {
    GatewayError::Unknown(e.to_string())
  }
}
