use std::sync::Mutex;

use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, Response};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{ApiError, Fetched, HttpOptions, JsonApi};

const DEFAULT_API_ROOT: &str = "https://rl.talis.com";
const DEFAULT_AUTH_ROOT: &str = "https://users.talis.com/1/oauth/tokens";
const DEFAULT_VERSION: u32 = 2;

/// Rate-limit state reported by a JSON API response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RateLimit {
  limit: Option<u64>,
  remaining: Option<u64>,
  reset: Option<DateTime<Utc>>,
}

impl RateLimit {
  fn from_headers(headers: &HeaderMap) -> Self {
    let value = |name: &str| {
      headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    };
    Self {
      limit: value("x-ratelimit-limit"),
      remaining: value("x-ratelimit-remaining"),
      reset: value("x-ratelimit-reset")
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0)),
    }
  }
}

#[derive(Deserialize)]
struct TokenResponse {
  access_token: String,
}

/// JSON API endpoint settings. `None` fields take the public defaults.
#[derive(Debug, Clone, Default)]
pub struct JsonApiOptions {
  pub api_root: Option<String>,
  pub auth_root: Option<String>,
  pub version: Option<u32>,
}

/// Blocking client for the authenticated JSON API.
pub struct JsonApiClient {
  http: Client,
  client_id: String,
  secret: String,
  tenancy_code: String,
  api_root: String,
  auth_root: String,
  version: u32,
  token: Mutex<Option<String>>,
}

impl JsonApiClient {
  pub fn new(
    client_id: &str,
    secret: &str,
    tenancy_code: &str,
    endpoints: JsonApiOptions,
    options: &HttpOptions,
  ) -> Result<Self, ApiError> {
    Ok(Self {
      http: options.client()?,
      client_id: client_id.to_string(),
      secret: secret.to_string(),
      tenancy_code: tenancy_code.to_string(),
      api_root: endpoints
        .api_root
        .unwrap_or_else(|| DEFAULT_API_ROOT.to_string()),
      auth_root: endpoints
        .auth_root
        .unwrap_or_else(|| DEFAULT_AUTH_ROOT.to_string()),
      version: endpoints.version.unwrap_or(DEFAULT_VERSION),
      token: Mutex::new(None),
    })
  }

  /// Full endpoint URL; absolute URLs pass through.
  pub fn api_url(&self, path: &str) -> String {
    if path.contains("//") {
      path.to_string()
    } else {
      format!(
        "{}/{}/{}/{}",
        self.api_root.trim_end_matches('/'),
        self.version,
        self.tenancy_code,
        path.trim_start_matches('/')
      )
    }
  }

  fn token(&self, refresh: bool) -> Result<String, ApiError> {
    let mut cached = self.token.lock().unwrap_or_else(|e| e.into_inner());
    if let (Some(token), false) = (cached.as_ref(), refresh) {
      return Ok(token.clone());
    }
    *cached = None;

    debug!(url = %self.auth_root, "requesting API token");
    let response = self
      .http
      .post(&self.auth_root)
      .basic_auth(&self.client_id, Some(&self.secret))
      .form(&[("grant_type", "client_credentials")])
      .send()
      .map_err(|e| ApiError::from_reqwest(&self.auth_root, e))?;
    if !response.status().is_success() {
      return Err(ApiError::Auth(format!(
        "token request returned HTTP {}",
        response.status()
      )));
    }
    let body: TokenResponse = response
      .json()
      .map_err(|e| ApiError::Auth(format!("invalid token response: {}", e)))?;

    *cached = Some(body.access_token.clone());
    Ok(body.access_token)
  }

  fn send(&self, url: &str, params: &[(&str, &str)], token: &str) -> Result<Response, ApiError> {
    let response = self
      .http
      .get(url)
      .query(params)
      .bearer_auth(token)
      .send()
      .map_err(|e| ApiError::from_reqwest(url, e))?;
    let rate = RateLimit::from_headers(response.headers());
    if rate.remaining == Some(0) {
      warn!(url, reset = ?rate.reset, "JSON API rate limit exhausted");
    } else {
      debug!(url, limit = ?rate.limit, remaining = ?rate.remaining, "JSON API rate limit");
    }
    Ok(response)
  }
}

impl JsonApi for JsonApiClient {
  /// A rejected token is refreshed and the call repeated once.
  fn fetch(&self, path: &str, params: &[(&str, &str)]) -> Result<Option<Fetched>, ApiError> {
    let url = self.api_url(path);
    debug!(url = %url, "GET JSON API");

    let mut response = self.send(&url, params, &self.token(false)?)?;
    if response.status() == StatusCode::UNAUTHORIZED {
      warn!(url = %url, "API token rejected, refreshing");
      response = self.send(&url, params, &self.token(true)?)?;
    }

    let status = response.status();
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
      return Ok(None);
    }
    if status == StatusCode::UNAUTHORIZED {
      return Err(ApiError::Auth(format!("{} rejected the API token", url)));
    }
    if !status.is_success() {
      return Err(ApiError::Status { url, status });
    }

    let body = response
      .bytes()
      .map_err(|e| ApiError::from_reqwest(&url, e))?;
    Fetched::from_bytes(&url, body.to_vec())
  }
}
