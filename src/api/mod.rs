//! Remote API collaborators.
//!
//! The cache only needs two things from the outside world: fetching a
//! linked-data object by URL, and fetching the JSON API representation of a
//! list. Both are expressed as traits so the crawl engine can be driven by
//! the real HTTP clients or by in-memory fakes.

mod json;
mod linked_data;
mod tenancy;

pub use json::{JsonApiClient, JsonApiOptions};
pub use linked_data::LinkedDataClient;
pub use tenancy::Tenancy;

use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::retry::{Classify, Delay, RetryConfig};

/// Raw response bytes and the JSON parsed from them.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
  pub raw: Vec<u8>,
  pub data: Value,
}

impl Fetched {
  /// Parse a response body. Empty bodies carry no object and give `None`.
  pub fn from_bytes(url: &str, raw: Vec<u8>) -> Result<Option<Self>, ApiError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
      return Ok(None);
    }
    let data = serde_json::from_slice(&raw).map_err(|source| ApiError::Decode {
      url: url.to_string(),
      source,
    })?;
    Ok(Some(Self { raw, data }))
  }
}

/// The linked-data API of a tenancy.
pub trait LinkedDataApi {
  /// Canonical host name of the tenancy.
  fn tenancy_host(&self) -> &str;

  /// Expand a partial object path (`lists/123`) into a full URL.
  fn api_url(&self, path: &str) -> String;

  /// Rewrite a tenancy URL or alias into canonical form, or `None` if the
  /// URL doesn't belong to this tenancy.
  fn canonical_url(&self, url: &str) -> Option<String>;

  /// Fetch an object. `Ok(None)` means the API has no data for it.
  fn fetch(&self, url: &str) -> Result<Option<Fetched>, ApiError>;
}

/// The JSON API, used for the secondary representation of lists.
pub trait JsonApi {
  fn fetch(&self, path: &str, params: &[(&str, &str)]) -> Result<Option<Fetched>, ApiError>;
}

#[derive(Debug, Error)]
pub enum ApiError {
  #[error("{url} timed out")]
  Timeout { url: String },
  #[error("{url} connection failed: {source}")]
  Connect {
    url: String,
    #[source]
    source: reqwest::Error,
  },
  #[error("{url} returned HTTP {status}")]
  Status { url: String, status: StatusCode },
  #[error("{url} returned invalid JSON: {source}")]
  Decode {
    url: String,
    #[source]
    source: serde_json::Error,
  },
  #[error("authentication failed: {0}")]
  Auth(String),
  #[error("invalid URL {url}: {source}")]
  InvalidUrl {
    url: String,
    #[source]
    source: url::ParseError,
  },
  #[error("{url} request failed: {source}")]
  Request {
    url: String,
    #[source]
    source: reqwest::Error,
  },
  #[error("failed to read CA certificate {}: {source}", path.display())]
  Certificate {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl ApiError {
  pub(crate) fn from_reqwest(url: &str, source: reqwest::Error) -> Self {
    let url = url.to_string();
    if source.is_timeout() {
      Self::Timeout { url }
    } else if source.is_connect() {
      Self::Connect { url, source }
    } else {
      Self::Request { url, source }
    }
  }
}

/// Retry classification of [`ApiError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorKind {
  /// Any API failure.
  Api,
  Timeout,
  Connect,
  Status,
  /// 5xx and 429 responses.
  Unavailable,
  Decode,
  Auth,
}

impl Classify for ApiError {
  type Kind = ApiErrorKind;

  fn kinds(&self) -> Vec<ApiErrorKind> {
    use ApiErrorKind::*;
    match self {
      Self::Timeout { .. } => vec![Timeout, Api],
      Self::Connect { .. } => vec![Connect, Api],
      Self::Status { status, .. }
        if status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS =>
      {
        vec![Unavailable, Status, Api]
      }
      Self::Status { .. } => vec![Status, Api],
      Self::Decode { .. } => vec![Decode, Api],
      Self::Auth(_) => vec![Auth, Api],
      Self::InvalidUrl { .. } | Self::Request { .. } | Self::Certificate { .. } => vec![Api],
    }
  }
}

/// Retry policy for remote fetches: transient network failures and
/// overloaded servers are retried.
pub fn default_retry(max_tries: u32, delay: Delay) -> RetryConfig<ApiError> {
  RetryConfig::new(max_tries).delay(delay).retriable([
    ApiErrorKind::Timeout,
    ApiErrorKind::Connect,
    ApiErrorKind::Unavailable,
  ])
}

/// Connection settings shared by both clients.
#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
  pub timeout: Option<Duration>,
  pub ca_file: Option<PathBuf>,
}

impl HttpOptions {
  pub(crate) fn client(&self) -> Result<reqwest::blocking::Client, ApiError> {
    let mut builder = reqwest::blocking::Client::builder()
      .user_agent(concat!("aspire-cache/", env!("CARGO_PKG_VERSION")))
      .timeout(self.timeout);
    if let Some(path) = &self.ca_file {
      let pem = std::fs::read(path).map_err(|source| ApiError::Certificate {
        path: path.clone(),
        source,
      })?;
      let cert = reqwest::Certificate::from_pem(&pem).map_err(|source| ApiError::Request {
        url: path.display().to_string(),
        source,
      })?;
      builder = builder.add_root_certificate(cert);
    }
    builder.build().map_err(|source| ApiError::Request {
      url: String::new(),
      source,
    })
  }
}
