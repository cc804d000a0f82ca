use reqwest::blocking::Client;
use reqwest::StatusCode;
use tracing::debug;

use super::{ApiError, Fetched, HttpOptions, LinkedDataApi, Tenancy};

/// Blocking client for the linked-data API of a tenancy.
pub struct LinkedDataClient {
  http: Client,
  tenancy: Tenancy,
}

impl LinkedDataClient {
  pub fn new(tenancy: Tenancy, options: &HttpOptions) -> Result<Self, ApiError> {
    Ok(Self {
      http: options.client()?,
      tenancy,
    })
  }
}

impl LinkedDataApi for LinkedDataClient {
  fn tenancy_host(&self) -> &str {
    self.tenancy.host()
  }

  fn api_url(&self, path: &str) -> String {
    self.tenancy.api_url(path)
  }

  fn canonical_url(&self, url: &str) -> Option<String> {
    self.tenancy.canonical_url(url)
  }

  fn fetch(&self, url: &str) -> Result<Option<Fetched>, ApiError> {
    let mut url = self.tenancy.api_url(url);
    if !url.ends_with(".json") {
      url.push_str(".json");
    }

    debug!(url = %url, "GET linked data");
    let response = self
      .http
      .get(&url)
      .send()
      .map_err(|e| ApiError::from_reqwest(&url, e))?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
      debug!(url = %url, status = status.as_u16(), "no linked data");
      return Ok(None);
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
