use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::{self, HttpOptions, JsonApiOptions, Tenancy};
use crate::cache::{CacheOptions, DEFAULT_MODE};
use crate::retry::Delay;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub tenancy: TenancyConfig,
  #[serde(default)]
  pub json_api: JsonApiConfig,
  #[serde(default)]
  pub http: HttpConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub retry: RetrySettings,
  #[serde(default)]
  pub report: ReportConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenancyConfig {
  /// Short tenancy code, e.g. "uni"
  pub code: String,
  /// Canonical root URL (defaults to http://{code}.myreadinglists.org)
  pub root: Option<String>,
  /// Root URL used inside linked data documents
  pub linked_data_root: Option<String>,
  /// Host names accepted as the same tenancy
  pub aliases: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonApiConfig {
  pub client_id: Option<String>,
  pub api_root: Option<String>,
  pub auth_root: Option<String>,
  pub version: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
  /// Request timeout in seconds, 0 for none
  #[serde(default = "default_timeout")]
  pub timeout_secs: u64,
  pub ssl_ca_file: Option<PathBuf>,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout(),
      ssl_ca_file: None,
    }
  }
}

fn default_timeout() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  pub path: Option<PathBuf>,
  /// Directory permissions, octal (e.g. "0750")
  #[serde(default = "default_mode", deserialize_with = "deserialize_mode")]
  pub mode: u32,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      mode: DEFAULT_MODE,
    }
  }
}

fn default_mode() -> u32 {
  DEFAULT_MODE
}

/// Modes are octal whether written as a string or a bare number.
fn deserialize_mode<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
  D: serde::Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Mode {
    Text(String),
    Number(u64),
  }

  let text = match Mode::deserialize(deserializer)? {
    Mode::Text(s) => s,
    Mode::Number(n) => n.to_string(),
  };
  parse_mode(&text).map_err(serde::de::Error::custom)
}

fn parse_mode(text: &str) -> Result<u32, String> {
  let digits = text.trim().trim_start_matches("0o");
  match u32::from_str_radix(digits, 8) {
    Ok(mode) if mode <= 0o7777 => Ok(mode),
    _ => Err(format!("invalid directory mode {:?}", text)),
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
  #[serde(default = "default_max_tries")]
  pub max_tries: u32,
  /// Positive: fixed delay. Negative: random delay of up to that many seconds.
  #[serde(default = "default_delay")]
  pub delay_secs: f64,
}

impl Default for RetrySettings {
  fn default() -> Self {
    Self {
      max_tries: default_max_tries(),
      delay_secs: default_delay(),
    }
  }
}

fn default_max_tries() -> u32 {
  5
}

fn default_delay() -> f64 {
  -10.0
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportConfig {
  /// "All Lists" report CSV
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  pub file: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./aspire-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/aspire-cache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/aspire-cache/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("aspire-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("aspire-cache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.tenancy.code.trim().is_empty() {
      return Err(eyre!("tenancy.code must not be empty"));
    }
    Ok(config)
  }

  /// Get the JSON API secret from environment variables.
  ///
  /// Checks ASPIRE_API_SECRET first, then ASPIRE_SECRET as fallback.
  pub fn get_api_secret() -> Result<String> {
    std::env::var("ASPIRE_API_SECRET")
      .or_else(|_| std::env::var("ASPIRE_SECRET"))
      .map_err(|_| eyre!("API secret not found. Set ASPIRE_API_SECRET or ASPIRE_SECRET environment variable."))
  }

  /// The JSON API client id, from the file or ASPIRE_API_CLIENT_ID.
  pub fn client_id(&self) -> Option<String> {
    self
      .json_api
      .client_id
      .clone()
      .or_else(|| std::env::var("ASPIRE_API_CLIENT_ID").ok())
      .filter(|id| !id.is_empty())
  }

  pub fn tenancy(&self) -> Result<Tenancy> {
    let t = &self.tenancy;
    Tenancy::new(
      &t.code,
      t.root.as_deref(),
      t.linked_data_root.as_deref(),
      t.aliases.as_deref(),
    )
    .map_err(|e| eyre!("Invalid tenancy configuration: {}", e))
  }

  pub fn http_options(&self) -> HttpOptions {
    HttpOptions {
      timeout: (self.http.timeout_secs > 0).then(|| Duration::from_secs(self.http.timeout_secs)),
      ca_file: self.http.ssl_ca_file.clone(),
    }
  }

  pub fn json_api_options(&self) -> JsonApiOptions {
    JsonApiOptions {
      api_root: self.json_api.api_root.clone(),
      auth_root: self.json_api.auth_root.clone(),
      version: self.json_api.version,
    }
  }

  /// Cache directory: configured, else the user cache dir, else
  /// /tmp/aspire/cache.
  pub fn cache_path(&self) -> PathBuf {
    self
      .cache
      .path
      .clone()
      .or_else(|| dirs::cache_dir().map(|d| d.join("aspire-cache")))
      .unwrap_or_else(|| PathBuf::from("/tmp/aspire/cache"))
  }

  pub fn cache_options(&self, clear: bool) -> CacheOptions {
    let mut options = CacheOptions::new(self.cache_path());
    options.mode = self.cache.mode;
    options.clear = clear;
    options.retry = api::default_retry(
      self.retry.max_tries,
      Delay::from_secs_f64(self.retry.delay_secs),
    );
    options
  }
}
