use url::Url;

use super::ApiError;

/// Domain of the public linked-data host names of tenancies.
const TENANCY_DOMAIN: &str = "myreadinglists.org";

/// Host naming of a tenancy: the canonical root, the root used inside
/// linked-data documents, and the aliases accepted as the same tenancy.
#[derive(Debug, Clone)]
pub struct Tenancy {
  code: String,
  root: Url,
  linked_data_root: Url,
  aliases: Vec<String>,
}

impl Tenancy {
  /// Missing roots default to `http://{code}.myreadinglists.org`; missing
  /// aliases default to that same host.
  pub fn new(
    code: &str,
    root: Option<&str>,
    linked_data_root: Option<&str>,
    aliases: Option<&[String]>,
  ) -> Result<Self, ApiError> {
    let canonical_host = format!("{}.{}", code, TENANCY_DOMAIN);
    let aliases = match aliases {
      None => vec![canonical_host.clone()],
      Some(aliases) => aliases
        .iter()
        .filter_map(|alias| lenient_url(alias).ok())
        .filter_map(|url| url.host_str().map(str::to_string))
        .filter(|host| !host.is_empty())
        .collect(),
    };
    Ok(Self {
      code: code.to_string(),
      root: parse_root(root, &canonical_host)?,
      linked_data_root: parse_root(linked_data_root, &canonical_host)?,
      aliases,
    })
  }

  pub fn code(&self) -> &str {
    &self.code
  }

  /// Canonical host name of the tenancy.
  pub fn host(&self) -> &str {
    self.root.host_str().unwrap_or_default()
  }

  pub fn linked_data_host(&self) -> &str {
    self.linked_data_root.host_str().unwrap_or_default()
  }

  pub fn aliases(&self) -> &[String] {
    &self.aliases
  }

  /// Full URL from a partial path; paths that already carry a host pass
  /// through untouched.
  pub fn api_url(&self, path: &str) -> String {
    if path.contains("//") {
      path.to_string()
    } else {
      format!(
        "{}/{}",
        self.root.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
      )
    }
  }

  pub fn is_valid_host(&self, host: &str) -> bool {
    host == self.host() || self.aliases.iter().any(|alias| alias == host)
  }

  pub fn is_valid_url(&self, url: &str) -> bool {
    lenient_url(url)
      .ok()
      .and_then(|url| url.host_str().map(|host| self.is_valid_host(host)))
      .unwrap_or(false)
  }

  /// Canonical form: tenancy scheme and host, `.json` format.
  pub fn canonical_url(&self, url: &str) -> Option<String> {
    self.rewrite(url, &self.root, ".json")
  }

  /// Form used inside linked-data documents: linked-data host, no format.
  pub fn linked_data_url(&self, url: &str) -> Option<String> {
    self.rewrite(url, &self.linked_data_root, "")
  }

  fn rewrite(&self, url: &str, root: &Url, format: &str) -> Option<String> {
    let mut url = lenient_url(url).ok()?;
    if !self.is_valid_host(url.host_str()?) {
      return None;
    }
    url.set_scheme(root.scheme()).ok()?;
    url.set_host(root.host_str()).ok()?;
    url.set_port(root.port()).ok()?;
    let path = rewrite_format(url.path(), format);
    url.set_path(&path);
    Some(url.to_string())
  }
}

/// Replace the extension of the last path segment with `format`.
fn rewrite_format(path: &str, format: &str) -> String {
  let name_start = path.rfind('/').map_or(0, |i| i + 1);
  let stem = match path[name_start..].rfind('.') {
    Some(dot) if dot > 0 => &path[..name_start + dot],
    _ => path,
  };
  if stem.is_empty() || stem == "/" || stem.ends_with(format) {
    stem.to_string()
  } else {
    format!("{}{}", stem, format)
  }
}

/// Parse a URL, treating scheme-less strings as host names.
fn lenient_url(url: &str) -> Result<Url, url::ParseError> {
  match Url::parse(url) {
    Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(&format!("http://{}", url)),
    result => result,
  }
}

fn parse_root(root: Option<&str>, default_host: &str) -> Result<Url, ApiError> {
  let root = root.filter(|r| !r.is_empty()).unwrap_or(default_host);
  lenient_url(root).map_err(|source| ApiError::InvalidUrl {
    url: root.to_string(),
    source,
  })
}
