//! Object URL model.
//!
//! Every object in a tenancy is addressed by a URL of the form
//! `scheme://host/type/id[.format](/child_type[/child_id][.format])`.
//! This module splits such URLs into their components and answers the
//! structural questions the cache needs (is this a list, is this a child of
//! that object). Comparisons only look at the object type and id, so callers
//! should canonicalize hosts before comparing URLs from different sources.

use std::fmt;

use thiserror::Error;
use url::Url;

/// Object type of reading lists.
pub const LISTS: &str = "lists";

#[derive(Debug, Error)]
pub enum UrlError {
  #[error("invalid URL {url}: {source}")]
  Invalid {
    url: String,
    #[source]
    source: url::ParseError,
  },
  #[error("unsupported URL scheme {scheme} in {url}")]
  Scheme { url: String, scheme: String },
  #[error("URL has no host: {0}")]
  NoHost(String),
}

/// The components of an object URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUrl {
  pub tenancy_host: String,
  pub object_type: String,
  pub object_id: String,
  pub format: Option<String>,
  pub child_type: Option<String>,
  pub child_id: Option<String>,
  pub child_format: Option<String>,
}

impl ObjectUrl {
  /// Parse an object URL.
  ///
  /// Fails only when the URL itself is malformed (bad syntax, a scheme other
  /// than http/https, or no host). Paths that don't follow the object layout
  /// parse fine with the missing components left empty.
  pub fn parse(url: &str) -> Result<Self, UrlError> {
    let parsed = Url::parse(url).map_err(|source| UrlError::Invalid {
      url: url.to_string(),
      source,
    })?;
    Self::from_url(&parsed)
  }

  pub fn from_url(url: &Url) -> Result<Self, UrlError> {
    if !matches!(url.scheme(), "http" | "https") {
      return Err(UrlError::Scheme {
        url: url.to_string(),
        scheme: url.scheme().to_string(),
      });
    }
    let host = match url.host_str() {
      Some(host) if !host.is_empty() => host.to_string(),
      _ => return Err(UrlError::NoHost(url.to_string())),
    };

    let mut segments = url.path().trim_start_matches('/').split('/');
    let object_type = segments.next().unwrap_or_default().to_string();
    let (object_id, format) = split_format(segments.next().unwrap_or_default());
    let (child_type, child_format) = split_format(segments.next().unwrap_or_default());
    let (child_id, child_id_format) = split_format(segments.next().unwrap_or_default());

    Ok(Self {
      tenancy_host: host,
      object_type,
      object_id: object_id.unwrap_or_default(),
      format,
      child_type,
      child_id,
      child_format: child_id_format.or(child_format),
    })
  }

  /// The primary object id, e.g. the list id of `lists/{id}/items/{item}`.
  pub fn id(&self) -> &str {
    &self.object_id
  }

  /// True for a top-level list (no child type).
  pub fn is_list(&self) -> bool {
    self.object_type == LISTS && self.child_type.is_none()
  }

  /// True for a list or any child object of a list.
  pub fn is_list_or_child(&self) -> bool {
    self.object_type == LISTS
  }

  pub fn is_type(&self, object_type: &str) -> bool {
    self.object_type == object_type
  }

  /// True if both URLs address the same primary object.
  pub fn same_object(&self, other: &ObjectUrl) -> bool {
    self.object_type == other.object_type && self.object_id == other.object_id
  }

  /// True if `self` is the parent of `other`.
  ///
  /// A strict comparison requires `other` to be a child object of `self`;
  /// a non-strict one also accepts the same object.
  pub fn is_parent_of(&self, other: &ObjectUrl, strict: bool) -> bool {
    if !self.same_object(other) {
      return false;
    }
    if !strict {
      return true;
    }
    self.child_type.is_none() && other.child_type.is_some()
  }

  pub fn is_child_of(&self, other: &ObjectUrl, strict: bool) -> bool {
    other.is_parent_of(self, strict)
  }

  /// True if `self` is a strict child of `parent`.
  pub fn is_strict_child_of(&self, parent: &ObjectUrl) -> bool {
    self.is_child_of(parent, true)
  }
}

impl fmt::Display for ObjectUrl {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}/{}", self.tenancy_host, self.object_type, self.object_id)?;
    if let Some(child_type) = &self.child_type {
      write!(f, "/{}", child_type)?;
      if let Some(child_id) = &self.child_id {
        write!(f, "/{}", child_id)?;
      }
    }
    Ok(())
  }
}

/// Convenience wrapper returning the primary id of a URL.
pub fn id_from_url(url: &str) -> Result<String, UrlError> {
  Ok(ObjectUrl::parse(url)?.object_id)
}

/// Split `"id.format"` into its parts. Empty strings map to `None`.
fn split_format(segment: &str) -> (Option<String>, Option<String>) {
  let (name, format) = match segment.split_once('.') {
    Some((name, format)) => (name, Some(format)),
    None => (segment, None),
  };
  let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
  (non_empty(name), format.and_then(non_empty))
}
