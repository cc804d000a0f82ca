use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::api::ApiError;

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("{url} is not cacheable")]
  NotCacheable { url: String },

  #[error("{url} is not cached [{}]", path.display())]
  CacheMiss { url: String, path: PathBuf },

  #[error("{url} has no JSON API representation")]
  NoJsonRepresentation { url: String },

  #[error("{url} is not a reading list")]
  NotAList { url: String },

  #[error("{url} is already marked [{}]", path.display())]
  Marked { url: String, path: PathBuf },

  #[error("failed to mark {url} [{}]: {source}", path.display())]
  Mark {
    url: String,
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to unmark {url} [{}]: {source}", path.display())]
  Unmark {
    url: String,
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to read {url} [{}]: {source}", path.display())]
  Read {
    url: String,
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("corrupt cache file for {url} [{}]: {source}", path.display())]
  Corrupt {
    url: String,
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to fetch {url}: {source}")]
  Fetch {
    url: String,
    #[source]
    source: ApiError,
  },

  #[error("invalid data for {url}: {source}")]
  InvalidData {
    url: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to write {url} [{}]: {source}", path.display())]
  Write {
    url: String,
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to remove {}: {source}", path.display())]
  Remove {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("cache directory {} is unusable: {source}", path.display())]
  Root {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

impl CacheError {
  /// Errors that leave the cache in an unknown state. A crawl stops on
  /// these and keeps its markers so the run can be resumed.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      Self::Mark { .. } | Self::Unmark { .. } | Self::Root { .. }
    )
  }

  pub fn is_not_cacheable(&self) -> bool {
    matches!(self, Self::NotCacheable { .. })
  }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
