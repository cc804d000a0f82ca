//! Cache store that orchestrates the file cache with remote fetching.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, error, info, warn};
use walkdir::{DirEntry, WalkDir};

use super::entry::{add_filename_prefix, create_dirs, CacheEntry, Representation, JSON_API_OPTIONS};
use super::error::{CacheError, Result};
use crate::api::{self, ApiError, Fetched, JsonApi, LinkedDataApi};
use crate::retry::{Action, Delay, Retry, RetryConfig};

/// Default permissions of cache directories.
pub const DEFAULT_MODE: u32 = 0o750;

/// Data supplied by the caller instead of fetching it.
#[derive(Debug, Clone)]
pub enum Payload {
  Parsed(Value),
  Raw(Vec<u8>),
}

impl From<Value> for Payload {
  fn from(value: Value) -> Self {
    Self::Parsed(value)
  }
}

impl From<Vec<u8>> for Payload {
  fn from(raw: Vec<u8>) -> Self {
    Self::Raw(raw)
  }
}

impl From<String> for Payload {
  fn from(raw: String) -> Self {
    Self::Raw(raw.into_bytes())
  }
}

impl Payload {
  fn into_fetched(self, url: &str) -> Result<Option<Fetched>> {
    match self {
      Self::Parsed(data) => {
        let raw = serde_json::to_vec(&data).map_err(|source| CacheError::InvalidData {
          url: url.to_string(),
          source,
        })?;
        Ok(Some(Fetched { raw, data }))
      }
      Self::Raw(raw) => Fetched::from_bytes(url, raw).map_err(|e| match e {
        ApiError::Decode { source, .. } => CacheError::InvalidData {
          url: url.to_string(),
          source,
        },
        source => CacheError::Fetch {
          url: url.to_string(),
          source,
        },
      }),
    }
  }
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
  pub path: PathBuf,
  pub mode: u32,
  /// Empty the cache when it is opened.
  pub clear: bool,
  pub retry: RetryConfig<ApiError>,
}

impl CacheOptions {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      mode: DEFAULT_MODE,
      clear: false,
      retry: api::default_retry(5, Delay::UpTo(std::time::Duration::from_secs(10))),
    }
  }
}

/// A read-through file cache of a tenancy's objects.
///
/// Reads are served from disk when possible and fall back to the remote
/// APIs, in which case the fetched data is written to the cache before it is
/// returned.
pub struct CacheStore {
  ld_api: Box<dyn LinkedDataApi>,
  json_api: Option<Box<dyn JsonApi>>,
  root: PathBuf,
  mode: u32,
  retry: RetryConfig<ApiError>,
}

impl CacheStore {
  /// Open the cache, creating the root directory if needed.
  pub fn new(
    ld_api: Box<dyn LinkedDataApi>,
    json_api: Option<Box<dyn JsonApi>>,
    options: CacheOptions,
  ) -> Result<Self> {
    create_dirs(&options.path, options.mode).map_err(|source| CacheError::Root {
      path: options.path.clone(),
      source,
    })?;
    let store = Self {
      ld_api,
      json_api,
      root: options.path,
      mode: options.mode,
      retry: options.retry,
    };
    if options.clear {
      store.clear()?;
    }
    Ok(store)
  }

  pub fn path(&self) -> &Path {
    &self.root
  }

  pub fn tenancy_host(&self) -> &str {
    self.ld_api.tenancy_host()
  }

  pub fn canonical_url(&self, url: &str) -> Option<String> {
    self.ld_api.canonical_url(url)
  }

  /// The cache entry for any form of an object URL.
  pub fn entry(&self, url: &str) -> Result<CacheEntry> {
    let canonical = self
      .canonical_url(url)
      .ok_or_else(|| CacheError::NotCacheable {
        url: url.to_string(),
      })?;
    CacheEntry::new(&canonical, &self.root, self.tenancy_host(), self.mode)
  }

  /// True if the object's linked data is cached.
  pub fn contains(&self, url: &str) -> bool {
    self
      .entry(url)
      .is_ok_and(|entry| entry.exists(Representation::LinkedData))
  }

  pub fn is_empty(&self) -> Result<bool> {
    let mut entries = fs::read_dir(&self.root).map_err(|source| CacheError::Root {
      path: self.root.clone(),
      source,
    })?;
    Ok(entries.next().is_none())
  }

  /// Read an object.
  ///
  /// 1. With `use_cache`, return the cached copy if there is one
  /// 2. Otherwise fetch it and write it to the cache
  ///
  /// Returns `None` when the API has no data for the object.
  pub fn read(&self, entry: &CacheEntry, kind: Representation, use_cache: bool) -> Result<Option<Value>> {
    if use_cache {
      if let Some(data) = self.read_cached(entry, kind)? {
        return Ok(Some(data));
      }
    }
    self.write(entry, None, kind)
  }

  /// [`CacheStore::read`] by URL. URLs that aren't cacheable give `None`.
  pub fn read_url(&self, url: &str, kind: Representation, use_cache: bool) -> Result<Option<Value>> {
    match self.entry(url) {
      Ok(entry) => self.read(&entry, kind, use_cache),
      Err(e) if e.is_not_cacheable() => {
        debug!(url, "not cacheable");
        Ok(None)
      }
      Err(e) => Err(e),
    }
  }

  /// The cached copy of a representation, or `None` on a cache miss.
  pub fn read_cached(&self, entry: &CacheEntry, kind: Representation) -> Result<Option<Value>> {
    let raw = match entry.read(kind) {
      Ok(raw) => raw,
      Err(CacheError::CacheMiss { .. } | CacheError::NoJsonRepresentation { .. }) => return Ok(None),
      Err(e) => return Err(e),
    };
    let data = serde_json::from_slice(&raw).map_err(|source| CacheError::Corrupt {
      url: entry.url().to_string(),
      path: entry.path(kind).map(Path::to_path_buf).unwrap_or_default(),
      source,
    })?;
    debug!(url = entry.url(), ?kind, "read from cache");
    Ok(Some(data))
  }

  /// Write an object to the cache.
  ///
  /// Without a payload the object is fetched first. Returns the written data,
  /// or `None` if there was nothing to write.
  pub fn write(&self, entry: &CacheEntry, data: Option<Payload>, kind: Representation) -> Result<Option<Value>> {
    let fetched = match data {
      Some(payload) => payload.into_fetched(entry.url())?,
      None => self.fetch(entry, kind)?,
    };
    let Some(Fetched { raw, data }) = fetched else {
      debug!(url = entry.url(), ?kind, "no data");
      return Ok(None);
    };
    entry.write(&raw, kind)?;
    info!(url = entry.url(), ?kind, "cached");
    Ok(Some(data))
  }

  /// Remove an object from the cache, returning the linked data it held.
  ///
  /// Marked entries are only removed with `force`.
  pub fn remove(&self, entry: &CacheEntry, force: bool, with_children: bool) -> Result<Option<Value>> {
    if !entry.exists(Representation::LinkedData) && !entry.is_marked() {
      return Ok(None);
    }
    let data = match self.read_cached(entry, Representation::LinkedData) {
      Ok(data) => data,
      Err(e) => {
        warn!(url = entry.url(), error = %e, "removing unreadable entry");
        None
      }
    };
    entry.delete(force, with_children)?;
    info!(url = entry.url(), "removed from cache");
    Ok(data)
  }

  pub fn remove_url(&self, url: &str, force: bool, with_children: bool) -> Result<Option<Value>> {
    match self.entry(url) {
      Ok(entry) => self.remove(&entry, force, with_children),
      Err(e) if e.is_not_cacheable() => Ok(None),
      Err(e) => Err(e),
    }
  }

  /// Entries with an in-progress marker, under the given object types or the
  /// whole cache when `types` is empty.
  pub fn marked_entries(&self, types: &[&str]) -> MarkedEntries<'_> {
    let roots: Vec<PathBuf> = if types.is_empty() {
      vec![self.root.clone()]
    } else {
      types.iter().map(|t| self.root.join(t)).collect()
    };
    MarkedEntries {
      store: self,
      markers: Box::new(roots.into_iter().flat_map(walk_markers)),
    }
  }

  /// Remove everything under the cache root, keeping the root itself.
  pub fn clear(&self) -> Result<()> {
    let root_error = |source| CacheError::Root {
      path: self.root.clone(),
      source,
    };
    for child in fs::read_dir(&self.root).map_err(root_error)? {
      let path = child.map_err(root_error)?.path();
      let removed = if path.is_dir() {
        fs::remove_dir_all(&path)
      } else {
        fs::remove_file(&path)
      };
      removed.map_err(|source| CacheError::Remove { path, source })?;
    }
    info!(path = %self.root.display(), "cache cleared");
    Ok(())
  }

  /// Remove the cache root and everything under it.
  pub fn delete(&self) -> Result<()> {
    match fs::remove_dir_all(&self.root) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(source) => {
        return Err(CacheError::Root {
          path: self.root.clone(),
          source,
        })
      }
    }
    info!(path = %self.root.display(), "cache deleted");
    Ok(())
  }

  fn fetch(&self, entry: &CacheEntry, kind: Representation) -> Result<Option<Fetched>> {
    let json_request = match kind {
      Representation::LinkedData => None,
      Representation::Json => match (&self.json_api, entry.json_api_path()) {
        (Some(api), Some(path)) => Some((api, path)),
        _ => {
          debug!(url = entry.url(), "no JSON API available");
          return Ok(None);
        }
      },
    };

    let url = entry.url();
    let mut retry = Retry::new(self.retry.clone())
      .on_default(|attempt| {
        warn!(
          url,
          attempt = attempt.attempt,
          tries_left = ?attempt.tries_left,
          error = %attempt.error,
          "fetch failed"
        );
        Ok(Action::Continue)
      })
      .on_retry(|attempt| {
        info!(url, attempt = attempt.attempt + 1, "retrying fetch");
        Ok(Action::Continue)
      });

    let result = retry.execute(|| match &json_request {
      None => self.ld_api.fetch(url),
      Some((api, path)) => api.fetch(path, JSON_API_OPTIONS),
    });
    result.map_err(|source| {
      error!(url, error = %source, "fetch abandoned");
      CacheError::Fetch {
        url: url.to_string(),
        source,
      }
    })
  }
}

/// Iterator over marked entries, walking the cache tree lazily.
pub struct MarkedEntries<'a> {
  store: &'a CacheStore,
  markers: Box<dyn Iterator<Item = DirEntry>>,
}

impl Iterator for MarkedEntries<'_> {
  type Item = CacheEntry;

  fn next(&mut self) -> Option<CacheEntry> {
    let store = self.store;
    self.markers.find_map(|marker| entry_for(store, marker.path()))
  }
}

/// Marker files under `dir`. A missing directory has no markers.
fn walk_markers(dir: PathBuf) -> impl Iterator<Item = DirEntry> {
  WalkDir::new(dir)
    .into_iter()
    .filter_map(|entry| match entry {
      Ok(entry) => Some(entry),
      Err(e) => {
        if e.io_error().map_or(true, |io| io.kind() != io::ErrorKind::NotFound) {
          warn!(error = %e, "failed to scan for markers");
        }
        None
      }
    })
    .filter(|entry| entry.file_type().is_file() && is_marker(entry.path()))
}

/// Rebuild the entry of a marker file from its path under the root.
fn entry_for(store: &CacheStore, marker: &Path) -> Option<CacheEntry> {
  let name = marker.file_name()?.to_str()?.strip_prefix('.')?;
  let file = marker.with_file_name(name);
  let relative = file.strip_prefix(&store.root).ok()?;
  let path = relative
    .components()
    .map(|c| c.as_os_str().to_str())
    .collect::<Option<Vec<_>>>()?
    .join("/");
  match store.entry(&store.ld_api.api_url(&path)) {
    Ok(entry) => Some(entry),
    Err(e) => {
      warn!(path = %marker.display(), error = %e, "ignoring marker");
      None
    }
  }
}

fn is_marker(path: &Path) -> bool {
  let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
    return false;
  };
  name.starts_with('.') && !name.starts_with("..") && name.ends_with(".json")
}

/// Marker path of a cache file, for callers that only have the file.
pub fn marker_path(file: &Path) -> PathBuf {
  add_filename_prefix(file, ".")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::testing::{FakeJson, FakeLinkedData};
  use serde_json::json;
  use std::rc::Rc;
  use tempfile::TempDir;

  struct Fixture {
    _dir: TempDir,
    ld: Rc<FakeLinkedData>,
    json: Rc<FakeJson>,
    store: CacheStore,
  }

  fn fixture(setup: impl FnOnce(&mut FakeLinkedData, &mut FakeJson)) -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut ld = FakeLinkedData::new();
    let mut json = FakeJson::default();
    setup(&mut ld, &mut json);
    let ld = Rc::new(ld);
    let json = Rc::new(json);
    let mut options = CacheOptions::new(dir.path().join("cache"));
    options.retry = api::default_retry(3, Delay::None);
    let store = CacheStore::new(Box::new(ld.clone()), Some(Box::new(json.clone())), options).unwrap();
    Fixture {
      _dir: dir,
      ld,
      json,
      store,
    }
  }

  fn list_data() -> Value {
    json!({"http://uni.myreadinglists.org/lists/L1": {}})
  }

  #[test]
  fn test_read_fetches_once() {
    let f = fixture(|ld, _| ld.insert("lists/L1", list_data()));
    let url = "http://uni.myreadinglists.org/lists/L1";

    let first = f.store.read_url(url, Representation::LinkedData, true).unwrap();
    assert_eq!(first, Some(list_data()));
    let second = f.store.read_url(url, Representation::LinkedData, true).unwrap();
    assert_eq!(second, Some(list_data()));
    assert_eq!(f.ld.fetches.get(), 1);
    assert!(f.store.contains(url));

    // Bypassing the cache refetches
    f.store.read_url(url, Representation::LinkedData, false).unwrap();
    assert_eq!(f.ld.fetches.get(), 2);
  }

  #[test]
  fn test_written_data_reads_back_without_fetching() {
    let f = fixture(|_, _| {});
    let entry = f.store.entry("https://uni.rl.talis.com/modules/M1").unwrap();
    let data = json!({"m": [1, 2]});
    f.store
      .write(&entry, Some(data.clone().into()), Representation::LinkedData)
      .unwrap();
    let read = f.store.read(&entry, Representation::LinkedData, true).unwrap();
    assert_eq!(read, Some(data));
    assert_eq!(f.ld.fetches.get(), 0);
  }

  #[test]
  fn test_raw_payload_is_written_verbatim() {
    let f = fixture(|_, _| {});
    let entry = f.store.entry("https://uni.rl.talis.com/modules/M1").unwrap();
    let raw = "{ \"m\" : 1 }".to_string();
    f.store
      .write(&entry, Some(raw.clone().into()), Representation::LinkedData)
      .unwrap();
    assert_eq!(fs::read_to_string(entry.file()).unwrap(), raw);

    let bad = f
      .store
      .write(&entry, Some(b"{oops".to_vec().into()), Representation::LinkedData)
      .unwrap_err();
    assert!(matches!(bad, CacheError::InvalidData { .. }));
  }

  #[test]
  fn test_missing_object_is_not_written() {
    let f = fixture(|_, _| {});
    let url = "https://uni.rl.talis.com/lists/NOPE";
    assert_eq!(f.store.read_url(url, Representation::LinkedData, true).unwrap(), None);
    assert!(!f.store.contains(url));
  }

  #[test]
  fn test_not_cacheable_reads_none() {
    let f = fixture(|_, _| {});
    let read = f
      .store
      .read_url("http://www.google.com/lists/L1", Representation::LinkedData, true)
      .unwrap();
    assert_eq!(read, None);
    let read = f
      .store
      .read_url("https://uni.rl.talis.com/users/U1", Representation::LinkedData, true)
      .unwrap();
    assert_eq!(read, None);
    assert_eq!(f.ld.fetches.get(), 0);
  }

  #[test]
  fn test_json_representation_of_lists() {
    let f = fixture(|_, json| {
      json.objects.insert("lists/L1".into(), json!({"data": {"id": "L1"}}));
    });
    let list = f.store.entry("https://uni.rl.talis.com/lists/L1").unwrap();
    let data = f.store.read(&list, Representation::Json, true).unwrap();
    assert_eq!(data, Some(json!({"data": {"id": "L1"}})));
    assert!(list.exists(Representation::Json));

    let module = f.store.entry("https://uni.rl.talis.com/modules/M1").unwrap();
    assert_eq!(f.store.read(&module, Representation::Json, true).unwrap(), None);
    assert_eq!(f.json.fetches.get(), 1);
  }

  #[test]
  fn test_transient_failures_are_retried() {
    let f = fixture(|ld, _| ld.insert("lists/L1", list_data()));
    f.ld.timeouts.set(2);
    let read = f
      .store
      .read_url("https://uni.rl.talis.com/lists/L1", Representation::LinkedData, true)
      .unwrap();
    assert_eq!(read, Some(list_data()));
    assert_eq!(f.ld.fetches.get(), 3);
  }

  #[test]
  fn test_exhausted_retries_fail_the_read() {
    let f = fixture(|ld, _| ld.insert("lists/L1", list_data()));
    f.ld.timeouts.set(5);
    let err = f
      .store
      .read_url("https://uni.rl.talis.com/lists/L1", Representation::LinkedData, true)
      .unwrap_err();
    assert!(matches!(err, CacheError::Fetch { .. }));
    assert!(!err.is_fatal());
    assert_eq!(f.ld.fetches.get(), 3);
  }

  #[test]
  fn test_corrupt_cache_file() {
    let f = fixture(|_, _| {});
    let entry = f.store.entry("https://uni.rl.talis.com/modules/M1").unwrap();
    entry.write(b"{truncated", Representation::LinkedData).unwrap();
    let err = f.store.read(&entry, Representation::LinkedData, true).unwrap_err();
    assert!(matches!(err, CacheError::Corrupt { .. }));
  }

  #[test]
  fn test_remove_returns_previous_data() {
    let f = fixture(|ld, _| ld.insert("lists/L1", list_data()));
    let url = "https://uni.rl.talis.com/lists/L1";
    f.store.read_url(url, Representation::LinkedData, true).unwrap();

    let removed = f.store.remove_url(url, false, false).unwrap();
    assert_eq!(removed, Some(list_data()));
    assert!(!f.store.contains(url));
    assert_eq!(f.store.remove_url(url, false, false).unwrap(), None);
    assert!(f.store.is_empty().unwrap());
  }

  #[test]
  fn test_marked_entries() {
    let f = fixture(|_, _| {});
    let list = f.store.entry("https://uni.rl.talis.com/lists/L1").unwrap();
    let item = f.store.entry("https://uni.rl.talis.com/lists/L1/items/I1").unwrap();
    let module = f.store.entry("https://uni.rl.talis.com/modules/M1").unwrap();
    for entry in [&list, &item, &module] {
      entry.write(b"{}", Representation::LinkedData).unwrap();
    }
    list.mark(false).unwrap().retain();
    item.mark(false).unwrap().retain();
    module.mark(false).unwrap().retain();

    let mut lists: Vec<String> = f
      .store
      .marked_entries(&["lists"])
      .map(|e| e.url().to_string())
      .collect();
    lists.sort();
    assert_eq!(
      lists,
      vec![
        "https://uni.rl.talis.com/lists/L1.json",
        "https://uni.rl.talis.com/lists/L1/items/I1.json",
      ]
    );
    assert_eq!(f.store.marked_entries(&[]).count(), 3);
    assert_eq!(f.store.marked_entries(&["events"]).count(), 0);
    assert_eq!(marker_path(list.file()), list.marker());
  }

  #[test]
  fn test_marked_entries_only_yield_marker_files() {
    let f = fixture(|_, _| {});
    let root = f.store.path();
    fs::create_dir_all(root.join("lists/.L2.json")).unwrap();
    fs::write(root.join("lists/.L3.lock"), b"").unwrap();
    fs::write(root.join("lists/L4.json"), b"{}").unwrap();
    assert_eq!(f.store.marked_entries(&["lists"]).count(), 0);
    assert_eq!(f.store.marked_entries(&["modules", "lists"]).count(), 0);

    let module = f.store.entry("https://uni.rl.talis.com/modules/M1").unwrap();
    module.mark(false).unwrap().retain();
    let found: Vec<String> = f
      .store
      .marked_entries(&["events", "modules"])
      .map(|e| e.url().to_string())
      .collect();
    assert_eq!(found, vec!["https://uni.rl.talis.com/modules/M1.json"]);
  }

  #[test]
  fn test_clear_keeps_root() {
    let f = fixture(|ld, _| ld.insert("lists/L1", list_data()));
    f.store
      .read_url("https://uni.rl.talis.com/lists/L1", Representation::LinkedData, true)
      .unwrap();
    assert!(!f.store.is_empty().unwrap());
    f.store.clear().unwrap();
    assert!(f.store.is_empty().unwrap());
    assert!(f.store.path().is_dir());

    f.store.delete().unwrap();
    assert!(!f.store.path().exists());
  }
}
