use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};
use url::Url;

use super::error::{CacheError, Result};
use crate::uri::ObjectUrl;

/// Query options for the JSON API representation of a list.
pub const JSON_API_OPTIONS: &[(&str, &str)] = &[
  ("bookjacket", "1"),
  ("draft", "1"),
  ("editions", "1"),
  ("history", "1"),
];

/// The two stored representations of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
  LinkedData,
  Json,
}

/// Storage location and lifecycle of one cached object.
///
/// The linked-data file lives at `{root}/{url path}.json`. Lists also get a
/// JSON API sibling named `{id}-json.json`. A hidden marker `.{name}.json`
/// next to the file flags an entry whose references are being written.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  url: String,
  parsed: ObjectUrl,
  root: PathBuf,
  file: PathBuf,
  json_file: Option<PathBuf>,
  marker: PathBuf,
  mode: u32,
}

impl CacheEntry {
  /// Create the entry for a canonical URL.
  ///
  /// Fails with [`CacheError::NotCacheable`] unless the URL is on the
  /// tenancy host and its object type is stored.
  pub fn new(url: &str, root: &Path, tenancy_host: &str, mode: u32) -> Result<Self> {
    let not_cacheable = || CacheError::NotCacheable {
      url: url.to_string(),
    };
    let parsed = ObjectUrl::parse(url).map_err(|_| not_cacheable())?;
    if !is_cacheable(&parsed, tenancy_host) {
      return Err(not_cacheable());
    }
    let relative = relative_path(url).ok_or_else(not_cacheable)?;

    let file = root.join(relative);
    let json_file = parsed
      .is_list()
      .then(|| add_filename_suffix(&file, "-json"));
    let marker = add_filename_prefix(&file, ".");

    Ok(Self {
      url: url.to_string(),
      parsed,
      root: root.to_path_buf(),
      file,
      json_file,
      marker,
      mode,
    })
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  pub fn parsed(&self) -> &ObjectUrl {
    &self.parsed
  }

  pub fn file(&self) -> &Path {
    &self.file
  }

  pub fn json_file(&self) -> Option<&Path> {
    self.json_file.as_deref()
  }

  pub fn marker(&self) -> &Path {
    &self.marker
  }

  pub fn path(&self, kind: Representation) -> Option<&Path> {
    match kind {
      Representation::LinkedData => Some(&self.file),
      Representation::Json => self.json_file(),
    }
  }

  pub fn is_list(&self) -> bool {
    self.parsed.is_list()
  }

  pub fn has_json(&self) -> bool {
    self.json_file.is_some()
  }

  /// The JSON API path of a list, e.g. `lists/ABC`.
  pub fn json_api_path(&self) -> Option<String> {
    self
      .has_json()
      .then(|| format!("lists/{}", self.parsed.id()))
  }

  /// Events aren't linked data, so their references can't be followed.
  pub fn references_followable(&self) -> bool {
    !self.parsed.is_type("events") && self.parsed.child_type.as_deref() != Some("events")
  }

  /// Directory holding the files of child objects (`lists/L1/items/...`).
  pub fn children_dir(&self) -> PathBuf {
    self.file.with_extension("")
  }

  pub fn exists(&self, kind: Representation) -> bool {
    self.path(kind).is_some_and(Path::is_file)
  }

  pub fn is_marked(&self) -> bool {
    self.marker.exists()
  }

  /// Create the in-progress marker.
  ///
  /// Fails with [`CacheError::Marked`] if the marker already exists, unless
  /// `force` is set. The returned guard removes the marker when dropped.
  pub fn mark(&self, force: bool) -> Result<MarkGuard<'_>> {
    let mark_error = |source| CacheError::Mark {
      url: self.url.clone(),
      path: self.marker.clone(),
      source,
    };
    if let Some(dir) = self.marker.parent() {
      create_dirs(dir, self.mode).map_err(mark_error)?;
    }

    let mut options = OpenOptions::new();
    options.write(true);
    if force {
      options.create(true).truncate(true);
    } else {
      options.create_new(true);
    }
    match options.open(&self.marker) {
      Ok(_) => {
        debug!(url = %self.url, "marked");
        Ok(MarkGuard {
          entry: self,
          armed: true,
        })
      }
      Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(CacheError::Marked {
        url: self.url.clone(),
        path: self.marker.clone(),
      }),
      Err(e) => Err(mark_error(e)),
    }
  }

  /// Remove the in-progress marker. A missing marker is not an error.
  pub fn unmark(&self) -> Result<()> {
    match fs::remove_file(&self.marker) {
      Ok(()) => {
        debug!(url = %self.url, "unmarked");
        Ok(())
      }
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(source) => Err(CacheError::Unmark {
        url: self.url.clone(),
        path: self.marker.clone(),
        source,
      }),
    }
  }

  pub fn read(&self, kind: Representation) -> Result<Vec<u8>> {
    let path = self.require_path(kind)?;
    fs::read(path).map_err(|source| {
      if source.kind() == io::ErrorKind::NotFound {
        CacheError::CacheMiss {
          url: self.url.clone(),
          path: path.to_path_buf(),
        }
      } else {
        CacheError::Read {
          url: self.url.clone(),
          path: path.to_path_buf(),
          source,
        }
      }
    })
  }

  /// Write a representation, creating parent directories with the cache
  /// mode. The file is exclusively locked while it is rewritten.
  pub fn write(&self, data: &[u8], kind: Representation) -> Result<()> {
    let path = self.require_path(kind)?;
    let write_error = |source| CacheError::Write {
      url: self.url.clone(),
      path: path.to_path_buf(),
      source,
    };
    if let Some(dir) = path.parent() {
      create_dirs(dir, self.mode).map_err(write_error)?;
    }
    let mut file = OpenOptions::new()
      .write(true)
      .create(true)
      .truncate(false)
      .open(path)
      .map_err(write_error)?;
    write_locked(&mut file, data).map_err(write_error)
  }

  /// Delete the entry's files, then any directories left empty between the
  /// file and the cache root.
  ///
  /// A marked entry is only deleted when `force` is set. With
  /// `with_children` the directory of child objects goes too.
  pub fn delete(&self, force: bool, with_children: bool) -> Result<()> {
    let guard = self.mark(force)?;

    remove_file(&self.file)?;
    if let Some(json_file) = &self.json_file {
      remove_file(json_file)?;
    }
    if with_children {
      let children = self.children_dir();
      match fs::remove_dir_all(&children) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
          return Err(CacheError::Remove {
            path: children,
            source,
          })
        }
      }
    }
    guard.release()?;

    prune_empty_dirs(&self.file, &self.root)
  }

  fn require_path(&self, kind: Representation) -> Result<&Path> {
    self.path(kind).ok_or_else(|| CacheError::NoJsonRepresentation {
      url: self.url.clone(),
    })
  }
}

/// Holds an entry's marker. Dropping the guard removes the marker; use
/// [`MarkGuard::release`] to observe unmark failures or
/// [`MarkGuard::retain`] to leave the marker for a later resume.
#[must_use = "the marker is removed when the guard is dropped"]
pub struct MarkGuard<'a> {
  entry: &'a CacheEntry,
  armed: bool,
}

impl MarkGuard<'_> {
  pub fn release(mut self) -> Result<()> {
    self.armed = false;
    self.entry.unmark()
  }

  pub fn retain(mut self) {
    self.armed = false;
  }
}

impl Drop for MarkGuard<'_> {
  fn drop(&mut self) {
    if self.armed {
      if let Err(e) = self.entry.unmark() {
        warn!(error = %e, "failed to remove marker");
      }
    }
  }
}

fn is_cacheable(url: &ObjectUrl, tenancy_host: &str) -> bool {
  if url.tenancy_host != tenancy_host {
    return false;
  }
  match url.object_type.as_str() {
    "catalog" => false,
    // User objects are private, but their children (notes) aren't
    "users" => url.child_type.is_some(),
    "config" => !url.object_id.starts_with("importance"),
    _ => true,
  }
}

/// The URL path relative to the cache root, always with a `.json` extension.
fn relative_path(url: &str) -> Option<PathBuf> {
  let url = Url::parse(url).ok()?;
  let path = url.path().trim_start_matches('/');
  if path.is_empty() || path.split('/').any(|s| s == "..") {
    return None;
  }
  if path.ends_with(".json") {
    Some(PathBuf::from(path))
  } else {
    Some(PathBuf::from(format!("{}.json", path)))
  }
}

/// `dir/name.ext` to `dir/{prefix}name.ext`.
pub(crate) fn add_filename_prefix(path: &Path, prefix: &str) -> PathBuf {
  let name = path.file_name().unwrap_or_default().to_string_lossy();
  path.with_file_name(format!("{}{}", prefix, name))
}

/// `dir/name.ext` to `dir/name{suffix}.ext`.
fn add_filename_suffix(path: &Path, suffix: &str) -> PathBuf {
  let stem = path.file_stem().unwrap_or_default().to_string_lossy();
  match path.extension() {
    Some(ext) => path.with_file_name(format!("{}{}.{}", stem, suffix, ext.to_string_lossy())),
    None => path.with_file_name(format!("{}{}", stem, suffix)),
  }
}

pub(crate) fn create_dirs(dir: &Path, mode: u32) -> io::Result<()> {
  let mut builder = DirBuilder::new();
  builder.recursive(true);
  #[cfg(unix)]
  {
    use std::os::unix::fs::DirBuilderExt;
    builder.mode(mode);
  }
  #[cfg(not(unix))]
  let _ = mode;
  builder.create(dir)
}

fn write_locked(file: &mut File, data: &[u8]) -> io::Result<()> {
  file.lock_exclusive()?;
  file.set_len(0)?;
  file.write_all(data)?;
  file.flush()
}

fn remove_file(path: &Path) -> Result<()> {
  match fs::remove_file(path) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(source) => Err(CacheError::Remove {
      path: path.to_path_buf(),
      source,
    }),
  }
}

/// Remove empty directories from `file`'s parent up to, not including,
/// `root`.
fn prune_empty_dirs(file: &Path, root: &Path) -> Result<()> {
  let mut dir = file.parent();
  while let Some(current) = dir {
    if current == root || !current.starts_with(root) {
      break;
    }
    let is_empty = match fs::read_dir(current) {
      Ok(mut entries) => entries.next().is_none(),
      Err(e) if e.kind() == io::ErrorKind::NotFound => true,
      Err(source) => {
        return Err(CacheError::Remove {
          path: current.to_path_buf(),
          source,
        })
      }
    };
    if !is_empty {
      break;
    }
    match fs::remove_dir(current) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(source) => {
        return Err(CacheError::Remove {
          path: current.to_path_buf(),
          source,
        })
      }
    }
    dir = current.parent();
  }
  Ok(())
}
