//! Recursive crawl that fills the cache from reading lists.
//!
//! Writing an object writes its linked data (and the JSON API document of a
//! list), then follows the graph: first the related objects embedded in the
//! same response, then every URI the object references. A crawl rooted at a
//! list never leaves that list for another one, so a path like
//! `list -> module -> other lists` stops at the module.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEntry, CacheError, CacheStore, Representation, Result};
use crate::ld::Document;
use crate::uri::{ObjectUrl, LISTS};

/// Outcome of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildSummary {
  pub lists: usize,
  pub elapsed: Duration,
}

impl fmt::Display for BuildSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} lists cached in {}", self.lists, format_elapsed(self.elapsed))
  }
}

/// `HH:MM:SS`, hours unbounded.
pub fn format_elapsed(elapsed: Duration) -> String {
  let secs = elapsed.as_secs();
  format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

/// State of one top-level write.
struct Crawl {
  /// The list a crawl is rooted at. Other lists are out of scope.
  root: Option<ObjectUrl>,
  reload: bool,
  handled: HashSet<String>,
}

impl Crawl {
  fn new(root: Option<ObjectUrl>, reload: bool) -> Self {
    Self {
      root,
      reload,
      handled: HashSet::new(),
    }
  }

  fn skip_reason(&self, entry: &CacheEntry) -> Option<&'static str> {
    if self.handled.contains(entry.url()) {
      Some("already handled")
    } else if !self.reload && entry.exists(Representation::LinkedData) {
      Some("already cached")
    } else if entry.is_marked() {
      Some("in progress elsewhere")
    } else if !self.in_scope(entry.parsed()) {
      Some("unrelated list")
    } else {
      None
    }
  }

  /// Lists and their children are only reachable from their own list.
  fn in_scope(&self, url: &ObjectUrl) -> bool {
    match &self.root {
      Some(root) if url.is_list_or_child() => url.is_child_of(root, false),
      _ => true,
    }
  }
}

/// Builds the cache by crawling from reading lists.
pub struct Builder<'a> {
  cache: &'a CacheStore,
}

impl<'a> Builder<'a> {
  pub fn new(cache: &'a CacheStore) -> Self {
    Self { cache }
  }

  /// Cache every list in `urls`, skipping objects that are already cached.
  pub fn build<I>(&self, urls: I, clear: bool) -> Result<BuildSummary>
  where
    I: IntoIterator,
    I::Item: AsRef<str>,
  {
    if clear {
      self.cache.clear()?;
    }

    let start = Instant::now();
    let mut lists = 0;
    for url in urls {
      let url = url.as_ref();
      match self.write_list(url, None, false) {
        Ok(()) => {}
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => error!(url, error = %e, "list not cached"),
      }
      lists += 1;
    }

    let summary = BuildSummary {
      lists,
      elapsed: start.elapsed(),
    };
    info!("{}", summary);
    Ok(summary)
  }

  /// Continue an interrupted build.
  ///
  /// Lists and list objects left marked by a crashed run are deleted and
  /// fetched again before the build runs. An entry that can't be deleted is
  /// logged and left for the next resume.
  pub fn resume<I>(&self, urls: I) -> Result<BuildSummary>
  where
    I: IntoIterator,
    I::Item: AsRef<str>,
  {
    let marked: Vec<CacheEntry> = self.cache.marked_entries(&[LISTS]).collect();
    for entry in marked {
      info!(url = entry.url(), "reloading interrupted entry");
      match self.cache.remove(&entry, true, false) {
        Ok(_) => {}
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
          error!(url = entry.url(), error = %e, "interrupted entry not removed");
          continue;
        }
      }
      // A list child is reloaded within its own list
      let mut crawl = Crawl::new(Some(entry.parsed().clone()), true);
      self.write_entry(&mut crawl, entry, None)?;
    }
    self.build(urls, false)
  }

  /// Write a list as the root of a crawl.
  pub fn write_list(&self, url: &str, data: Option<Value>, reload: bool) -> Result<()> {
    let entry = match self.cache.entry(url) {
      Ok(entry) => entry,
      Err(e) if e.is_not_cacheable() => {
        debug!(url, "not cacheable");
        return Ok(());
      }
      Err(e) => return Err(e),
    };
    if !entry.is_list() {
      return Err(CacheError::NotAList {
        url: url.to_string(),
      });
    }
    let mut crawl = Crawl::new(Some(entry.parsed().clone()), reload);
    self.write_entry(&mut crawl, entry, data)
  }

  /// Write an object and everything reachable from it.
  ///
  /// With a `parent_list`, lists other than that one and its children are
  /// skipped. Without `reload`, cached objects are left as they are.
  pub fn write(
    &self,
    url: &str,
    data: Option<Value>,
    parent_list: Option<&CacheEntry>,
    reload: bool,
  ) -> Result<()> {
    let mut crawl = Crawl::new(parent_list.map(|list| list.parsed().clone()), reload);
    self.write_url(&mut crawl, url, data)
  }

  fn write_url(&self, crawl: &mut Crawl, url: &str, data: Option<Value>) -> Result<()> {
    match self.cache.entry(url) {
      Ok(entry) => self.write_entry(crawl, entry, data),
      Err(e) if e.is_not_cacheable() => {
        debug!(url, "not cacheable");
        Ok(())
      }
      Err(e) => Err(e),
    }
  }

  /// Write one entry. Only fatal errors are returned; anything else is
  /// logged and the crawl moves on.
  fn write_entry(&self, crawl: &mut Crawl, entry: CacheEntry, data: Option<Value>) -> Result<()> {
    if let Some(reason) = crawl.skip_reason(&entry) {
      debug!(url = entry.url(), reason, "skipped");
      return Ok(());
    }
    match self.write_data(crawl, &entry, data) {
      Ok(()) => Ok(()),
      Err(e) if e.is_fatal() => {
        error!(url = entry.url(), error = %e, "fatal cache error");
        Err(e)
      }
      Err(e) => {
        error!(url = entry.url(), error = %e, "object not cached");
        Ok(())
      }
    }
  }

  fn write_data(&self, crawl: &mut Crawl, entry: &CacheEntry, data: Option<Value>) -> Result<()> {
    crawl.handled.insert(entry.url().to_string());
    let use_cache = !crawl.reload;

    let linked_data = match data {
      Some(data) => self
        .cache
        .write(entry, Some(data.into()), Representation::LinkedData)?,
      None => self.cache.read(entry, Representation::LinkedData, use_cache)?,
    };
    if entry.has_json() {
      match self.cache.read(entry, Representation::Json, use_cache) {
        Ok(_) => {}
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => warn!(url = entry.url(), error = %e, "JSON API data not cached"),
      }
    }

    let Some(linked_data) = linked_data else {
      return Ok(());
    };
    if !entry.references_followable() {
      return Ok(());
    }
    let Some(objects) = linked_data.as_object().filter(|o| !o.is_empty()) else {
      return Ok(());
    };

    let guard = entry.mark(false)?;
    let result = self
      .write_related(crawl, entry, objects)
      .and_then(|()| self.write_references(crawl, &Document::from_value(&linked_data)));
    match result {
      Ok(()) => guard.release(),
      Err(e) => {
        guard.retain();
        Err(e)
      }
    }
  }

  /// Objects embedded in the response are written from the response itself.
  fn write_related(&self, crawl: &mut Crawl, entry: &CacheEntry, objects: &Map<String, Value>) -> Result<()> {
    for (url, properties) in objects {
      if self.cache.canonical_url(url).as_deref() == Some(entry.url()) {
        continue;
      }
      let mut data = Map::new();
      data.insert(url.clone(), properties.clone());
      self.write_url(crawl, url, Some(Value::Object(data)))?;
    }
    Ok(())
  }

  fn write_references(&self, crawl: &mut Crawl, document: &Document) -> Result<()> {
    for url in document.references() {
      self.write_url(crawl, url, None)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::testing::{FakeJson, FakeLinkedData};
  use crate::api::{self, LinkedDataApi};
  use crate::cache::CacheOptions;
  use crate::retry::Delay;
  use serde_json::json;
  use std::rc::Rc;
  use tempfile::TempDir;

  const USED_BY: &str = "http://purl.org/vocab/resourcelist/schema#usedBy";
  const USES_LIST: &str = "http://purl.org/vocab/resourcelist/schema#usesList";
  const RESOURCE: &str = "http://purl.org/vocab/resourcelist/schema#resource";
  const HAS_OWNER: &str = "http://purl.org/vocab/resourcelist/schema#hasOwner";
  const SEE_ALSO: &str = "http://www.w3.org/2000/01/rdf-schema#seeAlso";
  const ITEM_1: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#_1";

  struct Fixture {
    dir: TempDir,
    ld: Rc<FakeLinkedData>,
    json: Rc<FakeJson>,
    store: CacheStore,
  }

  fn uri(value: String) -> Value {
    json!([{"type": "uri", "value": value}])
  }

  /// L1 embeds item I1 and references module M1, which is also used by the
  /// unrelated list L2. The list item I2 leads back to M1.
  fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut ld = FakeLinkedData::new();
    let u = |path: &str| ld.ld_url(path);

    let mut l1 = Map::new();
    l1.insert(
      u("lists/L1"),
      json!({
        USED_BY: uri(u("modules/M1")),
        ITEM_1: uri(u("items/I1")),
        HAS_OWNER: uri(u("users/U1")),
        SEE_ALSO: [
          {"type": "uri", "value": u("events/E1")},
          {"type": "uri", "value": u("lists/L1/items/I2")},
          {"type": "uri", "value": "http://www.google.com/"},
          {"type": "literal", "value": u("resources/R3")}
        ]
      }),
    );
    l1.insert(
      u("items/I1"),
      json!({ RESOURCE: uri(u("resources/R1")), USED_BY: uri(u("lists/L1")) }),
    );
    let module = json!({ (u("modules/M1")): { USES_LIST: [
      {"type": "uri", "value": u("lists/L1")},
      {"type": "uri", "value": u("lists/L2")}
    ]}});
    let event = json!({ (u("events/E1")): { SEE_ALSO: uri(u("resources/R2")) } });
    let resource = |path: &str| json!({ (u(path)): { SEE_ALSO: [{"type": "literal", "value": "x"}] } });
    let (r1, r2, r3, i2) = (
      resource("resources/R1"),
      resource("resources/R2"),
      resource("resources/R3"),
      json!({ (u("lists/L1/items/I2")): { USED_BY: uri(u("modules/M1")) } }),
    );
    let l2 = json!({ (u("lists/L2")): {} });

    ld.insert("lists/L1", Value::Object(l1));
    ld.insert("modules/M1", module);
    ld.insert("events/E1", event);
    ld.insert("resources/R1", r1);
    ld.insert("resources/R2", r2);
    ld.insert("resources/R3", r3);
    ld.insert("lists/L1/items/I2", i2);
    ld.insert("lists/L2", l2);

    let mut json_api = FakeJson::default();
    json_api
      .objects
      .insert("lists/L1".into(), json!({"data": {"id": "L1"}}));

    let ld = Rc::new(ld);
    let json_api = Rc::new(json_api);
    let mut options = CacheOptions::new(dir.path().join("cache"));
    options.retry = api::default_retry(2, Delay::None);
    let store = CacheStore::new(Box::new(ld.clone()), Some(Box::new(json_api.clone())), options).unwrap();
    Fixture {
      dir,
      ld,
      json: json_api,
      store,
    }
  }

  impl Fixture {
    fn url(&self, path: &str) -> String {
      self.ld.url(path)
    }

    fn cached(&self, path: &str) -> bool {
      self.store.contains(&self.url(path))
    }
  }

  #[test]
  fn test_crawl_from_list() {
    let f = fixture();
    Builder::new(&f.store).write_list(&f.url("lists/L1"), None, false).unwrap();

    for path in [
      "lists/L1",
      "items/I1",
      "resources/R1",
      "modules/M1",
      "events/E1",
      "lists/L1/items/I2",
    ] {
      assert!(f.cached(path), "{} should be cached", path);
    }
    assert!(f.store.path().join("lists/L1-json.json").is_file());

    // Unrelated lists, event references and literals are not followed
    assert!(!f.cached("lists/L2"));
    assert!(!f.cached("resources/R2"));
    assert!(!f.cached("resources/R3"));
    assert!(!f.store.path().join("users").exists());

    // The embedded item needs no fetch
    assert_eq!(f.ld.fetches.get(), 5);
    assert_eq!(f.json.fetches.get(), 1);
    assert_eq!(f.store.marked_entries(&[]).count(), 0);
  }

  #[test]
  fn test_second_build_fetches_nothing() {
    let f = fixture();
    let builder = Builder::new(&f.store);
    let urls = vec![f.url("lists/L1")];

    let summary = builder.build(&urls, false).unwrap();
    assert_eq!(summary.lists, 1);
    let fetches = (f.ld.fetches.get(), f.json.fetches.get());

    builder.build(&urls, false).unwrap();
    assert_eq!((f.ld.fetches.get(), f.json.fetches.get()), fetches);
  }

  #[test]
  fn test_build_with_clear_refetches() {
    let f = fixture();
    let builder = Builder::new(&f.store);
    let urls = [f.url("lists/L1")];
    builder.build(urls.iter(), false).unwrap();
    let fetches = f.ld.fetches.get();

    builder.build(urls.iter(), true).unwrap();
    assert_eq!(f.ld.fetches.get(), fetches * 2);
  }

  #[test]
  fn test_crawl_without_parent_list_follows_lists() {
    let f = fixture();
    Builder::new(&f.store)
      .write(&f.url("modules/M1"), None, None, false)
      .unwrap();
    assert!(f.cached("lists/L1"));
    assert!(f.cached("lists/L2"));
  }

  #[test]
  fn test_reload_skips_marked_entries() {
    let f = fixture();
    let module = f.store.entry(&f.url("modules/M1")).unwrap();
    module.mark(false).unwrap().retain();

    Builder::new(&f.store).write(module.url(), None, None, true).unwrap();
    assert_eq!(f.ld.fetches.get(), 0);
    assert!(!f.cached("modules/M1"));
  }

  #[test]
  fn test_reload_refetches_cached_entries() {
    let f = fixture();
    let builder = Builder::new(&f.store);
    let url = f.url("resources/R1");
    builder.write(&url, None, None, false).unwrap();
    builder.write(&url, None, None, false).unwrap();
    assert_eq!(f.ld.fetches.get(), 1);
    builder.write(&url, None, None, true).unwrap();
    assert_eq!(f.ld.fetches.get(), 2);
  }

  #[test]
  fn test_supplied_data_is_written_without_fetching() {
    let f = fixture();
    let url = f.url("resources/R9");
    let data = json!({ (f.ld.ld_url("resources/R9")): {} });
    Builder::new(&f.store)
      .write(&url, Some(data.clone()), None, false)
      .unwrap();
    assert_eq!(f.ld.fetches.get(), 0);
    let entry = f.store.entry(&url).unwrap();
    assert_eq!(f.store.read_cached(&entry, Representation::LinkedData).unwrap(), Some(data));
  }

  #[test]
  fn test_not_cacheable_urls_are_skipped() {
    let f = fixture();
    let builder = Builder::new(&f.store);
    builder.write("http://www.google.com/", None, None, false).unwrap();
    builder.write(&f.url("users/U1"), None, None, false).unwrap();
    builder.write_list("http://www.google.com/lists/L1", None, false).unwrap();
    assert_eq!(f.ld.fetches.get(), 0);
  }

  #[test]
  fn test_write_list_requires_a_list() {
    let f = fixture();
    let err = Builder::new(&f.store)
      .write_list(&f.url("modules/M1"), None, false)
      .unwrap_err();
    assert!(matches!(err, CacheError::NotAList { .. }));
    assert!(!err.is_fatal());
  }

  #[test]
  fn test_fetch_failures_do_not_stop_the_build() {
    let f = fixture();
    f.ld.timeouts.set(2);
    let builder = Builder::new(&f.store);
    let summary = builder
      .build([f.url("lists/L1"), f.url("lists/L2")], false)
      .unwrap();
    assert_eq!(summary.lists, 2);
    assert!(!f.cached("lists/L1"));
    assert!(f.cached("lists/L2"));
  }

  #[test]
  fn test_resume_reloads_interrupted_lists() {
    let f = fixture();
    let builder = Builder::new(&f.store);
    let list_url = f.url("lists/L1");
    builder.build([&list_url], false).unwrap();

    // A crashed run leaves the list marked with stale content
    let list = f.store.entry(&list_url).unwrap();
    list.write(b"{}", Representation::LinkedData).unwrap();
    list.mark(false).unwrap().retain();
    let fetches = f.ld.fetches.get();

    builder.resume([&list_url]).unwrap();
    assert!(!list.is_marked());
    assert!(f.ld.fetches.get() > fetches);
    let data = f.store.read_cached(&list, Representation::LinkedData).unwrap().unwrap();
    assert!(data.get(f.ld.ld_url("lists/L1")).is_some());
    assert_eq!(f.store.marked_entries(&[]).count(), 0);
    assert!(f.dir.path().join("cache/lists/L1.json").is_file());
  }

  #[test]
  fn test_resume_of_a_list_child_stays_in_its_list() {
    let f = fixture();
    let item = f.store.entry(&f.url("lists/L1/items/I2")).unwrap();
    item.mark(false).unwrap().retain();

    Builder::new(&f.store).resume(Vec::<String>::new()).unwrap();
    assert!(!item.is_marked());
    assert!(f.cached("lists/L1/items/I2"));
    assert!(f.cached("modules/M1"));
    assert!(f.cached("lists/L1"));
    assert!(!f.cached("lists/L2"));
  }

  #[test]
  fn test_resume_continues_after_a_failed_removal() {
    let f = fixture();
    let builder = Builder::new(&f.store);

    // L1's cache file can't be removed, L2 is a plain interrupted list
    let stuck = f.store.entry(&f.url("lists/L1")).unwrap();
    std::fs::create_dir_all(stuck.file().join("contents")).unwrap();
    stuck.mark(false).unwrap().retain();
    let list = f.store.entry(&f.url("lists/L2")).unwrap();
    list.mark(false).unwrap().retain();

    builder.resume(Vec::<String>::new()).unwrap();
    assert!(f.cached("lists/L2"));
    assert!(!list.is_marked());
    assert!(stuck.file().is_dir());
  }

  #[test]
  fn test_fatal_error_leaves_ancestors_marked() {
    let f = fixture();
    // While I1 is being expanded, its marker becomes impossible to remove
    let marker = f.store.path().join("items/.I1.json");
    let hook: Box<dyn Fn()> = Box::new(move || {
      std::fs::remove_file(&marker).unwrap();
      std::fs::create_dir_all(marker.join("stuck")).unwrap();
    });
    *f.ld.before_fetch.borrow_mut() = Some((f.url("resources/R1"), hook));

    let list_url = f.url("lists/L1");
    let err = Builder::new(&f.store).write_list(&list_url, None, false).unwrap_err();
    assert!(err.is_fatal(), "{}", err);
    assert!(matches!(err, CacheError::Unmark { .. }));

    let list = f.store.entry(&list_url).unwrap();
    assert!(list.is_marked());
    let marked: Vec<String> = f
      .store
      .marked_entries(&[LISTS])
      .map(|e| e.url().to_string())
      .collect();
    assert_eq!(marked, vec![list_url]);

    // Related objects come first, so no reference was reached
    assert!(f.cached("resources/R1"));
    assert!(!f.cached("modules/M1"));
  }

  #[test]
  fn test_marked_entries_are_skipped_without_reload() {
    let f = fixture();
    let resource = f.store.entry(&f.url("resources/R1")).unwrap();
    resource.mark(false).unwrap().retain();

    Builder::new(&f.store).write(resource.url(), None, None, false).unwrap();
    assert_eq!(f.ld.fetches.get(), 0);
    assert!(!f.cached("resources/R1"));
    assert!(resource.is_marked());
  }

  #[test]
  fn test_summary_display() {
    let summary = BuildSummary {
      lists: 12,
      elapsed: Duration::from_secs(3 * 3600 + 25 * 60 + 7),
    };
    assert_eq!(summary.to_string(), "12 lists cached in 03:25:07");
    assert_eq!(format_elapsed(Duration::from_millis(999)), "00:00:00");
  }

  #[test]
  fn test_scope_of_a_list_crawl() {
    let f = fixture();
    let root = ObjectUrl::parse(&f.url("lists/L1")).unwrap();
    let crawl = Crawl::new(Some(root), false);
    let parse = |path: &str| ObjectUrl::parse(&f.url(path)).unwrap();
    assert!(crawl.in_scope(&parse("lists/L1")));
    assert!(crawl.in_scope(&parse("lists/L1/items/I2")));
    assert!(crawl.in_scope(&parse("modules/M1")));
    assert!(!crawl.in_scope(&parse("lists/L2")));
    assert!(!crawl.in_scope(&parse("lists/L2/sections/S1")));
    assert_eq!(f.store.tenancy_host(), f.ld.tenancy_host());
  }
}
