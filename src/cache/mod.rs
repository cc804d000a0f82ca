//! File cache of linked-data objects.
//!
//! This module provides the on-disk mirror of a tenancy:
//! - One JSON file per object, laid out by URL path under the cache root
//! - A JSON API sibling file for reading lists
//! - Hidden marker files flagging objects whose references are still being
//!   written, so an interrupted build can be resumed

mod entry;
mod error;
mod store;

pub use entry::{CacheEntry, MarkGuard, Representation, JSON_API_OPTIONS};
pub use error::{CacheError, Result};
pub use store::{marker_path, CacheOptions, CacheStore, MarkedEntries, Payload, DEFAULT_MODE};
