//! Incremental mirror of an Aspire reading list tenancy.
//!
//! [`builder::Builder`] crawls the linked-data graph outward from reading
//! lists and stores every object it is allowed to follow in a
//! [`cache::CacheStore`]. Remote access goes through the [`api`] traits and
//! is made resilient by the [`retry`] engine.

pub mod api;
pub mod builder;
pub mod cache;
pub mod config;
pub mod ld;
pub mod logging;
pub mod report;
pub mod retry;
pub mod uri;
