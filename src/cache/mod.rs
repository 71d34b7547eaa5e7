//! Client-side cache for establishment data.
//!
//! This module provides a bounded in-memory store that:
//! - Expires entries lazily once their TTL has lapsed
//! - Evicts by priority first, then least-recently-used
//! - Invalidates in bulk by tag or by key pattern
//! - Snapshots valuable entries to durable storage for a warm start

mod entry;
mod key;
mod snapshot;
mod store;

pub use entry::Priority;
pub use key::{CacheKey, Tag};
pub use snapshot::SnapshotPolicy;
pub use store::{CacheStats, CacheStore, SetOptions};

/// The cache as the application uses it: JSON payloads from the API.
pub type JsonCache = CacheStore<serde_json::Value>;
