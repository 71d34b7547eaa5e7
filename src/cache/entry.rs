//! Cache entry and its metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use super::key::Tag;

/// Eviction priority. Lower priorities are evicted first.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Low,
  #[default]
  Medium,
  High,
  Critical,
}

/// Wrapper for cached data with metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<V> {
  /// The cached data.
  pub data: V,
  /// When the data was cached.
  pub created_at: DateTime<Utc>,
  /// Time to live, counted from `created_at`.
  #[serde(with = "duration_ms", rename = "ttl_ms")]
  pub ttl: Duration,
  pub access_count: u64,
  pub last_accessed_at: DateTime<Utc>,
  pub tags: BTreeSet<Tag>,
  pub priority: Priority,
  /// Estimated footprint of key and serialized data.
  pub size_bytes: usize,
  /// Monotonic access sequence, breaks `last_accessed_at` ties.
  #[serde(skip)]
  pub(super) access_seq: u64,
}

impl<V> CacheEntry<V> {
  /// Check if this entry has expired at `now`.
  ///
  /// A clock that moved backwards never expires an entry.
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    let elapsed = now
      .signed_duration_since(self.created_at)
      .to_std()
      .unwrap_or(Duration::ZERO);

    elapsed > self.ttl
  }

  /// Record a hit.
  pub(super) fn touch(&mut self, now: DateTime<Utc>, seq: u64) {
    self.access_count += 1;
    self.last_accessed_at = now;
    self.access_seq = seq;
  }
}

mod duration_ms {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(ttl.as_millis().min(u64::MAX as u128) as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
  }
}
