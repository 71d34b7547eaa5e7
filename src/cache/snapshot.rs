//! Best-effort warm start: persist valuable entries and load them back.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use super::entry::{CacheEntry, Priority};
use super::key::CacheKey;
use super::store::CacheStore;
use crate::storage::{KeyValueStorage, StorageError};

/// Storage key holding the serialized snapshot.
pub const SNAPSHOT_KEY: &str = "cache:snapshot";

/// Which entries are worth persisting.
#[derive(Debug, Clone)]
pub struct SnapshotPolicy {
  pub max_entries: usize,
  /// Entries created within this window are kept regardless of priority
  pub recent_window: Duration,
}

#[derive(Serialize, Deserialize)]
struct SnapshotRecord<V> {
  key: CacheKey,
  entry: CacheEntry<V>,
}

impl<V> CacheStore<V>
where
  V: Clone + Serialize + DeserializeOwned,
{
  /// Write high-priority and recently written entries to `storage`.
  ///
  /// Returns the number of entries written. Newest entries win when the
  /// policy limit is reached.
  pub fn snapshot(
    &self,
    storage: &dyn KeyValueStorage,
    policy: &SnapshotPolicy,
  ) -> Result<usize, StorageError> {
    let now = self.now();
    let recent = chrono::Duration::from_std(policy.recent_window).unwrap_or(chrono::Duration::MAX);

    let mut selected = self.entries_where(|e| {
      !e.is_expired(now) && (e.priority >= Priority::High || now - e.created_at <= recent)
    });
    selected.sort_by(|(_, a), (_, b)| b.created_at.cmp(&a.created_at));
    selected.truncate(policy.max_entries);

    let records: Vec<SnapshotRecord<V>> = selected
      .into_iter()
      .map(|(key, entry)| SnapshotRecord { key, entry })
      .collect();

    let json = serde_json::to_string(&records)?;
    storage.set(SNAPSHOT_KEY, &json)?;

    info!(entries = records.len(), "cache snapshot written");
    Ok(records.len())
  }

  /// Load non-expired entries from the last snapshot.
  ///
  /// A corrupt snapshot is discarded; only storage I/O errors are returned.
  pub fn restore(&self, storage: &dyn KeyValueStorage) -> Result<usize, StorageError> {
    let Some(json) = storage.get(SNAPSHOT_KEY)? else {
      return Ok(0);
    };

    let records: Vec<SnapshotRecord<V>> = match serde_json::from_str(&json) {
      Ok(records) => records,
      Err(e) => {
        warn!(error = %e, "discarding unreadable cache snapshot");
        storage.remove(SNAPSHOT_KEY)?;
        return Ok(0);
      }
    };

    let now = self.now();
    let mut restored = 0;
    for record in records {
      if record.entry.is_expired(now) {
        continue;
      }
      if self.insert_entry(record.key, record.entry) {
        restored += 1;
      }
    }

    info!(entries = restored, "cache restored from snapshot");
    Ok(restored)
  }
}
