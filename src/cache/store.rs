//! In-memory cache store with TTL, priority-weighted LRU eviction and tag
//! invalidation.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use super::entry::{CacheEntry, Priority};
use super::key::{CacheKey, Tag};
use crate::clock::Clock;
use crate::domain::EstablishmentId;

/// Options for a single `set`.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
  /// Falls back to the store's default TTL
  pub ttl: Option<Duration>,
  pub priority: Priority,
  /// Added to the key's default tags
  pub tags: Vec<Tag>,
}

impl SetOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  #[cfg(test)]
  pub fn tag(mut self, tag: Tag) -> Self {
    self.tags.push(tag);
    self
  }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  pub hit_rate: f64,
  pub entries: usize,
  /// Entries that lapsed, whether found on `get` or by a sweep
  pub expired_entries: u64,
  pub evictions: u64,
  pub memory_bytes: usize,
}

#[derive(Debug)]
struct Inner<V> {
  entries: HashMap<CacheKey, CacheEntry<V>>,
  seq: u64,
  hits: u64,
  misses: u64,
  expired: u64,
  evictions: u64,
}

impl<V> Inner<V> {
  fn next_seq(&mut self) -> u64 {
    self.seq += 1;
    self.seq
  }

  fn remove_where<F>(&mut self, mut pred: F) -> usize
  where
    F: FnMut(&CacheKey, &CacheEntry<V>) -> bool,
  {
    let before = self.entries.len();
    self.entries.retain(|k, e| !pred(k, e));
    before - self.entries.len()
  }

  /// Evict one resident: lowest priority, then least recently accessed.
  fn evict_one(&mut self) -> Option<CacheKey> {
    let victim = self
      .entries
      .iter()
      .min_by_key(|(_, e)| (e.priority, e.last_accessed_at, e.access_seq))
      .map(|(k, _)| k.clone())?;
    self.entries.remove(&victim);
    self.evictions += 1;
    Some(victim)
  }
}

/// Bounded, TTL-aware key-value cache.
///
/// All state sits behind one mutex that is never held across an `.await`,
/// so every operation is atomic with respect to the others.
pub struct CacheStore<V> {
  inner: Mutex<Inner<V>>,
  max_entries: usize,
  default_ttl: Duration,
  clock: Arc<dyn Clock>,
}

impl<V> CacheStore<V>
where
  V: Clone + Serialize,
{
  pub fn new(max_entries: usize, default_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
    Self {
      inner: Mutex::new(Inner {
        entries: HashMap::new(),
        seq: 0,
        hits: 0,
        misses: 0,
        expired: 0,
        evictions: 0,
      }),
      max_entries,
      default_ttl,
      clock,
    }
  }

  fn lock(&self) -> MutexGuard<'_, Inner<V>> {
    // Counters and entries stay consistent even if a holder panicked
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub(super) fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  /// Look up `key`, treating expired entries as absent.
  pub fn get(&self, key: &CacheKey) -> Option<V> {
    let now = self.clock.now();
    let mut inner = self.lock();

    let expired = match inner.entries.get(key).map(|e| e.is_expired(now)) {
      Some(expired) => expired,
      None => {
        inner.misses += 1;
        debug!(%key, "cache miss");
        return None;
      }
    };

    if expired {
      inner.entries.remove(key);
      inner.expired += 1;
      inner.misses += 1;
      debug!(%key, "cache entry expired");
      return None;
    }

    let seq = inner.next_seq();
    inner.hits += 1;
    let entry = inner.entries.get_mut(key)?;
    entry.touch(now, seq);
    debug!(%key, "cache hit");
    Some(entry.data.clone())
  }

  /// Insert or overwrite `key`.
  ///
  /// When the store is full and `key` is new, exactly one resident is
  /// evicted first.
  pub fn set(&self, key: CacheKey, value: V, options: SetOptions) {
    let ttl = options.ttl.unwrap_or(self.default_ttl);
    if ttl.is_zero() || self.max_entries == 0 {
      debug!(%key, "skipping cache insert with zero ttl or capacity");
      return;
    }

    let size_bytes = estimate_size(&key, &value);
    let mut tags: BTreeSet<Tag> = key.default_tags().into_iter().collect();
    tags.extend(options.tags);

    let now = self.clock.now();
    let mut inner = self.lock();

    if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_entries {
      if let Some(victim) = inner.evict_one() {
        debug!(evicted = %victim, "cache at capacity, evicted entry");
      }
    }

    let seq = inner.next_seq();
    inner.entries.insert(
      key,
      CacheEntry {
        data: value,
        created_at: now,
        ttl,
        access_count: 0,
        last_accessed_at: now,
        tags,
        priority: options.priority,
        size_bytes,
        access_seq: seq,
      },
    );
  }

  /// Put back an entry with its original metadata. Used by restore.
  pub(super) fn insert_entry(&self, key: CacheKey, mut entry: CacheEntry<V>) -> bool {
    let mut inner = self.lock();
    if inner.entries.len() >= self.max_entries && !inner.entries.contains_key(&key) {
      return false;
    }
    entry.access_seq = inner.next_seq();
    inner.entries.insert(key, entry);
    true
  }

  /// Entries for which `pred` holds, cloned out of the store.
  pub(super) fn entries_where<F>(&self, mut pred: F) -> Vec<(CacheKey, CacheEntry<V>)>
  where
    F: FnMut(&CacheEntry<V>) -> bool,
  {
    self
      .lock()
      .entries
      .iter()
      .filter(|(_, e)| pred(e))
      .map(|(k, e)| (k.clone(), e.clone()))
      .collect()
  }

  /// Remove a single entry. Returns whether it was present.
  pub fn delete(&self, key: &CacheKey) -> bool {
    self.lock().entries.remove(key).is_some()
  }

  /// Remove every entry carrying at least one of `tags`.
  pub fn invalidate_by_tags(&self, tags: &[Tag]) -> usize {
    let removed = self
      .lock()
      .remove_where(|_, e| tags.iter().any(|t| e.tags.contains(t)));
    debug!(?tags, removed, "invalidated cache entries by tag");
    removed
  }

  /// Remove every entry whose rendered key matches `pattern`.
  pub fn invalidate_by_pattern(&self, pattern: &Regex) -> usize {
    let removed = self
      .lock()
      .remove_where(|k, _| pattern.is_match(&k.to_string()));
    debug!(pattern = pattern.as_str(), removed, "invalidated cache entries by pattern");
    removed
  }

  /// Drop everything cached for one establishment.
  pub fn invalidate_establishment(&self, id: EstablishmentId) -> usize {
    self.invalidate_by_tags(&[Tag::establishment(id)])
  }

  /// Remove all lapsed entries. Returns how many were removed.
  pub fn cleanup(&self) -> usize {
    let now = self.clock.now();
    let mut inner = self.lock();
    let removed = inner.remove_where(|_, e| e.is_expired(now));
    inner.expired += removed as u64;
    if removed > 0 {
      debug!(removed, "cache cleanup removed expired entries");
    }
    removed
  }

  pub fn clear(&self) {
    let mut inner = self.lock();
    let count = inner.entries.len();
    inner.entries.clear();
    if count > 0 {
      warn!(count, "cache cleared");
    }
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn stats(&self) -> CacheStats {
    let inner = self.lock();
    let lookups = inner.hits + inner.misses;
    CacheStats {
      hits: inner.hits,
      misses: inner.misses,
      hit_rate: if lookups == 0 {
        0.0
      } else {
        inner.hits as f64 / lookups as f64
      },
      entries: inner.entries.len(),
      expired_entries: inner.expired,
      evictions: inner.evictions,
      memory_bytes: inner.entries.values().map(|e| e.size_bytes).sum(),
    }
  }
}

/// Rough footprint of an entry: rendered key plus JSON-encoded value.
fn estimate_size<V: Serialize>(key: &CacheKey, value: &V) -> usize {
  let value_len = serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0);
  key.to_string().len() + value_len
}
