//! Durable, string-valued key-value storage.
//!
//! This is the device-local store that backs the cache snapshot and the
//! offline queues. Keys are namespaced by their owners (`cache:snapshot`,
//! `offline-queue:{establishment}`) and values are JSON documents.

mod sqlite;

pub use sqlite::SqliteStorage;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
  #[error("storage quota exceeded: {needed} bytes needed, quota is {quota} bytes")]
  QuotaExceeded { needed: u64, quota: u64 },

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("storage lock poisoned")]
  Poisoned,
}

/// What an `update` callback wants done with the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
  /// Leave the stored value untouched
  Keep,
  Set(String),
  Remove,
}

/// Trait for durable key-value backends.
pub trait KeyValueStorage: Send + Sync {
  /// Read the value stored under `key`.
  fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

  /// Insert or replace the value stored under `key`.
  fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

  /// Remove `key`. Removing a missing key is not an error.
  fn remove(&self, key: &str) -> Result<(), StorageError>;

  /// All keys starting with `prefix`, in lexical order.
  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

  /// Read-modify-write `key` atomically, also against other processes
  /// sharing the same backing store.
  ///
  /// `f` receives the current value and decides what to write. Nothing is
  /// written if `f` or the write fails.
  fn update(
    &self,
    key: &str,
    f: &mut dyn FnMut(Option<String>) -> Result<Write, StorageError>,
  ) -> Result<(), StorageError>;
}
