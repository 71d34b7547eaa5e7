//! SQLite implementation of the durable key-value store.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::{KeyValueStorage, StorageError, Write};

/// How long a writer waits for another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Schema for the key-value table.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQLite-based key-value storage with an optional byte quota.
///
/// The quota counts key and value bytes across the whole table, which is
/// how browser local storage accounts for its budget.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  quota_bytes: Option<u64>,
}

impl SqliteStorage {
  /// Open or create the database at `path`.
  pub fn open(path: &Path, quota_bytes: Option<u64>) -> Result<Self, StorageError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    debug!(path = %path.display(), "opened storage database");
    Self::with_connection(conn, quota_bytes)
  }

  /// Open a private in-memory database.
  #[cfg(test)]
  pub fn open_in_memory(quota_bytes: Option<u64>) -> Result<Self, StorageError> {
    Self::with_connection(Connection::open_in_memory()?, quota_bytes)
  }

  fn with_connection(conn: Connection, quota_bytes: Option<u64>) -> Result<Self, StorageError> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
      quota_bytes,
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self.conn.lock().map_err(|_| StorageError::Poisoned)
  }

  /// Bytes used by every row except `key`.
  fn used_bytes_excluding(conn: &Connection, key: &str) -> Result<u64, StorageError> {
    // TEXT length() counts characters, so measure the UTF-8 bytes instead
    let used: i64 = conn.query_row(
      "SELECT COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0)
       FROM kv_store WHERE key != ?",
      params![key],
      |row| row.get(0),
    )?;
    Ok(used.max(0) as u64)
  }

  fn read(conn: &Connection, key: &str) -> Result<Option<String>, StorageError> {
    let value = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn write(&self, conn: &Connection, key: &str, value: &str) -> Result<(), StorageError> {
    if let Some(quota) = self.quota_bytes {
      let needed = Self::used_bytes_excluding(conn, key)? + (key.len() + value.len()) as u64;
      if needed > quota {
        return Err(StorageError::QuotaExceeded { needed, quota });
      }
    }

    conn.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }
}

impl KeyValueStorage for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
    let conn = self.lock()?;
    Self::read(&conn, key)
  }

  fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
    let conn = self.lock()?;
    self.write(&conn, key, value)
  }

  fn remove(&self, key: &str) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT key FROM kv_store WHERE substr(key, 1, ?) = ? ORDER BY key")?;
    let keys = stmt
      .query_map(params![prefix.chars().count() as i64, prefix], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
  }

  fn update(
    &self,
    key: &str,
    f: &mut dyn FnMut(Option<String>) -> Result<Write, StorageError>,
  ) -> Result<(), StorageError> {
    let mut conn = self.lock()?;
    // IMMEDIATE takes the write lock up front, so no other connection can
    // change `key` between the read and the write
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    match f(Self::read(&tx, key)?)? {
      Write::Keep => return Ok(()),
      Write::Set(value) => self.write(&tx, key, &value)?,
      Write::Remove => {
        tx.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
      }
    }

    tx.commit()?;
    Ok(())
  }
}
