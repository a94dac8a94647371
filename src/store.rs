//! Persistent key/value tier with per-entry expiry.
//!
//! Survives restarts, unlike the memory tier. Expired rows are invisible to
//! reads and are physically removed by [`PersistentTier::sweep_expired`],
//! which the periodic cleanup task calls.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};

/// Operations the coordinator needs from a persistent tier.
pub trait PersistentTier: Send + Sync {
  /// Number of live (unexpired) entries.
  fn len(&self) -> Result<usize>;

  fn clear(&self) -> Result<()>;

  /// Delete expired entries. Returns how many were removed.
  fn sweep_expired(&self) -> Result<usize>;
}

/// SQLite-backed key/value store.
pub struct SqliteKvStore {
  conn: Mutex<Connection>,
  clock: Arc<dyn Clock>,
}

const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_cache (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_kv_cache_expires ON kv_cache(expires_at);
"#;

impl SqliteKvStore {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
      clock: Arc::new(SystemClock),
    })
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn now_millis(&self) -> i64 {
    self.clock.now().timestamp_millis()
  }

  /// Store a value that expires after `ttl`.
  pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
    let data =
      serde_json::to_string(value).map_err(|e| eyre!("Failed to serialize value: {}", e))?;
    let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    let expires_at = self.now_millis().saturating_add(ttl_millis);

    let conn = self.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv_cache (key, value, expires_at) VALUES (?, ?, ?)",
        params![key, data, expires_at],
      )
      .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;

    Ok(())
  }

  /// Read a live value.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    let now = self.now_millis();
    let conn = self.conn()?;
    let data: Option<String> = conn
      .query_row(
        "SELECT value FROM kv_cache WHERE key = ? AND expires_at >= ?",
        params![key, now],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))?;

    data
      .map(|data| {
        serde_json::from_str(&data).map_err(|e| eyre!("Failed to deserialize {}: {}", key, e))
      })
      .transpose()
  }

  pub fn delete(&self, key: &str) -> Result<bool> {
    let conn = self.conn()?;
    let removed = conn
      .execute("DELETE FROM kv_cache WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete {}: {}", key, e))?;
    Ok(removed > 0)
  }
}

impl PersistentTier for SqliteKvStore {
  fn len(&self) -> Result<usize> {
    let now = self.now_millis();
    let conn = self.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM kv_cache WHERE expires_at >= ?",
        params![now],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count store entries: {}", e))?;
    Ok(count as usize)
  }

  fn clear(&self) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute("DELETE FROM kv_cache", [])
      .map_err(|e| eyre!("Failed to clear store: {}", e))?;
    Ok(())
  }

  fn sweep_expired(&self) -> Result<usize> {
    let now = self.now_millis();
    let conn = self.conn()?;
    let removed = conn
      .execute("DELETE FROM kv_cache WHERE expires_at < ?", params![now])
      .map_err(|e| eyre!("Failed to sweep store: {}", e))?;
    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;

  fn store() -> (SqliteKvStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let store = SqliteKvStore::open_in_memory()
      .unwrap()
      .with_clock(clock.clone());
    (store, clock)
  }

  #[test]
  fn test_set_get_delete() {
    let (store, _) = store();
    store.set("profile", &vec!["a", "b"], Duration::from_secs(60)).unwrap();

    let value: Option<Vec<String>> = store.get("profile").unwrap();
    assert_eq!(value, Some(vec!["a".to_string(), "b".to_string()]));
    assert!(store.delete("profile").unwrap());
    assert_eq!(store.get::<Vec<String>>("profile").unwrap(), None);
  }

  #[test]
  fn test_expired_entries_are_invisible_then_swept() {
    let (store, clock) = store();
    store.set("short", &1, Duration::from_secs(10)).unwrap();
    store.set("long", &2, Duration::from_secs(600)).unwrap();

    clock.advance(Duration::from_secs(11));
    assert_eq!(store.get::<i32>("short").unwrap(), None);
    assert_eq!(store.len().unwrap(), 1);

    assert_eq!(store.sweep_expired().unwrap(), 1);
    assert_eq!(store.sweep_expired().unwrap(), 0);
    assert_eq!(store.get::<i32>("long").unwrap(), Some(2));
  }

  #[test]
  fn test_clear() {
    let (store, _) = store();
    store.set("a", &1, Duration::from_secs(60)).unwrap();
    store.set("b", &2, Duration::from_secs(60)).unwrap();
    store.clear().unwrap();
    assert_eq!(store.len().unwrap(), 0);
  }

  #[test]
  fn test_open_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");
    {
      let store = SqliteKvStore::open(&path).unwrap();
      store.set("k", &"v", Duration::from_secs(60)).unwrap();
    }
    let reopened = SqliteKvStore::open(&path).unwrap();
    assert_eq!(reopened.get::<String>("k").unwrap(), Some("v".to_string()));
  }
}
