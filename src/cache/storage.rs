//! Partition storage trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::fetch::Response;

/// A response held in a partition.
#[derive(Debug, Clone)]
pub struct StoredEntry {
  /// URL the entry was stored for
  pub url: String,
  pub response: Response,
}

/// Trait for partition storage backends.
///
/// Entries within a partition keep their insertion order; re-inserting a key
/// moves it to the newest position.
pub trait PartitionStorage: Send + Sync {
  /// Create the partition if it doesn't exist yet.
  fn open_partition(&self, partition: &str) -> Result<()>;

  /// Names of every existing partition.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Delete a partition and all its entries. Returns whether it existed.
  fn delete_partition(&self, partition: &str) -> Result<bool>;

  /// Look up an entry by key.
  fn get(&self, partition: &str, key: &str) -> Result<Option<StoredEntry>>;

  /// Insert or replace an entry, creating the partition lazily.
  fn put(&self, partition: &str, key: &str, url: &str, response: &Response) -> Result<()>;

  /// Remove the oldest-inserted entries until at most `max_entries` remain.
  /// Returns the URLs of the evicted entries, oldest first.
  fn evict_to(&self, partition: &str, max_entries: usize) -> Result<Vec<String>>;

  /// Number of entries in a partition.
  fn entry_count(&self, partition: &str) -> Result<usize>;

  /// URLs of a partition's entries in insertion order.
  fn urls(&self, partition: &str) -> Result<Vec<String>>;

  /// Version tag recorded by the last successful activation, if any.
  fn activated_version(&self) -> Result<Option<String>>;

  fn record_activation(&self, version: &str) -> Result<()>;
}

/// SQLite-based partition storage.
pub struct SqlitePartitionStore {
  conn: Mutex<Connection>,
}

impl SqlitePartitionStore {
  /// Open (or create) the store at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(PARTITION_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for partition tables.
const PARTITION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- seq is global and strictly increasing; it defines insertion order
CREATE TABLE IF NOT EXISTS entries (
    partition TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    seq INTEGER NOT NULL,
    PRIMARY KEY (partition, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_entries_seq ON entries(partition, seq);

-- single row: survives restarts so a failed reinstall keeps serving
CREATE TABLE IF NOT EXISTS activation (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version TEXT NOT NULL,
    activated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl PartitionStorage for SqlitePartitionStore {
  fn open_partition(&self, partition: &str) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to create partition {}: {}", partition, e))?;
    Ok(())
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    let conn = self.conn()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE partition = ?", params![partition])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", partition, e))?;
    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![partition])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", partition, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get(&self, partition: &str, key: &str) -> Result<Option<StoredEntry>> {
    let conn = self.conn()?;
    let row: Option<(String, u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT url, status, headers, body FROM entries
         WHERE partition = ? AND entry_key = ?",
        params![partition, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    match row {
      Some((url, status, headers, body)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;
        Ok(Some(StoredEntry {
          url,
          response: Response {
            status,
            headers,
            body,
          },
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, partition: &str, key: &str, url: &str, response: &Response) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let conn = self.conn()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to create partition {}: {}", partition, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO entries (partition, entry_key, url, status, headers, body, seq)
       VALUES (?, ?, ?, ?, ?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM entries))",
      params![partition, key, url, response.status, headers, response.body],
    )
    .map_err(|e| eyre!("Failed to store entry: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn evict_to(&self, partition: &str, max_entries: usize) -> Result<Vec<String>> {
    let count = self.entry_count(partition)?;
    if count <= max_entries {
      return Ok(Vec::new());
    }
    let excess = count - max_entries;

    let conn = self.conn()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let victims: Vec<(String, String)> = {
      let mut stmt = tx
        .prepare(
          "SELECT entry_key, url FROM entries WHERE partition = ?
           ORDER BY seq ASC LIMIT ?",
        )
        .map_err(|e| eyre!("Failed to prepare eviction query: {}", e))?;

      let rows = stmt
        .query_map(params![partition, excess as i64], |row| {
          Ok((row.get(0)?, row.get(1)?))
        })
        .map_err(|e| eyre!("Failed to select eviction victims: {}", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read eviction victim: {}", e))?;
      rows
    };

    for (key, _) in &victims {
      tx.execute(
        "DELETE FROM entries WHERE partition = ? AND entry_key = ?",
        params![partition, key],
      )
      .map_err(|e| eyre!("Failed to evict entry: {}", e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(victims.into_iter().map(|(_, url)| url).collect())
  }

  fn entry_count(&self, partition: &str) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries: {}", e))?;

    Ok(count as usize)
  }

  fn urls(&self, partition: &str) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT url FROM entries WHERE partition = ? ORDER BY seq ASC")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![partition], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list entries: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry url: {}", e))?;

    Ok(urls)
  }

  fn activated_version(&self) -> Result<Option<String>> {
    let conn = self.conn()?;
    conn
      .query_row("SELECT version FROM activation WHERE id = 1", [], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read activation: {}", e))
  }

  fn record_activation(&self, version: &str) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO activation (id, version, activated_at)
         VALUES (1, ?, datetime('now'))",
        params![version],
      )
      .map_err(|e| eyre!("Failed to record activation of {}: {}", version, e))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn response(body: &str) -> Response {
    Response::new(200, body).with_header("content-type", "text/plain")
  }

  #[test]
  fn test_put_and_get_roundtrip() {
    let store = SqlitePartitionStore::open_in_memory().unwrap();
    store.put("p", "k1", "https://a.test/1", &response("one")).unwrap();

    let entry = store.get("p", "k1").unwrap().unwrap();
    assert_eq!(entry.url, "https://a.test/1");
    assert_eq!(entry.response.body, b"one");
    assert_eq!(entry.response.header("content-type"), Some("text/plain"));
    assert!(store.get("p", "missing").unwrap().is_none());
    assert!(store.get("other", "k1").unwrap().is_none());
  }

  #[test]
  fn test_partitions_created_lazily() {
    let store = SqlitePartitionStore::open_in_memory().unwrap();
    assert!(store.partition_names().unwrap().is_empty());

    store.put("b", "k", "u", &response("x")).unwrap();
    store.open_partition("a").unwrap();
    assert_eq!(store.partition_names().unwrap(), vec!["a", "b"]);
  }

  #[test]
  fn test_activation_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partitions.db");

    let store = SqlitePartitionStore::open(&path).unwrap();
    assert_eq!(store.activated_version().unwrap(), None);
    store.record_activation("v1").unwrap();
    store.record_activation("v2").unwrap();
    drop(store);

    let reopened = SqlitePartitionStore::open(&path).unwrap();
    assert_eq!(reopened.activated_version().unwrap(), Some("v2".to_string()));
  }

  #[test]
  fn test_evict_removes_first_inserted() {
    let store = SqlitePartitionStore::open_in_memory().unwrap();
    store.put("api", "a", "A", &response("a")).unwrap();
    store.put("api", "b", "B", &response("b")).unwrap();
    store.put("api", "c", "C", &response("c")).unwrap();

    let evicted = store.evict_to("api", 2).unwrap();
    assert_eq!(evicted, vec!["A"]);
    assert_eq!(store.urls("api").unwrap(), vec!["B", "C"]);
  }

  #[test]
  fn test_reinsert_moves_to_newest_position() {
    let store = SqlitePartitionStore::open_in_memory().unwrap();
    store.put("api", "a", "A", &response("a")).unwrap();
    store.put("api", "b", "B", &response("b")).unwrap();
    store.put("api", "a", "A", &response("a2")).unwrap();

    assert_eq!(store.entry_count("api").unwrap(), 2);
    assert_eq!(store.urls("api").unwrap(), vec!["B", "A"]);
  }

  #[test]
  fn test_eviction_is_per_partition() {
    let store = SqlitePartitionStore::open_in_memory().unwrap();
    store.put("one", "a", "A", &response("a")).unwrap();
    store.put("two", "b", "B", &response("b")).unwrap();
    store.put("one", "c", "C", &response("c")).unwrap();

    assert_eq!(store.evict_to("one", 1).unwrap(), vec!["A"]);
    assert_eq!(store.entry_count("two").unwrap(), 1);
  }

  #[test]
  fn test_delete_partition() {
    let store = SqlitePartitionStore::open_in_memory().unwrap();
    store.put("old", "a", "A", &response("a")).unwrap();

    assert!(store.delete_partition("old").unwrap());
    assert!(!store.delete_partition("old").unwrap());
    assert_eq!(store.entry_count("old").unwrap(), 0);
    assert!(store.partition_names().unwrap().is_empty());
  }
}
