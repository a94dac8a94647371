//! Bounded in-memory tier with per-entry TTL.
//!
//! Capacity is counted in entries. When full, the single oldest-inserted
//! entry is evicted before a new one is admitted; reads do not affect
//! eviction order.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::{elapsed_since, Clock, SystemClock};

/// Reasons a value is refused admission.
#[derive(Debug, Error)]
pub enum MemoryCacheError {
  #[error("Value too large: {size} bytes (max: {max})")]
  ValueTooLarge { size: usize, max: usize },

  #[error("Value cannot be encoded: {0}")]
  Malformed(String),
}

/// A single stored value.
#[derive(Debug, Clone)]
pub struct MemoryCacheEntry {
  pub data: Value,
  pub inserted_at: DateTime<Utc>,
  pub ttl: Duration,
  seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
  entries: HashMap<String, MemoryCacheEntry>,
  /// Insertion sequence -> key; the first entry is the oldest
  order: BTreeMap<u64, String>,
  next_seq: u64,
}

impl Inner {
  fn remove(&mut self, key: &str) -> Option<MemoryCacheEntry> {
    let entry = self.entries.remove(key)?;
    self.order.remove(&entry.seq);
    Some(entry)
  }
}

/// Capacity-bounded key/value cache for hot, ephemeral values.
pub struct MemoryCache {
  inner: Mutex<Inner>,
  max_size: usize,
  max_entry_bytes: usize,
  default_ttl: Duration,
  clock: Arc<dyn Clock>,
}

impl MemoryCache {
  pub fn new(max_size: usize, default_ttl: Duration) -> Self {
    Self {
      inner: Mutex::new(Inner::default()),
      max_size,
      max_entry_bytes: usize::MAX,
      default_ttl,
      clock: Arc::new(SystemClock),
    }
  }

  /// Reject values whose JSON encoding exceeds this many bytes.
  pub fn with_max_entry_bytes(mut self, max_entry_bytes: usize) -> Self {
    self.max_entry_bytes = max_entry_bytes;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn max_size(&self) -> usize {
    self.max_size
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  /// Insert a value. At capacity, the oldest-inserted entry goes first.
  ///
  /// Capacity counts distinct keys, so eviction only happens when a new key
  /// is admitted. Replacing an existing key at capacity evicts nothing: the
  /// old value is dropped and the key moves to the newest position, so it is
  /// no longer the next eviction victim.
  pub fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), MemoryCacheError> {
    let size = serde_json::to_vec(&value)
      .map_err(|e| MemoryCacheError::Malformed(e.to_string()))?
      .len();
    if size > self.max_entry_bytes {
      warn!(key, size, max = self.max_entry_bytes, "Rejected oversized memory entry");
      return Err(MemoryCacheError::ValueTooLarge {
        size,
        max: self.max_entry_bytes,
      });
    }

    let now = self.clock.now();
    let mut inner = self.inner.lock();

    if inner.remove(key).is_none() && inner.entries.len() >= self.max_size {
      if let Some((_, oldest)) = inner.order.pop_first() {
        inner.entries.remove(&oldest);
        debug!(evicted = %oldest, "Memory tier at capacity");
      }
    }

    if self.max_size == 0 {
      return Ok(());
    }

    let seq = inner.next_seq;
    inner.next_seq += 1;
    inner.order.insert(seq, key.to_string());
    inner.entries.insert(
      key.to_string(),
      MemoryCacheEntry {
        data: value,
        inserted_at: now,
        ttl,
        seq,
      },
    );

    Ok(())
  }

  /// Insert any serializable value with the default TTL.
  pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), MemoryCacheError> {
    let value = serde_json::to_value(value).map_err(|e| MemoryCacheError::Malformed(e.to_string()))?;
    self.set(key, value, self.default_ttl)
  }

  /// Read a value. Expired entries are deleted by the read.
  pub fn get(&self, key: &str) -> Option<Value> {
    let now = self.clock.now();
    let mut inner = self.inner.lock();

    let expired = {
      let entry = inner.entries.get(key)?;
      elapsed_since(now, entry.inserted_at) > entry.ttl
    };

    if expired {
      inner.remove(key);
      debug!(key, "Memory entry expired on read");
      return None;
    }

    inner.entries.get(key).map(|entry| entry.data.clone())
  }

  /// Read and decode a value; entries that don't decode as `T` read as absent.
  pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self
      .get(key)
      .and_then(|value| serde_json::from_value(value).ok())
  }

  pub fn delete(&self, key: &str) -> bool {
    self.inner.lock().remove(key).is_some()
  }

  pub fn clear(&self) {
    let mut inner = self.inner.lock();
    inner.entries.clear();
    inner.order.clear();
  }

  pub fn size(&self) -> usize {
    self.inner.lock().entries.len()
  }

  /// Remove every expired entry. Returns how many were removed.
  pub fn sweep_expired(&self) -> usize {
    let now = self.clock.now();
    let mut inner = self.inner.lock();

    let expired: Vec<String> = inner
      .entries
      .iter()
      .filter(|(_, entry)| elapsed_since(now, entry.inserted_at) > entry.ttl)
      .map(|(key, _)| key.clone())
      .collect();

    for key in &expired {
      inner.remove(key);
    }
    expired.len()
  }
}
