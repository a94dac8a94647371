//! Main-context query cache.
//!
//! Inspired by TanStack Query: results are stored under hierarchical keys,
//! go stale after `stale_time`, and can be invalidated by key prefix so that
//! the next read refetches.
//!
//! # Example
//!
//! ```ignore
//! let queries = QueryClient::new(Duration::from_secs(60));
//! let products = queries
//!     .fetch_query(&QueryKey::new(["products"]), || async { api.list_products().await })
//!     .await?;
//!
//! // After a product changes:
//! queries.invalidate(&QueryKey::new(["products"]))?;
//! ```

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::{elapsed_since, Clock, SystemClock};

/// Hierarchical query key, e.g. `["product", "42"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
  pub fn new<I, S>(segments: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self(segments.into_iter().map(Into::into).collect())
  }

  /// Append a segment.
  pub fn with(mut self, segment: impl Into<String>) -> Self {
    self.0.push(segment.into());
    self
  }

  pub fn segments(&self) -> &[String] {
    &self.0
  }

  /// Whether `prefix` matches this key segment by segment.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// Flat form used as a key in the memory and persistent tiers.
  pub fn flat(&self) -> String {
    self.0.join(":")
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}]", self.0.join(", "))
  }
}

/// What the invalidation engine needs from a query cache. It never reads
/// the cached contents.
pub trait QueryCache: Send + Sync {
  /// Mark every query whose key starts with `prefix` as stale.
  /// Returns how many queries were affected.
  fn invalidate(&self, prefix: &QueryKey) -> Result<usize>;

  /// Drop every cached query.
  fn clear(&self) -> Result<()>;

  /// Number of cached queries.
  fn len(&self) -> Result<usize>;
}

#[derive(Debug, Clone)]
struct CachedQuery {
  data: Value,
  updated_at: DateTime<Utc>,
  invalidated: bool,
}

/// In-process query cache keyed by [`QueryKey`].
pub struct QueryClient {
  entries: Mutex<HashMap<QueryKey, CachedQuery>>,
  stale_time: Duration,
  clock: Arc<dyn Clock>,
}

impl QueryClient {
  pub fn new(stale_time: Duration) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      stale_time,
      clock: Arc::new(SystemClock),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Store data for a key, replacing anything there.
  pub fn set_query_data<T: Serialize>(&self, key: &QueryKey, data: &T) -> Result<()> {
    let data = serde_json::to_value(data)
      .map_err(|e| eyre!("Failed to serialize query data for {}: {}", key, e))?;
    self.entries.lock().insert(
      key.clone(),
      CachedQuery {
        data,
        updated_at: self.clock.now(),
        invalidated: false,
      },
    );
    Ok(())
  }

  /// Cached data for a key, stale or not.
  pub fn get_query_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
    let data = self.entries.lock().get(key)?.data.clone();
    serde_json::from_value(data).ok()
  }

  /// Whether a key is missing, invalidated, or older than the stale time.
  pub fn is_stale(&self, key: &QueryKey) -> bool {
    let now = self.clock.now();
    match self.entries.lock().get(key) {
      Some(entry) => entry.invalidated || elapsed_since(now, entry.updated_at) > self.stale_time,
      None => true,
    }
  }

  /// Return fresh cached data, or run the fetcher and cache its result.
  pub async fn fetch_query<T, F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<T>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    if !self.is_stale(key) {
      if let Some(data) = self.get_query_data(key) {
        return Ok(data);
      }
    }

    debug!(%key, "Fetching query");
    let data = fetcher().await?;
    self.set_query_data(key, &data)?;
    Ok(data)
  }
}

impl QueryCache for QueryClient {
  fn invalidate(&self, prefix: &QueryKey) -> Result<usize> {
    let mut entries = self.entries.lock();
    let mut affected = 0;
    for (key, entry) in entries.iter_mut() {
      if key.starts_with(prefix) {
        entry.invalidated = true;
        affected += 1;
      }
    }
    debug!(%prefix, affected, "Invalidated queries");
    Ok(affected)
  }

  fn clear(&self) -> Result<()> {
    self.entries.lock().clear();
    Ok(())
  }

  fn len(&self) -> Result<usize> {
    Ok(self.entries.lock().len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn client() -> (QueryClient, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let client = QueryClient::new(Duration::from_secs(60)).with_clock(clock.clone());
    (client, clock)
  }

  #[test]
  fn test_prefix_matching() {
    let detail = QueryKey::new(["product"]).with("42");
    assert!(detail.starts_with(&QueryKey::new(["product"])));
    assert!(!detail.starts_with(&QueryKey::new(["products"])));
    assert_eq!(detail.flat(), "product:42");
    assert_eq!(detail.to_string(), "[product, 42]");
  }

  #[tokio::test]
  async fn test_fetch_query_uses_cache_until_stale() {
    let (client, clock) = client();
    let key = QueryKey::new(["cart"]);
    let counter = AtomicU32::new(0);

    for _ in 0..2 {
      let value: u32 = client
        .fetch_query(&key, || async { Ok(counter.fetch_add(1, Ordering::SeqCst)) })
        .await
        .unwrap();
      assert_eq!(value, 0);
    }

    clock.advance(Duration::from_secs(61));
    let value: u32 = client
      .fetch_query(&key, || async { Ok(counter.fetch_add(1, Ordering::SeqCst)) })
      .await
      .unwrap();
    assert_eq!(value, 1);
  }

  #[tokio::test]
  async fn test_invalidate_forces_refetch() {
    let (client, _) = client();
    client.set_query_data(&QueryKey::new(["products"]), &vec![1, 2]).unwrap();
    client.set_query_data(&QueryKey::new(["product", "1"]), &1).unwrap();
    client.set_query_data(&QueryKey::new(["cart"]), &0).unwrap();

    assert_eq!(client.invalidate(&QueryKey::new(["product"])).unwrap(), 1);
    assert!(client.is_stale(&QueryKey::new(["product", "1"])));
    assert!(!client.is_stale(&QueryKey::new(["products"])));
    assert!(!client.is_stale(&QueryKey::new(["cart"])));

    let refreshed: i32 = client
      .fetch_query(&QueryKey::new(["product", "1"]), || async { Ok(7) })
      .await
      .unwrap();
    assert_eq!(refreshed, 7);
  }

  #[tokio::test]
  async fn test_fetch_error_propagates() {
    let (client, _) = client();
    let result: Result<u32> = client
      .fetch_query(&QueryKey::new(["user"]), || async { Err(eyre!("backend down")) })
      .await;
    assert!(result.is_err());
    assert_eq!(client.len().unwrap(), 0);
  }

  #[test]
  fn test_clear() {
    let (client, _) = client();
    client.set_query_data(&QueryKey::new(["a"]), &1).unwrap();
    client.clear().unwrap();
    assert_eq!(client.len().unwrap(), 0);
    assert!(client.get_query_data::<i32>(&QueryKey::new(["a"])).is_none());
  }
}
