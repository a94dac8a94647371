//! Cross-tier commands issued from the main context.
//!
//! Every command is best effort: a tier that fails is logged and reported,
//! and the remaining tiers are still processed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::ControlChannel;
use crate::invalidation::{InvalidationAction, InvalidationEvent};
use crate::memory::MemoryCache;
use crate::query::QueryCache;
use crate::store::PersistentTier;

/// Entry counts across tiers. `None` means that tier could not be read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierStats {
  pub memory_entries: usize,
  pub store_entries: Option<usize>,
  pub query_entries: Option<usize>,
  /// Interception-layer partitions; empty if the worker didn't answer in time
  pub partitions: BTreeMap<String, usize>,
}

impl TierStats {
  pub fn total_entries(&self) -> usize {
    self.memory_entries
      + self.store_entries.unwrap_or(0)
      + self.query_entries.unwrap_or(0)
      + self.partitions.values().sum::<usize>()
  }
}

impl fmt::Display for TierStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fn count(value: Option<usize>) -> String {
      value.map_or_else(|| "unavailable".to_string(), |n| n.to_string())
    }

    writeln!(f, "memory     {}", self.memory_entries)?;
    writeln!(f, "store      {}", count(self.store_entries))?;
    writeln!(f, "queries    {}", count(self.query_entries))?;
    if self.partitions.is_empty() {
      writeln!(f, "partitions none")?;
    }
    for (name, entries) in &self.partitions {
      writeln!(f, "partition  {} {}", name, entries)?;
    }
    Ok(())
  }
}

/// Outcome of a best-effort command, step by step.
#[derive(Debug, Clone, Default)]
pub struct CommandReport {
  pub completed: Vec<String>,
  /// Step label and error message
  pub failed: Vec<(String, String)>,
}

impl CommandReport {
  pub fn is_complete(&self) -> bool {
    self.failed.is_empty()
  }

  fn record(&mut self, step: String, outcome: color_eyre::Result<()>) {
    match outcome {
      Ok(()) => self.completed.push(step),
      Err(e) => {
        warn!(%step, error = %e, "Tier operation failed");
        self.failed.push((step, e.to_string()));
      }
    }
  }
}

/// Owns the main-context tiers and the control channel to the worker.
pub struct CacheCoordinator {
  memory: Arc<MemoryCache>,
  store: Arc<dyn PersistentTier>,
  queries: Arc<dyn QueryCache>,
  control: ControlChannel,
}

impl CacheCoordinator {
  pub fn new(
    memory: Arc<MemoryCache>,
    store: Arc<dyn PersistentTier>,
    queries: Arc<dyn QueryCache>,
    control: ControlChannel,
  ) -> Self {
    Self {
      memory,
      store,
      queries,
      control,
    }
  }

  pub fn memory(&self) -> &Arc<MemoryCache> {
    &self.memory
  }

  pub fn control(&self) -> &ControlChannel {
    &self.control
  }

  /// Collect entry counts from every tier; a failing tier doesn't hide the others.
  pub async fn collect_stats(&self) -> TierStats {
    let store_entries = self
      .store
      .len()
      .map_err(|e| warn!(error = %e, "Failed to read store stats"))
      .ok();
    let query_entries = self
      .queries
      .len()
      .map_err(|e| warn!(error = %e, "Failed to read query cache stats"))
      .ok();

    TierStats {
      memory_entries: self.memory.size(),
      store_entries,
      query_entries,
      partitions: self.control.get_cache_stats().await,
    }
  }

  /// Apply a domain event across tiers.
  pub async fn invalidate(&self, event: &InvalidationEvent) -> CommandReport {
    info!(domain = %event.domain, entity = ?event.entity_id, "Invalidating");
    self.execute(&event.actions()).await
  }

  /// Clear every tier.
  pub async fn clear_all(&self) -> CommandReport {
    self
      .execute(&[
        InvalidationAction::ClearMemory,
        InvalidationAction::ClearStore,
        InvalidationAction::ClearQueries,
        InvalidationAction::ClearInterceptor,
      ])
      .await
  }

  async fn execute(&self, actions: &[InvalidationAction]) -> CommandReport {
    let mut report = CommandReport::default();

    for action in actions {
      match action {
        InvalidationAction::Key(key) => {
          let outcome = self.queries.invalidate(key).map(|affected| {
            debug!(%key, affected, "Query cache invalidated");
          });
          report.record(format!("query {}", key), outcome);

          self.memory.delete(&key.flat());
          report.record(format!("memory {}", key.flat()), Ok(()));
        }
        InvalidationAction::ClearMemory => {
          self.memory.clear();
          report.record("clear memory".to_string(), Ok(()));
        }
        InvalidationAction::ClearStore => {
          report.record("clear store".to_string(), self.store.clear());
        }
        InvalidationAction::ClearQueries => {
          report.record("clear queries".to_string(), self.queries.clear());
        }
        InvalidationAction::ClearInterceptor => {
          let outcome = if self.control.clear_cache().await {
            Ok(())
          } else {
            Err(color_eyre::eyre::eyre!("worker reported failure"))
          };
          report.record("clear partitions".to_string(), outcome);
        }
      }
    }

    report
  }

  /// Sweep expired entries out of the memory and persistent tiers every
  /// `interval`, until `cancel` fires.
  pub fn spawn_cleanup(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    let memory = Arc::clone(&self.memory);
    let store = Arc::clone(&self.store);

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately
      ticker.tick().await;

      loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          _ = ticker.tick() => sweep_tiers(&memory, store.as_ref()),
        }
      }
      debug!("Cleanup task stopped");
    })
  }
}

fn sweep_tiers(memory: &MemoryCache, store: &dyn PersistentTier) {
  let from_memory = memory.sweep_expired();
  let from_store = match store.sweep_expired() {
    Ok(removed) => removed,
    Err(e) => {
      warn!(error = %e, "Store sweep failed");
      0
    }
  };
  if from_memory + from_store > 0 {
    debug!(from_memory, from_store, "Swept expired entries");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheLayer, LayerSettings, SqlitePartitionStore};
  use crate::clock::ManualClock;
  use crate::fetch::testing::StubFetcher;
  use crate::fetch::Request;
  use crate::interceptor::{Interceptor, InterceptorHandle, WorkerMessage};
  use crate::invalidation::keys;
  use crate::query::{QueryClient, QueryKey};
  use crate::store::SqliteKvStore;
  use color_eyre::{eyre::eyre, Result};
  use serde_json::json;
  use tokio::sync::mpsc;

  struct BrokenStore;

  impl PersistentTier for BrokenStore {
    fn len(&self) -> Result<usize> {
      Err(eyre!("disk unavailable"))
    }

    fn clear(&self) -> Result<()> {
      Err(eyre!("disk unavailable"))
    }

    fn sweep_expired(&self) -> Result<usize> {
      Err(eyre!("disk unavailable"))
    }
  }

  struct BrokenQueries;

  impl QueryCache for BrokenQueries {
    fn invalidate(&self, _prefix: &QueryKey) -> Result<usize> {
      Err(eyre!("query cache gone"))
    }

    fn clear(&self) -> Result<()> {
      Err(eyre!("query cache gone"))
    }

    fn len(&self) -> Result<usize> {
      Err(eyre!("query cache gone"))
    }
  }

  /// Control channel whose worker never answers.
  fn silent_control() -> (ControlChannel, mpsc::Receiver<WorkerMessage>) {
    let (tx, rx) = mpsc::channel(16);
    (ControlChannel::new(tx, Duration::from_millis(100)), rx)
  }

  fn memory() -> Arc<MemoryCache> {
    Arc::new(MemoryCache::new(100, Duration::from_secs(300)))
  }

  #[tokio::test]
  async fn test_logout_empties_every_tier() {
    let fetcher = Arc::new(StubFetcher::new());
    let layer = CacheLayer::new(
      SqlitePartitionStore::open_in_memory().unwrap(),
      fetcher,
      LayerSettings::default(),
    );
    let handle = InterceptorHandle::spawn(Interceptor::new(layer, Vec::new())).unwrap();
    handle
      .fetch(Request::parse_get("https://shop.test/api/cart").unwrap())
      .await
      .unwrap();

    let store = Arc::new(SqliteKvStore::open_in_memory().unwrap());
    store.set("session", &"abc", Duration::from_secs(60)).unwrap();
    let queries = Arc::new(QueryClient::new(Duration::from_secs(60)));
    queries.set_query_data(&keys::cart(), &json!([1])).unwrap();
    let memory = memory();
    memory.set("cart", json!(1), Duration::from_secs(60)).unwrap();

    let coordinator = CacheCoordinator::new(
      memory,
      store,
      queries,
      handle.control(Duration::from_secs(1)),
    );
    assert_eq!(coordinator.collect_stats().await.total_entries(), 4);

    let report = coordinator.invalidate(&InvalidationEvent::logout()).await;
    assert!(report.is_complete());

    let stats = coordinator.collect_stats().await;
    assert_eq!(stats.total_entries(), 0);
    assert_eq!(stats.store_entries, Some(0));

    handle.shutdown().await;
  }

  #[tokio::test]
  async fn test_product_invalidation_purges_list_and_detail() {
    let (control, _rx) = silent_control();
    let queries = Arc::new(QueryClient::new(Duration::from_secs(60)));
    queries.set_query_data(&keys::product_list(), &json!([])).unwrap();
    queries.set_query_data(&keys::product_detail("42"), &json!({})).unwrap();
    queries.set_query_data(&keys::cart(), &json!([])).unwrap();
    let memory = memory();
    memory.set("products", json!([]), Duration::from_secs(60)).unwrap();
    memory.set("product:42", json!({}), Duration::from_secs(60)).unwrap();
    memory.set("cart", json!([]), Duration::from_secs(60)).unwrap();

    let coordinator = CacheCoordinator::new(
      memory.clone(),
      Arc::new(SqliteKvStore::open_in_memory().unwrap()),
      queries.clone(),
      control,
    );
    let report = coordinator
      .invalidate(&InvalidationEvent::product(Some("42")))
      .await;

    assert!(report.is_complete());
    assert!(queries.is_stale(&keys::product_list()));
    assert!(queries.is_stale(&keys::product_detail("42")));
    assert!(!queries.is_stale(&keys::cart()));
    assert!(memory.get("products").is_none());
    assert!(memory.get("product:42").is_none());
    assert!(memory.get("cart").is_some());
  }

  #[tokio::test]
  async fn test_failing_tier_does_not_block_others() {
    let (control, _rx) = silent_control();
    let memory = memory();
    memory.set("orders", json!([]), Duration::from_secs(60)).unwrap();
    memory.set("admin:orders", json!([]), Duration::from_secs(60)).unwrap();

    let coordinator = CacheCoordinator::new(
      memory.clone(),
      Arc::new(BrokenStore),
      Arc::new(BrokenQueries),
      control,
    );

    let report = coordinator.invalidate(&InvalidationEvent::order()).await;
    assert_eq!(report.failed.len(), 2);
    assert_eq!(memory.size(), 0);

    memory.set("x", json!(1), Duration::from_secs(60)).unwrap();
    let report = coordinator.clear_all().await;
    assert_eq!(report.failed.len(), 2);
    assert_eq!(memory.size(), 0);
  }

  #[tokio::test]
  async fn test_stats_are_partial_when_sources_fail() {
    let (control, _rx) = silent_control();
    let memory = memory();
    memory.set("a", json!(1), Duration::from_secs(60)).unwrap();

    let coordinator =
      CacheCoordinator::new(memory, Arc::new(BrokenStore), Arc::new(BrokenQueries), control);

    let started = std::time::Instant::now();
    let stats = coordinator.collect_stats().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(stats.memory_entries, 1);
    assert_eq!(stats.store_entries, None);
    assert_eq!(stats.query_entries, None);
    assert!(stats.partitions.is_empty());
  }

  #[tokio::test]
  async fn test_cleanup_task_sweeps_on_interval() {
    let (control, _rx) = silent_control();
    let clock = Arc::new(ManualClock::default());
    let memory = Arc::new(MemoryCache::new(10, Duration::from_secs(60)).with_clock(clock.clone()));
    let store = Arc::new(SqliteKvStore::open_in_memory().unwrap().with_clock(clock.clone()));
    memory.set("a", json!(1), Duration::from_secs(1)).unwrap();
    memory.set("b", json!(2), Duration::from_secs(600)).unwrap();
    store.set("c", &3, Duration::from_secs(1)).unwrap();

    let coordinator = CacheCoordinator::new(
      memory.clone(),
      store.clone(),
      Arc::new(QueryClient::new(Duration::from_secs(60))),
      control,
    );
    let cancel = CancellationToken::new();
    let task = coordinator.spawn_cleanup(Duration::from_millis(20), cancel.clone());

    clock.advance(Duration::from_secs(2));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(memory.size(), 1);
    assert_eq!(store.sweep_expired().unwrap(), 0);

    cancel.cancel();
    task.await.unwrap();
  }
}
