use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tiercache::cache::{CacheLayer, SqlitePartitionStore};
use tiercache::config::Config;
use tiercache::coordinator::{CacheCoordinator, CommandReport, TierStats};
use tiercache::fetch::{HttpFetcher, Request};
use tiercache::interceptor::{Interceptor, InterceptorHandle};
use tiercache::invalidation::InvalidationEvent;
use tiercache::memory::MemoryCache;
use tiercache::query::QueryClient;
use tiercache::store::SqliteKvStore;

/// Every tier wired together from one configuration.
pub struct App {
  interceptor: InterceptorHandle,
  coordinator: CacheCoordinator,
  cleanup: CancellationToken,
  cleanup_task: JoinHandle<()>,
}

impl App {
  /// Open the storage files, start the interception worker and the cleanup task.
  pub fn new(config: &Config) -> Result<Self> {
    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)
      .map_err(|e| eyre!("Failed to create data directory {}: {}", data_dir.display(), e))?;

    let fetcher = Arc::new(HttpFetcher::new(config.network_timeout())?);
    let partitions = SqlitePartitionStore::open(&config.partitions_path()?)?;
    let layer = CacheLayer::new(partitions, fetcher, config.layer_settings());
    let interceptor = InterceptorHandle::spawn(Interceptor::new(layer, config.seed_urls()?))?;

    let memory = Arc::new(
      MemoryCache::new(config.memory.max_size, config.memory_ttl())
        .with_max_entry_bytes(config.memory.max_entry_bytes),
    );
    let store = Arc::new(SqliteKvStore::open(&config.store_path()?)?);
    let queries = Arc::new(QueryClient::new(config.memory_ttl()));
    let coordinator = CacheCoordinator::new(
      memory,
      store,
      queries,
      interceptor.control(config.control_timeout()),
    );

    let cleanup = CancellationToken::new();
    let cleanup_task = coordinator.spawn_cleanup(config.cleanup_interval(), cleanup.clone());

    info!(data_dir = %data_dir.display(), version = %config.cache.version, "Cache tiers ready");

    Ok(Self {
      interceptor,
      coordinator,
      cleanup,
      cleanup_task,
    })
  }

  /// Serve each URL through the interception worker and print the outcome.
  pub async fn fetch(&self, urls: &[String], navigate: bool) -> Result<()> {
    for url in urls {
      let mut request = Request::parse_get(url)?;
      if navigate {
        request = Request::navigate(request.url);
      }

      let served = self.interceptor.fetch(request).await?;
      let strategy = served
        .strategy
        .map_or_else(|| "pass-through".to_string(), |s| s.to_string());
      println!(
        "{} {:<16} {:<8} {:<22} {}",
        served.response.status,
        served.source.to_string(),
        served.class.to_string(),
        strategy,
        url
      );
    }
    Ok(())
  }

  pub async fn stats(&self) -> TierStats {
    self.coordinator.collect_stats().await
  }

  pub async fn clear(&self) -> CommandReport {
    self.coordinator.clear_all().await
  }

  pub async fn invalidate(&self, event: &InvalidationEvent) -> CommandReport {
    self.coordinator.invalidate(event).await
  }

  /// Stop the cleanup task and the worker.
  pub async fn shutdown(self) {
    self.cleanup.cancel();
    if let Err(e) = self.cleanup_task.await {
      warn!(error = %e, "Cleanup task ended abnormally");
    }
    self.interceptor.shutdown().await;
  }
}
