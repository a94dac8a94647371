//! Cache layer that applies per-class strategies on top of partition storage.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;

use crate::clock::{elapsed_since, Clock, SystemClock};
use crate::fetch::{Connectivity, Fetcher, Request, Response};

use super::partition::PartitionNamer;
use super::policy::{classify, PolicyConfig, PolicyTable, ResourceClass, Strategy};
use super::storage::{PartitionStorage, StoredEntry};
use super::traits::{CacheSource, Served};

/// Header stamped on every stored response; drives staleness.
pub const CACHED_AT_HEADER: &str = "x-cached-at";

const OFFLINE_PAGE: &str =
  "<!doctype html><title>Offline</title><h1>You are offline</h1><p>This page is not available offline.</p>";
const OFFLINE_JSON: &str = r#"{"error":"offline","message":"Network unavailable"}"#;

/// Static settings for a [`CacheLayer`].
#[derive(Debug, Clone)]
pub struct LayerSettings {
  pub policies: PolicyTable,
  pub namer: PartitionNamer,
  /// Hosts whose every request is API data
  pub api_hosts: Vec<String>,
  /// Path of the app shell served to offline navigations
  pub shell_path: String,
  /// Path of the image served in place of unavailable images
  pub placeholder_path: String,
}

impl Default for LayerSettings {
  fn default() -> Self {
    Self {
      policies: PolicyTable::default(),
      namer: PartitionNamer::new("tiercache", "v1"),
      api_hosts: Vec::new(),
      shell_path: "/".to_string(),
      placeholder_path: "/placeholder.svg".to_string(),
    }
  }
}

/// Cache layer that manages strategy dispatch and network fetching.
///
/// This layer sits between the caller and the network, and always produces a
/// response: when both cache and network fail, it answers with an offline
/// fallback.
pub struct CacheLayer<S: PartitionStorage> {
  storage: Arc<S>,
  fetcher: Arc<dyn Fetcher>,
  settings: Arc<LayerSettings>,
  clock: Arc<dyn Clock>,
  connectivity: Connectivity,
  /// Revalidations and per-request tasks; drained before the worker exits
  tasks: TaskTracker,
}

impl<S: PartitionStorage + 'static> CacheLayer<S> {
  pub fn new(storage: S, fetcher: Arc<dyn Fetcher>, settings: LayerSettings) -> Self {
    Self {
      storage: Arc::new(storage),
      fetcher,
      settings: Arc::new(settings),
      clock: Arc::new(SystemClock),
      connectivity: Connectivity::online(),
      tasks: TaskTracker::new(),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
    self.connectivity = connectivity;
    self
  }

  pub fn settings(&self) -> &LayerSettings {
    &self.settings
  }

  pub fn tasks(&self) -> &TaskTracker {
    &self.tasks
  }

  pub fn classify(&self, request: &Request) -> ResourceClass {
    classify(request, &self.settings.api_hosts)
  }

  pub fn partition_for(&self, class: ResourceClass) -> String {
    self.settings.namer.name_for(class)
  }

  /// Serve a request according to its class's policy.
  pub async fn handle(&self, request: &Request) -> Served {
    let class = self.classify(request);
    if !request.is_get() {
      return self.passthrough(request, class).await;
    }

    let policy = *self.settings.policies.get(class);
    debug!(url = %request.url, %class, strategy = %policy.strategy, "Dispatching request");

    match policy.strategy {
      Strategy::CacheFirst => self.cache_first(request, class, policy).await,
      Strategy::NetworkFirst => self.network_first(request, class, policy).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request, class, policy).await,
      Strategy::CacheOnly => self.cache_only(request, class, policy).await,
      Strategy::NetworkOnly => self.network_only(request, class, policy).await,
    }
  }

  /// Go straight to the network without touching partitions.
  pub async fn passthrough(&self, request: &Request, class: ResourceClass) -> Served {
    match self.fetcher.fetch(request).await {
      Ok(response) => Served::new(response, CacheSource::Network, class, None),
      Err(e) => {
        info!(url = %request.url, error = %e, "Pass-through request failed");
        self.offline_fallback(request, class).await
      }
    }
  }

  /// Cache-first: serve a fresh entry without touching the network.
  ///
  /// 1. Fresh entry in cache - return it
  /// 2. Otherwise fetch, store, evict, return
  /// 3. On network failure, return the entry even if expired
  /// 4. Nothing cached - offline fallback
  async fn cache_first(&self, request: &Request, class: ResourceClass, policy: PolicyConfig) -> Served {
    let partition = self.partition_for(class);
    let cached = self.lookup(&partition, request);

    if let Some(entry) = &cached {
      if self.is_fresh(&entry.response, policy.max_age) {
        debug!(url = %request.url, %partition, "Cache hit");
        return Served::new(entry.response.clone(), CacheSource::CacheFresh, class, Some(policy.strategy));
      }
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store(&partition, policy, request, &response);
        Served::new(response, CacheSource::Network, class, Some(policy.strategy))
      }
      Err(e) => match cached {
        Some(entry) => {
          info!(url = %request.url, error = %e, "Network failed, serving expired entry");
          Served::new(entry.response, CacheSource::CacheStale, class, Some(policy.strategy))
        }
        None => {
          info!(url = %request.url, error = %e, "Network failed with nothing cached");
          self.offline_fallback(request, class).await
        }
      },
    }
  }

  /// Network-first: only an unexpired entry may stand in for a failed fetch.
  async fn network_first(&self, request: &Request, class: ResourceClass, policy: PolicyConfig) -> Served {
    let partition = self.partition_for(class);

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store(&partition, policy, request, &response);
        Served::new(response, CacheSource::Network, class, Some(policy.strategy))
      }
      Err(e) => {
        let fresh = self
          .lookup(&partition, request)
          .filter(|entry| self.is_fresh(&entry.response, policy.max_age));

        match fresh {
          Some(entry) => {
            info!(url = %request.url, error = %e, "Network failed, serving cached entry");
            Served::new(entry.response, CacheSource::CacheFresh, class, Some(policy.strategy))
          }
          None => {
            info!(url = %request.url, error = %e, "Network failed with no fresh entry");
            self.offline_fallback(request, class).await
          }
        }
      }
    }
  }

  /// Stale-while-revalidate: answer from a fresh entry at once, refresh in the
  /// background for the next caller.
  async fn stale_while_revalidate(
    &self,
    request: &Request,
    class: ResourceClass,
    policy: PolicyConfig,
  ) -> Served {
    let partition = self.partition_for(class);
    let fresh = self
      .lookup(&partition, request)
      .filter(|entry| self.is_fresh(&entry.response, policy.max_age));

    let (tx, rx) = oneshot::channel();
    if fresh.is_none() || self.connectivity.is_online() {
      let layer = self.clone();
      let request = request.clone();
      let partition = partition.clone();

      // Never joined by this caller; only the worker's shutdown drain waits on it
      self.tasks.spawn(async move {
        let outcome = layer.fetcher.fetch(&request).await;
        match &outcome {
          Ok(response) => layer.store(&partition, policy, &request, response),
          Err(e) => debug!(url = %request.url, error = %e, "Background revalidation failed"),
        }
        // The caller may have been answered from cache already
        let _ = tx.send(outcome);
      });
    }

    if let Some(entry) = fresh {
      debug!(url = %request.url, %partition, "Serving cached entry, revalidating in background");
      return Served::new(entry.response, CacheSource::CacheFresh, class, Some(policy.strategy));
    }

    match rx.await {
      Ok(Ok(response)) => Served::new(response, CacheSource::Network, class, Some(policy.strategy)),
      Ok(Err(e)) => {
        info!(url = %request.url, error = %e, "Revalidation failed with no fresh entry");
        self.offline_fallback(request, class).await
      }
      Err(_) => self.offline_fallback(request, class).await,
    }
  }

  /// Cache-only: with no network to refresh from, an expired entry is still
  /// served (as stale) before giving up.
  async fn cache_only(&self, request: &Request, class: ResourceClass, policy: PolicyConfig) -> Served {
    let partition = self.partition_for(class);

    match self.lookup(&partition, request) {
      Some(entry) => {
        let source = if self.is_fresh(&entry.response, policy.max_age) {
          CacheSource::CacheFresh
        } else {
          CacheSource::CacheStale
        };
        Served::new(entry.response, source, class, Some(policy.strategy))
      }
      None => {
        debug!(url = %request.url, %partition, "Cache-only miss");
        self.offline_fallback(request, class).await
      }
    }
  }

  async fn network_only(&self, request: &Request, class: ResourceClass, policy: PolicyConfig) -> Served {
    match self.fetcher.fetch(request).await {
      Ok(response) => Served::new(response, CacheSource::Network, class, Some(policy.strategy)),
      Err(e) => {
        info!(url = %request.url, error = %e, "Network-only request failed");
        self.offline_fallback(request, class).await
      }
    }
  }

  /// Last-resort answer when cache and network both failed.
  ///
  /// Navigations get the cached app shell, images the cached placeholder,
  /// everything else a synthesized 503.
  pub async fn offline_fallback(&self, request: &Request, class: ResourceClass) -> Served {
    let shell_classes = [ResourceClass::Static, ResourceClass::Dynamic];
    let image_classes = [ResourceClass::Static, ResourceClass::Image];

    let response = if request.is_navigation() {
      self
        .lookup_asset(&request.url, &self.settings.shell_path, &shell_classes)
        .unwrap_or_else(|| Response::unavailable("text/html; charset=utf-8", OFFLINE_PAGE))
    } else if class == ResourceClass::Image {
      self
        .lookup_asset(&request.url, &self.settings.placeholder_path, &image_classes)
        .unwrap_or_else(|| Response::unavailable("text/plain; charset=utf-8", "Image unavailable offline"))
    } else {
      Response::unavailable("application/json", OFFLINE_JSON)
    };

    Served::new(response, CacheSource::Offline, class, None)
  }

  /// Unexpired cached response for a request, without touching the network.
  pub fn match_fresh(&self, request: &Request) -> Option<Response> {
    let class = self.classify(request);
    let policy = self.settings.policies.get(class);
    self
      .lookup(&self.partition_for(class), request)
      .filter(|entry| self.is_fresh(&entry.response, policy.max_age))
      .map(|entry| entry.response)
  }

  /// Pre-populate the static partition with the seed assets.
  ///
  /// All or nothing: if any seed fails to fetch, nothing is stored.
  pub async fn install(&self, seeds: &[Url]) -> Result<usize> {
    let partition = self.partition_for(ResourceClass::Static);
    self.storage.open_partition(&partition)?;

    let requests: Vec<Request> = seeds.iter().cloned().map(Request::get).collect();
    let responses = join_all(requests.iter().map(|r| self.fetcher.fetch(r))).await;

    let mut fetched = Vec::with_capacity(requests.len());
    for (request, outcome) in requests.iter().zip(responses) {
      match outcome {
        Ok(response) if response.is_success() => fetched.push((request, response)),
        Ok(response) => {
          return Err(eyre!(
            "Seed asset {} answered with status {}",
            request.url,
            response.status
          ))
        }
        Err(e) => return Err(eyre!("Failed to fetch seed asset {}: {}", request.url, e)),
      }
    }

    let policy = self.settings.policies.static_assets;
    for (request, response) in &fetched {
      self.store(&partition, policy, request, response);
    }

    info!(%partition, count = fetched.len(), "Seed assets installed");
    Ok(fetched.len())
  }

  /// Delete every partition that does not belong to the current version and
  /// record the activation. Returns the names of the deleted partitions.
  pub fn activate(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.storage.partition_names()? {
      if self.settings.namer.is_current(&name) {
        continue;
      }
      match self.storage.delete_partition(&name) {
        Ok(_) => {
          info!(partition = %name, "Deleted obsolete partition");
          deleted.push(name);
        }
        Err(e) => warn!(partition = %name, error = %e, "Failed to delete obsolete partition"),
      }
    }
    self.storage.record_activation(self.settings.namer.version())?;
    Ok(deleted)
  }

  /// Whether the current version was activated before, possibly by an
  /// earlier process over the same storage.
  pub fn is_activated(&self) -> bool {
    match self.storage.activated_version() {
      Ok(version) => version.as_deref() == Some(self.settings.namer.version()),
      Err(e) => {
        warn!(error = %e, "Failed to read activation state");
        false
      }
    }
  }

  /// Entry count per existing partition.
  pub fn partition_stats(&self) -> Result<BTreeMap<String, usize>> {
    let mut stats = BTreeMap::new();
    for name in self.storage.partition_names()? {
      let count = self.storage.entry_count(&name)?;
      stats.insert(name, count);
    }
    Ok(stats)
  }

  /// Delete every partition. Returns how many were deleted.
  pub fn clear_all(&self) -> Result<usize> {
    let mut deleted = 0;
    for name in self.storage.partition_names()? {
      if self.storage.delete_partition(&name)? {
        deleted += 1;
      }
    }
    info!(deleted, "Cleared all partitions");
    Ok(deleted)
  }

  /// When a stored response was inserted: `x-cached-at`, else the `date` header.
  pub fn inserted_at(response: &Response) -> Option<DateTime<Utc>> {
    if let Some(stamp) = response.header(CACHED_AT_HEADER) {
      if let Ok(at) = DateTime::parse_from_rfc3339(stamp) {
        return Some(at.with_timezone(&Utc));
      }
    }
    response
      .header("date")
      .and_then(|date| DateTime::parse_from_rfc2822(date).ok())
      .map(|at| at.with_timezone(&Utc))
  }

  /// Entries without a usable timestamp are never fresh.
  fn is_fresh(&self, response: &Response, max_age: Duration) -> bool {
    Self::inserted_at(response)
      .map(|at| elapsed_since(self.clock.now(), at) <= max_age)
      .unwrap_or(false)
  }

  fn lookup(&self, partition: &str, request: &Request) -> Option<StoredEntry> {
    match self.storage.get(partition, &request.cache_key()) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(%partition, url = %request.url, error = %e, "Partition lookup failed");
        None
      }
    }
  }

  fn lookup_asset(&self, base: &Url, path: &str, classes: &[ResourceClass]) -> Option<Response> {
    let url = base.join(path).ok()?;
    let request = Request::get(url);
    classes
      .iter()
      .find_map(|class| self.lookup(&self.partition_for(*class), &request))
      .map(|entry| entry.response)
  }

  /// Store a successful response and evict down to the partition's limit.
  /// Failures are logged; they never reach the caller.
  fn store(&self, partition: &str, policy: PolicyConfig, request: &Request, response: &Response) {
    if !response.is_success() {
      debug!(url = %request.url, status = response.status, "Not caching unsuccessful response");
      return;
    }

    let stamped = response
      .clone()
      .with_header(CACHED_AT_HEADER, self.clock.now().to_rfc3339());

    if let Err(e) = self
      .storage
      .put(partition, &request.cache_key(), &request.identity_url(), &stamped)
    {
      warn!(%partition, url = %request.url, error = %e, "Failed to store response");
      return;
    }

    match self.storage.evict_to(partition, policy.max_entries) {
      Ok(evicted) if !evicted.is_empty() => {
        debug!(%partition, evicted = ?evicted, "Evicted oldest entries");
      }
      Ok(_) => {}
      Err(e) => warn!(%partition, error = %e, "Eviction failed"),
    }
  }
}

impl<S: PartitionStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      settings: Arc::clone(&self.settings),
      clock: Arc::clone(&self.clock),
      connectivity: self.connectivity.clone(),
      tasks: self.tasks.clone(),
    }
  }
}
