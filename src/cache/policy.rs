//! Per-resource-class caching policy and request classification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::fetch::{Destination, Request};

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  CacheOnly,
  NetworkOnly,
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Strategy::CacheFirst => "cache-first",
      Strategy::NetworkFirst => "network-first",
      Strategy::StaleWhileRevalidate => "stale-while-revalidate",
      Strategy::CacheOnly => "cache-only",
      Strategy::NetworkOnly => "network-only",
    };
    f.write_str(name)
  }
}

/// Policy shared by every entry of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyConfig {
  pub strategy: Strategy,
  pub max_age: Duration,
  pub max_entries: usize,
}

impl PolicyConfig {
  pub const fn new(strategy: Strategy, max_age: Duration, max_entries: usize) -> Self {
    Self {
      strategy,
      max_age,
      max_entries,
    }
  }
}

/// Resource class a request falls into. Each class maps to one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceClass {
  Static,
  Api,
  Image,
  Dynamic,
}

impl ResourceClass {
  pub const ALL: [ResourceClass; 4] = [
    ResourceClass::Static,
    ResourceClass::Api,
    ResourceClass::Image,
    ResourceClass::Dynamic,
  ];

  /// Partition suffix for this class.
  pub fn as_str(&self) -> &'static str {
    match self {
      ResourceClass::Static => "static",
      ResourceClass::Api => "api",
      ResourceClass::Image => "images",
      ResourceClass::Dynamic => "dynamic",
    }
  }
}

impl fmt::Display for ResourceClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

const DAY: u64 = 24 * 60 * 60;

/// Static configuration: one policy per resource class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTable {
  pub static_assets: PolicyConfig,
  pub api: PolicyConfig,
  pub images: PolicyConfig,
  pub dynamic: PolicyConfig,
}

impl PolicyTable {
  pub fn get(&self, class: ResourceClass) -> &PolicyConfig {
    match class {
      ResourceClass::Static => &self.static_assets,
      ResourceClass::Api => &self.api,
      ResourceClass::Image => &self.images,
      ResourceClass::Dynamic => &self.dynamic,
    }
  }

  pub fn set(&mut self, class: ResourceClass, policy: PolicyConfig) {
    match class {
      ResourceClass::Static => self.static_assets = policy,
      ResourceClass::Api => self.api = policy,
      ResourceClass::Image => self.images = policy,
      ResourceClass::Dynamic => self.dynamic = policy,
    }
  }
}

impl Default for PolicyTable {
  fn default() -> Self {
    Self {
      static_assets: PolicyConfig::new(Strategy::CacheFirst, Duration::from_secs(30 * DAY), 100),
      api: PolicyConfig::new(Strategy::NetworkFirst, Duration::from_secs(5 * 60), 50),
      images: PolicyConfig::new(Strategy::CacheFirst, Duration::from_secs(7 * DAY), 60),
      dynamic: PolicyConfig::new(Strategy::StaleWhileRevalidate, Duration::from_secs(DAY), 50),
    }
  }
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico"];
const STATIC_EXTENSIONS: &[&str] = &[
  "js",
  "mjs",
  "css",
  "woff",
  "woff2",
  "ttf",
  "otf",
  "json",
  "webmanifest",
  "map",
];
const API_PATH_PREFIXES: &[&str] = &["/api/", "/rest/v1/", "/auth/v1/", "/storage/v1/"];
const STATIC_PATH_PREFIXES: &[&str] = &["/assets/", "/static/"];

/// Classify a request into a resource class.
///
/// Pure and total: anything unrecognised is [`ResourceClass::Dynamic`].
/// `api_hosts` lists hosts whose every path is API data.
pub fn classify(request: &Request, api_hosts: &[String]) -> ResourceClass {
  let path = request.url.path().to_ascii_lowercase();
  let extension = path
    .rsplit('/')
    .next()
    .and_then(|segment| segment.rsplit_once('.'))
    .map(|(_, ext)| ext);

  if request.destination == Destination::Image
    || extension.is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext))
  {
    return ResourceClass::Image;
  }

  let is_api_host = request
    .url
    .host_str()
    .is_some_and(|host| api_hosts.iter().any(|h| h.eq_ignore_ascii_case(host)));
  if is_api_host || API_PATH_PREFIXES.iter().any(|p| path.starts_with(p)) {
    return ResourceClass::Api;
  }

  if extension.is_some_and(|ext| STATIC_EXTENSIONS.contains(&ext))
    || STATIC_PATH_PREFIXES.iter().any(|p| path.starts_with(p))
  {
    return ResourceClass::Static;
  }

  ResourceClass::Dynamic
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[test]
  fn test_classify_static_assets() {
    let hosts = Vec::new();
    assert_eq!(classify(&get("https://shop.test/app.js"), &hosts), ResourceClass::Static);
    assert_eq!(classify(&get("https://shop.test/theme.CSS"), &hosts), ResourceClass::Static);
    assert_eq!(classify(&get("https://shop.test/assets/chunk"), &hosts), ResourceClass::Static);
    assert_eq!(classify(&get("https://shop.test/manifest.json"), &hosts), ResourceClass::Static);
  }

  #[test]
  fn test_classify_images() {
    let hosts = Vec::new();
    assert_eq!(classify(&get("https://cdn.test/p/1.webp"), &hosts), ResourceClass::Image);
    let by_destination = Request::image(Url::parse("https://cdn.test/render?id=4").unwrap());
    assert_eq!(classify(&by_destination, &hosts), ResourceClass::Image);
  }

  #[test]
  fn test_classify_api_by_host_and_path() {
    let hosts = vec!["db.backend.test".to_string()];
    assert_eq!(classify(&get("https://db.backend.test/anything"), &hosts), ResourceClass::Api);
    assert_eq!(classify(&get("https://shop.test/rest/v1/products"), &hosts), ResourceClass::Api);
    assert_eq!(classify(&get("https://shop.test/api/cart"), &hosts), ResourceClass::Api);
  }

  #[test]
  fn test_classify_defaults_to_dynamic() {
    let hosts = Vec::new();
    assert_eq!(classify(&get("https://shop.test/"), &hosts), ResourceClass::Dynamic);
    assert_eq!(classify(&get("https://shop.test/products/42"), &hosts), ResourceClass::Dynamic);
    assert_eq!(classify(&get("https://shop.test/v1.2/"), &hosts), ResourceClass::Dynamic);
  }

  #[test]
  fn test_strategy_serde_names() {
    let parsed: Strategy = serde_yaml::from_str("stale-while-revalidate").unwrap();
    assert_eq!(parsed, Strategy::StaleWhileRevalidate);
    assert_eq!(Strategy::CacheFirst.to_string(), "cache-first");
  }

  #[test]
  fn test_default_table() {
    let table = PolicyTable::default();
    assert_eq!(table.get(ResourceClass::Static).strategy, Strategy::CacheFirst);
    assert_eq!(table.get(ResourceClass::Api).strategy, Strategy::NetworkFirst);
    assert_eq!(table.get(ResourceClass::Api).max_age, Duration::from_secs(300));
    assert_eq!(
      table.get(ResourceClass::Dynamic).strategy,
      Strategy::StaleWhileRevalidate
    );
  }
}
