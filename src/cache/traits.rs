//! Result types describing how a request was served.

use crate::fetch::Response;

use super::policy::{ResourceClass, Strategy};

/// A response handed back to the caller, with metadata about where it came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: CacheSource,
  /// Class the request was classified into
  pub class: ResourceClass,
  /// Strategy that produced the response, `None` for pass-through requests
  pub strategy: Option<Strategy>,
}

impl Served {
  pub fn new(
    response: Response,
    source: CacheSource,
    class: ResourceClass,
    strategy: Option<Strategy>,
  ) -> Self {
    Self {
      response,
      source,
      class,
      strategy,
    }
  }

  pub fn is_fallback(&self) -> bool {
    self.source == CacheSource::Offline
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still within max age
  CacheFresh,
  /// Data from cache past its max age, served because the network failed
  CacheStale,
  /// Last-resort offline fallback (cached shell, placeholder, or synthesized)
  Offline,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      CacheSource::Network => "network",
      CacheSource::CacheFresh => "cache",
      CacheSource::CacheStale => "cache (stale)",
      CacheSource::Offline => "offline fallback",
    };
    f.write_str(name)
  }
}
