//! Interception-layer caching.
//!
//! This module owns the partitioned response cache:
//! - Classifies requests into resource classes, one partition each
//! - Serves each class with its configured strategy (cache-first, network-first, ...)
//! - Evicts oldest-inserted entries past a partition's capacity
//! - Falls back to the app shell, a placeholder image or a 503 when offline
//! - Names partitions by version so activation can purge obsolete ones

mod layer;
mod partition;
mod policy;
mod storage;
mod traits;

pub use layer::{CacheLayer, LayerSettings, CACHED_AT_HEADER};
pub use partition::PartitionNamer;
pub use policy::{classify, PolicyConfig, PolicyTable, ResourceClass, Strategy};
pub use storage::{PartitionStorage, SqlitePartitionStore, StoredEntry};
pub use traits::{CacheSource, Served};
