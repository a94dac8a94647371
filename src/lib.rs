//! Multi-tier caching and offline resilience for web clients.
//!
//! An interception worker serves requests from versioned partitions using a
//! per-class strategy, the main context keeps a bounded memory tier, a
//! persistent tier and a query cache, and the coordinator keeps them all
//! consistent when domain data changes.

pub mod cache;
pub mod clock;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod fetch;
pub mod interceptor;
pub mod invalidation;
pub mod logging;
pub mod memory;
pub mod query;
pub mod store;
