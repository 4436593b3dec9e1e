//! Request-level caching for offline support.
//!
//! This module provides:
//! - Named stores over a pluggable storage backend (SQLite, memory, or none)
//! - Strategy execution: cache-first, network-first with fallback,
//!   stale-while-revalidate and network-only
//! - Periodic age-based eviction

mod eviction;
mod key;
mod layer;
pub(crate) mod memory;
pub(crate) mod storage;
mod stores;
pub(crate) mod types;

pub use eviction::{EvictionReport, EvictionScheduler, SchedulerHandle};
pub use key::cache_key;
pub use layer::CacheLayer;
pub use memory::MemoryStorage;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use stores::{StoreManager, StoreSpec};
pub use types::{CacheEntry, CacheSource, ResponseSnapshot, Served};
