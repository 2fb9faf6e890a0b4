//! Deduplicating, content-addressed, write-back block cache with a
//! concurrent upload/removal pipeline, sitting between a filesystem layer
//! and an object-store backend.

pub mod backend;
pub mod backends;
pub mod block_cache;
pub mod cache_entry;
pub mod cache_map;
pub mod distributor;
pub mod error;
pub mod lock;
pub mod metadata;
pub mod removal_queue;

pub use backend::{Backend, BackendLease, BackendPool};
pub use block_cache::{BlockCache, CacheConfig, CacheHandle, CacheUsage, UploadOutcome};
pub use cache_entry::{CacheEntry, EntryKey};
pub use cache_map::CacheMap;
pub use distributor::Distributor;
pub use error::{CacheError, Result};
pub use lock::MultiLock;
pub use metadata::Metadata;
pub use removal_queue::{RemovalItem, RemovalQueue};
