//! SQLite-backed local storage for tgflow result sets.
//!
//! Each logical database is a single shared SQLite connection holding a set of
//! declared object stores. The crate exposes:
//! - Versioned open with a single upgrade pass per version bump
//! - Read-through point lookups fronted by a bounded LRU cache
//! - Atomic, batched writes spanning any number of stores
//! - Range queries over the primary key or a declared index (never cached)
//! - TTL reclamation for ephemeral stores

mod cache;
mod schema;
pub mod storage;
mod types;

pub use cache::{CacheMetrics, CacheStats};
pub use schema::{IndexSchema, OpenReport, StoreSchema};
pub use storage::{Database, StorageConfig, StorageError, StorageManager, UpgradePolicy};
pub use types::{BatchOp, Key, KeyRange, Query};
