//! Database engine for chronicle
//!
//! This crate orchestrates all lower layers:
//! - Database: one node, its sessions, caches and branch registry
//! - Session / Transaction: consistent reads and buffered writes
//! - Caches: derived views advanced along the update chain
//! - Branch creation with model and data checks
//! - Replication: consuming the other nodes' replay records
//!
//! The engine is the only component that knows about:
//! - Cross-layer coordination (store + chain + replay log)
//! - Lock order (cluster commit lock, then the node's replication state)
//! - Eviction driven by the pin watermark

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
mod branch_ops;
pub mod cache;
pub mod coordinator;
pub mod database;
pub mod item;
mod replication;
pub mod session;
pub mod transaction;

#[cfg(test)]
pub(crate) mod test_support;

pub use backend::Backend;
pub use cache::{
    Cache, CacheHandler, CacheId, CacheStats, CacheUpdate, FailFastIter, IndexedLinks,
    IndexedView, OrderedLinks, OrderedView, Snapshot, ViewContext,
};
pub use coordinator::{TransactionCoordinator, TransactionMetrics};
pub use database::{Database, DatabaseConfig, HistoryRetention, CONFIG_FILE_NAME};
pub use item::{Item, ItemState};
pub use session::Session;
pub use transaction::Transaction;

#[cfg(test)]
mod send_sync {
    static_assertions::assert_impl_all!(super::Database: Send, Sync);
    static_assertions::assert_impl_all!(super::Backend: Send, Sync);
    static_assertions::assert_impl_all!(super::Item: Send, Sync);
    static_assertions::assert_impl_all!(super::Session: Send);
}
