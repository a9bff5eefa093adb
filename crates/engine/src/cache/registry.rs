//! One cache instance per identity
//!
//! The registry maps a [`CacheId`] to its type-erased cache. Concurrent
//! first accesses race on the DashMap entry API, so exactly one instance is
//! created per identity and node.

use super::{Cache, CacheHandler};
use chronicle_concurrency::{PinRegistry, UpdateChainLink};
use chronicle_core::{Error, ObjectKey, Result, RevisionNumber, TypeName};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Identity of a cache
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheId {
    /// Referrers of `anchor` through `attribute`, keyed by `index`
    IndexedLinks {
        /// Referenced object (data key)
        anchor: ObjectKey,
        /// Referrer type, including subtypes
        referrer_type: TypeName,
        /// Reference attribute
        attribute: String,
        /// Attribute holding the secondary key
        index: String,
    },
    /// Referrers of `anchor` through `attribute`, sorted by `order`
    OrderedLinks {
        /// Referenced object (data key)
        anchor: ObjectKey,
        /// Referrer type, including subtypes
        referrer_type: TypeName,
        /// Reference attribute
        attribute: String,
        /// Attribute holding the order key
        order: String,
    },
    /// Application defined cache
    Custom(String),
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheId::IndexedLinks {
                anchor,
                referrer_type,
                attribute,
                index,
            } => write!(f, "{}.{} -> {} by {}", referrer_type, attribute, anchor, index),
            CacheId::OrderedLinks {
                anchor,
                referrer_type,
                attribute,
                order,
            } => write!(f, "{}.{} -> {} ordered by {}", referrer_type, attribute, anchor, order),
            CacheId::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// Type-independent maintenance of a registered cache
pub trait CacheMaintenance: Send + Sync {
    /// Drop versions no reader at or after `watermark` can see
    fn evict(&self, watermark: RevisionNumber);

    /// Cache identity for logs
    fn describe(&self) -> &str;
}

/// Counters shared by every cache of a registry
///
/// Rebuild and event counts are purely observational. Stamps only need to
/// be distinct, so relaxed ordering is enough for all three.
#[derive(Debug, Default)]
pub struct CacheCounters {
    rebuilds: AtomicU64,
    events_applied: AtomicU64,
    stamps: AtomicU64,
}

impl CacheCounters {
    /// Fresh modification stamp; every distinct cache value gets its own
    pub(crate) fn next_stamp(&self) -> u64 {
        self.stamps.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_rebuild(&self) {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event(&self) {
        self.events_applied.fetch_add(1, Ordering::Relaxed);
    }
}

/// Cache statistics of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Registered caches
    pub caches: usize,
    /// Values built from a store scan
    pub rebuilds: u64,
    /// Events replayed into a built value
    pub events_applied: u64,
}

struct Registered {
    cache: Arc<dyn Any + Send + Sync>,
    maintenance: Arc<dyn CacheMaintenance>,
}

/// Registry of the caches of one node
pub struct CacheRegistry {
    caches: DashMap<CacheId, Registered>,
    counters: Arc<CacheCounters>,
}

impl CacheRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            caches: DashMap::new(),
            counters: Arc::new(CacheCounters::default()),
        }
    }

    /// Get the cache registered under `id`, creating it with `handler` on
    /// first access
    ///
    /// A new cache starts at `link` and builds on its first read.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if `id` is registered with another
    /// handler type, or whatever `handler` fails with.
    pub fn get_or_create<H, F>(
        &self,
        id: CacheId,
        handler: F,
        link: Arc<UpdateChainLink>,
        pins: &Arc<PinRegistry>,
    ) -> Result<Arc<Cache<H>>>
    where
        H: CacheHandler,
        F: FnOnce() -> Result<H>,
    {
        match self.caches.entry(id) {
            Entry::Occupied(entry) => {
                let cache = Arc::clone(&entry.get().cache);
                cache.downcast::<Cache<H>>().map_err(|_| {
                    Error::invalid_operation(format!(
                        "cache {} is registered with another handler",
                        entry.key()
                    ))
                })
            }
            Entry::Vacant(entry) => {
                let cache = Arc::new(Cache::new(
                    handler()?,
                    link,
                    Arc::clone(pins),
                    Arc::clone(&self.counters),
                ));
                debug!(target: "chronicle::cache", cache = %entry.key(), "cache registered");
                entry.insert(Registered {
                    cache: cache.clone(),
                    maintenance: cache.clone(),
                });
                Ok(cache)
            }
        }
    }

    /// Whether a cache is registered under `id`
    pub fn contains(&self, id: &CacheId) -> bool {
        self.caches.contains_key(id)
    }

    /// Drop versions below the watermark in every cache
    pub fn evict(&self, watermark: RevisionNumber) {
        let caches: Vec<Arc<dyn CacheMaintenance>> = self
            .caches
            .iter()
            .map(|entry| Arc::clone(&entry.value().maintenance))
            .collect();
        for cache in caches {
            cache.evict(watermark);
        }
    }

    /// Statistics snapshot
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            caches: self.caches.len(),
            rebuilds: self.counters.rebuilds.load(Ordering::Relaxed),
            events_applied: self.counters.events_applied.load(Ordering::Relaxed),
        }
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("stats", &self.stats())
            .finish()
    }
}
