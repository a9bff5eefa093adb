//! Database struct and open logic
//!
//! A [`Database`] is one node of a cluster. It owns everything that is
//! local to the node:
//! - the revision history and update chain it has applied so far
//! - the branch registry
//! - the cache registry and the pin registry defining the watermark
//! - the transaction coordinator and its metrics
//! - its position in the shared replay log
//!
//! Everything shared between nodes lives in the [`Backend`].
//!
//! ## Sessions and transactions
//!
//! Readers and writers go through a [`Session`]:
//!
//! 1. **Closure API** (recommended): `session.transaction(|txn| { ... })`
//!    - Commit on success, rollback on error
//!    - Conflicts are returned, never retried
//!
//! 2. **Manual API**: `session.begin()` + `txn.commit()` / `txn.rollback()`

pub mod config;
mod transactions;

pub use config::{DatabaseConfig, HistoryRetention, CONFIG_FILE_NAME};

use crate::backend::Backend;
use crate::cache::{
    CacheId, CacheRegistry, CacheStats, IndexedLinkCache, IndexedLinksHandler, OrderedLinkCache,
    OrderedLinksHandler,
};
use crate::coordinator::{TransactionCoordinator, TransactionMetrics};
use crate::session::Session;
use chronicle_concurrency::{PinRegistry, SessionRevisionTracker, UpdateChain};
use chronicle_core::{
    BranchId, BranchRegistry, NodeId, ObjectKey, Result, RevisionHistory, RevisionNumber,
    SchemaRegistry, SessionId, TypeName, INITIAL_REVISION,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Position of a node in the replay log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ReplicationState {
    /// Records consumed, own records included
    pub(crate) position: u64,
    /// Last revision applied to the chain
    pub(crate) last_revision: RevisionNumber,
}

/// One node of a chronicle cluster
///
/// Create a node with [`Database::open`] (or [`Database::in_memory`] for a
/// single-node cluster) and work with it through sessions.
///
/// # Example
///
/// ```text
/// let db = Database::in_memory(schema)?;
/// let mut session = db.session();
/// let key = session.transaction(|txn| {
///     txn.create("Person", attrs([("age", Value::Int(42))]))
/// })?;
/// ```
pub struct Database {
    /// Identity in replay records
    node: NodeId,

    config: DatabaseConfig,

    /// Parsed `config.history_retention`
    retention: HistoryRetention,

    /// Collaborators shared with the other nodes
    backend: Arc<Backend>,

    branches: Arc<BranchRegistry>,

    /// Revisions this node has applied, own and replayed
    history: RevisionHistory,

    /// Events in commit order, shared by every session and cache
    chain: UpdateChain,

    /// Revisions still readable by a live session, item or iterator
    pins: Arc<PinRegistry>,

    caches: CacheRegistry,

    /// Transaction lifecycle, revision allocation and metrics
    coordinator: TransactionCoordinator,

    /// Replay log position; always taken after the cluster commit lock
    replication: Mutex<ReplicationState>,

    next_session: AtomicU64,
}

impl Database {
    /// Open a node on `backend`
    ///
    /// Replays every record already in the log, so a new node starts at the
    /// cluster's latest revision.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` for an invalid config and whatever the
    /// replay fails with (`Corruption`, `ReplicationGap`).
    pub fn open(backend: Arc<Backend>, config: DatabaseConfig) -> Result<Arc<Self>> {
        let retention = config.retention()?;
        let coordinator =
            TransactionCoordinator::new(Arc::clone(backend.sequence()), &config.revision_sequence);
        let db = Arc::new(Self {
            node: NodeId::new(),
            config,
            retention,
            backend,
            branches: Arc::new(BranchRegistry::new()),
            history: RevisionHistory::new(),
            chain: UpdateChain::new(INITIAL_REVISION),
            pins: PinRegistry::new(),
            caches: CacheRegistry::new(),
            coordinator,
            replication: Mutex::new(ReplicationState::default()),
            next_session: AtomicU64::new(1),
        });

        let applied = {
            let mut state = db.replication.lock();
            db.drain(&mut state)?
        };
        info!(
            target: "chronicle::replication",
            node = %db.node,
            name = %db.config.node_name,
            replayed = applied,
            revision = db.latest_revision(),
            "node opened"
        );
        Ok(db)
    }

    /// Open a node configured by `chronicle.toml` in `dir`
    ///
    /// Writes the default config file if the directory has none.
    pub fn open_dir(backend: Arc<Backend>, dir: &Path) -> Result<Arc<Self>> {
        let config = DatabaseConfig::load(dir)?;
        Self::open(backend, config)
    }

    /// Single node on a fresh in-memory backend with the default config
    pub fn in_memory(schema: impl SchemaRegistry + 'static) -> Result<Arc<Self>> {
        Self::open(Backend::in_memory(schema), DatabaseConfig::default())
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// New session on the trunk, positioned at the newest applied revision
    pub fn session(self: &Arc<Self>) -> Session {
        let tracker = self.new_tracker();
        Session::new(Arc::clone(self), tracker, BranchId::TRUNK)
    }

    /// New session on `branch`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown branch.
    pub fn session_on(self: &Arc<Self>, branch: BranchId) -> Result<Session> {
        self.branches.get(branch)?;
        let tracker = self.new_tracker();
        Ok(Session::new(Arc::clone(self), tracker, branch))
    }

    fn new_tracker(&self) -> Arc<SessionRevisionTracker> {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        Arc::new(SessionRevisionTracker::new(id, self.chain.tail(), &self.pins))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Node identity
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Node configuration
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Shared backend
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Branch registry
    pub fn branches(&self) -> &Arc<BranchRegistry> {
        &self.branches
    }

    /// Revision history applied by this node
    pub fn history(&self) -> &RevisionHistory {
        &self.history
    }

    /// Newest revision applied by this node
    pub fn latest_revision(&self) -> RevisionNumber {
        self.chain.latest_revision()
    }

    /// Pin registry
    pub fn pins(&self) -> &Arc<PinRegistry> {
        &self.pins
    }

    pub(crate) fn chain(&self) -> &UpdateChain {
        &self.chain
    }

    pub(crate) fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub(crate) fn caches(&self) -> &CacheRegistry {
        &self.caches
    }

    pub(crate) fn replication(&self) -> &Mutex<ReplicationState> {
        &self.replication
    }

    /// Transaction metrics snapshot
    pub fn metrics(&self) -> TransactionMetrics {
        self.coordinator.metrics()
    }

    /// Cache statistics snapshot
    pub fn cache_stats(&self) -> CacheStats {
        self.caches.stats()
    }

    /// Lowest revision some reader may still need
    pub fn watermark(&self) -> RevisionNumber {
        self.pins.watermark(self.latest_revision())
    }

    // ========================================================================
    // Caches
    // ========================================================================

    /// Indexed link cache of `anchor`, created on first access
    pub(crate) fn indexed_cache(
        &self,
        anchor: &ObjectKey,
        referrer_type: TypeName,
        attribute: &str,
        index: &str,
    ) -> Result<Arc<IndexedLinkCache>> {
        let anchor = self.branches.data_key(&anchor.as_current())?;
        let id = CacheId::IndexedLinks {
            anchor: anchor.clone(),
            referrer_type: referrer_type.clone(),
            attribute: attribute.to_string(),
            index: index.to_string(),
        };
        self.caches.get_or_create(
            id,
            || {
                IndexedLinksHandler::new(
                    &anchor,
                    referrer_type,
                    attribute,
                    index,
                    Arc::clone(self.backend.store()),
                    Arc::clone(self.backend.schema()),
                    Arc::clone(&self.branches),
                )
            },
            self.chain.tail(),
            &self.pins,
        )
    }

    /// Ordered link cache of `anchor`, created on first access
    pub(crate) fn ordered_cache(
        &self,
        anchor: &ObjectKey,
        referrer_type: TypeName,
        attribute: &str,
        order: &str,
    ) -> Result<Arc<OrderedLinkCache>> {
        let anchor = self.branches.data_key(&anchor.as_current())?;
        let id = CacheId::OrderedLinks {
            anchor: anchor.clone(),
            referrer_type: referrer_type.clone(),
            attribute: attribute.to_string(),
            order: order.to_string(),
        };
        self.caches.get_or_create(
            id,
            || {
                OrderedLinksHandler::new(
                    &anchor,
                    referrer_type,
                    attribute,
                    order,
                    Arc::clone(self.backend.store()),
                    Arc::clone(self.backend.schema()),
                    Arc::clone(&self.branches),
                )
            },
            self.chain.tail(),
            &self.pins,
        )
    }

    /// Evict whatever no reader at or above the watermark can see
    ///
    /// Runs after every session advance. With `history_retention =
    /// "watermark"` historic row states are dropped as well; the store is
    /// shared, so that setting is only safe when every node advances.
    pub(crate) fn evict(&self) -> Result<()> {
        let watermark = self.watermark();
        self.caches.evict(watermark);
        if self.retention == HistoryRetention::Watermark {
            let removed = self.backend.store().cleanup_history(watermark)?;
            if removed > 0 {
                debug!(target: "chronicle::chain", watermark, removed, "history cleaned up");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("node", &self.node)
            .field("name", &self.config.node_name)
            .field("revision", &self.latest_revision())
            .field("branches", &self.branches.branches().len())
            .field("caches", &self.caches)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{company_schema, person};
    use chronicle_core::{attrs, Error, Value};
    use tempfile::TempDir;

    #[test]
    fn test_open_dir_creates_config_file() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_dir(Backend::in_memory(company_schema()), dir.path()).unwrap();
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
        assert_eq!(db.config(), &DatabaseConfig::default());
        assert_eq!(db.latest_revision(), INITIAL_REVISION);
    }

    #[test]
    fn test_open_rejects_invalid_retention() {
        let config = DatabaseConfig {
            history_retention: "sometimes".into(),
            ..Default::default()
        };
        let err = Database::open(Backend::in_memory(company_schema()), config).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn test_transaction_closure_api() {
        let db = Database::in_memory(company_schema()).unwrap();
        let mut session = db.session();

        let key = session
            .transaction(|txn| txn.create("Person", attrs([("age", Value::Int(42))])))
            .unwrap();

        assert_eq!(session.revision(), 1);
        assert_eq!(session.attribute(&key, "age").unwrap(), Value::Int(42));
        assert_eq!(db.history().latest().commit_number, 1);
    }

    #[test]
    fn test_transaction_read_your_writes() {
        let db = Database::in_memory(company_schema()).unwrap();
        let mut session = db.session();

        let age = session
            .transaction(|txn| {
                let key = txn.create("Person", attrs([("age", Value::Int(1))]))?;
                txn.set(&key, "age", Value::Int(2))?;
                txn.attribute(&key, "age")
            })
            .unwrap();
        assert_eq!(age, Value::Int(2));
    }

    #[test]
    fn test_transaction_aborts_on_closure_error() {
        let db = Database::in_memory(company_schema()).unwrap();
        let mut session = db.session();

        let result: Result<()> = session.transaction(|txn| {
            txn.create("Person", attrs([("age", Value::Int(999))]))?;
            Err(Error::invalid_operation("intentional error"))
        });

        assert!(result.is_err());
        assert_eq!(db.latest_revision(), INITIAL_REVISION);
        assert!(session.scan(&"Person".into()).unwrap().is_empty());
        assert_eq!(db.metrics().total_aborted, 1);
    }

    #[test]
    fn test_begin_and_commit_manual() {
        let db = Database::in_memory(company_schema()).unwrap();
        let mut session = db.session();

        let mut txn = session.begin();
        let key = txn.create("Person", attrs([("age", Value::Int(7))])).unwrap();
        let revision = txn.commit().unwrap().unwrap();

        assert_eq!(revision.commit_number, 1);
        assert_eq!(key, person(key.name.as_i64()));
        let metrics = db.metrics();
        assert_eq!(metrics.total_committed, 1);
        assert_eq!(metrics.active_count, 0);
    }

    #[test]
    fn test_idle_cache_releases_old_links() {
        let db = Database::in_memory(company_schema()).unwrap();
        let mut writer = db.session();
        let company = writer
            .transaction(|txn| txn.create("Company", attrs([("name", Value::from("acme"))])))
            .unwrap();
        let first = Arc::downgrade(&db.chain().tail());
        {
            let reader = db.session();
            let staff = reader.ordered_links(&company, "Person", "employer", "age").unwrap();
            assert!(staff.is_empty().unwrap());
        }

        for age in 0..50 {
            writer
                .transaction(|txn| txn.create("Person", attrs([("age", Value::Int(age))])))
                .unwrap();
        }
        assert!(first.upgrade().is_none());
        assert_eq!(db.cache_stats().rebuilds, 1);
    }

    #[test]
    fn test_read_only_commit_allocates_nothing() {
        let db = Database::in_memory(company_schema()).unwrap();
        let mut session = db.session();
        let txn = session.begin();
        assert!(txn.commit().unwrap().is_none());
        assert_eq!(db.latest_revision(), INITIAL_REVISION);
        assert!(db.backend().replay_log().is_empty());
    }
}
