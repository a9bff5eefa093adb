//! Sessions: a reader's consistent view of one node
//!
//! A session sees exactly one revision at a time, the position of its
//! [`SessionRevisionTracker`] in the update chain. It never moves on its
//! own: commits by other sessions become visible after [`Session::advance`],
//! commits by other nodes after [`Session::refetch`]. Committing a
//! transaction moves the session to the new revision.

use crate::cache::{Cache, CacheHandler, CacheId, IndexedView, OrderedView, ViewContext};
use crate::database::Database;
use crate::item::Item;
use crate::transaction::Transaction;
use chronicle_concurrency::SessionRevisionTracker;
use chronicle_core::{
    attribute, Attributes, Branch, BranchId, Error, HistoryContext, ObjectKey, Result,
    RevisionNumber, SessionId, TypeName, Value,
};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// A reader (and, through [`Session::begin`], writer) on one branch
pub struct Session {
    db: Arc<Database>,
    tracker: Arc<SessionRevisionTracker>,
    branch: BranchId,
}

impl Session {
    pub(crate) fn new(db: Arc<Database>, tracker: Arc<SessionRevisionTracker>, branch: BranchId) -> Self {
        Self { db, tracker, branch }
    }

    /// Session id
    pub fn id(&self) -> SessionId {
        self.tracker.id()
    }

    /// Revision the session sees
    pub fn revision(&self) -> RevisionNumber {
        self.tracker.revision()
    }

    /// Branch the session works on
    pub fn branch(&self) -> BranchId {
        self.branch
    }

    /// Node the session belongs to
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub(crate) fn tracker(&self) -> &Arc<SessionRevisionTracker> {
        &self.tracker
    }

    // ========================================================================
    // Moving forward
    // ========================================================================

    /// Move to the newest revision applied by the node
    ///
    /// Every cache the session has read replays the events in between.
    pub fn advance(&self) -> Result<RevisionNumber> {
        let from = self.revision();
        let revision = self.tracker.advance();
        self.after_advance(from, revision)
    }

    /// Move forward to the newest revision not beyond `revision`
    pub fn advance_to(&self, revision: RevisionNumber) -> Result<RevisionNumber> {
        let from = self.revision();
        let reached = self.tracker.advance_to(revision);
        self.after_advance(from, reached)
    }

    /// Wait for a revision committed by another node, then advance
    ///
    /// # Errors
    ///
    /// Returns `RefetchTimeout` if nothing arrived within `timeout`.
    pub fn refetch(&self, timeout: Duration) -> Result<RevisionNumber> {
        self.db.refetch(timeout)?;
        self.advance()
    }

    /// [`Session::refetch`] with the node's configured timeout
    pub fn refetch_default(&self) -> Result<RevisionNumber> {
        self.refetch(self.db.config().refetch_timeout())
    }

    fn after_advance(&self, from: RevisionNumber, to: RevisionNumber) -> Result<RevisionNumber> {
        if to > from {
            trace!(target: "chronicle::chain", session = %self.id(), from, to, "session advanced");
            self.db.evict()?;
        }
        Ok(to)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Open a transaction reading at the session revision
    pub fn begin(&mut self) -> Transaction<'_> {
        Transaction::begin(self)
    }

    /// Run `f` in a transaction: commit if it succeeds, roll back if not
    ///
    /// A merge conflict is returned to the caller as is.
    pub fn transaction<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let mut txn = self.begin();
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Revision a key is read at: its own for historic keys, else the
    /// session revision
    fn read_revision(&self, key: &ObjectKey) -> RevisionNumber {
        match key.history {
            HistoryContext::Revision(revision) => revision,
            HistoryContext::Current => self.revision(),
        }
    }

    /// Resolve `key` to the branch holding its data
    pub fn data_key(&self, key: &ObjectKey) -> Result<ObjectKey> {
        self.db.branches().data_key(key)
    }

    /// Declared attributes of `key`, `None` if not alive
    pub fn get(&self, key: &ObjectKey) -> Result<Option<Attributes>> {
        let revision = self.read_revision(key);
        let data = self.data_key(key)?;
        self.db.backend().store().read_as_of(&data, revision)
    }

    /// Whether `key` is alive
    pub fn exists(&self, key: &ObjectKey) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// One attribute of `key`; undeclared names read the flexible bag
    ///
    /// # Errors
    ///
    /// Returns `DeletedObjectAccess` if the object is not alive.
    pub fn attribute(&self, key: &ObjectKey, name: &str) -> Result<Value> {
        let values = self
            .get(key)?
            .ok_or_else(|| Error::deleted_object(key.clone(), self.read_revision(key)))?;
        let schema = self.db.backend().schema();
        if schema.attribute(&key.type_name, name).is_some() {
            return Ok(attribute(&values, name).clone());
        }
        let bag = self
            .db
            .backend()
            .flex()
            .load(&self.data_key(key)?.as_current(), self.read_revision(key))?;
        Ok(bag.get(name).cloned().unwrap_or(Value::Null))
    }

    /// Objects of `type_name` and its subtypes visible on the session branch
    pub fn scan(&self, type_name: &TypeName) -> Result<Vec<(ObjectKey, Attributes)>> {
        let revision = self.revision();
        let mut result = Vec::new();
        for concrete in self.db.backend().schema().subtypes(type_name) {
            let branch = self.db.branches().data_branch(self.branch, &concrete)?;
            result.extend(
                self.db
                    .backend()
                    .store()
                    .scan(branch, &concrete, revision, &|_| true)?,
            );
        }
        result.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(result)
    }

    /// Handle caching the states of `key`
    pub fn item(&self, key: &ObjectKey) -> Result<Item> {
        Item::new(Arc::clone(&self.db), self.data_key(&key.as_current())?)
    }

    // ========================================================================
    // Caches
    // ========================================================================

    /// Reader identity for caches, outside any transaction
    pub fn view_context(&self) -> ViewContext {
        ViewContext::new(Arc::clone(&self.tracker), None, Arc::clone(self.db.pins()))
    }

    /// Referrers of `anchor` through `referrer_type.attribute`, keyed by
    /// `index`
    pub fn indexed_links(
        &self,
        anchor: &ObjectKey,
        referrer_type: impl Into<TypeName>,
        attribute: &str,
        index: &str,
    ) -> Result<IndexedView> {
        let cache = self
            .db
            .indexed_cache(anchor, referrer_type.into(), attribute, index)?;
        Ok(IndexedView::new(cache, self.view_context()))
    }

    /// Referrers of `anchor` through `referrer_type.attribute`, ordered by
    /// `order`
    pub fn ordered_links(
        &self,
        anchor: &ObjectKey,
        referrer_type: impl Into<TypeName>,
        attribute: &str,
        order: &str,
    ) -> Result<OrderedView> {
        let cache = self
            .db
            .ordered_cache(anchor, referrer_type.into(), attribute, order)?;
        Ok(OrderedView::new(cache, self.view_context()))
    }

    /// Application defined cache registered under `name`
    ///
    /// Read it with `cache.value(&session.view_context())`.
    pub fn cache<H, F>(&self, name: &str, handler: F) -> Result<Arc<Cache<H>>>
    where
        H: CacheHandler,
        F: FnOnce() -> Result<H>,
    {
        self.db.caches().get_or_create(
            CacheId::Custom(name.to_string()),
            handler,
            self.db.chain().tail(),
            self.db.pins(),
        )
    }

    // ========================================================================
    // Branches
    // ========================================================================

    /// Fork the session branch at the session revision, copying `types`
    ///
    /// # Errors
    ///
    /// Returns `BranchConsistency` if the model or the data at the base
    /// revision contradicts the branched-type set; nothing is created then.
    pub fn create_branch<I, T>(&self, types: I) -> Result<Arc<Branch>>
    where
        I: IntoIterator<Item = T>,
        T: Into<TypeName>,
    {
        let types: BTreeSet<TypeName> = types.into_iter().map(Into::into).collect();
        self.db.create_branch(self.branch, self.revision(), types)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("branch", &self.branch)
            .field("revision", &self.revision())
            .finish()
    }
}
