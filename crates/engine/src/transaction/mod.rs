//! Transactions: buffered writes against a read base
//!
//! A [`Transaction`] wraps a [`TransactionContext`] and gives it the object
//! API:
//! - Read-your-writes: local state first, then the store at the read base
//! - Declared attributes go to the row, undeclared ones to the flexible bag
//! - Deletions run the reference deletion policies up front
//! - Every local change is forwarded to the transaction's cache overlays
//!
//! Nothing is visible to other sessions before [`Transaction::commit`].
//! Dropping an active transaction rolls it back and counts it as abandoned.

mod deletion;

use crate::cache::{IndexedView, OrderedView, TxnOverlays, ViewContext};
use crate::database::Database;
use crate::session::Session;
use chronicle_concurrency::{LocalRead, TransactionContext};
use chronicle_core::{
    attribute, normalize, AttributeBag, Attributes, BranchId, Error, HistoryContext, ObjectKey,
    ObjectName, Result, Revision, RevisionNumber, TxnId, TypeName, Value, OBJECT_SEQUENCE,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// An open transaction of a [`Session`]
pub struct Transaction<'s> {
    session: &'s mut Session,
    ctx: TransactionContext,
    overlays: Arc<TxnOverlays>,
}

impl<'s> Transaction<'s> {
    pub(crate) fn begin(session: &'s mut Session) -> Self {
        let ctx = session
            .database()
            .coordinator()
            .start_transaction(session.revision());
        let overlays = TxnOverlays::new(ctx.txn_id, session.tracker().link());
        Self {
            session,
            ctx,
            overlays,
        }
    }

    /// Transaction id
    pub fn id(&self) -> TxnId {
        self.ctx.txn_id
    }

    /// Revision every read is made at
    pub fn read_base(&self) -> RevisionNumber {
        self.ctx.read_base
    }

    /// Whether the transaction accepts operations
    pub fn is_active(&self) -> bool {
        self.ctx.is_active()
    }

    /// Session the transaction belongs to
    pub fn session(&self) -> &Session {
        self.session
    }

    fn db(&self) -> &Arc<Database> {
        self.session.database()
    }

    fn branch(&self) -> BranchId {
        self.session.branch()
    }

    /// Resolve `key` to the branch holding its data
    pub fn data_key(&self, key: &ObjectKey) -> Result<ObjectKey> {
        self.db().branches().data_key(key)
    }

    fn writable_key(&self, key: &ObjectKey) -> Result<ObjectKey> {
        self.ctx.ensure_active()?;
        if !key.is_current() {
            return Err(Error::invalid_operation(format!(
                "{} is a historic key and cannot be written",
                key
            )));
        }
        self.data_key(key)
    }

    fn store_read(&self, key: &ObjectKey, revision: RevisionNumber) -> Result<Option<Attributes>> {
        self.db().backend().store().read_as_of(key, revision)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Declared attributes of `key` in the transaction's view
    pub fn get(&self, key: &ObjectKey) -> Result<Option<Attributes>> {
        let data = self.data_key(key)?;
        if let HistoryContext::Revision(revision) = key.history {
            return self.store_read(&data, revision);
        }
        match self.ctx.local(&data) {
            LocalRead::Untouched => self.store_read(&data, self.ctx.read_base),
            LocalRead::Alive(values) => Ok(Some(values.clone())),
            LocalRead::Deleted => Ok(None),
        }
    }

    /// Whether `key` is alive in the transaction's view
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
            .ok_or_else(|| Error::deleted_object(key.clone(), self.ctx.read_base))?;
        if self
            .db()
            .backend()
            .schema()
            .attribute(&key.type_name, name)
            .is_some()
        {
            return Ok(attribute(&values, name).clone());
        }
        self.flex_attribute(key, name)
    }

    /// Undeclared attribute of `key`, staged change first
    pub fn flex_attribute(&self, key: &ObjectKey, name: &str) -> Result<Value> {
        let data = self.data_key(&key.as_current())?;
        let revision = match key.history {
            HistoryContext::Revision(revision) => revision,
            HistoryContext::Current => {
                if let Some(value) = self.ctx.staged_flex(&data).and_then(|bag| bag.get(name)) {
                    return Ok(value.clone());
                }
                self.ctx.read_base
            }
        };
        let bag = self.db().backend().flex().load(&data, revision)?;
        Ok(bag.get(name).cloned().unwrap_or(Value::Null))
    }

    /// Objects of `type_name` and its subtypes in the transaction's view
    pub fn scan(&self, type_name: &TypeName) -> Result<Vec<(ObjectKey, Attributes)>> {
        let mut result = Vec::new();
        for concrete in self.db().backend().schema().subtypes(type_name) {
            let branch = self.db().branches().data_branch(self.branch(), &concrete)?;
            result.extend(self.merged_scan(branch, &concrete, &|_| true)?);
        }
        result.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(result)
    }

    /// Rows of exactly `type_name` on `branch` matching `predicate`, with
    /// local changes applied over the read base
    pub(crate) fn merged_scan(
        &self,
        branch: BranchId,
        type_name: &TypeName,
        predicate: &dyn Fn(&Attributes) -> bool,
    ) -> Result<Vec<(ObjectKey, Attributes)>> {
        let mut rows: BTreeMap<ObjectKey, Attributes> = self
            .db()
            .backend()
            .store()
            .scan(branch, type_name, self.ctx.read_base, predicate)?
            .into_iter()
            .collect();
        for (key, pending) in self.ctx.objects() {
            if key.branch != branch || &key.type_name != type_name {
                continue;
            }
            if pending.is_alive() && predicate(&pending.values) {
                rows.insert(key.clone(), pending.values.clone());
            } else {
                rows.remove(key);
            }
        }
        Ok(rows.into_iter().collect())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Create an object of `type_name` named from the object sequence
    pub fn create(&mut self, type_name: impl Into<TypeName>, values: Attributes) -> Result<ObjectKey> {
        self.ctx.ensure_active()?;
        let name = self
            .db()
            .backend()
            .sequence()
            .next_value(OBJECT_SEQUENCE)?;
        self.create_with_name(type_name, ObjectName::new(name), values)
    }

    /// Create an object under an explicit name
    ///
    /// Undeclared attributes are staged in the flexible bag.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown type
    /// - `InvalidOperation` if the object is alive or a reference value
    ///   does not fit its attribute
    pub fn create_with_name(
        &mut self,
        type_name: impl Into<TypeName>,
        name: ObjectName,
        values: Attributes,
    ) -> Result<ObjectKey> {
        self.ctx.ensure_active()?;
        let type_name = type_name.into();
        let schema = Arc::clone(self.db().backend().schema());
        if !schema.contains(&type_name) {
            return Err(Error::not_found(format!("type {}", type_name)));
        }
        let key = self.data_key(&ObjectKey::current(self.branch(), type_name.clone(), name))?;
        if self.exists(&key)? {
            return Err(Error::invalid_operation(format!("{} already exists", key)));
        }

        let mut declared = Attributes::new();
        let mut flex = AttributeBag::new();
        for (attr, value) in normalize(values) {
            if schema.attribute(&type_name, &attr).is_some() {
                schema.check_reference_value(&type_name, &attr, &value)?;
                declared.insert(attr, value);
            } else {
                flex.insert(attr, value);
            }
        }

        let change = self.ctx.record_create(key.clone(), declared)?;
        self.overlays.push(change);
        if !flex.is_empty() {
            self.ctx.stage_flex(key.clone(), flex)?;
        }
        Ok(key)
    }

    /// Write one attribute; `Null` clears it
    ///
    /// Undeclared names are written to the flexible bag.
    ///
    /// # Errors
    ///
    /// - `DeletedObjectAccess` if the object is not alive
    /// - `InvalidOperation` for a historic key or an unfit reference value
    pub fn set(&mut self, key: &ObjectKey, name: &str, value: Value) -> Result<()> {
        let data = self.writable_key(key)?;
        let schema = Arc::clone(self.db().backend().schema());
        if schema.attribute(&data.type_name, name).is_none() {
            return self.set_flex(&data, name, value);
        }
        schema.check_reference_value(&data.type_name, name, &value)?;
        self.write(&data, name, value)
    }

    /// Record an attribute write on a data key without schema checks
    fn write(&mut self, data: &ObjectKey, name: &str, value: Value) -> Result<()> {
        let store = Arc::clone(self.db().backend().store());
        let read_base = self.ctx.read_base;
        let base_key = data.clone();
        let change = self.ctx.record_change(
            data,
            move || store.read_as_of(&base_key, read_base),
            name,
            value,
        )?;
        if let Some(change) = change {
            self.overlays.push(change);
        }
        Ok(())
    }

    /// Write one undeclared attribute into the flexible bag
    ///
    /// Only the change is staged; the commit applies it to the newest bag.
    pub fn set_flex(&mut self, key: &ObjectKey, name: &str, value: Value) -> Result<()> {
        let data = self.writable_key(key)?;
        if !self.exists(&data)? {
            return Err(Error::deleted_object(data, self.ctx.read_base));
        }
        let mut changes = self.ctx.staged_flex(&data).cloned().unwrap_or_default();
        changes.insert(name.to_string(), value);
        self.ctx.stage_flex(data, changes)
    }

    /// Delete `key`, applying the deletion policy of every reference to it
    ///
    /// Referrers are rewritten or deleted in the same transaction. Nothing
    /// is recorded if some reference vetoes.
    ///
    /// # Errors
    ///
    /// Returns `DeletionVetoed` for a vetoing reference and
    /// `DeletedObjectAccess` if the object is not alive.
    pub fn delete(&mut self, key: &ObjectKey) -> Result<()> {
        let data = self.writable_key(key)?;
        let plan = deletion::plan(self, &data)?;
        debug!(
            target: "chronicle::txn",
            txn = %self.ctx.txn_id,
            key = %data,
            cascaded = plan.deletions.len() - 1,
            rewritten = plan.rewrites.len(),
            "deletion planned"
        );
        for (referrer, attr, value) in plan.rewrites {
            self.write(&referrer, &attr, value)?;
        }
        for victim in plan.deletions {
            let store = Arc::clone(self.db().backend().store());
            let read_base = self.ctx.read_base;
            let base_key = victim.clone();
            let change = self
                .ctx
                .record_delete(&victim, move || store.read_as_of(&base_key, read_base))?;
            self.overlays.push(change);
        }
        Ok(())
    }

    // ========================================================================
    // Caches
    // ========================================================================

    /// Reader identity for caches, seeing this transaction's changes
    pub fn view_context(&self) -> ViewContext {
        ViewContext::new(
            Arc::clone(self.session.tracker()),
            Some(Arc::clone(&self.overlays)),
            Arc::clone(self.db().pins()),
        )
    }

    /// Writable indexed view of the referrers of `anchor`
    pub fn indexed_links(
        &self,
        anchor: &ObjectKey,
        referrer_type: impl Into<TypeName>,
        attribute: &str,
        index: &str,
    ) -> Result<IndexedView> {
        let cache = self
            .db()
            .indexed_cache(anchor, referrer_type.into(), attribute, index)?;
        Ok(IndexedView::new(cache, self.view_context()))
    }

    /// Writable ordered view of the referrers of `anchor`
    pub fn ordered_links(
        &self,
        anchor: &ObjectKey,
        referrer_type: impl Into<TypeName>,
        attribute: &str,
        order: &str,
    ) -> Result<OrderedView> {
        let cache = self
            .db()
            .ordered_cache(anchor, referrer_type.into(), attribute, order)?;
        Ok(OrderedView::new(cache, self.view_context()))
    }

    // ========================================================================
    // Finish
    // ========================================================================

    /// Local changes recorded so far, in order
    pub fn change_count(&self) -> usize {
        self.overlays.change_count()
    }

    /// Commit and move the session to the new revision
    ///
    /// Returns `None` for a transaction without writes; no revision is
    /// allocated then.
    ///
    /// # Errors
    ///
    /// Returns `MergeConflict` for a structural conflict with a concurrent
    /// commit; the transaction is aborted and nothing is written.
    pub fn commit(mut self) -> Result<Option<Revision>> {
        let db = Arc::clone(self.db());
        let result = db.commit_transaction(&mut self.ctx);
        self.overlays.finish();
        let outcome = result?;
        if let Some(link) = outcome.link {
            self.session.tracker().advance_until(link);
            db.evict()?;
        }
        Ok(outcome.revision.and_then(|r| db.history().get(r)))
    }

    /// Discard every local change
    ///
    /// Returns whether the transaction was active; calling it again is a
    /// no-op.
    pub fn rollback(&mut self) -> bool {
        if !self.ctx.mark_rolled_back() {
            return false;
        }
        self.overlays.finish();
        self.db().coordinator().record_abort();
        debug!(target: "chronicle::txn", txn = %self.ctx.txn_id, "rolled back");
        true
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.ctx.mark_rolled_back() {
            self.overlays.finish();
            self.session
                .database()
                .coordinator()
                .record_abandoned(&self.ctx);
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.ctx.txn_id)
            .field("read_base", &self.ctx.read_base)
            .field("status", &self.ctx.status)
            .field("pending", &self.ctx.pending_operations())
            .finish()
    }
}
