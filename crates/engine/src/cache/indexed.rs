//! Referrers of one object keyed by a secondary attribute
//!
//! An indexed link view maps the value of an index attribute to the
//! referrer holding it. Several referrers may claim the same index value;
//! the one with the lowest object name is visible, the others stay
//! recorded so removing the winner exposes the next claimant. Referrers
//! whose index attribute is `Null` are not part of the view.

use super::iter::FailFastIter;
use super::links::LinkSource;
use super::{make_writable, Cache, CacheHandler, CacheUpdate, Snapshot, ViewContext};
use crate::transaction::Transaction;
use chronicle_core::{
    attribute, Attributes, BackingStore, BranchRegistry, Error, ObjectKey, ObjectName, Result,
    RevisionNumber, SchemaRegistry, TypeName, UpdateEvent, Value,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Index value to referrer mapping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexedLinks {
    claims: BTreeMap<Value, BTreeSet<(ObjectName, ObjectKey)>>,
    by_referrer: BTreeMap<ObjectKey, Value>,
}

impl IndexedLinks {
    /// Visible referrer for `index`
    pub fn get(&self, index: &Value) -> Option<&ObjectKey> {
        self.claims
            .get(index)
            .and_then(|claims| claims.iter().next())
            .map(|(_, key)| key)
    }

    /// Every referrer claiming `index`, visible one first
    pub fn claimants(&self, index: &Value) -> Vec<&ObjectKey> {
        self.claims
            .get(index)
            .map(|claims| claims.iter().map(|(_, key)| key).collect())
            .unwrap_or_default()
    }

    /// Whether some referrer holds `index`
    pub fn contains_key(&self, index: &Value) -> bool {
        self.claims.contains_key(index)
    }

    /// Index value held by `referrer`
    pub fn index_of(&self, referrer: &ObjectKey) -> Option<&Value> {
        self.by_referrer.get(referrer)
    }

    /// Number of distinct index values
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// Whether no referrer is indexed
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Visible `(index, referrer)` pairs in index order
    pub fn entries(&self) -> impl Iterator<Item = (&Value, &ObjectKey)> {
        self.claims
            .iter()
            .filter_map(|(index, claims)| claims.iter().next().map(|(_, key)| (index, key)))
    }

    fn insert(&mut self, referrer: ObjectKey, index: Value) -> bool {
        if index.is_null() {
            return self.remove(&referrer);
        }
        if self.by_referrer.get(&referrer) == Some(&index) {
            return false;
        }
        self.remove(&referrer);
        self.claims
            .entry(index.clone())
            .or_default()
            .insert((referrer.name, referrer.clone()));
        self.by_referrer.insert(referrer, index);
        true
    }

    fn remove(&mut self, referrer: &ObjectKey) -> bool {
        let Some(index) = self.by_referrer.remove(referrer) else {
            return false;
        };
        if let Some(claims) = self.claims.get_mut(&index) {
            claims.remove(&(referrer.name, referrer.clone()));
            if claims.is_empty() {
                self.claims.remove(&index);
            }
        }
        true
    }
}

/// Maintains [`IndexedLinks`] for one anchor
pub struct IndexedLinksHandler {
    source: LinkSource,
    index_attribute: String,
}

impl IndexedLinksHandler {
    /// Handler for referrers of `anchor` through `referrer_type.attribute`,
    /// keyed by `index_attribute`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown type or anchor branch and
    /// `InvalidOperation` if the attribute is not a reference that can
    /// point at `anchor`.
    pub fn new(
        anchor: &ObjectKey,
        referrer_type: impl Into<TypeName>,
        attribute: &str,
        index_attribute: &str,
        store: Arc<dyn BackingStore>,
        schema: Arc<dyn SchemaRegistry>,
        branches: Arc<BranchRegistry>,
    ) -> Result<Self> {
        Ok(Self {
            source: LinkSource::new(anchor, referrer_type.into(), attribute, store, schema, branches)?,
            index_attribute: index_attribute.to_string(),
        })
    }

    /// Data key of the anchor
    pub fn anchor(&self) -> &ObjectKey {
        &self.source.anchor
    }

    fn index_value(&self, values: &Attributes) -> Value {
        attribute(values, &self.index_attribute).clone()
    }

    fn relevant(&self, attribute: &str) -> bool {
        attribute == self.source.attribute || attribute == self.index_attribute
    }

    /// Apply the state of one referrer; `None` means it no longer links
    fn apply(&self, value: &mut IndexedLinks, key: &ObjectKey, values: Option<&Attributes>) -> bool {
        match values {
            Some(values) if self.source.links(key, values) => {
                value.insert(key.clone(), self.index_value(values))
            }
            _ => value.remove(key),
        }
    }
}

impl CacheHandler for IndexedLinksHandler {
    type Value = IndexedLinks;

    fn describe(&self) -> String {
        self.source.describe("indexed", &self.index_attribute)
    }

    fn build(&self, revision: RevisionNumber) -> Result<IndexedLinks> {
        let mut value = IndexedLinks::default();
        for (key, values) in self.source.scan(revision)? {
            value.insert(key, self.index_value(&values));
        }
        Ok(value)
    }

    fn handle_event(
        &self,
        current: &mut Arc<IndexedLinks>,
        event: &UpdateEvent,
        copy_on_change: bool,
    ) -> CacheUpdate {
        if self.source.invalidated_by(event) {
            return CacheUpdate::Invalid;
        }
        let mut ops: Vec<(&ObjectKey, Option<&Attributes>)> = Vec::new();
        for (key, values) in &event.created {
            if self.source.links(key, values) {
                ops.push((key, Some(values)));
            }
        }
        for (key, change) in &event.updated {
            let touched = change.changes.keys().any(|a| self.relevant(a));
            if !touched {
                continue;
            }
            if self.source.links(key, &change.values) || current.index_of(key).is_some() {
                ops.push((key, Some(&change.values)));
            }
        }
        for key in event.deleted.keys() {
            if current.index_of(key).is_some() {
                ops.push((key, None));
            }
        }
        if ops.is_empty() {
            return CacheUpdate::Unchanged;
        }
        let value = make_writable(current, copy_on_change);
        let mut changed = false;
        for (key, values) in ops {
            changed |= self.apply(value, key, values);
        }
        if changed {
            CacheUpdate::Changed
        } else {
            CacheUpdate::Unchanged
        }
    }

    fn handle_local_creation(
        &self,
        value: &mut IndexedLinks,
        key: &ObjectKey,
        values: &Attributes,
    ) -> bool {
        self.source.links(key, values) && self.apply(value, key, Some(values))
    }

    fn handle_local_deletion(
        &self,
        value: &mut IndexedLinks,
        key: &ObjectKey,
        _values: &Attributes,
    ) -> bool {
        value.remove(key)
    }

    fn handle_local_change(
        &self,
        value: &mut IndexedLinks,
        key: &ObjectKey,
        attribute: &str,
        _old: &Value,
        _new: &Value,
        values: &Attributes,
    ) -> bool {
        self.relevant(attribute) && self.apply(value, key, Some(values))
    }
}

/// Cache of the referrers of one anchor keyed by an index attribute
pub type IndexedLinkCache = Cache<IndexedLinksHandler>;

/// Map-like view of an [`IndexedLinkCache`] for one reader
#[derive(Debug, Clone)]
pub struct IndexedView {
    cache: Arc<IndexedLinkCache>,
    ctx: ViewContext,
}

impl IndexedView {
    pub(crate) fn new(cache: Arc<IndexedLinkCache>, ctx: ViewContext) -> Self {
        Self { cache, ctx }
    }

    /// Current value as seen by this reader
    pub fn snapshot(&self) -> Result<Snapshot<IndexedLinks>> {
        self.cache.value(&self.ctx)
    }

    /// Referrer visible under `index`
    pub fn get(&self, index: &Value) -> Result<Option<ObjectKey>> {
        Ok(self.snapshot()?.get(index).cloned())
    }

    /// Whether some referrer holds `index`
    pub fn contains_key(&self, index: &Value) -> Result<bool> {
        Ok(self.snapshot()?.contains_key(index))
    }

    /// Number of distinct index values
    pub fn len(&self) -> Result<usize> {
        Ok(self.snapshot()?.len())
    }

    /// Whether the view is empty
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.snapshot()?.is_empty())
    }

    /// Index values in order
    pub fn keys(&self) -> Result<FailFastIter<'static, Value>> {
        self.iterate(|links| links.entries().map(|(index, _)| index.clone()).collect())
    }

    /// Visible referrers in index order
    pub fn values(&self) -> Result<FailFastIter<'static, ObjectKey>> {
        self.iterate(|links| links.entries().map(|(_, key)| key.clone()).collect())
    }

    /// Visible `(index, referrer)` pairs in index order
    pub fn entries(&self) -> Result<FailFastIter<'static, (Value, ObjectKey)>> {
        self.iterate(|links| {
            links
                .entries()
                .map(|(index, key)| (index.clone(), key.clone()))
                .collect()
        })
    }

    fn iterate<T>(&self, collect: impl FnOnce(&IndexedLinks) -> Vec<T>) -> Result<FailFastIter<'static, T>> {
        let snapshot = self.snapshot()?;
        let pin = self.ctx.pins.pin(self.ctx.revision());
        let cache = Arc::clone(&self.cache);
        let ctx = self.ctx.clone();
        Ok(FailFastIter::new(
            collect(&snapshot),
            snapshot.stamp(),
            move || cache.value(&ctx).map(|s| s.stamp()),
            self.cache.description().to_string(),
            pin,
        ))
    }

    /// Make `referrer` the entry under `index`
    ///
    /// Writes the index attribute, then the reference. Any other referrer
    /// claiming `index` is unlinked. Returns the previously visible
    /// referrer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the view is not bound to `txn`, or if
    /// `referrer` already links to another object.
    pub fn insert(
        &self,
        txn: &mut Transaction<'_>,
        index: Value,
        referrer: &ObjectKey,
    ) -> Result<Option<ObjectKey>> {
        self.check_bound(txn)?;
        if index.is_null() {
            return Err(Error::invalid_operation("indexed view key must not be null"));
        }
        let source = &self.cache.handler().source;
        let referrer = txn.data_key(referrer)?;
        if !source.resolves_from(referrer.branch) {
            return Err(Error::invalid_operation(format!(
                "{} cannot reach {}",
                referrer, source.anchor
            )));
        }
        let current_ref = txn.attribute(&referrer, &source.attribute)?;
        if !current_ref.is_null() && !current_ref.refers_to(source.anchor_id()) {
            return Err(Error::invalid_operation(format!(
                "{} is already linked to {}",
                referrer, current_ref
            )));
        }

        let snapshot = self.snapshot()?;
        let previous = snapshot.get(&index).cloned();
        for claimant in snapshot.claimants(&index) {
            if claimant != &referrer {
                txn.set(claimant, &source.attribute, Value::Null)?;
            }
        }
        let index_attribute = self.cache.handler().index_attribute.clone();
        txn.set(&referrer, &index_attribute, index)?;
        txn.set(&referrer, &source.attribute, Value::Ref(source.anchor_id().clone()))?;
        Ok(previous)
    }

    /// Unlink every referrer under `index`; returns the visible one
    pub fn remove(&self, txn: &mut Transaction<'_>, index: &Value) -> Result<Option<ObjectKey>> {
        self.check_bound(txn)?;
        let snapshot = self.snapshot()?;
        let attribute = &self.cache.handler().source.attribute;
        for claimant in snapshot.claimants(index) {
            txn.set(claimant, attribute, Value::Null)?;
        }
        Ok(snapshot.get(index).cloned())
    }

    fn check_bound(&self, txn: &Transaction<'_>) -> Result<()> {
        match self.ctx.active_txn() {
            Some(overlays) if overlays.id() == txn.id() => Ok(()),
            _ => Err(Error::invalid_operation(format!(
                "view {} is not bound to transaction {}",
                self.cache.description(),
                txn.id()
            ))),
        }
    }
}
