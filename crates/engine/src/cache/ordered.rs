//! Referrers of one object as an ordered list
//!
//! Members are sorted by their order attribute, ties broken by object name.
//! A member without an order key sorts last. List operations translate into
//! attribute writes planned by [`super::order`]: the order key is written
//! before the reference, and removal only clears the reference.

use super::iter::FailFastIter;
use super::links::LinkSource;
use super::order::{plan_insert, plan_sequence};
use super::{make_writable, Cache, CacheHandler, CacheUpdate, Snapshot, ViewContext};
use crate::transaction::Transaction;
use chronicle_core::{
    attribute, Attributes, BackingStore, BranchRegistry, Error, ObjectKey, ObjectName, Result,
    RevisionNumber, SchemaRegistry, TypeName, UpdateEvent, Value,
};
use std::collections::BTreeSet;
use std::sync::Arc;

fn sort_key(order: i32, key: &ObjectKey) -> (i32, ObjectName, &ObjectKey) {
    (order, key.name, key)
}

/// Order key stored in `values`, clamped to `i32`
fn order_of(values: &Attributes, order_attribute: &str) -> i32 {
    match attribute(values, order_attribute).as_int() {
        Some(order) => i32::try_from(order).unwrap_or(if order < 0 { i32::MIN } else { i32::MAX }),
        None => i32::MAX,
    }
}

/// Members of an ordered link view
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedLinks {
    members: Vec<(i32, ObjectKey)>,
}

impl OrderedLinks {
    /// Number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Member at `index`
    pub fn get(&self, index: usize) -> Option<&ObjectKey> {
        self.members.get(index).map(|(_, key)| key)
    }

    /// Order key of the member at `index`
    pub fn order_at(&self, index: usize) -> Option<i32> {
        self.members.get(index).map(|(order, _)| *order)
    }

    /// Position of `key`
    pub fn position(&self, key: &ObjectKey) -> Option<usize> {
        self.members.iter().position(|(_, member)| member == key)
    }

    /// Whether `key` is a member
    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.position(key).is_some()
    }

    /// Members in list order
    pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.members.iter().map(|(_, key)| key)
    }

    /// Order keys in list order
    pub fn orders(&self) -> Vec<i32> {
        self.members.iter().map(|(order, _)| *order).collect()
    }

    fn upsert(&mut self, key: ObjectKey, order: i32) -> bool {
        if let Some(pos) = self.position(&key) {
            if self.members[pos].0 == order {
                return false;
            }
            self.members.remove(pos);
        }
        let pos = self
            .members
            .partition_point(|(o, k)| sort_key(*o, k) < sort_key(order, &key));
        self.members.insert(pos, (order, key));
        true
    }

    fn remove(&mut self, key: &ObjectKey) -> bool {
        match self.position(key) {
            Some(pos) => {
                self.members.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Maintains [`OrderedLinks`] for one anchor
pub struct OrderedLinksHandler {
    source: LinkSource,
    order_attribute: String,
}

impl OrderedLinksHandler {
    /// Handler for referrers of `anchor` through `referrer_type.attribute`,
    /// sorted by `order_attribute`
    ///
    /// # Errors
    ///
    /// Same as [`super::IndexedLinksHandler::new`].
    pub fn new(
        anchor: &ObjectKey,
        referrer_type: impl Into<TypeName>,
        attribute: &str,
        order_attribute: &str,
        store: Arc<dyn BackingStore>,
        schema: Arc<dyn SchemaRegistry>,
        branches: Arc<BranchRegistry>,
    ) -> Result<Self> {
        Ok(Self {
            source: LinkSource::new(anchor, referrer_type.into(), attribute, store, schema, branches)?,
            order_attribute: order_attribute.to_string(),
        })
    }

    /// Data key of the anchor
    pub fn anchor(&self) -> &ObjectKey {
        &self.source.anchor
    }

    fn relevant(&self, attribute: &str) -> bool {
        attribute == self.source.attribute || attribute == self.order_attribute
    }

    fn apply(&self, value: &mut OrderedLinks, key: &ObjectKey, values: Option<&Attributes>) -> bool {
        match values {
            Some(values) if self.source.links(key, values) => {
                value.upsert(key.clone(), order_of(values, &self.order_attribute))
            }
            _ => value.remove(key),
        }
    }
}

impl CacheHandler for OrderedLinksHandler {
    type Value = OrderedLinks;

    fn describe(&self) -> String {
        self.source.describe("ordered", &self.order_attribute)
    }

    fn build(&self, revision: RevisionNumber) -> Result<OrderedLinks> {
        let mut value = OrderedLinks::default();
        for (key, values) in self.source.scan(revision)? {
            let order = order_of(&values, &self.order_attribute);
            value.upsert(key, order);
        }
        Ok(value)
    }

    fn handle_event(
        &self,
        current: &mut Arc<OrderedLinks>,
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
            if !change.changes.keys().any(|a| self.relevant(a)) {
                continue;
            }
            if self.source.links(key, &change.values) || current.contains(key) {
                ops.push((key, Some(&change.values)));
            }
        }
        for key in event.deleted.keys() {
            if current.contains(key) {
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
        value: &mut OrderedLinks,
        key: &ObjectKey,
        values: &Attributes,
    ) -> bool {
        self.source.links(key, values) && self.apply(value, key, Some(values))
    }

    fn handle_local_deletion(
        &self,
        value: &mut OrderedLinks,
        key: &ObjectKey,
        _values: &Attributes,
    ) -> bool {
        value.remove(key)
    }

    fn handle_local_change(
        &self,
        value: &mut OrderedLinks,
        key: &ObjectKey,
        attribute: &str,
        _old: &Value,
        _new: &Value,
        values: &Attributes,
    ) -> bool {
        self.relevant(attribute) && self.apply(value, key, Some(values))
    }
}

/// Cache of the referrers of one anchor in list order
pub type OrderedLinkCache = Cache<OrderedLinksHandler>;

/// List-like view of an [`OrderedLinkCache`] for one reader
#[derive(Debug, Clone)]
pub struct OrderedView {
    cache: Arc<OrderedLinkCache>,
    ctx: ViewContext,
}

impl OrderedView {
    pub(crate) fn new(cache: Arc<OrderedLinkCache>, ctx: ViewContext) -> Self {
        Self { cache, ctx }
    }

    /// Current value as seen by this reader
    pub fn snapshot(&self) -> Result<Snapshot<OrderedLinks>> {
        self.cache.value(&self.ctx)
    }

    /// Number of members
    pub fn len(&self) -> Result<usize> {
        Ok(self.snapshot()?.len())
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.snapshot()?.is_empty())
    }

    /// Member at `index`
    pub fn get(&self, index: usize) -> Result<Option<ObjectKey>> {
        Ok(self.snapshot()?.get(index).cloned())
    }

    /// Position of `key`
    pub fn position(&self, key: &ObjectKey) -> Result<Option<usize>> {
        Ok(self.snapshot()?.position(key))
    }

    /// Members in list order
    pub fn to_vec(&self) -> Result<Vec<ObjectKey>> {
        Ok(self.snapshot()?.keys().cloned().collect())
    }

    /// Fail-fast iterator over the members
    pub fn iter(&self) -> Result<FailFastIter<'static, ObjectKey>> {
        let snapshot = self.snapshot()?;
        let pin = self.ctx.pins.pin(self.ctx.revision());
        let cache = Arc::clone(&self.cache);
        let ctx = self.ctx.clone();
        Ok(FailFastIter::new(
            snapshot.keys().cloned().collect(),
            snapshot.stamp(),
            move || cache.value(&ctx).map(|s| s.stamp()),
            self.cache.description().to_string(),
            pin,
        ))
    }

    /// Append `referrer`
    pub fn push(&self, txn: &mut Transaction<'_>, referrer: &ObjectKey) -> Result<()> {
        let len = self.len()?;
        self.insert(txn, len, referrer)
    }

    /// Insert `referrer` at `index`
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if `index` is out of range, the view is
    /// not bound to `txn`, or `referrer` is already a member of this or
    /// another list.
    pub fn insert(&self, txn: &mut Transaction<'_>, index: usize, referrer: &ObjectKey) -> Result<()> {
        self.check_bound(txn)?;
        let referrer = self.check_free(txn, referrer)?;
        let snapshot = self.snapshot()?;
        let plan = plan_insert(&snapshot.orders(), index)?;
        let order_attribute = self.order_attribute();
        for (position, order) in plan.renumber {
            if let Some(member) = snapshot.get(position) {
                txn.set(member, order_attribute, Value::Int(i64::from(order)))?;
            }
        }
        self.link(txn, &referrer, plan.order)
    }

    /// Remove and return the member at `index`
    pub fn remove(&self, txn: &mut Transaction<'_>, index: usize) -> Result<ObjectKey> {
        self.check_bound(txn)?;
        let member = self.member(index)?;
        txn.set(&member, self.reference_attribute(), Value::Null)?;
        Ok(member)
    }

    /// Replace the member at `index` by `referrer`; returns the old member
    pub fn set(&self, txn: &mut Transaction<'_>, index: usize, referrer: &ObjectKey) -> Result<ObjectKey> {
        self.check_bound(txn)?;
        let snapshot = self.snapshot()?;
        let old = self.member(index)?;
        let referrer_key = txn.data_key(referrer)?;
        if referrer_key == old {
            return Ok(old);
        }
        let referrer_key = self.check_free(txn, &referrer_key)?;
        let order = snapshot.order_at(index).unwrap_or(i32::MAX);
        self.link(txn, &referrer_key, order)?;
        txn.set(&old, self.reference_attribute(), Value::Null)?;
        Ok(old)
    }

    /// Move the member at `from` so it ends up at `to`
    ///
    /// Moving a member onto its own position writes nothing.
    pub fn move_to(&self, txn: &mut Transaction<'_>, from: usize, to: usize) -> Result<()> {
        self.check_bound(txn)?;
        let snapshot = self.snapshot()?;
        let member = self.member(from)?;
        if from == to {
            return Ok(());
        }
        let rest: Vec<(i32, &ObjectKey)> = snapshot
            .members
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != from)
            .map(|(_, (order, key))| (*order, key))
            .collect();
        let orders: Vec<i32> = rest.iter().map(|(order, _)| *order).collect();
        let plan = plan_insert(&orders, to)?;
        let order_attribute = self.order_attribute();
        for (position, order) in plan.renumber {
            txn.set(rest[position].1, order_attribute, Value::Int(i64::from(order)))?;
        }
        txn.set(&member, order_attribute, Value::Int(i64::from(plan.order)))
    }

    /// Make the list exactly `referrers`, writing as few order keys as
    /// possible
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` on duplicates or on a referrer that is a
    /// member of another list.
    pub fn replace_all(&self, txn: &mut Transaction<'_>, referrers: &[ObjectKey]) -> Result<()> {
        self.check_bound(txn)?;
        let snapshot = self.snapshot()?;
        let mut wanted = Vec::with_capacity(referrers.len());
        let mut seen = BTreeSet::new();
        for referrer in referrers {
            let key = txn.data_key(referrer)?;
            if !seen.insert(key.clone()) {
                return Err(Error::invalid_operation(format!(
                    "{} appears twice in the new list",
                    key
                )));
            }
            let key = if snapshot.contains(&key) {
                key
            } else {
                self.check_free(txn, &key)?
            };
            wanted.push(key);
        }

        for member in snapshot.keys() {
            if !seen.contains(member) {
                txn.set(member, self.reference_attribute(), Value::Null)?;
            }
        }
        let current: Vec<Option<i32>> = wanted
            .iter()
            .map(|key| snapshot.position(key).and_then(|p| snapshot.order_at(p)))
            .collect();
        for (position, order) in plan_sequence(&current) {
            txn.set(&wanted[position], self.order_attribute(), Value::Int(i64::from(order)))?;
        }
        let reference = Value::Ref(self.cache.handler().source.anchor_id().clone());
        for (position, key) in wanted.iter().enumerate() {
            if current[position].is_none() {
                txn.set(key, self.reference_attribute(), reference.clone())?;
            }
        }
        Ok(())
    }

    fn order_attribute(&self) -> &str {
        &self.cache.handler().order_attribute
    }

    fn reference_attribute(&self) -> &str {
        &self.cache.handler().source.attribute
    }

    fn member(&self, index: usize) -> Result<ObjectKey> {
        self.get(index)?.ok_or_else(|| {
            Error::invalid_operation(format!(
                "position {} out of range for {}",
                index,
                self.cache.description()
            ))
        })
    }

    fn link(&self, txn: &mut Transaction<'_>, referrer: &ObjectKey, order: i32) -> Result<()> {
        let reference = Value::Ref(self.cache.handler().source.anchor_id().clone());
        txn.set(referrer, self.order_attribute(), Value::Int(i64::from(order)))?;
        txn.set(referrer, self.reference_attribute(), reference)
    }

    /// Data key of `referrer` if it may join this list
    fn check_free(&self, txn: &mut Transaction<'_>, referrer: &ObjectKey) -> Result<ObjectKey> {
        let source = &self.cache.handler().source;
        let referrer = txn.data_key(referrer)?;
        if !source.resolves_from(referrer.branch) {
            return Err(Error::invalid_operation(format!(
                "{} cannot reach {}",
                referrer, source.anchor
            )));
        }
        let current = txn.attribute(&referrer, &source.attribute)?;
        if !current.is_null() {
            return Err(Error::invalid_operation(format!(
                "{} is already a list member through {}",
                referrer, current
            )));
        }
        Ok(referrer)
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
