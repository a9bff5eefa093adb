//! In-memory flexible attribute manager
//!
//! Every published bag of an object is kept with the revision it became
//! valid at, so a reader sees the bag as of its own revision. Commits stage
//! their changes per transaction; only `publish` makes them visible. The
//! store can be switched to read-only, in which case staging answers `false`
//! and the committing transaction is rejected.

use chronicle_core::{
    AttributeBag, CommitContext, FlexAttributeManager, ObjectKey, Result, RevisionNumber, TxnId,
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace};

/// Published bags of one object, oldest first; `None` marks a removal
type BagHistory = Vec<(RevisionNumber, Option<AttributeBag>)>;

/// Flexible attribute storage keyed by data key
#[derive(Debug, Default)]
pub struct MemoryFlexStore {
    bags: DashMap<ObjectKey, BagHistory>,
    staged: DashMap<TxnId, Vec<(ObjectKey, Option<AttributeBag>)>>,
    read_only: AtomicBool,
    stores: AtomicU64,
}

impl MemoryFlexStore {
    /// Create an empty, writable store
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject (or accept again) every following write
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Relaxed);
    }

    /// Number of accepted `store` calls
    pub fn store_count(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }

    /// Number of transactions with staged, unpublished changes
    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    fn newest(&self, object: &ObjectKey) -> AttributeBag {
        self.bags
            .get(object)
            .and_then(|history| history.last().and_then(|(_, bag)| bag.clone()))
            .unwrap_or_default()
    }

    fn stage(&self, txn: TxnId, object: ObjectKey, bag: Option<AttributeBag>) {
        let mut staged = self.staged.entry(txn).or_default();
        staged.retain(|(key, _)| key != &object);
        staged.push((object, bag));
    }
}

impl FlexAttributeManager for MemoryFlexStore {
    fn load(&self, object: &ObjectKey, revision: RevisionNumber) -> Result<AttributeBag> {
        Ok(self
            .bags
            .get(&object.as_current())
            .and_then(|history| {
                history
                    .iter()
                    .rev()
                    .find(|(from, _)| *from <= revision)
                    .and_then(|(_, bag)| bag.clone())
            })
            .unwrap_or_default())
    }

    fn store(&self, object: &ObjectKey, changes: &AttributeBag, ctx: &CommitContext) -> Result<bool> {
        if self.read_only.load(Ordering::Relaxed) {
            return Ok(false);
        }
        let object = object.as_current();
        let mut bag = self.newest(&object);
        for (name, value) in changes {
            if value.is_null() {
                bag.remove(name);
            } else {
                bag.insert(name.clone(), value.clone());
            }
        }
        self.stage(ctx.txn, object.clone(), Some(bag));
        self.stores.fetch_add(1, Ordering::Relaxed);
        trace!(target: "chronicle::storage", %object, txn = %ctx.txn, "flex attributes staged");
        Ok(true)
    }

    fn delete(&self, object: &ObjectKey, ctx: &CommitContext) -> Result<bool> {
        if self.read_only.load(Ordering::Relaxed) {
            return Ok(false);
        }
        let object = object.as_current();
        trace!(target: "chronicle::storage", %object, txn = %ctx.txn, "flex removal staged");
        self.stage(ctx.txn, object, None);
        Ok(true)
    }

    fn publish(&self, txn: TxnId, revision: RevisionNumber) {
        let Some((_, staged)) = self.staged.remove(&txn) else {
            return;
        };
        let published = staged.len();
        for (object, bag) in staged {
            let mut history = self.bags.entry(object).or_default();
            if bag.is_none() && history.last().map_or(true, |(_, b)| b.is_none()) {
                continue;
            }
            history.push((revision, bag));
        }
        debug!(target: "chronicle::storage", %txn, revision, published, "flex attributes published");
    }

    fn discard(&self, txn: TxnId) {
        if self.staged.remove(&txn).is_some() {
            debug!(target: "chronicle::storage", %txn, "staged flex attributes discarded");
        }
    }
}
