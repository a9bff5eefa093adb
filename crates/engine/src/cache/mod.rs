//! Derived caches kept consistent with the committed history
//!
//! A [`Cache`] holds a value derived from the store (an index, an ordered
//! list, anything a [`CacheHandler`] can compute) in two layers:
//!
//! - **global versions**, each tagged with the revision it became valid at,
//!   advanced by replaying chain events in commit order
//! - **overlays**, one per open transaction, patched with the
//!   transaction's local changes and dropped at commit or rollback
//!
//! A reader inside a transaction sees its overlay; every other reader sees
//! the global version valid at its session revision.
//!
//! ## Copy on change
//!
//! While some session is pinned below an event's revision, the version
//! before that event must stay readable, so the handler is asked to copy
//! instead of mutating. With nobody behind, the newest version is patched
//! in place.

pub mod indexed;
pub mod iter;
mod links;
pub mod order;
pub mod ordered;
pub mod overlay;
pub mod registry;

pub use indexed::{IndexedLinkCache, IndexedLinks, IndexedLinksHandler, IndexedView};
pub use iter::FailFastIter;
pub use order::{plan_insert, plan_sequence, InsertPlan, ORDER_APPEND_GAP, ORDER_INSERT_GAP};
pub use ordered::{OrderedLinkCache, OrderedLinks, OrderedLinksHandler, OrderedView};
pub use overlay::{OverlayHost, TxnOverlays, ViewContext};
pub use registry::{CacheCounters, CacheId, CacheMaintenance, CacheRegistry, CacheStats};

use chronicle_concurrency::{ChainFollower, LocalChange, PinRegistry, UpdateChainLink};
use chronicle_core::{Attributes, ObjectKey, Result, RevisionNumber, TxnId, UpdateEvent, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

/// Outcome of replaying one event into a cache value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    /// The event does not affect the value
    Unchanged,
    /// The value was updated
    Changed,
    /// The value cannot be maintained; rebuild on the next read
    Invalid,
}

/// Computes and maintains one derived value
pub trait CacheHandler: Send + Sync + 'static {
    /// Derived value
    type Value: Clone + Send + Sync + 'static;

    /// Human readable identity, used in errors and logs
    fn describe(&self) -> String;

    /// Compute the value from the store as of `revision`
    fn build(&self, revision: RevisionNumber) -> Result<Self::Value>;

    /// Apply a committed event
    ///
    /// With `copy_on_change` the value behind `current` must not be mutated
    /// in place; replace it (see [`make_writable`]).
    fn handle_event(
        &self,
        current: &mut Arc<Self::Value>,
        event: &UpdateEvent,
        copy_on_change: bool,
    ) -> CacheUpdate;

    /// Patch an overlay with an object created by the transaction
    ///
    /// Returns whether the value changed.
    fn handle_local_creation(
        &self,
        value: &mut Self::Value,
        key: &ObjectKey,
        values: &Attributes,
    ) -> bool;

    /// Patch an overlay with an object deleted by the transaction
    fn handle_local_deletion(
        &self,
        value: &mut Self::Value,
        key: &ObjectKey,
        values: &Attributes,
    ) -> bool;

    /// Patch an overlay with an attribute written by the transaction
    fn handle_local_change(
        &self,
        value: &mut Self::Value,
        key: &ObjectKey,
        attribute: &str,
        old: &Value,
        new: &Value,
        values: &Attributes,
    ) -> bool;
}

/// Mutable access to a cache value, copying it first when required
pub fn make_writable<V: Clone>(current: &mut Arc<V>, copy_on_change: bool) -> &mut V {
    if copy_on_change {
        *current = Arc::new(V::clone(&**current));
    }
    Arc::make_mut(current)
}

/// One cache value as seen by a reader
#[derive(Debug)]
pub struct Snapshot<V> {
    stamp: u64,
    value: Arc<V>,
}

impl<V> Snapshot<V> {
    fn new(value: V, stamp: u64) -> Self {
        Self {
            stamp,
            value: Arc::new(value),
        }
    }

    /// Modification stamp; changes whenever the value does
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    /// Shared value
    pub fn value(&self) -> &Arc<V> {
        &self.value
    }
}

impl<V> Clone for Snapshot<V> {
    fn clone(&self) -> Self {
        Self {
            stamp: self.stamp,
            value: Arc::clone(&self.value),
        }
    }
}

impl<V> std::ops::Deref for Snapshot<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

struct Version<V> {
    valid_from: RevisionNumber,
    stamp: u64,
    value: Arc<V>,
}

struct GlobalState<V> {
    /// Last chain link replayed into `versions`
    link: Arc<UpdateChainLink>,
    versions: VecDeque<Version<V>>,
    /// Values built for revisions older than every version
    historic: BTreeMap<RevisionNumber, Snapshot<V>>,
}

impl<V> GlobalState<V> {
    fn lookup(&self, revision: RevisionNumber) -> Option<Snapshot<V>> {
        if revision <= self.link.revision() {
            if let Some(version) = self.versions.iter().rev().find(|v| v.valid_from <= revision) {
                return Some(Snapshot {
                    stamp: version.stamp,
                    value: Arc::clone(&version.value),
                });
            }
        }
        self.historic.get(&revision).cloned()
    }
}

/// A derived value with global versions and transaction overlays
pub struct Cache<H: CacheHandler> {
    handler: H,
    description: String,
    pins: Arc<PinRegistry>,
    global: Mutex<GlobalState<H::Value>>,
    overlays: Mutex<FxHashMap<TxnId, Snapshot<H::Value>>>,
    counters: Arc<CacheCounters>,
}

impl<H: CacheHandler> Cache<H> {
    /// Create an empty cache positioned at `link`; nothing is built until
    /// the first read
    pub fn new(
        handler: H,
        link: Arc<UpdateChainLink>,
        pins: Arc<PinRegistry>,
        counters: Arc<CacheCounters>,
    ) -> Self {
        let description = handler.describe();
        Self {
            handler,
            description,
            pins,
            global: Mutex::new(GlobalState {
                link,
                versions: VecDeque::new(),
                historic: BTreeMap::new(),
            }),
            overlays: Mutex::new(FxHashMap::default()),
            counters,
        }
    }

    /// Handler computing the value
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Cache identity for errors and logs
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Value for `ctx`: the transaction overlay if the reader has an open
    /// transaction, else the global version at the session revision
    pub fn value(self: &Arc<Self>, ctx: &ViewContext) -> Result<Snapshot<H::Value>> {
        let follower: Arc<dyn ChainFollower> = self.clone();
        ctx.tracker.touch(&follower);
        match ctx.active_txn() {
            Some(txn) => self.overlay(txn),
            None => self.global_at(&ctx.tracker.link()),
        }
    }

    /// Global version valid at `target`, catching up or building as needed
    pub fn global_at(&self, target: &Arc<UpdateChainLink>) -> Result<Snapshot<H::Value>> {
        let revision = target.revision();
        {
            let mut state = self.global.lock();
            self.catch_up(&mut state, target);
            if let Some(snapshot) = state.lookup(revision) {
                return Ok(snapshot);
            }
        }

        let value = self.handler.build(revision)?;
        self.counters.record_rebuild();
        debug!(target: "chronicle::cache", cache = %self.description, revision, "cache built");

        let mut state = self.global.lock();
        if let Some(snapshot) = state.lookup(revision) {
            return Ok(snapshot);
        }
        let snapshot = Snapshot::new(value, self.counters.next_stamp());
        if state.versions.is_empty() && state.link.revision() == revision {
            state.versions.push_back(Version {
                valid_from: revision,
                stamp: snapshot.stamp,
                value: Arc::clone(&snapshot.value),
            });
        } else {
            state.historic.insert(revision, snapshot.clone());
        }
        Ok(snapshot)
    }

    /// Number of global versions currently held
    pub fn version_count(&self) -> usize {
        self.global.lock().versions.len()
    }

    /// Number of open overlays
    pub fn overlay_count(&self) -> usize {
        self.overlays.lock().len()
    }

    fn overlay(self: &Arc<Self>, txn: &Arc<TxnOverlays>) -> Result<Snapshot<H::Value>> {
        if let Some(snapshot) = self.overlays.lock().get(&txn.id()) {
            return Ok(snapshot.clone());
        }
        let base = self.global_at(txn.read_link())?;
        let host: Arc<dyn OverlayHost> = self.clone();
        Ok(txn.attach(&host, |changes| {
            let mut value = H::Value::clone(&base.value);
            for change in changes {
                self.apply_local_change(&mut value, change);
            }
            let snapshot = Snapshot::new(value, self.counters.next_stamp());
            self.overlays.lock().insert(txn.id(), snapshot.clone());
            snapshot
        }))
    }

    fn apply_local_change(&self, value: &mut H::Value, change: &LocalChange) -> bool {
        match change {
            LocalChange::Created { key, values } => {
                self.handler.handle_local_creation(value, key, values)
            }
            LocalChange::Deleted { key, values } => {
                self.handler.handle_local_deletion(value, key, values)
            }
            LocalChange::Changed {
                key,
                attribute,
                old,
                new,
                values,
            } => self
                .handler
                .handle_local_change(value, key, attribute, old, new, values),
        }
    }

    fn catch_up(&self, state: &mut GlobalState<H::Value>, target: &Arc<UpdateChainLink>) {
        if state.link.revision() >= target.revision() {
            return;
        }
        for link in state.link.links_until(target) {
            if let Some(event) = link.event() {
                self.apply_event(state, event);
            }
            state.link = link;
        }
    }

    fn apply_event(&self, state: &mut GlobalState<H::Value>, event: &UpdateEvent) {
        let Some(last) = state.versions.back_mut() else {
            // Nothing built yet; the next read builds at its own revision.
            return;
        };
        self.counters.record_event();
        let copy = self.pins.watermark(event.revision) < event.revision;

        let update = if copy {
            let mut next = Arc::clone(&last.value);
            let update = self.handler.handle_event(&mut next, event, true);
            if update == CacheUpdate::Changed {
                state.versions.push_back(Version {
                    valid_from: event.revision,
                    stamp: self.counters.next_stamp(),
                    value: next,
                });
            }
            update
        } else {
            let update = self.handler.handle_event(&mut last.value, event, false);
            if update == CacheUpdate::Changed {
                last.valid_from = event.revision;
                last.stamp = self.counters.next_stamp();
                // Nobody reads below this event any more
                let keep = state.versions.len() - 1;
                state.versions.drain(..keep);
            }
            update
        };

        match update {
            CacheUpdate::Unchanged => {}
            CacheUpdate::Changed => trace!(
                target: "chronicle::cache",
                cache = %self.description,
                revision = event.revision,
                copied = copy,
                "cache advanced"
            ),
            CacheUpdate::Invalid => {
                state.versions.clear();
                debug!(
                    target: "chronicle::cache",
                    cache = %self.description,
                    revision = event.revision,
                    "cache invalidated"
                );
            }
        }
    }
}

impl<H: CacheHandler> ChainFollower for Cache<H> {
    fn follow(&self, link: &Arc<UpdateChainLink>) {
        let mut state = self.global.lock();
        self.catch_up(&mut state, link);
    }
}

impl<H: CacheHandler> OverlayHost for Cache<H> {
    fn apply_local(&self, txn: TxnId, change: &LocalChange) {
        let mut overlays = self.overlays.lock();
        if let Some(snapshot) = overlays.get_mut(&txn) {
            let value = Arc::make_mut(&mut snapshot.value);
            if self.apply_local_change(value, change) {
                snapshot.stamp = self.counters.next_stamp();
            }
        }
    }

    fn discard(&self, txn: TxnId) {
        self.overlays.lock().remove(&txn);
    }
}

impl<H: CacheHandler> CacheMaintenance for Cache<H> {
    fn evict(&self, watermark: RevisionNumber) {
        let mut state = self.global.lock();
        if state.link.revision() < watermark {
            // Nobody reads below the watermark; release the links behind it
            let target = state.link.walk_to(watermark);
            self.catch_up(&mut state, &target);
        }
        let keep_from = state
            .versions
            .iter()
            .rposition(|v| v.valid_from <= watermark)
            .unwrap_or(0);
        state.versions.drain(..keep_from);
        state.historic.retain(|revision, _| *revision >= watermark);
    }

    fn describe(&self) -> &str {
        &self.description
    }
}

impl<H: CacheHandler> std::fmt::Debug for Cache<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("description", &self.description)
            .field("versions", &self.version_count())
            .field("overlays", &self.overlay_count())
            .finish()
    }
}
