//! Sharded in-memory backing store
//!
//! DashMap + HashMap, one shard per `(branch, type)`.
//!
//! # Design
//!
//! - DashMap: sharded, reads never wait on writers of other shards
//! - FxHashMap: O(1) lookups by object name inside a shard
//! - VersionChain: every state an object ever had, newest first
//!
//! # Revision handling
//!
//! A write at revision `r` closes the open state at `r` and pushes a new
//! state valid from `r`. Readers at any revision below `r` keep seeing the
//! closed state, so a commit in progress is invisible to them.

use crate::stored_value::StoredState;
use chronicle_core::{
    normalize, AttributeDelta, Attributes, BackingStore, BranchId, Error, ObjectKey,
    ObjectLifecycle, ObjectName, Result, RevisionNumber, TypeName,
};
use dashmap::DashMap;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Version chain of one object
///
/// States are stored newest first. Consecutive states either belong to the
/// same incarnation (the older one closed where the newer one starts) or are
/// separated by a deletion gap.
#[derive(Debug, Default, Clone)]
pub struct VersionChain {
    versions: VecDeque<StoredState>,
}

impl VersionChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self {
            versions: VecDeque::with_capacity(4),
        }
    }

    /// Newest state
    #[inline]
    pub fn latest(&self) -> Option<&StoredState> {
        self.versions.front()
    }

    /// Whether the newest state is open
    pub fn is_alive(&self) -> bool {
        self.latest().map_or(false, StoredState::is_open)
    }

    /// Newest state with `valid_from <= revision`, alive or not
    pub fn state_at(&self, revision: RevisionNumber) -> Option<(usize, &StoredState)> {
        self.versions
            .iter()
            .enumerate()
            .find(|(_, s)| s.valid_from() <= revision)
    }

    /// State alive at `revision`
    pub fn get_at_revision(&self, revision: RevisionNumber) -> Option<&StoredState> {
        self.state_at(revision)
            .map(|(_, s)| s)
            .filter(|s| s.covers(revision))
    }

    /// Check that `delta` can be applied to the newest state
    pub fn check(&self, key: &ObjectKey, delta: &AttributeDelta) -> Result<()> {
        check_delta(key, delta, self.is_alive())
    }

    /// Apply a row write at `revision`
    ///
    /// Writes at the revision of the newest state amend that state in place.
    pub fn apply(
        &mut self,
        key: &ObjectKey,
        delta: &AttributeDelta,
        revision: RevisionNumber,
    ) -> Result<()> {
        self.check(key, delta)?;
        if let Some(latest) = self.latest() {
            if latest.valid_from() > revision {
                return Err(Error::storage(format!(
                    "write to {} at revision {} precedes state from revision {}",
                    key,
                    revision,
                    latest.valid_from()
                )));
            }
        }
        match delta {
            AttributeDelta::Create(values) => {
                self.versions
                    .push_front(StoredState::created(normalize(values.clone()), revision));
            }
            AttributeDelta::Update(changes) => {
                let Some(latest) = self.versions.front_mut() else {
                    return Err(Error::storage(format!("cannot write {}: no state", key)));
                };
                if latest.valid_from() == revision {
                    let values = latest.values_mut();
                    for (name, value) in changes {
                        if value.is_null() {
                            values.remove(name);
                        } else {
                            values.insert(name.clone(), value.clone());
                        }
                    }
                } else {
                    let mut values = latest.values().clone();
                    for (name, value) in changes {
                        if value.is_null() {
                            values.remove(name);
                        } else {
                            values.insert(name.clone(), value.clone());
                        }
                    }
                    latest.close(revision);
                    let next = latest.successor(values, revision);
                    self.versions.push_front(next);
                }
            }
            AttributeDelta::Delete => {
                let Some(latest) = self.versions.front_mut() else {
                    return Err(Error::storage(format!("cannot delete {}: no state", key)));
                };
                if latest.valid_from() == revision {
                    self.versions.pop_front();
                } else {
                    latest.close(revision);
                }
            }
        }
        Ok(())
    }

    /// Undo the write applied at `revision`
    ///
    /// Drops a state that starts at `revision` and reopens the state it
    /// closed. Returns whether anything changed.
    pub fn revert(&mut self, revision: RevisionNumber) -> bool {
        let mut changed = false;
        if self.latest().map_or(false, |s| s.valid_from() == revision) {
            self.versions.pop_front();
            changed = true;
        }
        if let Some(latest) = self.versions.front_mut() {
            if latest.valid_to() == Some(revision) {
                latest.reopen();
                changed = true;
            }
        }
        changed
    }

    /// Lifecycle classification at `revision`
    pub fn lifecycle(&self, revision: RevisionNumber) -> ObjectLifecycle {
        match self.state_at(revision) {
            None => ObjectLifecycle::NotYetCreated {
                created_at: self.versions.back().map(StoredState::created_at),
            },
            Some((_, state)) if state.covers(revision) => ObjectLifecycle::Alive {
                values: state.values().clone(),
                valid_from: state.valid_from(),
                valid_to: state.valid_to(),
                created_at: state.created_at(),
            },
            Some((index, state)) => ObjectLifecycle::Deleted {
                deleted_at: state.valid_to().unwrap_or(revision),
                recreated_at: index
                    .checked_sub(1)
                    .and_then(|newer| self.versions.get(newer))
                    .map(StoredState::created_at),
            },
        }
    }

    /// Remove states closed at or before `keep_from`
    ///
    /// Keeps at least the newest state. Returns the number of removed states.
    pub fn gc(&mut self, keep_from: RevisionNumber) -> usize {
        let mut removed = 0;
        while self.versions.len() > 1 {
            match self.versions.back().and_then(StoredState::valid_to) {
                Some(to) if to <= keep_from => {
                    self.versions.pop_back();
                    removed += 1;
                }
                _ => break,
            }
        }
        removed
    }

    /// Number of states stored
    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    /// Whether the chain holds no state
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// Check a row write against the liveness of its key
fn check_delta(key: &ObjectKey, delta: &AttributeDelta, alive: bool) -> Result<()> {
    match (delta, alive) {
        (AttributeDelta::Create(_), true) => Err(Error::invalid_operation(format!(
            "cannot create {}: already alive",
            key
        ))),
        (AttributeDelta::Update(_) | AttributeDelta::Delete, false) => {
            Err(Error::storage(format!("cannot write {}: not alive", key)))
        }
        _ => Ok(()),
    }
}

/// Objects of one type on one branch
#[derive(Debug, Default)]
pub struct Shard {
    pub(crate) data: FxHashMap<ObjectName, VersionChain>,
}

/// In-memory [`BackingStore`]
///
/// Shared by every node of a cluster. Holds full revision history until
/// [`BackingStore::cleanup_history`] is called.
#[derive(Debug, Default)]
pub struct ShardedStore {
    shards: DashMap<(BranchId, TypeName), Shard>,
    writes: AtomicU64,
}

impl ShardedStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of row writes applied so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of states stored for `key`
    pub fn version_count(&self, key: &ObjectKey) -> usize {
        self.shards
            .get(&(key.branch, key.type_name.clone()))
            .and_then(|shard| shard.data.get(&key.name).map(VersionChain::version_count))
            .unwrap_or(0)
    }

    fn shard_key(key: &ObjectKey) -> (BranchId, TypeName) {
        (key.branch, key.type_name.clone())
    }
}

impl BackingStore for ShardedStore {
    fn write(&self, key: &ObjectKey, delta: &AttributeDelta, revision: RevisionNumber) -> Result<()> {
        let mut shard = self.shards.entry(Self::shard_key(key)).or_default();
        let emptied = {
            let chain = shard.data.entry(key.name).or_default();
            chain.apply(key, delta, revision)?;
            chain.is_empty()
        };
        if emptied {
            shard.data.remove(&key.name);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        trace!(target: "chronicle::storage", %key, revision, "row written");
        Ok(())
    }

    fn write_batch(&self, writes: &[(ObjectKey, AttributeDelta)], revision: RevisionNumber) -> Result<()> {
        // Check every write against the current chains before touching any.
        for (key, delta) in writes {
            let alive = self
                .shards
                .get(&Self::shard_key(key))
                .and_then(|shard| shard.data.get(&key.name).map(VersionChain::is_alive))
                .unwrap_or(false);
            // A key appears at most once per commit, so each check stands alone.
            check_delta(key, delta, alive)?;
        }
        for (done, (key, delta)) in writes.iter().enumerate() {
            if let Err(e) = self.write(key, delta, revision) {
                self.revert_batch(&writes[..done], revision)?;
                return Err(e);
            }
        }
        debug!(target: "chronicle::storage", revision, writes = writes.len(), "batch written");
        Ok(())
    }

    fn revert_batch(&self, writes: &[(ObjectKey, AttributeDelta)], revision: RevisionNumber) -> Result<()> {
        for (key, _) in writes {
            let Some(mut shard) = self.shards.get_mut(&Self::shard_key(key)) else {
                continue;
            };
            let emptied = match shard.data.get_mut(&key.name) {
                Some(chain) => {
                    chain.revert(revision);
                    chain.is_empty()
                }
                None => false,
            };
            if emptied {
                shard.data.remove(&key.name);
            }
        }
        debug!(target: "chronicle::storage", revision, writes = writes.len(), "batch reverted");
        Ok(())
    }

    fn read_as_of(&self, key: &ObjectKey, revision: RevisionNumber) -> Result<Option<Attributes>> {
        Ok(self.shards.get(&Self::shard_key(key)).and_then(|shard| {
            shard
                .data
                .get(&key.name)
                .and_then(|chain| chain.get_at_revision(revision))
                .map(|state| state.values().clone())
        }))
    }

    fn lifecycle(&self, key: &ObjectKey, revision: RevisionNumber) -> Result<ObjectLifecycle> {
        Ok(self
            .shards
            .get(&Self::shard_key(key))
            .and_then(|shard| shard.data.get(&key.name).map(|chain| chain.lifecycle(revision)))
            .unwrap_or(ObjectLifecycle::NotYetCreated { created_at: None }))
    }

    fn scan(
        &self,
        branch: BranchId,
        type_name: &TypeName,
        revision: RevisionNumber,
        predicate: &dyn Fn(&Attributes) -> bool,
    ) -> Result<Vec<(ObjectKey, Attributes)>> {
        let Some(shard) = self.shards.get(&(branch, type_name.clone())) else {
            return Ok(Vec::new());
        };
        let mut result: Vec<(ObjectKey, Attributes)> = shard
            .data
            .iter()
            .filter_map(|(name, chain)| {
                chain
                    .get_at_revision(revision)
                    .filter(|state| predicate(state.values()))
                    .map(|state| {
                        (
                            ObjectKey::current(branch, type_name.clone(), *name),
                            state.values().clone(),
                        )
                    })
            })
            .collect();
        result.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        Ok(result)
    }

    fn cleanup_history(&self, keep_from: RevisionNumber) -> Result<usize> {
        let mut removed = 0;
        for mut shard in self.shards.iter_mut() {
            for chain in shard.data.values_mut() {
                removed += chain.gc(keep_from);
            }
        }
        debug!(target: "chronicle::storage", keep_from, removed, "history cleaned up");
        Ok(removed)
    }
}
