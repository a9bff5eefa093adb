//! Item: a handle on one object across revisions
//!
//! An [`Item`] caches the states of one data key it has been asked about,
//! each tagged with the half-open revision range `[from, to)` it holds for.
//! Ranges come from the store's lifecycle classification, so a cached alive
//! state ends exactly where the object was deleted and never covers a later
//! incarnation.
//!
//! The newest state of an object has no upper bound in the store. The cached
//! range is closed one past the newest revision the node has applied, so a
//! later commit is always looked up again.

use crate::database::Database;
use crate::session::Session;
use chronicle_concurrency::Pin;
use chronicle_core::{Attributes, Error, ObjectKey, ObjectLifecycle, Result, RevisionNumber};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Classification of an object at one revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemState {
    /// Alive with these values
    Alive(Arc<Attributes>),
    /// Not created yet
    NotYetCreated,
    /// Deleted at `deleted_at` and not recreated since
    Deleted {
        /// Revision of the deletion
        deleted_at: RevisionNumber,
    },
}

impl ItemState {
    /// Values if alive
    pub fn values(&self) -> Option<&Arc<Attributes>> {
        match self {
            ItemState::Alive(values) => Some(values),
            _ => None,
        }
    }

    /// Whether the object is alive
    pub fn is_alive(&self) -> bool {
        matches!(self, ItemState::Alive(_))
    }
}

#[derive(Debug, Clone)]
struct CachedState {
    from: RevisionNumber,
    to: RevisionNumber,
    state: ItemState,
}

impl CachedState {
    fn covers(&self, revision: RevisionNumber) -> bool {
        self.from <= revision && revision < self.to
    }
}

/// Handle on one object, caching its states per revision range
pub struct Item {
    db: Arc<Database>,
    key: ObjectKey,
    snapshots: Mutex<SmallVec<[CachedState; 4]>>,
    pin: Mutex<Option<Pin>>,
}

impl Item {
    /// Handle on the data key `key`
    pub(crate) fn new(db: Arc<Database>, key: ObjectKey) -> Result<Self> {
        if !key.is_current() {
            return Err(Error::invalid_operation(format!(
                "item handles need a current key, got {}",
                key
            )));
        }
        Ok(Self {
            db,
            key,
            snapshots: Mutex::new(SmallVec::new()),
            pin: Mutex::new(None),
        })
    }

    /// Data key of the object
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// State of the object at `revision`
    pub fn state_at(&self, revision: RevisionNumber) -> Result<ItemState> {
        if let Some(cached) = self.snapshots.lock().iter().find(|s| s.covers(revision)) {
            return Ok(cached.state.clone());
        }

        let open_end = self.db.latest_revision().max(revision) + 1;
        let lifecycle = self.db.backend().store().lifecycle(&self.key, revision)?;
        let cached = match lifecycle {
            ObjectLifecycle::Alive {
                values,
                valid_from,
                valid_to,
                ..
            } => CachedState {
                from: valid_from,
                to: valid_to.unwrap_or(open_end),
                state: ItemState::Alive(Arc::new(values)),
            },
            ObjectLifecycle::NotYetCreated { created_at } => CachedState {
                from: revision,
                to: created_at.unwrap_or(open_end),
                state: ItemState::NotYetCreated,
            },
            ObjectLifecycle::Deleted {
                deleted_at,
                recreated_at,
            } => CachedState {
                from: deleted_at,
                to: recreated_at.unwrap_or(open_end),
                state: ItemState::Deleted { deleted_at },
            },
        };
        trace!(
            target: "chronicle::cache",
            key = %self.key,
            from = cached.from,
            to = cached.to,
            "item state cached"
        );
        let state = cached.state.clone();
        let mut snapshots = self.snapshots.lock();
        snapshots.retain(|s| s.to <= cached.from || s.from >= cached.to);
        snapshots.push(cached);
        Ok(state)
    }

    /// Values at `revision`, `None` unless alive
    pub fn values_at(&self, revision: RevisionNumber) -> Result<Option<Arc<Attributes>>> {
        Ok(self.state_at(revision)?.values().cloned())
    }

    /// Values in the view of `session`
    ///
    /// # Errors
    ///
    /// Returns `DeletedObjectAccess` if the object is not alive there.
    pub fn get(&self, session: &Session) -> Result<Arc<Attributes>> {
        let revision = session.revision();
        self.values_at(revision)?
            .ok_or_else(|| Error::deleted_object(self.key.clone(), revision))
    }

    /// Keep `revision` readable until [`Item::unpin`] or drop
    pub fn pin_at(&self, revision: RevisionNumber) {
        let mut pin = self.pin.lock();
        match pin.as_mut() {
            Some(existing) => existing.move_to(revision),
            None => *pin = Some(self.db.pins().pin(revision)),
        }
    }

    /// Release the pin, if any
    pub fn unpin(&self) {
        self.pin.lock().take();
    }

    /// Pinned revision, if any
    pub fn pinned(&self) -> Option<RevisionNumber> {
        self.pin.lock().as_ref().map(Pin::revision)
    }

    /// Number of cached states
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().len()
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("key", &self.key)
            .field("snapshots", &self.snapshot_count())
            .field("pinned", &self.pinned())
            .finish()
    }
}
