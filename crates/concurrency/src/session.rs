//! Session revision tracking and the reclamation watermark
//!
//! Each session owns a [`SessionRevisionTracker`]: a pointer into the update
//! chain that only moves when the session asks for it. Moving the pointer
//! replays every intermediate event into the caches the session has read,
//! in chain order.
//!
//! ## Watermark
//!
//! Sessions, pinned items and open iterators register a [`Pin`] with the
//! node's [`PinRegistry`]. The minimum pinned revision is the watermark:
//! cache versions and chain links below it can never be read again.

use crate::chain::UpdateChainLink;
use chronicle_core::{RevisionNumber, SessionId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

// ============================================================================
// Pins
// ============================================================================

/// Registry of pinned revisions of one node
#[derive(Debug, Default)]
pub struct PinRegistry {
    pins: Mutex<BTreeMap<u64, RevisionNumber>>,
    next_id: AtomicU64,
}

impl PinRegistry {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pin `revision` until the returned guard is dropped
    pub fn pin(self: &Arc<Self>, revision: RevisionNumber) -> Pin {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pins.lock().insert(id, revision);
        Pin {
            registry: Arc::clone(self),
            id,
            revision,
        }
    }

    /// Minimum pinned revision, or `fallback` when nothing is pinned
    pub fn watermark(&self, fallback: RevisionNumber) -> RevisionNumber {
        self.pins
            .lock()
            .values()
            .copied()
            .min()
            .unwrap_or(fallback)
    }

    /// Number of live pins
    pub fn len(&self) -> usize {
        self.pins.lock().len()
    }

    /// Whether nothing is pinned
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Guard keeping one revision pinned
#[derive(Debug)]
pub struct Pin {
    registry: Arc<PinRegistry>,
    id: u64,
    revision: RevisionNumber,
}

impl Pin {
    /// Pinned revision
    pub fn revision(&self) -> RevisionNumber {
        self.revision
    }

    /// Move the pin to another revision
    pub fn move_to(&mut self, revision: RevisionNumber) {
        self.registry.pins.lock().insert(self.id, revision);
        self.revision = revision;
    }
}

impl Drop for Pin {
    fn drop(&mut self) {
        self.registry.pins.lock().remove(&self.id);
    }
}

// ============================================================================
// Session tracker
// ============================================================================

/// Something that consumes chain events on behalf of a session
///
/// Caches implement this so a session's `advance()` brings every cache it
/// has read up to the new revision.
pub trait ChainFollower: Send + Sync {
    /// Apply every event up to and including `link`
    fn follow(&self, link: &Arc<UpdateChainLink>);
}

/// Per-session pointer into the update chain
pub struct SessionRevisionTracker {
    id: SessionId,
    link: RwLock<Arc<UpdateChainLink>>,
    pin: Mutex<Pin>,
    followers: Mutex<Vec<Weak<dyn ChainFollower>>>,
}

impl SessionRevisionTracker {
    /// Create a tracker positioned at `link`
    pub fn new(id: SessionId, link: Arc<UpdateChainLink>, pins: &Arc<PinRegistry>) -> Self {
        let pin = pins.pin(link.revision());
        Self {
            id,
            link: RwLock::new(link),
            pin: Mutex::new(pin),
            followers: Mutex::new(Vec::new()),
        }
    }

    /// Session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current chain position
    pub fn link(&self) -> Arc<UpdateChainLink> {
        Arc::clone(&self.link.read())
    }

    /// Revision the session currently sees
    pub fn revision(&self) -> RevisionNumber {
        self.link.read().revision()
    }

    /// Register a follower the session has read from
    ///
    /// Registering the same follower twice is a no-op.
    pub fn touch(&self, follower: &Arc<dyn ChainFollower>) {
        let mut followers = self.followers.lock();
        let ptr = Arc::as_ptr(follower) as *const ();
        if followers
            .iter()
            .any(|f| f.as_ptr() as *const () == ptr)
        {
            return;
        }
        followers.push(Arc::downgrade(follower));
    }

    /// Number of live followers
    pub fn follower_count(&self) -> usize {
        self.followers
            .lock()
            .iter()
            .filter(|f| f.strong_count() > 0)
            .count()
    }

    /// Move to the newest published link
    pub fn advance(&self) -> RevisionNumber {
        let newest = self.link().newest();
        self.advance_until(newest)
    }

    /// Move forward, stopping at the newest link not beyond `revision`
    ///
    /// Never moves backwards.
    pub fn advance_to(&self, revision: RevisionNumber) -> RevisionNumber {
        let target = self.link().walk_to(revision);
        self.advance_until(target)
    }

    /// Move forward to `target`, which must be reachable from the current link
    pub fn advance_until(&self, target: Arc<UpdateChainLink>) -> RevisionNumber {
        let current = self.link();
        if target.revision() <= current.revision() {
            return current.revision();
        }

        let followers: Vec<Arc<dyn ChainFollower>> = {
            let mut followers = self.followers.lock();
            followers.retain(|f| f.strong_count() > 0);
            followers.iter().filter_map(Weak::upgrade).collect()
        };
        for link in current.links_until(&target) {
            for follower in &followers {
                follower.follow(&link);
            }
        }

        let revision = target.revision();
        *self.link.write() = target;
        self.pin.lock().move_to(revision);
        trace!(
            target: "chronicle::chain",
            session = %self.id,
            from = current.revision(),
            to = revision,
            "session advanced"
        );
        revision
    }
}
