//! Per-transaction overlay bookkeeping
//!
//! Every open transaction owns a [`TxnOverlays`]: the ordered log of its
//! local changes plus the caches holding an overlay for it. A cache builds
//! its overlay lazily from the global version at the read base by replaying
//! the log, and receives every later change as it is recorded. Commit and
//! rollback discard all overlays.

use chronicle_concurrency::{LocalChange, PinRegistry, SessionRevisionTracker, UpdateChainLink};
use chronicle_core::{RevisionNumber, TxnId};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A cache that keeps overlays for transactions
pub trait OverlayHost: Send + Sync {
    /// Patch the overlay of `txn` with one local change
    fn apply_local(&self, txn: TxnId, change: &LocalChange);

    /// Drop the overlay of `txn`
    fn discard(&self, txn: TxnId);
}

/// Local change log and overlay hosts of one transaction
pub struct TxnOverlays {
    id: TxnId,
    read_link: Arc<UpdateChainLink>,
    changes: RwLock<Vec<LocalChange>>,
    hosts: Mutex<Vec<Weak<dyn OverlayHost>>>,
    active: AtomicBool,
}

impl TxnOverlays {
    /// Overlay state of a transaction reading at `read_link`
    pub fn new(id: TxnId, read_link: Arc<UpdateChainLink>) -> Arc<Self> {
        Arc::new(Self {
            id,
            read_link,
            changes: RwLock::new(Vec::new()),
            hosts: Mutex::new(Vec::new()),
            active: AtomicBool::new(true),
        })
    }

    /// Transaction id
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Chain position of the read base
    pub fn read_link(&self) -> &Arc<UpdateChainLink> {
        &self.read_link
    }

    /// Whether the transaction is still open
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Number of recorded changes
    pub fn change_count(&self) -> usize {
        self.changes.read().len()
    }

    /// Record a change and forward it to every attached overlay
    pub fn push(&self, change: LocalChange) {
        let mut changes = self.changes.write();
        let hosts: Vec<Arc<dyn OverlayHost>> = {
            let mut hosts = self.hosts.lock();
            hosts.retain(|h| h.strong_count() > 0);
            hosts.iter().filter_map(Weak::upgrade).collect()
        };
        for host in hosts {
            host.apply_local(self.id, &change);
        }
        changes.push(change);
    }

    /// Attach `host` and build its overlay from the changes so far
    ///
    /// Holding the change log while attaching means no change can slip in
    /// between the replay and the registration.
    pub fn attach<T>(
        &self,
        host: &Arc<dyn OverlayHost>,
        build: impl FnOnce(&[LocalChange]) -> T,
    ) -> T {
        let changes = self.changes.read();
        let result = build(&changes);
        let mut hosts = self.hosts.lock();
        let ptr = Arc::as_ptr(host) as *const ();
        if !hosts.iter().any(|h| h.as_ptr() as *const () == ptr) {
            hosts.push(Arc::downgrade(host));
        }
        result
    }

    /// Close the transaction and discard every overlay
    pub fn finish(&self) {
        self.active.store(false, Ordering::Release);
        let hosts: Vec<Arc<dyn OverlayHost>> = self
            .hosts
            .lock()
            .drain(..)
            .filter_map(|h| h.upgrade())
            .collect();
        for host in hosts {
            host.discard(self.id);
        }
        self.changes.write().clear();
    }
}

impl std::fmt::Debug for TxnOverlays {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnOverlays")
            .field("id", &self.id)
            .field("read_base", &self.read_link.revision())
            .field("changes", &self.change_count())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Who is reading a cache: a session, optionally inside a transaction
#[derive(Clone)]
pub struct ViewContext {
    pub(crate) tracker: Arc<SessionRevisionTracker>,
    pub(crate) txn: Option<Arc<TxnOverlays>>,
    pub(crate) pins: Arc<PinRegistry>,
}

impl ViewContext {
    pub(crate) fn new(
        tracker: Arc<SessionRevisionTracker>,
        txn: Option<Arc<TxnOverlays>>,
        pins: Arc<PinRegistry>,
    ) -> Self {
        Self { tracker, txn, pins }
    }

    /// Open transaction of the reader, if any
    pub fn active_txn(&self) -> Option<&Arc<TxnOverlays>> {
        self.txn.as_ref().filter(|t| t.is_active())
    }

    /// Revision the reader sees
    pub fn revision(&self) -> RevisionNumber {
        match self.active_txn() {
            Some(txn) => txn.read_link.revision(),
            None => self.tracker.revision(),
        }
    }
}

impl std::fmt::Debug for ViewContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewContext")
            .field("session", &self.tracker.id())
            .field("revision", &self.revision())
            .field("txn", &self.active_txn().map(|t| t.id()))
            .finish()
    }
}
