//! Update chain: the forward-only list of committed events
//!
//! Every session and every cache holds an `Arc` to some link of the chain
//! and walks forward by following `next`. A link is created with its event
//! complete and becomes reachable through a single `OnceCell::set` on its
//! predecessor, so readers never block and never observe a half-built
//! commit.
//!
//! ## Reclamation
//!
//! Links are reference counted. Once no session, cache or iterator holds a
//! link (or any link before it), the prefix is dropped. `Drop` unlinks
//! iteratively so very long chains do not overflow the stack.

use chronicle_core::{Error, Result, RevisionNumber, UpdateEvent};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// One node of the update chain
pub struct UpdateChainLink {
    revision: RevisionNumber,
    event: Option<Arc<UpdateEvent>>,
    next: OnceCell<Arc<UpdateChainLink>>,
}

impl UpdateChainLink {
    /// Starting link of a chain; carries no event
    pub fn anchor(revision: RevisionNumber) -> Arc<Self> {
        Arc::new(Self {
            revision,
            event: None,
            next: OnceCell::new(),
        })
    }

    fn with_event(event: UpdateEvent) -> Arc<Self> {
        Arc::new(Self {
            revision: event.revision,
            event: Some(Arc::new(event)),
            next: OnceCell::new(),
        })
    }

    /// Revision this link leads to
    pub fn revision(&self) -> RevisionNumber {
        self.revision
    }

    /// Event that produced this link (`None` for the anchor)
    pub fn event(&self) -> Option<&Arc<UpdateEvent>> {
        self.event.as_ref()
    }

    /// Successor, once published
    pub fn next(&self) -> Option<&Arc<UpdateChainLink>> {
        self.next.get()
    }

    /// Newest link reachable from this one
    pub fn newest(self: &Arc<Self>) -> Arc<Self> {
        let mut current = Arc::clone(self);
        while let Some(next) = current.next().cloned() {
            current = next;
        }
        current
    }

    /// Newest reachable link whose revision does not exceed `revision`
    pub fn walk_to(self: &Arc<Self>, revision: RevisionNumber) -> Arc<Self> {
        let mut current = Arc::clone(self);
        while let Some(next) = current.next().filter(|n| n.revision <= revision).cloned() {
            current = next;
        }
        current
    }

    /// Links after this one, up to and including `target`
    ///
    /// Yields nothing when `target` is not ahead of this link.
    pub fn links_until(self: &Arc<Self>, target: &Arc<Self>) -> Vec<Arc<Self>> {
        let mut links = Vec::new();
        let mut current = Arc::clone(self);
        while current.revision < target.revision {
            match current.next().cloned() {
                Some(next) => {
                    links.push(Arc::clone(&next));
                    current = next;
                }
                None => break,
            }
        }
        links
    }
}

impl fmt::Debug for UpdateChainLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateChainLink")
            .field("revision", &self.revision)
            .field("has_event", &self.event.is_some())
            .field("has_next", &self.next.get().is_some())
            .finish()
    }
}

impl Drop for UpdateChainLink {
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(link) = next {
            match Arc::try_unwrap(link) {
                Ok(mut owned) => next = owned.next.take(),
                Err(_) => break,
            }
        }
    }
}

/// Publishing end of the update chain
///
/// Only committers (and replay) append. The tail lock serializes appends;
/// readers never take it on the hot path.
#[derive(Debug)]
pub struct UpdateChain {
    tail: Mutex<Arc<UpdateChainLink>>,
}

impl UpdateChain {
    /// Create a chain anchored at `revision`
    pub fn new(revision: RevisionNumber) -> Self {
        Self {
            tail: Mutex::new(UpdateChainLink::anchor(revision)),
        }
    }

    /// Newest published link
    pub fn tail(&self) -> Arc<UpdateChainLink> {
        Arc::clone(&self.tail.lock())
    }

    /// Revision of the newest published link
    pub fn latest_revision(&self) -> RevisionNumber {
        self.tail.lock().revision
    }

    /// Check that `event` would be accepted as the next link
    ///
    /// # Errors
    ///
    /// Returns `ReplicationGap` if the event does not start at the current
    /// tail, and `InvalidOperation` if its revision does not advance.
    pub fn check_next(&self, event: &UpdateEvent) -> Result<()> {
        check_follows(&self.tail.lock(), event)
    }

    /// Publish a complete event as the new tail
    ///
    /// # Errors
    ///
    /// Fails like [`UpdateChain::check_next`].
    pub fn publish(&self, event: UpdateEvent) -> Result<Arc<UpdateChainLink>> {
        let mut tail = self.tail.lock();
        check_follows(&tail, &event)?;
        let link = UpdateChainLink::with_event(event);
        tail.next
            .set(Arc::clone(&link))
            .map_err(|_| Error::corruption(format!("chain link {} already has a successor", tail.revision)))?;
        trace!(target: "chronicle::chain", revision = link.revision, "link published");
        *tail = Arc::clone(&link);
        Ok(link)
    }
}

fn check_follows(tail: &UpdateChainLink, event: &UpdateEvent) -> Result<()> {
    if event.previous_revision != tail.revision {
        return Err(Error::ReplicationGap {
            expected: tail.revision,
            previous: event.previous_revision,
            found: event.revision,
        });
    }
    if event.revision <= tail.revision {
        return Err(Error::invalid_operation(format!(
            "event revision {} does not advance chain at {}",
            event.revision, tail.revision
        )));
    }
    Ok(())
}
