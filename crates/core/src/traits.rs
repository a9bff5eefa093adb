//! Contracts of the external collaborators
//!
//! The consistency engine consumes its surroundings only through these
//! traits:
//! - [`SequenceService`]: monotonic named sequences (revisions, names, branches)
//! - [`BackingStore`]: versioned object rows with as-of reads
//! - [`FlexAttributeManager`]: versioned storage for undeclared attributes
//!
//! In-memory implementations live in `chronicle-storage`.

use crate::error::Result;
use crate::types::{BranchId, ObjectKey, RevisionNumber, TxnId, TypeName};
use crate::value::{Attributes, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the sequence object names are drawn from
pub const OBJECT_SEQUENCE: &str = "object";

/// Name of the sequence branch ids are drawn from
pub const BRANCH_SEQUENCE: &str = "branch";

// ============================================================================
// Sequences
// ============================================================================

/// Monotonic named sequences
pub trait SequenceService: Send + Sync {
    /// Advance the named sequence and return its new value
    ///
    /// Values returned for one name are strictly increasing, across all
    /// callers and nodes sharing the service.
    fn next_value(&self, name: &str) -> Result<i64>;

    /// Last value handed out for the named sequence
    fn current_value(&self, name: &str) -> Result<i64>;
}

// ============================================================================
// Backing store
// ============================================================================

/// One row write of a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeDelta {
    /// Create (or recreate) the object with these values
    Create(Attributes),
    /// Change these attributes; `Null` removes a value
    Update(BTreeMap<String, Value>),
    /// Delete the object
    Delete,
}

/// Classification of a key at a revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectLifecycle {
    /// Alive, with the state that is valid over `[valid_from, valid_to)`
    Alive {
        /// State at the requested revision
        values: Attributes,
        /// First revision of this state
        valid_from: RevisionNumber,
        /// First revision where this state no longer holds; `None` while it
        /// is the newest state
        valid_to: Option<RevisionNumber>,
        /// Revision the current incarnation was created at
        created_at: RevisionNumber,
    },
    /// Not created yet at the requested revision
    NotYetCreated {
        /// Revision of the next creation, if one exists
        created_at: Option<RevisionNumber>,
    },
    /// Deleted at or before the requested revision
    Deleted {
        /// Revision of the deletion
        deleted_at: RevisionNumber,
        /// Revision of the next recreation, if one exists
        recreated_at: Option<RevisionNumber>,
    },
}

impl ObjectLifecycle {
    /// Whether the key is alive
    pub fn is_alive(&self) -> bool {
        matches!(self, ObjectLifecycle::Alive { .. })
    }

    /// State if alive
    pub fn values(&self) -> Option<&Attributes> {
        match self {
            ObjectLifecycle::Alive { values, .. } => Some(values),
            _ => None,
        }
    }
}

/// Versioned row storage
///
/// Keys handed to the store are always data keys: the branch is the branch
/// that physically holds the type, and the history context is ignored.
pub trait BackingStore: Send + Sync {
    /// Persist one row write under `revision`
    fn write(&self, key: &ObjectKey, delta: &AttributeDelta, revision: RevisionNumber)
        -> Result<()>;

    /// Persist all row writes of one commit under `revision`
    ///
    /// The default applies [`BackingStore::write`] in order.
    fn write_batch(
        &self,
        writes: &[(ObjectKey, AttributeDelta)],
        revision: RevisionNumber,
    ) -> Result<()> {
        for (key, delta) in writes {
            self.write(key, delta, revision)?;
        }
        Ok(())
    }

    /// Undo the row writes of a commit that failed after [`BackingStore::write_batch`]
    ///
    /// Every key of `writes` returns to the state it had before `revision`.
    fn revert_batch(&self, writes: &[(ObjectKey, AttributeDelta)], revision: RevisionNumber)
        -> Result<()>;

    /// State of `key` as of `revision`, `None` if not alive
    fn read_as_of(&self, key: &ObjectKey, revision: RevisionNumber) -> Result<Option<Attributes>>;

    /// Lifecycle classification of `key` at `revision`
    fn lifecycle(&self, key: &ObjectKey, revision: RevisionNumber) -> Result<ObjectLifecycle>;

    /// All objects of exactly `type_name` on `branch` alive at `revision`
    /// whose state satisfies `predicate`, ordered by name
    fn scan(
        &self,
        branch: BranchId,
        type_name: &TypeName,
        revision: RevisionNumber,
        predicate: &dyn Fn(&Attributes) -> bool,
    ) -> Result<Vec<(ObjectKey, Attributes)>>;

    /// Drop historic states no reader at or after `keep_from` can see
    ///
    /// Returns the number of removed states.
    fn cleanup_history(&self, keep_from: RevisionNumber) -> Result<usize>;
}

// ============================================================================
// Flexible attributes
// ============================================================================

/// Bag of undeclared attributes of one object
///
/// Staged bags carry changes: a `Null` value removes the attribute.
pub type AttributeBag = BTreeMap<String, Value>;

/// Context handed to the flex manager inside a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitContext {
    /// Committing transaction
    pub txn: TxnId,
    /// Revision the transaction read from
    pub read_base: RevisionNumber,
    /// Committing author
    pub author: String,
}

/// Versioned storage for attributes not declared in the schema
///
/// Writes are two-phase. `store` and `delete` stage the changes of the
/// committing transaction and may reject them; nothing staged is visible
/// until `publish` tags it with the commit's revision. `discard` drops
/// whatever a failed commit staged. All three run under the cluster commit
/// lock.
pub trait FlexAttributeManager: Send + Sync {
    /// Bag of an object as of `revision`
    fn load(&self, object: &ObjectKey, revision: RevisionNumber) -> Result<AttributeBag>;

    /// Stage changes to the bag of an object; `false` rejects the commit
    fn store(&self, object: &ObjectKey, changes: &AttributeBag, ctx: &CommitContext)
        -> Result<bool>;

    /// Stage the removal of a deleted object's bag; `false` rejects the commit
    fn delete(&self, object: &ObjectKey, ctx: &CommitContext) -> Result<bool>;

    /// Make everything `txn` staged visible from `revision` on
    fn publish(&self, txn: TxnId, revision: RevisionNumber);

    /// Drop everything `txn` staged
    fn discard(&self, txn: TxnId);
}
