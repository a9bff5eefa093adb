//! Error types for the chronicle store
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Every variant names the key, revision or cache that triggered it.
//! Cache invalidation is an internal outcome and never surfaces here.

use crate::types::{BranchId, ObjectKey, RevisionNumber, TxnId};
use thiserror::Error;

/// Result type alias for chronicle operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the chronicle store
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Commit-time validation found a structural conflict with a concurrent commit
    #[error("merge conflict on {key} against revision {revision}: {reason}")]
    MergeConflict {
        /// Object that conflicted
        key: ObjectKey,
        /// Latest committed revision the transaction was validated against
        revision: RevisionNumber,
        /// Human readable description
        reason: String,
    },

    /// Access to an object that is not alive at the reader's revision
    #[error("object {key} is not alive at revision {revision}")]
    DeletedObjectAccess {
        /// Object that was accessed
        key: ObjectKey,
        /// Revision the access was made at
        revision: RevisionNumber,
    },

    /// No external revision arrived before the refetch deadline
    #[error("refetch timed out after {waited_ms} ms at revision {revision}")]
    RefetchTimeout {
        /// Time spent waiting
        waited_ms: u64,
        /// Last revision applied by this node
        revision: RevisionNumber,
    },

    /// Branch creation rejected by the model or data check
    #[error("cannot branch from {base} at revision {revision}: {reason}")]
    BranchConsistency {
        /// Base branch
        base: BranchId,
        /// Base revision
        revision: RevisionNumber,
        /// Human readable description
        reason: String,
    },

    /// A derived view changed while an iterator was walking it
    #[error("concurrent modification of {cache} during iteration")]
    ConcurrentModification {
        /// Description of the cache
        cache: String,
    },

    /// A replay record is missing between two applied revisions
    #[error("replication gap: record {found} follows revision {previous}, expected predecessor {expected}")]
    ReplicationGap {
        /// Last revision applied locally
        expected: RevisionNumber,
        /// Predecessor named by the record
        previous: RevisionNumber,
        /// Revision of the record
        found: RevisionNumber,
    },

    /// A `Veto` reference blocks a deletion
    #[error("deletion of {target} vetoed by {referrer}.{attribute}")]
    DeletionVetoed {
        /// Object that was to be deleted
        target: ObjectKey,
        /// Object holding the vetoing reference
        referrer: ObjectKey,
        /// Reference attribute
        attribute: String,
    },

    /// Operation on a transaction that is no longer active
    #[error("transaction {txn} is not active ({state})")]
    TransactionNotActive {
        /// Transaction id
        txn: TxnId,
        /// Current state
        state: String,
    },

    /// Lookup of an unknown entity (type, branch, cache)
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid operation or state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Data corruption detected
    #[error("data corruption: {0}")]
    Corruption(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backing store failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Create a merge conflict error
    pub fn merge_conflict(
        key: ObjectKey,
        revision: RevisionNumber,
        reason: impl Into<String>,
    ) -> Self {
        Error::MergeConflict {
            key,
            revision,
            reason: reason.into(),
        }
    }

    /// Create a deleted-object access error
    pub fn deleted_object(key: ObjectKey, revision: RevisionNumber) -> Self {
        Error::DeletedObjectAccess { key, revision }
    }

    /// Create a branch consistency error
    pub fn branch_consistency(
        base: BranchId,
        revision: RevisionNumber,
        reason: impl Into<String>,
    ) -> Self {
        Error::BranchConsistency {
            base,
            revision,
            reason: reason.into(),
        }
    }

    /// Create a concurrent modification error
    pub fn concurrent_modification(cache: impl Into<String>) -> Self {
        Error::ConcurrentModification {
            cache: cache.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    /// Create an invalid-operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Whether the caller may retry the operation after refreshing its view.
    ///
    /// Conflicts and timeouts are never retried internally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::MergeConflict { .. }
                | Error::RefetchTimeout { .. }
                | Error::DeletedObjectAccess { .. }
        )
    }

    /// Whether this is a commit-time conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::MergeConflict { .. })
    }
}
