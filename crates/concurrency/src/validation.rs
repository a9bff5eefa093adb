//! Commit-time validation
//!
//! A transaction is validated against the latest committed revision, not
//! its read base. Attribute writes merge: two transactions changing
//! different (or even the same) attributes of one object both commit, the
//! later one winning per attribute. Only structural conflicts abort:
//!
//! - an object the transaction changes or deletes was deleted (or deleted
//!   and recreated) concurrently
//! - an object the transaction creates under an explicit name already exists
//! - a reference the transaction writes points at an object that is gone
//! - a branch-local monomorphic current reference leaves its branch
//! - an object the transaction deletes gained a referrer concurrently

use crate::transaction::{LocalRead, PendingState, TransactionContext};
use chronicle_core::{
    attribute, BackingStore, BranchRegistry, Error, ObjectKey, ObjectLifecycle, Result,
    RevisionNumber, SchemaRegistry, Value,
};
use std::fmt;

/// Structural conflict found during validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictType {
    /// Object changed or deleted locally is no longer alive
    ConcurrentlyDeleted {
        /// Affected object
        key: ObjectKey,
    },

    /// Object changed or deleted locally was deleted and created again
    Recreated {
        /// Affected object
        key: ObjectKey,
        /// Revision of the new incarnation
        created_at: RevisionNumber,
    },

    /// Object created locally already exists
    AlreadyAlive {
        /// Affected object
        key: ObjectKey,
    },

    /// A written reference points at an object that is not alive
    DanglingReference {
        /// Referring object
        key: ObjectKey,
        /// Reference attribute
        attribute: String,
        /// Missing target
        target: ObjectKey,
    },

    /// A branch-local monomorphic current reference resolves off-branch
    CrossBranchReference {
        /// Referring object
        key: ObjectKey,
        /// Reference attribute
        attribute: String,
        /// Resolved target
        target: ObjectKey,
    },

    /// An object deleted locally is still referenced
    ConcurrentReferrer {
        /// Deleted object
        key: ObjectKey,
        /// Object still holding a reference
        referrer: ObjectKey,
        /// Reference attribute
        attribute: String,
    },
}

impl ConflictType {
    /// Object the conflict is reported against
    pub fn key(&self) -> &ObjectKey {
        match self {
            ConflictType::ConcurrentlyDeleted { key }
            | ConflictType::Recreated { key, .. }
            | ConflictType::AlreadyAlive { key }
            | ConflictType::DanglingReference { key, .. }
            | ConflictType::CrossBranchReference { key, .. }
            | ConflictType::ConcurrentReferrer { key, .. } => key,
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictType::ConcurrentlyDeleted { key } => write!(f, "{} was deleted", key),
            ConflictType::Recreated { key, created_at } => {
                write!(f, "{} was recreated at revision {}", key, created_at)
            }
            ConflictType::AlreadyAlive { key } => write!(f, "{} already exists", key),
            ConflictType::DanglingReference {
                key,
                attribute,
                target,
            } => write!(f, "{}.{} refers to deleted {}", key, attribute, target),
            ConflictType::CrossBranchReference {
                key,
                attribute,
                target,
            } => write!(f, "{}.{} crosses to branch of {}", key, attribute, target),
            ConflictType::ConcurrentReferrer {
                key,
                referrer,
                attribute,
            } => write!(f, "{} is referenced by {}.{}", key, referrer, attribute),
        }
    }
}

/// Result of validating a transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    /// All conflicts found
    pub conflicts: Vec<ConflictType>,
}

impl ValidationResult {
    /// Validation without conflicts
    pub fn ok() -> Self {
        Self::default()
    }

    /// Validation with a single conflict
    pub fn conflict(conflict: ConflictType) -> Self {
        Self {
            conflicts: vec![conflict],
        }
    }

    /// Whether no conflict was found
    pub fn is_valid(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Merge another result into this one
    pub fn merge(&mut self, other: ValidationResult) {
        self.conflicts.extend(other.conflicts);
    }

    /// Number of conflicts
    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }

    /// `MergeConflict` naming every conflict, reported against the first one
    pub fn into_error(self, latest: RevisionNumber) -> Option<Error> {
        let first = self.conflicts.first()?.key().clone();
        let reason = self
            .conflicts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Some(Error::merge_conflict(first, latest, reason))
    }
}

/// Validate a transaction against revision `latest`
///
/// # Errors
///
/// Returns store or registry failures; conflicts are reported in the result.
pub fn validate_transaction(
    txn: &TransactionContext,
    latest: RevisionNumber,
    store: &dyn BackingStore,
    schema: &dyn SchemaRegistry,
    branches: &BranchRegistry,
) -> Result<ValidationResult> {
    let mut result = ValidationResult::ok();
    result.merge(validate_lifecycles(txn, latest, store)?);
    result.merge(validate_references(txn, latest, store, schema, branches)?);
    result.merge(validate_deletions(txn, latest, store, schema, branches)?);
    Ok(result)
}

/// Touched objects must still be the incarnation the transaction read
pub fn validate_lifecycles(
    txn: &TransactionContext,
    latest: RevisionNumber,
    store: &dyn BackingStore,
) -> Result<ValidationResult> {
    let mut result = ValidationResult::ok();
    for (key, pending) in txn.objects() {
        let lifecycle = store.lifecycle(key, latest)?;
        match pending.state {
            PendingState::Created => {
                if lifecycle.is_alive() {
                    result.merge(ValidationResult::conflict(ConflictType::AlreadyAlive {
                        key: key.clone(),
                    }));
                }
            }
            PendingState::Modified | PendingState::Deleted => match lifecycle {
                ObjectLifecycle::Alive { created_at, .. } if created_at > txn.read_base => {
                    result.merge(ValidationResult::conflict(ConflictType::Recreated {
                        key: key.clone(),
                        created_at,
                    }));
                }
                ObjectLifecycle::Alive { .. } => {}
                _ => {
                    result.merge(ValidationResult::conflict(
                        ConflictType::ConcurrentlyDeleted { key: key.clone() },
                    ));
                }
            },
        }
    }
    Ok(result)
}

/// Current references written by the transaction must resolve to live objects
pub fn validate_references(
    txn: &TransactionContext,
    latest: RevisionNumber,
    store: &dyn BackingStore,
    schema: &dyn SchemaRegistry,
    branches: &BranchRegistry,
) -> Result<ValidationResult> {
    let mut result = ValidationResult::ok();
    for (key, pending) in txn.objects().filter(|(_, p)| p.is_alive()) {
        for name in &pending.changed {
            let Value::Ref(id) = attribute(&pending.values, name) else {
                continue;
            };
            let Some(def) = schema.reference(&key.type_name, name) else {
                continue;
            };
            let target = branches.resolve_reference(key.branch, def.branch_local, id)?;
            if def.requires_branched_target() && target.branch != key.branch {
                result.merge(ValidationResult::conflict(ConflictType::CrossBranchReference {
                    key: key.clone(),
                    attribute: name.clone(),
                    target,
                }));
                continue;
            }
            let alive = match txn.local(&target) {
                LocalRead::Alive(_) => true,
                LocalRead::Deleted => false,
                LocalRead::Untouched => store.lifecycle(&target, latest)?.is_alive(),
            };
            if !alive {
                result.merge(ValidationResult::conflict(ConflictType::DanglingReference {
                    key: key.clone(),
                    attribute: name.clone(),
                    target,
                }));
            }
        }
    }
    Ok(result)
}

/// Objects deleted by the transaction must have no referrer left after it
///
/// A referrer's effective value is the transaction's own value for
/// attributes it wrote and the latest committed value otherwise.
pub fn validate_deletions(
    txn: &TransactionContext,
    latest: RevisionNumber,
    store: &dyn BackingStore,
    schema: &dyn SchemaRegistry,
    branches: &BranchRegistry,
) -> Result<ValidationResult> {
    let mut result = ValidationResult::ok();
    for (key, _) in txn
        .objects()
        .filter(|(_, p)| p.state == PendingState::Deleted)
    {
        let id = key.object_id();
        for (referrer_type, name, def) in schema.referrers_of(&key.type_name) {
            for branch in branches.reference_sources(&referrer_type, def.branch_local, key)? {
                let hits = store.scan(branch, &referrer_type, latest, &|values| {
                    attribute(values, &name).refers_to(&id)
                })?;
                for (referrer, latest_values) in hits {
                    let still_refers = match txn.pending(&referrer) {
                        Some(p) if !p.is_alive() => false,
                        Some(p) if p.changed.contains(&name) => {
                            attribute(&p.values, &name).refers_to(&id)
                        }
                        _ => attribute(&latest_values, &name).refers_to(&id),
                    };
                    if still_refers {
                        result.merge(ValidationResult::conflict(
                            ConflictType::ConcurrentReferrer {
                                key: key.clone(),
                                referrer,
                                attribute: name.clone(),
                            },
                        ));
                    }
                }
            }
        }
    }
    Ok(result)
}
