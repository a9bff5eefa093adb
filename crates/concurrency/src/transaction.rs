//! Transaction context: the local modification set
//!
//! A transaction buffers every change it makes against its read base. The
//! buffer is keyed by data key and keeps, per object, the state at the read
//! base, the local post-image and the set of touched attributes.
//!
//! Every recording call returns the [`LocalChange`] it produced so the
//! caller can patch the transaction's cache overlays in order.
//!
//! # Lifecycle
//!
//! 1. **BEGIN**: Create with `new()`, status is `Active`
//! 2. **WRITE**: `record_create()`, `record_change()`, `record_delete()`
//! 3. **VALIDATE**: `mark_validating()`, structural checks against latest
//! 4. **FINISH**: `mark_committed()`, `mark_aborted()` or `mark_rolled_back()`

use chronicle_core::{
    attribute, normalize, AttributeBag, AttributeChange, AttributeDelta, Attributes, Error,
    ObjectChange, ObjectKey, Result, RevisionNumber, TxnId, UpdateEvent, Value,
};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// Status of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Transaction is executing, can read/write
    Active,
    /// Transaction is being validated against the latest revision
    Validating,
    /// Transaction committed successfully
    Committed {
        /// Revision allocated at commit
        revision: RevisionNumber,
    },
    /// Transaction was rolled back by its owner
    RolledBack,
    /// Transaction was aborted during commit
    Aborted {
        /// Human-readable reason for abort
        reason: String,
    },
}

/// How an object is touched by the transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// Created by this transaction
    Created,
    /// Existed at the read base and was changed
    Modified,
    /// Existed at the read base and was deleted
    Deleted,
}

/// Buffered state of one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingObject {
    /// How the object is touched
    pub state: PendingState,
    /// State at the read base; `None` for created objects
    pub base: Option<Attributes>,
    /// Local post-image (last values for deleted objects)
    pub values: Attributes,
    /// Attributes written by the transaction
    pub changed: BTreeSet<String>,
}

impl PendingObject {
    /// Whether the object is alive in the transaction's view
    pub fn is_alive(&self) -> bool {
        self.state != PendingState::Deleted
    }

    /// Attributes whose local value differs from the read base
    pub fn diff(&self) -> BTreeMap<String, AttributeChange> {
        let empty = Attributes::new();
        let base = self.base.as_ref().unwrap_or(&empty);
        self.changed
            .iter()
            .filter_map(|name| {
                let old = attribute(base, name);
                let new = attribute(&self.values, name);
                (old != new).then(|| {
                    (
                        name.clone(),
                        AttributeChange {
                            old: old.clone(),
                            new: new.clone(),
                        },
                    )
                })
            })
            .collect()
    }
}

/// One local modification, in the order it was made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    /// Object created
    Created {
        /// Data key
        key: ObjectKey,
        /// Initial values
        values: Attributes,
    },
    /// Attribute changed
    Changed {
        /// Data key
        key: ObjectKey,
        /// Changed attribute
        attribute: String,
        /// Previous local value
        old: Value,
        /// New local value
        new: Value,
        /// Local post-image
        values: Attributes,
    },
    /// Object deleted
    Deleted {
        /// Data key
        key: ObjectKey,
        /// Last local values
        values: Attributes,
    },
}

impl LocalChange {
    /// Key the change applies to
    pub fn key(&self) -> &ObjectKey {
        match self {
            LocalChange::Created { key, .. }
            | LocalChange::Changed { key, .. }
            | LocalChange::Deleted { key, .. } => key,
        }
    }
}

/// What the transaction knows about a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalRead<'a> {
    /// Not touched; read from the store at the read base
    Untouched,
    /// Alive with these local values
    Alive(&'a Attributes),
    /// Deleted by the transaction
    Deleted,
}

/// Summary of buffered operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingOperations {
    /// Objects created
    pub created: usize,
    /// Objects modified
    pub modified: usize,
    /// Objects deleted
    pub deleted: usize,
    /// Flexible attribute bags staged
    pub flex: usize,
}

impl PendingOperations {
    /// Total number of buffered operations
    pub fn total(&self) -> usize {
        self.created + self.modified + self.deleted + self.flex
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Local modification set of one transaction
#[derive(Debug)]
pub struct TransactionContext {
    /// Unique transaction ID
    pub txn_id: TxnId,
    /// Revision all reads are made at
    pub read_base: RevisionNumber,
    /// Current transaction status
    pub status: TransactionStatus,
    objects: BTreeMap<ObjectKey, PendingObject>,
    flex: BTreeMap<ObjectKey, AttributeBag>,
    start_time: Instant,
}

impl TransactionContext {
    /// Create an active transaction reading at `read_base`
    ///
    /// # Example
    ///
    /// ```
    /// use chronicle_concurrency::TransactionContext;
    /// use chronicle_core::TxnId;
    ///
    /// let txn = TransactionContext::new(TxnId(1), 5);
    /// assert!(txn.is_active());
    /// assert_eq!(txn.read_base, 5);
    /// ```
    pub fn new(txn_id: TxnId, read_base: RevisionNumber) -> Self {
        Self {
            txn_id,
            read_base,
            status: TransactionStatus::Active,
            objects: BTreeMap::new(),
            flex: BTreeMap::new(),
            start_time: Instant::now(),
        }
    }

    // === Status ===

    /// Whether the transaction accepts operations
    pub fn is_active(&self) -> bool {
        self.status == TransactionStatus::Active
    }

    /// Whether the transaction committed
    pub fn is_committed(&self) -> bool {
        matches!(self.status, TransactionStatus::Committed { .. })
    }

    /// Time since begin
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Check if transaction can accept operations
    ///
    /// # Errors
    /// Returns `TransactionNotActive` if transaction is not in `Active` state.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::TransactionNotActive {
                txn: self.txn_id,
                state: format!("{:?}", self.status),
            })
        }
    }

    /// `Active` → `Validating`
    pub fn mark_validating(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.status = TransactionStatus::Validating;
        Ok(())
    }

    /// `Validating` → `Committed`
    pub fn mark_committed(&mut self, revision: RevisionNumber) -> Result<()> {
        match self.status {
            TransactionStatus::Validating => {
                self.status = TransactionStatus::Committed { revision };
                Ok(())
            }
            _ => Err(Error::invalid_operation(format!(
                "cannot commit {} from state {:?}",
                self.txn_id, self.status
            ))),
        }
    }

    /// `Active | Validating` → `Aborted`; buffered operations are discarded
    pub fn mark_aborted(&mut self, reason: impl Into<String>) {
        if matches!(
            self.status,
            TransactionStatus::Active | TransactionStatus::Validating
        ) {
            self.status = TransactionStatus::Aborted {
                reason: reason.into(),
            };
            self.clear();
        }
    }

    /// `Active` → `RolledBack`; a no-op in every other state
    ///
    /// Returns whether the transaction was active.
    pub fn mark_rolled_back(&mut self) -> bool {
        if self.is_active() {
            self.status = TransactionStatus::RolledBack;
            self.clear();
            true
        } else {
            false
        }
    }

    fn clear(&mut self) {
        self.objects.clear();
        self.flex.clear();
    }

    // === Recording ===

    /// Record the creation of `key`
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the transaction already touched the key.
    pub fn record_create(&mut self, key: ObjectKey, values: Attributes) -> Result<LocalChange> {
        self.ensure_active()?;
        if self.objects.contains_key(&key) {
            return Err(Error::invalid_operation(format!(
                "{} is already touched by {}",
                key, self.txn_id
            )));
        }
        let values = normalize(values);
        let changed = values.keys().cloned().collect();
        self.objects.insert(
            key.clone(),
            PendingObject {
                state: PendingState::Created,
                base: None,
                values: values.clone(),
                changed,
            },
        );
        Ok(LocalChange::Created { key, values })
    }

    /// Record an attribute write
    ///
    /// `base` supplies the read-base state when the key is untouched.
    /// Returns `None` when the value does not change.
    ///
    /// # Errors
    ///
    /// Returns `DeletedObjectAccess` if the object is not alive in the
    /// transaction's view.
    pub fn record_change<F>(
        &mut self,
        key: &ObjectKey,
        base: F,
        attribute_name: &str,
        value: Value,
    ) -> Result<Option<LocalChange>>
    where
        F: FnOnce() -> Result<Option<Attributes>>,
    {
        self.ensure_active()?;
        if !self.objects.contains_key(key) {
            let values = base()?.ok_or_else(|| Error::deleted_object(key.clone(), self.read_base))?;
            self.objects.insert(
                key.clone(),
                PendingObject {
                    state: PendingState::Modified,
                    base: Some(values.clone()),
                    values,
                    changed: BTreeSet::new(),
                },
            );
        }
        let read_base = self.read_base;
        let Some(pending) = self.objects.get_mut(key) else {
            return Err(Error::deleted_object(key.clone(), read_base));
        };
        if pending.state == PendingState::Deleted {
            return Err(Error::deleted_object(key.clone(), read_base));
        }
        let old = attribute(&pending.values, attribute_name).clone();
        if old == value {
            return Ok(None);
        }
        if value.is_null() {
            pending.values.remove(attribute_name);
        } else {
            pending.values.insert(attribute_name.to_string(), value.clone());
        }
        pending.changed.insert(attribute_name.to_string());
        Ok(Some(LocalChange::Changed {
            key: key.clone(),
            attribute: attribute_name.to_string(),
            old,
            new: value,
            values: pending.values.clone(),
        }))
    }

    /// Record the deletion of `key`
    ///
    /// Deleting an object created by the same transaction forgets it.
    ///
    /// # Errors
    ///
    /// Returns `DeletedObjectAccess` if the object is not alive in the
    /// transaction's view.
    pub fn record_delete<F>(&mut self, key: &ObjectKey, base: F) -> Result<LocalChange>
    where
        F: FnOnce() -> Result<Option<Attributes>>,
    {
        self.ensure_active()?;
        match self.objects.get_mut(key) {
            Some(pending) => match pending.state {
                PendingState::Deleted => Err(Error::deleted_object(key.clone(), self.read_base)),
                PendingState::Created => {
                    let values = pending.values.clone();
                    self.objects.remove(key);
                    self.flex.remove(key);
                    Ok(LocalChange::Deleted {
                        key: key.clone(),
                        values,
                    })
                }
                PendingState::Modified => {
                    pending.state = PendingState::Deleted;
                    Ok(LocalChange::Deleted {
                        key: key.clone(),
                        values: pending.values.clone(),
                    })
                }
            },
            None => {
                let values =
                    base()?.ok_or_else(|| Error::deleted_object(key.clone(), self.read_base))?;
                self.objects.insert(
                    key.clone(),
                    PendingObject {
                        state: PendingState::Deleted,
                        base: Some(values.clone()),
                        values: values.clone(),
                        changed: BTreeSet::new(),
                    },
                );
                self.flex.remove(key);
                Ok(LocalChange::Deleted {
                    key: key.clone(),
                    values,
                })
            }
        }
    }

    /// Stage flexible attribute changes for `key`; `Null` removes a name
    pub fn stage_flex(&mut self, key: ObjectKey, bag: AttributeBag) -> Result<()> {
        self.ensure_active()?;
        self.flex.insert(key, bag);
        Ok(())
    }

    // === Inspection ===

    /// Local knowledge about `key`
    pub fn local(&self, key: &ObjectKey) -> LocalRead<'_> {
        match self.objects.get(key) {
            None => LocalRead::Untouched,
            Some(p) if p.state == PendingState::Deleted => LocalRead::Deleted,
            Some(p) => LocalRead::Alive(&p.values),
        }
    }

    /// Buffered object, if touched
    pub fn pending(&self, key: &ObjectKey) -> Option<&PendingObject> {
        self.objects.get(key)
    }

    /// Every touched object in key order
    pub fn objects(&self) -> impl Iterator<Item = (&ObjectKey, &PendingObject)> {
        self.objects.iter()
    }

    /// Staged flexible attribute changes of `key`
    pub fn staged_flex(&self, key: &ObjectKey) -> Option<&AttributeBag> {
        self.flex.get(key)
    }

    /// Every staged flexible attribute bag
    pub fn flex_bags(&self) -> impl Iterator<Item = (&ObjectKey, &AttributeBag)> {
        self.flex.iter()
    }

    /// Summary of pending operations
    pub fn pending_operations(&self) -> PendingOperations {
        let mut ops = PendingOperations {
            flex: self.flex.len(),
            ..Default::default()
        };
        for pending in self.objects.values() {
            match pending.state {
                PendingState::Created => ops.created += 1,
                PendingState::Modified => ops.modified += 1,
                PendingState::Deleted => ops.deleted += 1,
            }
        }
        ops
    }

    /// Whether the transaction has nothing to commit
    pub fn is_read_only(&self) -> bool {
        self.flex.is_empty() && self.writes().is_empty()
    }

    /// Row writes for the backing store, in key order
    ///
    /// Modified objects whose values match the read base produce no write.
    pub fn writes(&self) -> Vec<(ObjectKey, AttributeDelta)> {
        self.objects
            .iter()
            .filter_map(|(key, pending)| {
                let delta = match pending.state {
                    PendingState::Created => AttributeDelta::Create(pending.values.clone()),
                    PendingState::Deleted => AttributeDelta::Delete,
                    PendingState::Modified => {
                        let diff = pending.diff();
                        if diff.is_empty() {
                            return None;
                        }
                        AttributeDelta::Update(
                            diff.into_iter().map(|(name, change)| (name, change.new)).collect(),
                        )
                    }
                };
                Some((key.clone(), delta))
            })
            .collect()
    }

    /// Event describing this transaction's effect
    pub fn build_event(&self, revision: RevisionNumber, previous: RevisionNumber) -> UpdateEvent {
        let mut event = UpdateEvent::new(revision, previous);
        for (key, pending) in &self.objects {
            match pending.state {
                PendingState::Created => {
                    event.created.insert(key.clone(), pending.values.clone());
                }
                PendingState::Deleted => {
                    let last = pending.base.clone().unwrap_or_else(|| pending.values.clone());
                    event.deleted.insert(key.clone(), last);
                }
                PendingState::Modified => {
                    let changes = pending.diff();
                    if !changes.is_empty() {
                        event.updated.insert(
                            key.clone(),
                            ObjectChange {
                                changes,
                                values: pending.values.clone(),
                            },
                        );
                    }
                }
            }
        }
        event
    }
}
