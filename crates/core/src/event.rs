//! Per-commit change events
//!
//! An [`UpdateEvent`] is the delta between two adjacent commits on one
//! chain. It is computed once, at commit (or when a replay record is
//! applied), and then shared read-only by every session and cache.

use crate::branch::Branch;
use crate::types::{ObjectKey, RevisionNumber, TypeName};
use crate::value::{Attributes, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Old and new value of one attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Value before the commit
    pub old: Value,
    /// Value after the commit
    pub new: Value,
}

/// Update of one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectChange {
    /// Changed attributes only
    pub changes: BTreeMap<String, AttributeChange>,
    /// Full post-image of the object
    pub values: Attributes,
}

impl ObjectChange {
    /// Whether the update touched `attribute`
    pub fn touches(&self, attribute: &str) -> bool {
        self.changes.contains_key(attribute)
    }
}

/// Delta between two adjacent commits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEvent {
    /// Revision the event leads to
    pub revision: RevisionNumber,
    /// Revision the event starts from
    pub previous_revision: RevisionNumber,
    /// Created objects with their initial values
    pub created: BTreeMap<ObjectKey, Attributes>,
    /// Updated objects
    pub updated: BTreeMap<ObjectKey, ObjectChange>,
    /// Deleted objects with their last values
    pub deleted: BTreeMap<ObjectKey, Attributes>,
    /// Branches created by this commit
    pub created_branches: Vec<Branch>,
}

impl UpdateEvent {
    /// Create an empty event
    pub fn new(revision: RevisionNumber, previous_revision: RevisionNumber) -> Self {
        Self {
            revision,
            previous_revision,
            ..Default::default()
        }
    }

    /// Whether the event carries no object change and no branch
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && self.created_branches.is_empty()
    }

    /// Number of touched objects
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    /// Every key the event touches, in key order per category
    pub fn touched_keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.created
            .keys()
            .chain(self.updated.keys())
            .chain(self.deleted.keys())
    }

    /// Whether any object of `type_name` is touched
    pub fn touches_type(&self, type_name: &TypeName) -> bool {
        self.touched_keys().any(|k| &k.type_name == type_name)
    }

    /// Whether `key` is touched
    pub fn contains_key(&self, key: &ObjectKey) -> bool {
        self.created.contains_key(key)
            || self.updated.contains_key(key)
            || self.deleted.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BranchId, ObjectName};
    use crate::value::attrs;

    fn key(n: i64, t: &str) -> ObjectKey {
        ObjectKey::current(BranchId::TRUNK, t, ObjectName::new(n))
    }

    #[test]
    fn test_empty_event() {
        let event = UpdateEvent::new(3, 2);
        assert!(event.is_empty());
        assert_eq!(event.len(), 0);
    }

    #[test]
    fn test_touched_keys_cover_all_categories() {
        let mut event = UpdateEvent::new(3, 2);
        event.created.insert(key(1, "A"), attrs([("x", Value::Int(1))]));
        event.updated.insert(
            key(2, "B"),
            ObjectChange {
                changes: BTreeMap::from([(
                    "x".to_string(),
                    AttributeChange {
                        old: Value::Int(1),
                        new: Value::Int(2),
                    },
                )]),
                values: attrs([("x", Value::Int(2))]),
            },
        );
        event.deleted.insert(key(3, "C"), Attributes::new());

        assert_eq!(event.len(), 3);
        assert!(event.contains_key(&key(2, "B")));
        assert!(event.touches_type(&TypeName::from("C")));
        assert!(!event.touches_type(&TypeName::from("D")));
        assert!(event.updated[&key(2, "B")].touches("x"));
        assert!(!event.updated[&key(2, "B")].touches("y"));
    }

    #[test]
    fn test_event_roundtrips_through_msgpack() {
        let mut event = UpdateEvent::new(5, 4);
        event.created.insert(key(1, "A"), attrs([("x", Value::Int(1))]));
        event.created_branches.push(Branch::trunk());
        let bytes = rmp_serde::to_vec(&event).unwrap();
        let decoded: UpdateEvent = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, event);
    }
}
