//! Identity types for versioned objects
//!
//! This module defines the foundational identities:
//! - BranchId: Identifier of a branch (the trunk is branch 1)
//! - TypeName / ObjectName / ObjectId: Branch-independent object identity
//! - HistoryContext: Whether a key addresses the current state or a revision
//! - ObjectKey: Full value identity `(branch, history, type, name)`
//! - NodeId / SessionId / TxnId: Runtime identities

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Commit number of a revision.
///
/// Revision 0 is the empty initial state; the first commit is revision 1.
pub type RevisionNumber = i64;

/// The empty initial state every store starts from.
pub const INITIAL_REVISION: RevisionNumber = 0;

// ============================================================================
// Branches
// ============================================================================

/// Identifier of a branch.
///
/// Branch ids are drawn from the sequence service. The trunk always has
/// id 1 and owns every type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(u64);

impl BranchId {
    /// The trunk branch.
    pub const TRUNK: BranchId = BranchId(1);

    /// Wrap a raw branch id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether this is the trunk
    pub fn is_trunk(&self) -> bool {
        *self == Self::TRUNK
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "branch-{}", self.0)
    }
}

// ============================================================================
// Object identity
// ============================================================================

/// Name of a persistent type as registered in the schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeName(String);

impl TypeName {
    /// Create a type name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Type name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TypeName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TypeName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&TypeName> for TypeName {
    fn from(t: &TypeName) -> Self {
        t.clone()
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of an object, assigned once at creation.
///
/// Names come from the `object` sequence and are unique across all types.
/// A name is stable across the object's whole history, including
/// delete/recreate cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectName(i64);

impl ObjectName {
    /// Wrap a raw name
    pub const fn new(name: i64) -> Self {
        Self(name)
    }

    /// Raw name value
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Branch-independent identity of an object: its type and name.
///
/// References store an `ObjectId`; the branch is supplied by whoever
/// resolves the reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    /// Concrete type of the object
    pub type_name: TypeName,
    /// Object name
    pub name: ObjectName,
}

impl ObjectId {
    /// Create an object id
    pub fn new(type_name: impl Into<TypeName>, name: ObjectName) -> Self {
        Self {
            type_name: type_name.into(),
            name,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.type_name, self.name)
    }
}

/// Whether a key addresses the current state or a fixed revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HistoryContext {
    /// The state visible to the reader's session
    Current,
    /// The state as of a concrete revision
    Revision(RevisionNumber),
}

impl fmt::Display for HistoryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryContext::Current => f.write_str("current"),
            HistoryContext::Revision(r) => write!(f, "r{}", r),
        }
    }
}

/// Value identity of a stored object: `(branch, history, type, name)`.
///
/// Two keys are equal when all four components are equal. Keys are totally
/// ordered (branch, history, type, name) so they can live in ordered maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Branch the key is addressed through
    pub branch: BranchId,
    /// History context
    pub history: HistoryContext,
    /// Concrete type
    pub type_name: TypeName,
    /// Object name
    pub name: ObjectName,
}

impl ObjectKey {
    /// Key addressing the current state of an object on a branch
    pub fn current(branch: BranchId, type_name: impl Into<TypeName>, name: ObjectName) -> Self {
        Self {
            branch,
            history: HistoryContext::Current,
            type_name: type_name.into(),
            name,
        }
    }

    /// Key addressing an object on a branch as of a fixed revision
    pub fn historic(
        branch: BranchId,
        type_name: impl Into<TypeName>,
        name: ObjectName,
        revision: RevisionNumber,
    ) -> Self {
        Self {
            branch,
            history: HistoryContext::Revision(revision),
            type_name: type_name.into(),
            name,
        }
    }

    /// Same object, addressed at a fixed revision
    pub fn at_revision(&self, revision: RevisionNumber) -> Self {
        Self {
            history: HistoryContext::Revision(revision),
            ..self.clone()
        }
    }

    /// Same object, addressed at the current state
    pub fn as_current(&self) -> Self {
        Self {
            history: HistoryContext::Current,
            ..self.clone()
        }
    }

    /// Same object, addressed through another branch
    pub fn on_branch(&self, branch: BranchId) -> Self {
        Self {
            branch,
            ..self.clone()
        }
    }

    /// Branch-independent identity
    pub fn object_id(&self) -> ObjectId {
        ObjectId {
            type_name: self.type_name.clone(),
            name: self.name,
        }
    }

    /// Whether the key addresses the current state
    pub fn is_current(&self) -> bool {
        self.history == HistoryContext::Current
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}@{}/{}",
            self.type_name, self.name, self.branch, self.history
        )
    }
}

// ============================================================================
// Runtime identities
// ============================================================================

/// Identity of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Create a new random node id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Raw bytes of this node id
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a session within one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Identity of a transaction within one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_trunk_is_branch_one() {
        assert_eq!(BranchId::TRUNK.as_u64(), 1);
        assert!(BranchId::TRUNK.is_trunk());
        assert!(!BranchId::new(2).is_trunk());
    }

    #[test]
    fn test_object_key_equality_is_by_value() {
        let a = ObjectKey::current(BranchId::TRUNK, "Person", ObjectName::new(7));
        let b = ObjectKey::current(BranchId::TRUNK, TypeName::new("Person"), ObjectName::new(7));
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&b));
    }

    #[test]
    fn test_object_key_components_distinguish() {
        let base = ObjectKey::current(BranchId::TRUNK, "Person", ObjectName::new(7));
        assert_ne!(base, base.on_branch(BranchId::new(2)));
        assert_ne!(base, base.at_revision(3));
        assert_ne!(
            base,
            ObjectKey::current(BranchId::TRUNK, "Company", ObjectName::new(7))
        );
        assert_eq!(base, base.at_revision(3).as_current());
    }

    #[test]
    fn test_object_id_drops_branch_and_history() {
        let key = ObjectKey::historic(BranchId::new(4), "Person", ObjectName::new(9), 12);
        let id = key.object_id();
        assert_eq!(id, ObjectId::new("Person", ObjectName::new(9)));
        assert!(!key.is_current());
    }

    #[test]
    fn test_key_display_names_all_parts() {
        let key = ObjectKey::historic(BranchId::new(4), "Person", ObjectName::new(9), 12);
        let shown = key.to_string();
        assert!(shown.contains("Person"));
        assert!(shown.contains("#9"));
        assert!(shown.contains("branch-4"));
        assert!(shown.contains("r12"));
    }

    #[test]
    fn test_node_ids_are_unique() {
        assert_ne!(NodeId::new(), NodeId::new());
    }
}
