//! Core types and traits for chronicle
//!
//! This crate defines the foundational types used throughout the system:
//! - BranchId / ObjectKey / ObjectId: Value identity of versioned objects
//! - Value / Attributes: Attribute values
//! - Revision / RevisionHistory: Append-only commit history
//! - Branch / BranchRegistry: Fork points and branch resolution
//! - UpdateEvent: Per-commit delta shared by sessions and caches
//! - Schema: Type metadata and reference definitions
//! - Traits: Contracts of the external collaborators
//! - Error: Error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod branch;
pub mod error;
pub mod event;
pub mod revision;
pub mod schema;
pub mod traits;
pub mod types;
pub mod value;

pub use branch::{Branch, BranchRegistry};
pub use error::{Error, Result};
pub use event::{AttributeChange, ObjectChange, UpdateEvent};
pub use revision::{Revision, RevisionHistory, SYSTEM_AUTHOR};
pub use schema::{
    evaluate_deletion, AttributeDef, AttributeKind, DeletionAction, DeletionPolicy, HistoryType,
    ReferenceDef, SchemaRegistry, TypeDef, TypeRegistry,
};
pub use traits::{
    AttributeBag, AttributeDelta, BackingStore, CommitContext, FlexAttributeManager,
    ObjectLifecycle, SequenceService, BRANCH_SEQUENCE, OBJECT_SEQUENCE,
};
pub use types::{
    BranchId, HistoryContext, NodeId, ObjectId, ObjectKey, ObjectName, RevisionNumber, SessionId,
    TxnId, TypeName, INITIAL_REVISION,
};
pub use value::{attribute, attrs, normalize, Attributes, Value, NULL};
