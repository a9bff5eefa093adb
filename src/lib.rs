//! Chronicle - versioned, branchable, transactional object store
//!
//! Objects are typed bags of attributes addressed by `(branch, type, name)`.
//! Every commit produces a new revision; sessions read one revision at a
//! time and move forward explicitly. Derived caches (ordered and indexed
//! link views, or any [`CacheHandler`]) are kept consistent with the
//! revision each reader sees, including the reader's uncommitted changes.
//!
//! # Quick Start
//!
//! ```ignore
//! use chronicle::{attrs, Database, TypeDef, TypeRegistry, Value};
//!
//! let schema = TypeRegistry::new().with_type(TypeDef::new("Note").primitive("text"))?;
//! let db = Database::in_memory(schema)?;
//!
//! let mut session = db.session();
//! let note = session.transaction(|txn| {
//!     txn.create("Note", attrs([("text", Value::from("hello"))]))
//! })?;
//! assert_eq!(session.attribute(&note, "text")?, Value::from("hello"));
//! ```
//!
//! # Architecture
//!
//! - `chronicle-core`: identities, values, schema, branches, errors
//! - `chronicle-storage`: in-memory row store, sequences, flexible attributes
//! - `chronicle-concurrency`: transactions, validation, the update chain
//! - `chronicle-durability`: replay records and the shared replay log
//! - `chronicle-engine`: nodes, sessions, caches, branching, replication

pub use chronicle_core::{
    attribute, attrs, AttributeBag, Attributes, Branch, BranchId, DeletionPolicy, Error,
    HistoryContext, HistoryType, NodeId, ObjectId, ObjectKey, ObjectName, ReferenceDef, Result,
    Revision, RevisionNumber, SchemaRegistry, TypeDef, TypeName, TypeRegistry, UpdateEvent, Value,
    INITIAL_REVISION,
};
pub use chronicle_engine::*;
