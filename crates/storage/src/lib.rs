//! Storage layer for chronicle
//!
//! In-memory implementations of the external collaborators:
//! - ShardedStore: versioned backing store (DashMap + FxHashMap shards)
//! - VersionChain: every state of one object, newest first
//! - MemorySequence: named monotonic sequences
//! - MemoryFlexStore: flexible attribute bags
//!
//! All of them are shared by the nodes of one cluster.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod flex;
pub mod sequence;
pub mod sharded;
pub mod stored_value;

pub use flex::MemoryFlexStore;
pub use sequence::MemorySequence;
pub use sharded::{Shard, ShardedStore, VersionChain};
pub use stored_value::StoredState;
