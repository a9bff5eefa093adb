//! Concurrency layer for chronicle
//!
//! This crate implements the optimistic transaction protocol:
//! - UpdateChain: forward-only list of committed events
//! - SessionRevisionTracker: per-session position in the chain
//! - PinRegistry: revisions still readable, defining the watermark
//! - TransactionContext: local modification set
//! - Validation: structural conflict detection at commit time
//! - TransactionManager: the commit sequence

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chain;
pub mod manager;
pub mod session;
pub mod transaction;
pub mod validation;

pub use chain::{UpdateChain, UpdateChainLink};
pub use manager::{CommitEnv, CommitOutcome, CommitSink, TransactionManager};
pub use session::{ChainFollower, Pin, PinRegistry, SessionRevisionTracker};
pub use transaction::{
    LocalChange, LocalRead, PendingObject, PendingOperations, PendingState, TransactionContext,
    TransactionStatus,
};
pub use validation::{validate_transaction, ConflictType, ValidationResult};

#[cfg(test)]
mod send_sync {
    static_assertions::assert_impl_all!(super::UpdateChain: Send, Sync);
    static_assertions::assert_impl_all!(super::UpdateChainLink: Send, Sync);
    static_assertions::assert_impl_all!(super::SessionRevisionTracker: Send, Sync);
    static_assertions::assert_impl_all!(super::TransactionManager: Send, Sync);
    static_assertions::assert_impl_all!(super::TransactionContext: Send, Sync);
}
