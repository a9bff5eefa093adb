//! Collaborators shared by the nodes of a cluster
//!
//! Every [`crate::Database`] is one node. Nodes of the same cluster share a
//! [`Backend`]: the row store, the sequence service, the flexible attribute
//! manager, the schema and the replay log, plus the cluster-wide commit lock
//! that serializes revision allocation.

use chronicle_core::{
    BackingStore, FlexAttributeManager, SchemaRegistry, SequenceService, BRANCH_SEQUENCE,
};
use chronicle_durability::{MemoryReplayLog, ReplayLog};
use chronicle_storage::{MemoryFlexStore, MemorySequence, ShardedStore};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;

/// Shared state of one cluster
pub struct Backend {
    store: Arc<dyn BackingStore>,
    sequence: Arc<dyn SequenceService>,
    flex: Arc<dyn FlexAttributeManager>,
    replay_log: Arc<dyn ReplayLog>,
    schema: Arc<dyn SchemaRegistry>,
    commit_lock: Mutex<()>,
}

impl Backend {
    /// Assemble a backend from its collaborators
    pub fn new(
        store: Arc<dyn BackingStore>,
        sequence: Arc<dyn SequenceService>,
        flex: Arc<dyn FlexAttributeManager>,
        replay_log: Arc<dyn ReplayLog>,
        schema: Arc<dyn SchemaRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            sequence,
            flex,
            replay_log,
            schema,
            commit_lock: Mutex::new(()),
        })
    }

    /// Backend built from the in-memory reference collaborators
    ///
    /// The branch sequence starts past the trunk id.
    pub fn in_memory(schema: impl SchemaRegistry + 'static) -> Arc<Self> {
        let trunk = chronicle_core::BranchId::TRUNK.as_u64() as i64;
        Self::new(
            Arc::new(ShardedStore::new()),
            Arc::new(MemorySequence::new().with_value(BRANCH_SEQUENCE, trunk)),
            Arc::new(MemoryFlexStore::new()),
            Arc::new(MemoryReplayLog::new()),
            Arc::new(schema),
        )
    }

    /// Row store
    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// Sequence service
    pub fn sequence(&self) -> &Arc<dyn SequenceService> {
        &self.sequence
    }

    /// Flexible attribute manager
    pub fn flex(&self) -> &Arc<dyn FlexAttributeManager> {
        &self.flex
    }

    /// Replay log
    pub fn replay_log(&self) -> &Arc<dyn ReplayLog> {
        &self.replay_log
    }

    /// Schema registry
    pub fn schema(&self) -> &Arc<dyn SchemaRegistry> {
        &self.schema
    }

    /// Take the cluster-wide commit lock
    pub(crate) fn lock_commits(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("replay_log_len", &self.replay_log.len())
            .finish()
    }
}
