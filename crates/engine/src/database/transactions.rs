//! Commit path of a node
//!
//! A commit takes the cluster commit lock, then the node's replication
//! state, drains the replay log so the chain holds every foreign revision,
//! and only then validates and allocates. The replay record of the new
//! revision is appended before the chain link is published.

use super::{Database, ReplicationState};
use chronicle_concurrency::{CommitEnv, CommitOutcome, CommitSink, TransactionContext};
use chronicle_core::{AttributeDelta, NodeId, ObjectKey, Result, Revision, RevisionNumber, UpdateEvent};
use chronicle_durability::{ReplayLog, ReplayRecord};
use std::cell::Cell;

/// Appends every commit of this node to the replay log
struct LogSink<'a> {
    node: NodeId,
    log: &'a dyn ReplayLog,
    /// Log length after the append
    appended: Cell<Option<u64>>,
}

impl CommitSink for LogSink<'_> {
    fn committed(&self, revision: &Revision, event: &UpdateEvent) -> Result<()> {
        let record = ReplayRecord::new(self.node, revision.clone(), event.clone());
        let len = self.log.append(&record)?;
        self.appended.set(Some(len));
        Ok(())
    }
}

impl Database {
    /// Commit `txn` on this node
    ///
    /// On failure the transaction is aborted; conflicts are never retried.
    pub(crate) fn commit_transaction(&self, txn: &mut TransactionContext) -> Result<CommitOutcome> {
        let _cluster = self.backend.lock_commits();
        let mut state = self.replication.lock();
        if let Err(e) = self.drain(&mut state) {
            self.coordinator.manager().abort(txn, e.to_string());
            self.coordinator.record_abort();
            return Err(e);
        }

        let sink = LogSink {
            node: self.node,
            log: self.backend.replay_log().as_ref(),
            appended: Cell::new(None),
        };
        let env = self.commit_env(Some(&sink));
        let outcome = self.coordinator.commit(txn, &env)?;
        self.record_own_commit(&mut state, &sink, outcome.revision);
        Ok(outcome)
    }

    /// Publish a commit that is not a transaction (branch creation)
    ///
    /// The caller holds both locks and has drained the log.
    pub(crate) fn publish_system_commit(
        &self,
        state: &mut ReplicationState,
        revision: RevisionNumber,
        writes: &[(ObjectKey, AttributeDelta)],
        event: UpdateEvent,
    ) -> Result<()> {
        let sink = LogSink {
            node: self.node,
            log: self.backend.replay_log().as_ref(),
            appended: Cell::new(None),
        };
        let env = self.commit_env(Some(&sink));
        self.coordinator
            .manager()
            .publish(&env, revision, writes, event, None)?;
        self.record_own_commit(state, &sink, Some(revision));
        Ok(())
    }

    fn commit_env<'a>(&'a self, sink: Option<&'a dyn CommitSink>) -> CommitEnv<'a> {
        CommitEnv {
            store: self.backend.store().as_ref(),
            schema: self.backend.schema().as_ref(),
            branches: &self.branches,
            history: &self.history,
            chain: &self.chain,
            flex: self.backend.flex().as_ref(),
            author: &self.config.author,
            sink,
        }
    }

    fn record_own_commit(
        &self,
        state: &mut ReplicationState,
        sink: &LogSink<'_>,
        revision: Option<RevisionNumber>,
    ) {
        if let Some(position) = sink.appended.get() {
            state.position = position;
        }
        if let Some(revision) = revision {
            state.last_revision = revision;
        }
    }
}
