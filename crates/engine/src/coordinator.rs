//! Transaction coordinator for managing transaction lifecycle
//!
//! The TransactionCoordinator wraps TransactionManager and adds:
//! - Active transaction tracking
//! - Transaction metrics (started, committed, aborted, conflicts, abandoned)
//! - Commit rate calculation

use chronicle_concurrency::{CommitEnv, CommitOutcome, TransactionContext, TransactionManager};
use chronicle_core::{Result, RevisionNumber, SequenceService};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Transaction coordinator of one node
///
/// # Memory Ordering
///
/// The metric counters use Relaxed ordering: they are purely observational
/// and do not synchronize any other memory operations.
pub struct TransactionCoordinator {
    /// Transaction manager for id and revision allocation
    manager: TransactionManager,
    active_count: AtomicU64,
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_aborted: AtomicU64,
    total_conflicts: AtomicU64,
    total_abandoned: AtomicU64,
}

impl TransactionCoordinator {
    /// Create a coordinator drawing revisions from `revision_sequence`
    pub fn new(sequence: Arc<dyn SequenceService>, revision_sequence: &str) -> Self {
        Self {
            manager: TransactionManager::new(sequence, revision_sequence),
            active_count: AtomicU64::new(0),
            total_started: AtomicU64::new(0),
            total_committed: AtomicU64::new(0),
            total_aborted: AtomicU64::new(0),
            total_conflicts: AtomicU64::new(0),
            total_abandoned: AtomicU64::new(0),
        }
    }

    /// Start a transaction reading at `read_base`
    pub fn start_transaction(&self, read_base: RevisionNumber) -> TransactionContext {
        let txn = self.manager.begin(read_base);
        self.record_start();
        debug!(target: "chronicle::txn", txn = %txn.txn_id, read_base, "transaction started");
        txn
    }

    /// Commit a transaction through the concurrency layer
    ///
    /// The caller holds the cluster commit lock and has drained the replay
    /// log. Records commit, abort and conflict metrics.
    pub fn commit(
        &self,
        txn: &mut TransactionContext,
        env: &CommitEnv<'_>,
    ) -> Result<CommitOutcome> {
        match self.manager.commit(txn, env) {
            Ok(outcome) => {
                self.record_commit();
                Ok(outcome)
            }
            Err(e) => {
                if e.is_conflict() {
                    self.total_conflicts.fetch_add(1, Ordering::Relaxed);
                }
                self.record_abort();
                Err(e)
            }
        }
    }

    /// Allocate a revision outside a transaction (branch creation)
    pub fn allocate_revision(&self, latest: RevisionNumber) -> Result<RevisionNumber> {
        self.manager.allocate_revision(latest)
    }

    /// Underlying manager, for publishing non-transactional commits
    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    /// Record transaction start
    pub fn record_start(&self) {
        self.active_count.fetch_add(1, Ordering::Relaxed);
        self.total_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record transaction commit
    ///
    /// Decrements active count (saturating at 0) and increments committed count.
    pub fn record_commit(&self) {
        self.decrement_active();
        self.total_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record transaction abort or rollback
    pub fn record_abort(&self) {
        self.decrement_active();
        self.total_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transaction dropped while still active
    pub fn record_abandoned(&self, txn: &TransactionContext) {
        self.total_abandoned.fetch_add(1, Ordering::Relaxed);
        self.record_abort();
        warn!(
            target: "chronicle::txn",
            txn = %txn.txn_id,
            read_base = txn.read_base,
            elapsed_ms = txn.elapsed().as_millis() as u64,
            "transaction dropped while active, rolled back"
        );
    }

    fn decrement_active(&self) {
        let _ = self
            .active_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
    }

    /// Get transaction metrics
    pub fn metrics(&self) -> TransactionMetrics {
        let started = self.total_started.load(Ordering::Relaxed);
        let committed = self.total_committed.load(Ordering::Relaxed);

        TransactionMetrics {
            active_count: self.active_count.load(Ordering::Relaxed),
            total_started: started,
            total_committed: committed,
            total_aborted: self.total_aborted.load(Ordering::Relaxed),
            total_conflicts: self.total_conflicts.load(Ordering::Relaxed),
            total_abandoned: self.total_abandoned.load(Ordering::Relaxed),
            commit_rate: if started > 0 {
                committed as f64 / started as f64
            } else {
                0.0
            },
        }
    }

    /// Get current active transaction count
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("manager", &self.manager)
            .field("metrics", &self.metrics())
            .finish()
    }
}

/// Transaction metrics
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionMetrics {
    /// Number of currently active transactions
    pub active_count: u64,
    /// Total number of transactions started
    pub total_started: u64,
    /// Total number of transactions committed
    pub total_committed: u64,
    /// Total number of transactions aborted or rolled back
    pub total_aborted: u64,
    /// Aborts caused by merge conflicts
    pub total_conflicts: u64,
    /// Transactions dropped while active
    pub total_abandoned: u64,
    /// Commit success rate (committed / started)
    pub commit_rate: f64,
}

impl TransactionMetrics {
    /// Total transactions that completed (committed + aborted)
    pub fn total_completed(&self) -> u64 {
        self.total_committed + self.total_aborted
    }

    /// Abort rate (aborted / started)
    pub fn abort_rate(&self) -> f64 {
        if self.total_started > 0 {
            self.total_aborted as f64 / self.total_started as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_storage::MemorySequence;

    fn coordinator() -> TransactionCoordinator {
        TransactionCoordinator::new(Arc::new(MemorySequence::new()), "revision")
    }

    #[test]
    fn test_start_transaction_updates_metrics() {
        let coordinator = coordinator();
        let txn = coordinator.start_transaction(4);
        assert_eq!(txn.read_base, 4);
        let metrics = coordinator.metrics();
        assert_eq!(metrics.active_count, 1);
        assert_eq!(metrics.total_started, 1);
    }

    #[test]
    fn test_abandoned_counts_as_abort() {
        let coordinator = coordinator();
        let txn = coordinator.start_transaction(0);
        coordinator.record_abandoned(&txn);
        let metrics = coordinator.metrics();
        assert_eq!(metrics.active_count, 0);
        assert_eq!(metrics.total_aborted, 1);
        assert_eq!(metrics.total_abandoned, 1);
        assert_eq!(metrics.abort_rate(), 1.0);
    }

    #[test]
    fn test_active_count_saturates_at_zero() {
        let coordinator = coordinator();
        coordinator.record_start();
        coordinator.record_commit();
        coordinator.record_commit();
        assert_eq!(coordinator.active_count(), 0, "should saturate, not underflow");
        coordinator.record_abort();
        assert_eq!(coordinator.active_count(), 0);
    }

    #[test]
    fn test_metrics_helpers() {
        let coordinator = coordinator();
        for _ in 0..4 {
            coordinator.record_start();
        }
        coordinator.record_commit();
        coordinator.record_commit();
        coordinator.record_commit();
        coordinator.record_abort();
        let metrics = coordinator.metrics();
        assert_eq!(metrics.total_completed(), 4);
        assert_eq!(metrics.commit_rate, 0.75);
        assert_eq!(metrics.abort_rate(), 0.25);
    }

    #[test]
    fn test_revisions_are_allocated_past_latest() {
        let coordinator = coordinator();
        assert_eq!(coordinator.allocate_revision(0).unwrap(), 1);
        assert!(coordinator.allocate_revision(5).is_err());
    }
}
