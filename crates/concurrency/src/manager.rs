//! Transaction manager coordinating commits
//!
//! ## Commit Sequence
//!
//! ```text
//! 1. mark_validating()        - Active → Validating
//! 2. validate_transaction()   - structural checks against the latest revision
//! 3. IF conflicts: abort and return MergeConflict
//! 4. flex store / delete      - staged only; the flex manager may still reject
//! 5. allocate revision        - from the revision sequence
//! 6. chain check              - the event must follow the chain tail
//! 7. write_batch()            - rows, readable only at the new revision
//! 8. history append           - revision recorded
//! 9. sink                     - replay record for other nodes
//! 10. flex publish            - staged bags valid from the new revision
//! 11. chain publish           - event visible to sessions and caches
//! 12. mark_committed()
//! ```
//!
//! A failure in steps 4 to 9 undoes every earlier step: staged bags are
//! discarded, rows reverted and the history entry retracted. Nothing of the
//! commit stays behind; at most the revision number is skipped. Steps 10
//! and 11 cannot fail once step 6 passed, since the caller holds the
//! cluster-wide commit lock for the whole sequence and "latest" cannot move.

use crate::chain::{UpdateChain, UpdateChainLink};
use crate::transaction::{PendingState, TransactionContext};
use crate::validation::validate_transaction;
use chronicle_core::{
    AttributeDelta, BackingStore, BranchRegistry, CommitContext, Error, FlexAttributeManager,
    ObjectKey, Result, Revision, RevisionHistory, RevisionNumber, SchemaRegistry, SequenceService,
    TxnId, UpdateEvent,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Receives every revision this node commits, before it is published
pub trait CommitSink {
    /// Called once per commit, in revision order
    fn committed(&self, revision: &Revision, event: &UpdateEvent) -> Result<()>;
}

/// Node resources a commit touches
pub struct CommitEnv<'a> {
    /// Row storage
    pub store: &'a dyn BackingStore,
    /// Type metadata
    pub schema: &'a dyn SchemaRegistry,
    /// Branch registry
    pub branches: &'a BranchRegistry,
    /// Revision history of this node
    pub history: &'a RevisionHistory,
    /// Update chain of this node
    pub chain: &'a UpdateChain,
    /// Flexible attribute storage
    pub flex: &'a dyn FlexAttributeManager,
    /// Author recorded on new revisions
    pub author: &'a str,
    /// Replay sink, if the node replicates
    pub sink: Option<&'a dyn CommitSink>,
}

/// Result of a successful commit
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// Allocated revision; `None` for a transaction without writes
    pub revision: Option<RevisionNumber>,
    /// Published chain link; `None` for a transaction without writes
    pub link: Option<Arc<UpdateChainLink>>,
}

/// Manages transaction ids and the commit protocol
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    sequence: Arc<dyn SequenceService>,
    revision_sequence: String,
}

impl TransactionManager {
    /// Create a manager drawing revisions from `revision_sequence`
    pub fn new(sequence: Arc<dyn SequenceService>, revision_sequence: impl Into<String>) -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
            sequence,
            revision_sequence: revision_sequence.into(),
        }
    }

    /// Allocate next transaction ID
    pub fn next_txn_id(&self) -> TxnId {
        TxnId(self.next_txn_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Start a transaction reading at `read_base`
    pub fn begin(&self, read_base: RevisionNumber) -> TransactionContext {
        TransactionContext::new(self.next_txn_id(), read_base)
    }

    /// Allocate the revision of a commit following `latest`
    ///
    /// # Errors
    ///
    /// Returns `Corruption` if the sequence hands out a value that does not
    /// advance past `latest`.
    pub fn allocate_revision(&self, latest: RevisionNumber) -> Result<RevisionNumber> {
        let revision = self.sequence.next_value(&self.revision_sequence)?;
        if revision <= latest {
            return Err(Error::corruption(format!(
                "sequence {} returned {} at latest revision {}",
                self.revision_sequence, revision, latest
            )));
        }
        Ok(revision)
    }

    /// Commit a transaction
    ///
    /// # Errors
    ///
    /// - `TransactionNotActive` if the transaction already finished
    /// - `MergeConflict` if validation found structural conflicts
    /// - `MergeConflict` if the flex manager rejected a bag
    /// - store, sink and chain failures, after which the transaction is
    ///   aborted
    pub fn commit(
        &self,
        txn: &mut TransactionContext,
        env: &CommitEnv<'_>,
    ) -> Result<CommitOutcome> {
        txn.mark_validating()?;
        let latest = env.chain.latest_revision();

        let validation = validate_transaction(txn, latest, env.store, env.schema, env.branches);
        let validation = match validation {
            Ok(v) => v,
            Err(e) => {
                txn.mark_aborted(e.to_string());
                return Err(e);
            }
        };
        if let Some(err) = validation.into_error(latest) {
            warn!(target: "chronicle::txn", txn = %txn.txn_id, error = %err, "merge conflict");
            txn.mark_aborted(err.to_string());
            return Err(err);
        }

        let writes = txn.writes();
        if writes.is_empty() && txn.flex_bags().next().is_none() {
            txn.mark_committed(txn.read_base)?;
            return Ok(CommitOutcome {
                revision: None,
                link: None,
            });
        }

        if let Err(e) = stage_flex(txn, env) {
            env.flex.discard(txn.txn_id);
            txn.mark_aborted(e.to_string());
            return Err(e);
        }

        let result = self.allocate_revision(latest).and_then(|revision| {
            let event = txn.build_event(revision, latest);
            self.publish(env, revision, &writes, event, Some(txn.txn_id))
                .map(|link| (revision, link))
        });
        match result {
            Ok((revision, link)) => {
                txn.mark_committed(revision)?;
                info!(
                    target: "chronicle::txn",
                    txn = %txn.txn_id,
                    read_base = txn.read_base,
                    revision,
                    writes = writes.len(),
                    "committed"
                );
                Ok(CommitOutcome {
                    revision: Some(revision),
                    link: Some(link),
                })
            }
            Err(e) => {
                env.flex.discard(txn.txn_id);
                warn!(target: "chronicle::txn", txn = %txn.txn_id, error = %e, "commit failed");
                txn.mark_aborted(e.to_string());
                Err(e)
            }
        }
    }

    /// Make `revision` visible: rows, history, sink, staged bags, then the chain
    ///
    /// `flex` names the transaction whose staged bags become valid at
    /// `revision`. On error every step already taken is undone, except that
    /// staged bags are left for the caller to discard.
    pub fn publish(
        &self,
        env: &CommitEnv<'_>,
        revision: RevisionNumber,
        writes: &[(ObjectKey, AttributeDelta)],
        event: UpdateEvent,
        flex: Option<TxnId>,
    ) -> Result<Arc<UpdateChainLink>> {
        env.chain.check_next(&event)?;
        env.store.write_batch(writes, revision)?;

        let entry = Revision::new(revision, env.author);
        if let Err(e) = env.history.append(entry.clone()) {
            return Err(undo_rows(env, writes, revision, e));
        }
        if let Some(sink) = env.sink {
            if let Err(e) = sink.committed(&entry, &event) {
                env.history.retract(revision);
                return Err(undo_rows(env, writes, revision, e));
            }
        }

        if let Some(txn) = flex {
            env.flex.publish(txn, revision);
        }
        env.chain.publish(event)
    }

    /// Explicitly abort a transaction
    pub fn abort(&self, txn: &mut TransactionContext, reason: impl Into<String>) {
        txn.mark_aborted(reason);
    }
}

/// Revert the rows of a failed commit and return the failure
fn undo_rows(
    env: &CommitEnv<'_>,
    writes: &[(ObjectKey, AttributeDelta)],
    revision: RevisionNumber,
    cause: Error,
) -> Error {
    if let Err(e) = env.store.revert_batch(writes, revision) {
        error!(
            target: "chronicle::txn",
            revision,
            error = %e,
            cause = %cause,
            "rows of failed commit could not be reverted"
        );
    }
    cause
}

fn stage_flex(txn: &TransactionContext, env: &CommitEnv<'_>) -> Result<()> {
    let ctx = CommitContext {
        txn: txn.txn_id,
        read_base: txn.read_base,
        author: env.author.to_string(),
    };
    for (key, bag) in txn.flex_bags() {
        if !env.flex.store(key, bag, &ctx)? {
            return Err(Error::merge_conflict(
                key.clone(),
                env.chain.latest_revision(),
                "flexible attributes rejected",
            ));
        }
    }
    for (key, _) in txn
        .objects()
        .filter(|(_, p)| p.state == PendingState::Deleted)
    {
        if !env.flex.delete(key, &ctx)? {
            return Err(Error::merge_conflict(
                key.clone(),
                env.chain.latest_revision(),
                "flexible attribute deletion rejected",
            ));
        }
    }
    Ok(())
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("next_txn_id", &self.next_txn_id.load(Ordering::Relaxed))
            .field("revision_sequence", &self.revision_sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_core::{
        attrs, Attributes, AttributeBag, BranchId, ObjectName, TypeDef, TypeRegistry, Value,
    };
    use chronicle_storage::{MemoryFlexStore, MemorySequence, ShardedStore};

    struct Fixture {
        store: ShardedStore,
        schema: TypeRegistry,
        branches: BranchRegistry,
        history: RevisionHistory,
        chain: UpdateChain,
        flex: MemoryFlexStore,
        manager: TransactionManager,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: ShardedStore::new(),
                schema: TypeRegistry::new()
                    .with_type(TypeDef::new("Person").primitive("age"))
                    .unwrap(),
                branches: BranchRegistry::new(),
                history: RevisionHistory::new(),
                chain: UpdateChain::new(0),
                flex: MemoryFlexStore::new(),
                manager: TransactionManager::new(Arc::new(MemorySequence::new()), "revision"),
            }
        }

        fn commit(&self, txn: &mut TransactionContext, sink: Option<&dyn CommitSink>) -> Result<CommitOutcome> {
            let env = CommitEnv {
                store: &self.store,
                schema: &self.schema,
                branches: &self.branches,
                history: &self.history,
                chain: &self.chain,
                flex: &self.flex,
                author: "tester",
                sink,
            };
            self.manager.commit(txn, &env)
        }
    }

    struct Recording(parking_lot::Mutex<Vec<RevisionNumber>>);

    impl CommitSink for Recording {
        fn committed(&self, revision: &Revision, _event: &UpdateEvent) -> Result<()> {
            self.0.lock().push(revision.commit_number);
            Ok(())
        }
    }

    struct Refusing;

    impl CommitSink for Refusing {
        fn committed(&self, _revision: &Revision, _event: &UpdateEvent) -> Result<()> {
            Err(Error::storage("replay log unavailable"))
        }
    }

    fn person(n: i64) -> ObjectKey {
        ObjectKey::current(BranchId::TRUNK, "Person", ObjectName::new(n))
    }

    #[test]
    fn test_commit_publishes_in_order() {
        let fx = Fixture::new();
        let sink = Recording(parking_lot::Mutex::new(Vec::new()));
        let anchor = fx.chain.tail();

        let mut txn = fx.manager.begin(0);
        txn.record_create(person(1), attrs([("age", Value::Int(3))])).unwrap();
        let outcome = fx.commit(&mut txn, Some(&sink)).unwrap();

        assert_eq!(outcome.revision, Some(1));
        assert_eq!(txn.status, crate::TransactionStatus::Committed { revision: 1 });
        assert_eq!(fx.history.latest_number(), 1);
        assert_eq!(fx.chain.latest_revision(), 1);
        assert_eq!(*sink.0.lock(), vec![1]);
        assert_eq!(
            fx.store.read_as_of(&person(1), 1).unwrap(),
            Some(attrs([("age", Value::Int(3))]))
        );
        let event = anchor.next().unwrap().event().unwrap().clone();
        assert!(event.created.contains_key(&person(1)));
        assert_eq!(event.previous_revision, 0);
    }

    #[test]
    fn test_commit_without_writes_allocates_nothing() {
        let fx = Fixture::new();
        let mut txn = fx.manager.begin(0);
        let outcome = fx.commit(&mut txn, None).unwrap();
        assert!(outcome.revision.is_none());
        assert!(outcome.link.is_none());
        assert_eq!(fx.chain.latest_revision(), 0);
        assert!(fx.commit(&mut txn, None).is_err());
    }

    #[test]
    fn test_conflict_aborts_without_side_effects() {
        let fx = Fixture::new();
        let mut setup = fx.manager.begin(0);
        setup.record_create(person(1), Attributes::new()).unwrap();
        fx.commit(&mut setup, None).unwrap();

        let mut a = fx.manager.begin(1);
        let mut b = fx.manager.begin(1);
        let base = || fx.store.read_as_of(&person(1), 1);
        a.record_delete(&person(1), base).unwrap();
        b.record_change(&person(1), base, "age", Value::Int(4)).unwrap();

        fx.commit(&mut a, None).unwrap();
        let err = fx.commit(&mut b, None).unwrap_err();
        assert!(matches!(err, Error::MergeConflict { revision: 2, .. }));
        assert!(matches!(b.status, crate::TransactionStatus::Aborted { .. }));
        assert_eq!(fx.chain.latest_revision(), 2);
    }

    #[test]
    fn test_rejected_flex_bag_aborts_before_allocation() {
        let fx = Fixture::new();
        fx.flex.set_read_only(true);
        let mut txn = fx.manager.begin(0);
        txn.record_create(person(1), Attributes::new()).unwrap();
        txn.stage_flex(person(1), AttributeBag::from([("nick".to_string(), Value::from("x"))]))
            .unwrap();
        let err = fx.commit(&mut txn, None).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(fx.chain.latest_revision(), 0);
        assert!(fx.store.read_as_of(&person(1), 1).unwrap().is_none());

        // The next commit still gets revision 1
        fx.flex.set_read_only(false);
        let mut txn = fx.manager.begin(0);
        txn.record_create(person(2), Attributes::new()).unwrap();
        assert_eq!(fx.commit(&mut txn, None).unwrap().revision, Some(1));
    }

    /// Commit person 1 with age 1 at revision 1, then stage a change of it,
    /// a new person 2 and a flex bag on a transaction reading revision 1
    fn staged_followup(fx: &Fixture) -> TransactionContext {
        let mut setup = fx.manager.begin(0);
        setup.record_create(person(1), attrs([("age", Value::Int(1))])).unwrap();
        fx.commit(&mut setup, None).unwrap();

        let mut txn = fx.manager.begin(1);
        txn.record_change(&person(1), || fx.store.read_as_of(&person(1), 1), "age", Value::Int(2))
            .unwrap();
        txn.record_create(person(2), Attributes::new()).unwrap();
        txn.stage_flex(person(1), AttributeBag::from([("nick".to_string(), Value::from("x"))]))
            .unwrap();
        txn
    }

    fn assert_only_first_commit_visible(fx: &Fixture, revision: RevisionNumber) {
        assert_eq!(
            fx.store.read_as_of(&person(1), revision).unwrap().unwrap()["age"],
            Value::Int(1)
        );
        assert!(fx.store.read_as_of(&person(2), revision).unwrap().is_none());
        assert!(fx.flex.load(&person(1), revision).unwrap().is_empty());
        assert_eq!(fx.flex.staged_count(), 0);
    }

    #[test]
    fn test_sink_failure_leaves_no_trace() {
        let fx = Fixture::new();
        let mut txn = staged_followup(&fx);

        let err = fx.commit(&mut txn, Some(&Refusing)).unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(matches!(txn.status, crate::TransactionStatus::Aborted { .. }));
        assert_eq!(fx.history.latest_number(), 1);
        assert_eq!(fx.chain.latest_revision(), 1);
        assert_only_first_commit_visible(&fx, 2);

        // Revision 2 is skipped; later readers still see nothing of it
        let mut next = fx.manager.begin(1);
        next.record_create(person(3), Attributes::new()).unwrap();
        assert_eq!(fx.commit(&mut next, None).unwrap().revision, Some(3));
        assert_only_first_commit_visible(&fx, 3);
        assert!(fx.store.read_as_of(&person(3), 3).unwrap().is_some());
    }

    #[test]
    fn test_history_failure_reverts_rows() {
        let fx = Fixture::new();
        let mut txn = staged_followup(&fx);
        // A foreign entry ahead of the next allocation makes the append fail
        fx.history.append(Revision::new(9, "other")).unwrap();

        let err = fx.commit(&mut txn, None).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(fx.chain.latest_revision(), 1);
        assert_only_first_commit_visible(&fx, 2);
        assert_only_first_commit_visible(&fx, 9);
    }

    #[test]
    fn test_second_rejected_bag_discards_the_first() {
        let fx = Fixture::new();
        let mut setup = fx.manager.begin(0);
        setup.record_create(person(1), Attributes::new()).unwrap();
        setup.record_create(person(2), Attributes::new()).unwrap();
        fx.commit(&mut setup, None).unwrap();

        let mut txn = fx.manager.begin(1);
        txn.stage_flex(person(1), AttributeBag::from([("motto".to_string(), Value::from("a"))]))
            .unwrap();
        txn.stage_flex(person(2), AttributeBag::from([("motto".to_string(), Value::from("b"))]))
            .unwrap();
        // Staging person 1 succeeds, then the store turns read-only for person 2
        struct Flaky<'a>(&'a MemoryFlexStore);
        impl FlexAttributeManager for Flaky<'_> {
            fn load(&self, object: &ObjectKey, revision: RevisionNumber) -> Result<AttributeBag> {
                self.0.load(object, revision)
            }
            fn store(&self, object: &ObjectKey, bag: &AttributeBag, ctx: &CommitContext) -> Result<bool> {
                if object.name == ObjectName::new(2) {
                    return Ok(false);
                }
                self.0.store(object, bag, ctx)
            }
            fn delete(&self, object: &ObjectKey, ctx: &CommitContext) -> Result<bool> {
                self.0.delete(object, ctx)
            }
            fn publish(&self, txn: TxnId, revision: RevisionNumber) {
                self.0.publish(txn, revision)
            }
            fn discard(&self, txn: TxnId) {
                self.0.discard(txn)
            }
        }
        let flaky = Flaky(&fx.flex);
        let env = CommitEnv {
            store: &fx.store,
            schema: &fx.schema,
            branches: &fx.branches,
            history: &fx.history,
            chain: &fx.chain,
            flex: &flaky,
            author: "tester",
            sink: None,
        };
        let err = fx.manager.commit(&mut txn, &env).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(fx.flex.staged_count(), 0);
        assert!(fx.flex.load(&person(1), 5).unwrap().is_empty());
        assert_eq!(fx.chain.latest_revision(), 1);
    }
}
