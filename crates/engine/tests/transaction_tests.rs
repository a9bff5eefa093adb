//! Transactions racing on one node
//!
//! Attribute writes merge; structural conflicts abort the later commit and
//! leave nothing behind.

mod common;

use chronicle_core::{
    attrs, AttributeBag, CommitContext, Error, FlexAttributeManager, ObjectKey, ObjectName,
    Result, RevisionNumber, TxnId, Value,
};
use chronicle_durability::MemoryReplayLog;
use chronicle_storage::MemoryFlexStore;
use common::*;
use std::sync::{Arc, Barrier, OnceLock};
use std::thread;

#[test]
fn test_concurrent_attribute_writes_merge() {
    let db = open();
    let mut first = db.session();
    let member = first
        .transaction(|txn| Ok(create_member(txn, "ann")))
        .unwrap();
    let mut second = db.session();

    let mut a = first.begin();
    a.set(&member, "badge", Value::from("b-1")).unwrap();
    let mut b = second.begin();
    b.set(&member, "rank", Value::Int(4)).unwrap();
    b.set(&member, "name", Value::from("anne")).unwrap();

    a.commit().unwrap();
    b.commit().unwrap();

    let reader = db.session();
    assert_eq!(reader.attribute(&member, "badge").unwrap(), Value::from("b-1"));
    assert_eq!(reader.attribute(&member, "rank").unwrap(), Value::Int(4));
    assert_eq!(reader.attribute(&member, "name").unwrap(), Value::from("anne"));
}

#[test]
fn test_same_attribute_last_commit_wins() {
    let db = open();
    let mut first = db.session();
    let member = first
        .transaction(|txn| Ok(create_member(txn, "ann")))
        .unwrap();
    let mut second = db.session();

    let mut a = first.begin();
    a.set(&member, "rank", Value::Int(1)).unwrap();
    let mut b = second.begin();
    b.set(&member, "rank", Value::Int(2)).unwrap();
    b.commit().unwrap();
    a.commit().unwrap();

    assert_eq!(db.session().attribute(&member, "rank").unwrap(), Value::Int(1));
    assert_eq!(db.metrics().total_conflicts, 0);
}

#[test]
fn test_change_after_concurrent_delete_conflicts() {
    let db = open();
    let mut first = db.session();
    let member = first
        .transaction(|txn| Ok(create_member(txn, "ann")))
        .unwrap();
    let mut second = db.session();

    first.transaction(|txn| txn.delete(&member)).unwrap();
    let before = db.latest_revision();

    let err = second
        .transaction(|txn| txn.set(&member, "rank", Value::Int(9)))
        .unwrap_err();
    assert!(matches!(err, Error::MergeConflict { .. }));
    assert_eq!(db.latest_revision(), before);
    assert_eq!(second.revision(), before - 1);

    let metrics = db.metrics();
    assert_eq!(metrics.total_conflicts, 1);
    assert_eq!(metrics.active_count, 0);
}

#[test]
fn test_reference_to_concurrently_deleted_target_conflicts() {
    let db = open();
    let mut first = db.session();
    let (team, member) = first
        .transaction(|txn| Ok((create_team(txn, "t"), create_member(txn, "m"))))
        .unwrap();
    let mut second = db.session();

    let mut link = second.begin();
    link.set(&member, "team", team_ref(&team)).unwrap();
    first.transaction(|txn| txn.delete(&team)).unwrap();

    assert!(matches!(link.commit(), Err(Error::MergeConflict { .. })));
    assert_eq!(db.session().attribute(&member, "team").unwrap(), Value::Null);
}

#[test]
fn test_delete_conflicts_with_concurrent_referrer() {
    let db = open();
    let mut first = db.session();
    let (team, member) = first
        .transaction(|txn| Ok((create_team(txn, "t"), create_member(txn, "m"))))
        .unwrap();
    let mut second = db.session();

    let mut remove = first.begin();
    remove.delete(&team).unwrap();
    second
        .transaction(|txn| txn.set(&member, "team", team_ref(&team)))
        .unwrap();

    assert!(matches!(remove.commit(), Err(Error::MergeConflict { .. })));
    let reader = db.session();
    assert!(reader.exists(&team).unwrap());
    assert_eq!(reader.attribute(&member, "team").unwrap(), team_ref(&team));
}

#[test]
fn test_racing_commits_get_distinct_revisions() {
    const WRITERS: usize = 4;
    const COMMITS: usize = 10;
    let db = open();
    let mut setup = db.session();
    let member = setup
        .transaction(|txn| Ok(create_member(txn, "shared")))
        .unwrap();

    let barrier = Arc::new(Barrier::new(WRITERS));
    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let db = Arc::clone(&db);
            let member = member.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut session = db.session();
                barrier.wait();
                let mut revisions = Vec::new();
                for i in 0..COMMITS {
                    let mut txn = session.begin();
                    txn.set(&member, "rank", Value::Int((w * 100 + i) as i64)).unwrap();
                    let revision = txn.commit().unwrap().unwrap();
                    revisions.push(revision.commit_number);
                }
                revisions
            })
        })
        .collect();

    let mut all: Vec<i64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();
    let expected: Vec<i64> = (2..=(1 + WRITERS * COMMITS) as i64).collect();
    assert_eq!(all, expected);
    assert_eq!(db.metrics().total_committed, (1 + WRITERS * COMMITS) as u64);
}

#[test]
fn test_read_only_commit_allocates_nothing() {
    let db = open();
    let mut session = db.session();
    let member = session
        .transaction(|txn| Ok(create_member(txn, "m")))
        .unwrap();

    let txn = session.begin();
    assert_eq!(txn.attribute(&member, "name").unwrap(), Value::from("m"));
    assert!(txn.commit().unwrap().is_none());
    assert_eq!(db.latest_revision(), 1);
}

#[test]
fn test_rejected_flex_bag_aborts_commit() {
    let flex = Arc::new(MemoryFlexStore::new());
    let db = open_with(flex.clone(), Arc::new(MemoryReplayLog::new()));
    let mut session = db.session();
    let member = session
        .transaction(|txn| txn.create("Member", attrs([("name", Value::from("m"))])))
        .unwrap();

    flex.set_read_only(true);
    let err = session
        .transaction(|txn| txn.set(&member, "nickname", Value::from("emm")))
        .unwrap_err();
    assert!(matches!(err, Error::MergeConflict { .. }));
    assert_eq!(db.latest_revision(), 1);
    assert_eq!(session.attribute(&member, "nickname").unwrap(), Value::Null);

    flex.set_read_only(false);
    session
        .transaction(|txn| txn.set(&member, "nickname", Value::from("emm")))
        .unwrap();
    assert_eq!(session.attribute(&member, "nickname").unwrap(), Value::from("emm"));
    assert_eq!(flex.store_count(), 1);
}

#[test]
fn test_failed_log_append_leaves_nothing_behind() {
    let log = Arc::new(BreakableLog::default());
    let db = open_with(Arc::new(MemoryFlexStore::new()), log.clone());
    let mut session = db.session();
    let member = session
        .transaction(|txn| Ok(create_member(txn, "m")))
        .unwrap();

    log.set_broken(true);
    let err = session
        .transaction(|txn| {
            txn.set(&member, "name", Value::from("ghost"))?;
            txn.set(&member, "motto", Value::from("boo"))?;
            Ok(create_member(txn, "phantom"))
        })
        .unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
    assert_eq!(db.latest_revision(), 1);

    log.set_broken(false);
    session
        .transaction(|txn| Ok(create_member(txn, "later")))
        .unwrap();
    let other = db.session();
    for reader in [&session, &other] {
        assert_eq!(reader.attribute(&member, "name").unwrap(), Value::from("m"));
        assert_eq!(reader.attribute(&member, "motto").unwrap(), Value::Null);
        assert_eq!(reader.scan(&"Member".into()).unwrap().len(), 2);
    }
    assert_eq!(db.backend().replay_log().len(), 2);
}

/// Flexible attribute manager refusing every bag of one object
#[derive(Default)]
struct Refusing {
    inner: MemoryFlexStore,
    refused: OnceLock<ObjectName>,
}

impl Refusing {
    fn refuses(&self, object: &ObjectKey) -> bool {
        self.refused.get() == Some(&object.name)
    }
}

impl FlexAttributeManager for Refusing {
    fn load(&self, object: &ObjectKey, revision: RevisionNumber) -> Result<AttributeBag> {
        self.inner.load(object, revision)
    }

    fn store(&self, object: &ObjectKey, changes: &AttributeBag, ctx: &CommitContext) -> Result<bool> {
        if self.refuses(object) {
            return Ok(false);
        }
        self.inner.store(object, changes, ctx)
    }

    fn delete(&self, object: &ObjectKey, ctx: &CommitContext) -> Result<bool> {
        if self.refuses(object) {
            return Ok(false);
        }
        self.inner.delete(object, ctx)
    }

    fn publish(&self, txn: TxnId, revision: RevisionNumber) {
        self.inner.publish(txn, revision);
    }

    fn discard(&self, txn: TxnId) {
        self.inner.discard(txn);
    }
}

#[test]
fn test_one_refused_bag_discards_the_others() {
    let flex = Arc::new(Refusing::default());
    let db = open_with(flex.clone(), Arc::new(MemoryReplayLog::new()));
    let mut session = db.session();
    let (first, second) = session
        .transaction(|txn| Ok((create_member(txn, "a"), create_member(txn, "b"))))
        .unwrap();
    flex.refused.set(second.name).unwrap();

    let err = session
        .transaction(|txn| {
            txn.set(&first, "motto", Value::from("one"))?;
            txn.set(&second, "motto", Value::from("two"))
        })
        .unwrap_err();
    assert!(matches!(err, Error::MergeConflict { .. }));
    assert_eq!(flex.inner.staged_count(), 0);

    session
        .transaction(|txn| txn.set(&first, "name", Value::from("aa")))
        .unwrap();
    assert_eq!(session.attribute(&first, "name").unwrap(), Value::from("aa"));
    assert_eq!(session.attribute(&first, "motto").unwrap(), Value::Null);
    assert_eq!(session.attribute(&second, "motto").unwrap(), Value::Null);
}

#[test]
fn test_abandoned_and_rolled_back_transactions_are_counted() {
    let db = open();
    let mut session = db.session();
    {
        let mut txn = session.begin();
        create_member(&mut txn, "lost");
    }
    let mut txn = session.begin();
    create_member(&mut txn, "undone");
    assert!(txn.rollback());
    assert!(!txn.rollback());
    drop(txn);

    let metrics = db.metrics();
    assert_eq!(metrics.total_started, 2);
    assert_eq!(metrics.total_aborted, 2);
    assert_eq!(metrics.total_abandoned, 1);
    assert_eq!(metrics.active_count, 0);
    assert_eq!(db.latest_revision(), 0);
}

#[test]
fn test_closure_error_rolls_back() {
    let db = open();
    let mut session = db.session();
    let err = session
        .transaction(|txn| {
            create_team(txn, "never");
            txn.create("Spaceship", attrs([("name", Value::from("x"))]))
        })
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(db.latest_revision(), 0);
    assert!(session.scan(&"Team".into()).unwrap().is_empty());
}
