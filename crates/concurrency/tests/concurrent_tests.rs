//! Concurrent/Multi-threaded Tests for chronicle-concurrency
//!
//! These tests verify correct behavior under actual concurrent execution:
//!
//! 1. **Concurrent Commits** - Threads committing under the commit lock
//! 2. **Revision Monotonicity** - Revisions strictly increase and the chain is contiguous
//! 3. **Structural Conflicts** - Racing delete/update pairs commit exactly once
//! 4. **Chain Readers** - Sessions advancing while commits publish
//!
//! ## Running These Tests
//!
//! ```bash
//! cargo test --test concurrent_tests
//! ```

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use chronicle_concurrency::{
    ChainFollower, CommitEnv, PinRegistry, SessionRevisionTracker, TransactionContext,
    TransactionManager, UpdateChain, UpdateChainLink,
};
use chronicle_core::{
    attrs, Attributes, BackingStore, BranchId, BranchRegistry, Error, ObjectKey, ObjectName,
    Result, RevisionHistory, RevisionNumber, SessionId, TypeDef, TypeRegistry, Value,
};
use chronicle_storage::{MemoryFlexStore, MemorySequence, ShardedStore};

// ============================================================================
// Test Helpers
// ============================================================================

struct Node {
    store: ShardedStore,
    schema: TypeRegistry,
    branches: BranchRegistry,
    history: RevisionHistory,
    chain: UpdateChain,
    flex: MemoryFlexStore,
    manager: TransactionManager,
    commit_lock: Mutex<()>,
}

impl Node {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            store: ShardedStore::new(),
            schema: TypeRegistry::new()
                .with_type(TypeDef::new("Counter").primitive("value"))
                .unwrap(),
            branches: BranchRegistry::new(),
            history: RevisionHistory::new(),
            chain: UpdateChain::new(0),
            flex: MemoryFlexStore::new(),
            manager: TransactionManager::new(Arc::new(MemorySequence::new()), "revision"),
            commit_lock: Mutex::new(()),
        })
    }

    fn commit(&self, txn: &mut TransactionContext) -> Result<Option<RevisionNumber>> {
        let _guard = self.commit_lock.lock();
        let env = CommitEnv {
            store: &self.store,
            schema: &self.schema,
            branches: &self.branches,
            history: &self.history,
            chain: &self.chain,
            flex: &self.flex,
            author: "tester",
            sink: None,
        };
        self.manager.commit(txn, &env).map(|o| o.revision)
    }

    fn base(&self, key: &ObjectKey, revision: RevisionNumber) -> Result<Option<Attributes>> {
        self.store.read_as_of(key, revision)
    }
}

fn counter(n: i64) -> ObjectKey {
    ObjectKey::current(BranchId::TRUNK, "Counter", ObjectName::new(n))
}

// ============================================================================
// SECTION 1: Concurrent Commits
// ============================================================================

#[test]
fn test_concurrent_commits_get_unique_increasing_revisions() {
    let node = Node::new();
    let threads = 8;
    let per_thread = 50;
    let barrier = Arc::new(Barrier::new(threads));
    let revisions = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let node = Arc::clone(&node);
            let barrier = Arc::clone(&barrier);
            let revisions = Arc::clone(&revisions);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..per_thread {
                    let name = (t * per_thread + i) as i64;
                    let read_base = node.chain.latest_revision();
                    let mut txn = node.manager.begin(read_base);
                    txn.record_create(counter(name), attrs([("value", Value::Int(name))]))
                        .unwrap();
                    let revision = node.commit(&mut txn).unwrap().unwrap();
                    revisions.lock().push(revision);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let revisions = revisions.lock();
    let unique: HashSet<_> = revisions.iter().copied().collect();
    assert_eq!(unique.len(), threads * per_thread);
    assert_eq!(node.chain.latest_revision(), (threads * per_thread) as i64);
    assert_eq!(node.history.len(), threads * per_thread + 1);

    let all = node
        .store
        .scan(BranchId::TRUNK, &"Counter".into(), node.chain.latest_revision(), &|_| true)
        .unwrap();
    assert_eq!(all.len(), threads * per_thread);
}

// ============================================================================
// SECTION 2: Structural Conflicts
// ============================================================================

#[test]
fn test_racing_delete_and_update_commit_exactly_one() {
    for round in 0..20 {
        let node = Node::new();
        let key = counter(round);
        let mut setup = node.manager.begin(0);
        setup.record_create(key.clone(), attrs([("value", Value::Int(0))])).unwrap();
        node.commit(&mut setup).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let conflicts = Arc::new(AtomicUsize::new(0));

        let deleter = {
            let node = Arc::clone(&node);
            let barrier = Arc::clone(&barrier);
            let conflicts = Arc::clone(&conflicts);
            let key = key.clone();
            thread::spawn(move || {
                let mut txn = node.manager.begin(1);
                txn.record_delete(&key, || node.base(&key, 1)).unwrap();
                barrier.wait();
                if let Err(Error::MergeConflict { .. }) = node.commit(&mut txn) {
                    conflicts.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        let updater = {
            let node = Arc::clone(&node);
            let barrier = Arc::clone(&barrier);
            let conflicts = Arc::clone(&conflicts);
            let key = key.clone();
            thread::spawn(move || {
                let mut txn = node.manager.begin(1);
                txn.record_change(&key, || node.base(&key, 1), "value", Value::Int(9))
                    .unwrap();
                barrier.wait();
                if let Err(Error::MergeConflict { .. }) = node.commit(&mut txn) {
                    conflicts.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        deleter.join().unwrap();
        updater.join().unwrap();

        // Update-then-delete commits both; delete-then-update aborts the update
        let latest = node.chain.latest_revision();
        let alive = node.store.lifecycle(&key, latest).unwrap().is_alive();
        assert!(!alive);
        assert!(conflicts.load(Ordering::SeqCst) <= 1);
        assert_eq!(latest, 3 - conflicts.load(Ordering::SeqCst) as i64);
    }
}

// ============================================================================
// SECTION 3: Chain Readers
// ============================================================================

struct Counter {
    last: Mutex<RevisionNumber>,
    out_of_order: AtomicUsize,
}

impl ChainFollower for Counter {
    fn follow(&self, link: &Arc<UpdateChainLink>) {
        let mut last = self.last.lock();
        if link.revision() != *last + 1 {
            self.out_of_order.fetch_add(1, Ordering::SeqCst);
        }
        *last = link.revision();
    }
}

#[test]
fn test_sessions_see_every_event_in_order_while_commits_publish() {
    let node = Node::new();
    let pins = PinRegistry::new();
    let writers = 4;
    let per_writer = 100;
    let barrier = Arc::new(Barrier::new(writers + 1));

    let tracker = SessionRevisionTracker::new(SessionId(1), node.chain.tail(), &pins);
    let follower = Arc::new(Counter {
        last: Mutex::new(0),
        out_of_order: AtomicUsize::new(0),
    });
    let dyn_follower: Arc<dyn ChainFollower> = follower.clone();
    tracker.touch(&dyn_follower);

    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let node = Arc::clone(&node);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..per_writer {
                    let name = (w * per_writer + i) as i64;
                    let mut txn = node.manager.begin(node.chain.latest_revision());
                    txn.record_create(counter(name), Attributes::new()).unwrap();
                    node.commit(&mut txn).unwrap();
                }
            })
        })
        .collect();

    barrier.wait();
    let mut seen = 0;
    while seen < (writers * per_writer) as i64 {
        let revision = tracker.advance();
        assert!(revision >= seen);
        seen = revision;
        assert_eq!(pins.watermark(i64::MAX), revision);
        thread::yield_now();
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(follower.out_of_order.load(Ordering::SeqCst), 0);
    assert_eq!(*follower.last.lock(), (writers * per_writer) as i64);
}
