//! Shared fixtures for the engine integration tests

#![allow(dead_code)]

use chronicle_core::{
    attrs, DeletionPolicy, Error, FlexAttributeManager, ObjectId, ObjectKey, ReferenceDef,
    Result, TypeDef, TypeRegistry, Value, BRANCH_SEQUENCE,
};
use chronicle_durability::{MemoryReplayLog, ReplayLog, ReplayRecord};
use chronicle_engine::{Backend, Database, DatabaseConfig, Transaction};
use chronicle_storage::{MemorySequence, ShardedStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Teams with members; members carry a badge and a rank
pub fn team_schema() -> TypeRegistry {
    TypeRegistry::new()
        .with_type(TypeDef::new("Team").primitive("name"))
        .and_then(|r| {
            r.with_type(
                TypeDef::new("Member")
                    .primitive("name")
                    .primitive("badge")
                    .primitive("rank")
                    .reference(
                        "team",
                        ReferenceDef::new("Team").on_delete(DeletionPolicy::ClearReference),
                    ),
            )
        })
        .unwrap()
}

pub fn open() -> Arc<Database> {
    Database::in_memory(team_schema()).unwrap()
}

/// Single node over in-memory rows with the given flexible attribute
/// manager and replay log
pub fn open_with(flex: Arc<dyn FlexAttributeManager>, log: Arc<dyn ReplayLog>) -> Arc<Database> {
    let backend = Backend::new(
        Arc::new(ShardedStore::new()),
        Arc::new(MemorySequence::new().with_value(BRANCH_SEQUENCE, 1)),
        flex,
        log,
        Arc::new(team_schema()),
    );
    Database::open(backend, DatabaseConfig::default()).unwrap()
}

/// Replay log whose appends fail while it is broken
#[derive(Debug, Default)]
pub struct BreakableLog {
    inner: MemoryReplayLog,
    broken: AtomicBool,
}

impl BreakableLog {
    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }
}

impl ReplayLog for BreakableLog {
    fn append(&self, record: &ReplayRecord) -> Result<u64> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::storage("replay log unavailable"));
        }
        self.inner.append(record)
    }

    fn read_from(&self, position: u64) -> Result<Vec<ReplayRecord>> {
        self.inner.read_from(position)
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn wait_beyond(&self, position: u64, timeout: Duration) -> bool {
        self.inner.wait_beyond(position, timeout)
    }
}

/// Second node on the backend of `db`
pub fn open_peer(backend: &Arc<Backend>, name: &str) -> Arc<Database> {
    let config = DatabaseConfig {
        node_name: name.to_string(),
        ..Default::default()
    };
    Database::open(Arc::clone(backend), config).unwrap()
}

pub fn team_ref(team: &ObjectKey) -> Value {
    Value::Ref(ObjectId::new("Team", team.name))
}

pub fn create_team(txn: &mut Transaction<'_>, name: &str) -> ObjectKey {
    txn.create("Team", attrs([("name", Value::from(name))]))
        .unwrap()
}

pub fn create_member(txn: &mut Transaction<'_>, name: &str) -> ObjectKey {
    txn.create("Member", attrs([("name", Value::from(name))]))
        .unwrap()
}

pub fn name_of(db: &Arc<Database>, key: &ObjectKey) -> String {
    let session = db.session();
    session
        .attribute(key, "name")
        .unwrap()
        .as_text()
        .unwrap_or_default()
        .to_string()
}
