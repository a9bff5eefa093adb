//! Board schema and helpers shared by the scenarios

#![allow(dead_code)]

use chronicle::{
    attrs, Database, DeletionPolicy, HistoryType, ObjectId, ObjectKey, ReferenceDef, Transaction,
    TypeDef, TypeRegistry, Value,
};
use std::sync::{Arc, Once};

static LOGGING: Once = Once::new();

/// Route `tracing` output to the test harness
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Boards hold cards; cards hold comments; audit entries outlive cards
pub fn board_schema() -> TypeRegistry {
    TypeRegistry::new()
        .with_type(TypeDef::new("Board").primitive("title"))
        .and_then(|r| {
            r.with_type(
                TypeDef::new("Card")
                    .primitive("title")
                    .primitive("code")
                    .primitive("position")
                    .reference(
                        "board",
                        ReferenceDef::new("Board").on_delete(DeletionPolicy::ClearReference),
                    ),
            )
        })
        .and_then(|r| {
            r.with_type(
                TypeDef::new("Comment").primitive("text").reference(
                    "card",
                    ReferenceDef::new("Card").on_delete(DeletionPolicy::DeleteReferer),
                ),
            )
        })
        .and_then(|r| {
            r.with_type(
                TypeDef::new("Audit").primitive("note").reference(
                    "card",
                    ReferenceDef::new("Card")
                        .polymorphic()
                        .global()
                        .with_history(HistoryType::Mixed)
                        .on_delete(DeletionPolicy::StabiliseReference),
                ),
            )
        })
        .unwrap()
}

pub fn open_board() -> Arc<Database> {
    init_logging();
    Database::in_memory(board_schema()).unwrap()
}

pub fn reference(key: &ObjectKey) -> Value {
    Value::Ref(ObjectId::new(key.type_name.clone(), key.name))
}

pub fn board(txn: &mut Transaction<'_>, title: &str) -> ObjectKey {
    txn.create("Board", attrs([("title", Value::from(title))]))
        .unwrap()
}

pub fn card(txn: &mut Transaction<'_>, title: &str) -> ObjectKey {
    txn.create("Card", attrs([("title", Value::from(title))]))
        .unwrap()
}

/// Titles of `keys` as seen by a fresh session
pub fn titles(db: &Arc<Database>, keys: &[ObjectKey]) -> Vec<String> {
    let session = db.session();
    keys.iter()
        .map(|key| {
            session
                .attribute(key, "title")
                .unwrap()
                .as_text()
                .unwrap_or_default()
                .to_string()
        })
        .collect()
}
