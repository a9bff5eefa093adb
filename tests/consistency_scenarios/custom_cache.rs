//! An application cache counting cards

use crate::fixtures::*;
use chronicle::cache::make_writable;
use chronicle::{
    Attributes, BranchId, CacheHandler, CacheUpdate, ObjectKey, Result, RevisionNumber, TypeName,
    UpdateEvent, Value,
};
use chronicle_core::BackingStore;
use std::sync::Arc;

struct CardCount {
    store: Arc<dyn BackingStore>,
}

fn is_card(key: &ObjectKey) -> bool {
    key.branch == BranchId::TRUNK && key.type_name.as_str() == "Card"
}

impl CacheHandler for CardCount {
    type Value = i64;

    fn describe(&self) -> String {
        "card count".to_string()
    }

    fn build(&self, revision: RevisionNumber) -> Result<i64> {
        let cards = self
            .store
            .scan(BranchId::TRUNK, &TypeName::new("Card"), revision, &|_| true)?;
        Ok(cards.len() as i64)
    }

    fn handle_event(&self, current: &mut Arc<i64>, event: &UpdateEvent, copy: bool) -> CacheUpdate {
        let created = event.created.keys().filter(|k| is_card(k)).count() as i64;
        let deleted = event.deleted.keys().filter(|k| is_card(k)).count() as i64;
        if created == deleted {
            return CacheUpdate::Unchanged;
        }
        *make_writable(current, copy) += created - deleted;
        CacheUpdate::Changed
    }

    fn handle_local_creation(&self, value: &mut i64, key: &ObjectKey, _: &Attributes) -> bool {
        if !is_card(key) {
            return false;
        }
        *value += 1;
        true
    }

    fn handle_local_deletion(&self, value: &mut i64, key: &ObjectKey, _: &Attributes) -> bool {
        if !is_card(key) {
            return false;
        }
        *value -= 1;
        true
    }

    fn handle_local_change(
        &self,
        _: &mut i64,
        _: &ObjectKey,
        _: &str,
        _: &Value,
        _: &Value,
        _: &Attributes,
    ) -> bool {
        false
    }
}

#[test]
fn scenario_custom_cache_follows_readers() {
    let db = open_board();
    let mut writer = db.session();
    let first = writer.transaction(|txn| Ok(card(txn, "first"))).unwrap();

    let store = Arc::clone(db.backend().store());
    let count = writer
        .cache("card-count", || Ok(CardCount { store }))
        .unwrap();
    assert_eq!(*count.value(&writer.view_context()).unwrap(), 1);

    let lagging = db.session();
    assert_eq!(*count.value(&lagging.view_context()).unwrap(), 1);

    {
        let mut txn = writer.begin();
        card(&mut txn, "second");
        card(&mut txn, "third");
        assert_eq!(*count.value(&txn.view_context()).unwrap(), 3);
        txn.delete(&first).unwrap();
        assert_eq!(*count.value(&txn.view_context()).unwrap(), 2);
        txn.commit().unwrap();
    }

    assert_eq!(*count.value(&writer.view_context()).unwrap(), 2);
    assert_eq!(*count.value(&lagging.view_context()).unwrap(), 1);
    lagging.advance().unwrap();
    assert_eq!(*count.value(&lagging.view_context()).unwrap(), 2);

    // Registered once; the second handler is never built
    let again = writer
        .cache("card-count", || -> Result<CardCount> { panic!("handler built twice") })
        .unwrap();
    assert!(Arc::ptr_eq(&count, &again));

    let stats = db.cache_stats();
    assert_eq!(stats.rebuilds, 1);
    assert!(stats.events_applied >= 1);
}
