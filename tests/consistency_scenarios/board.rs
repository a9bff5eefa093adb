//! A project board: cards ordered on boards, looked up by code

use crate::fixtures::*;
use chronicle::{attrs, Error, TypeName, Value};

#[test]
fn scenario_board_lifecycle() {
    let db = open_board();
    let mut planner = db.session();

    // r1: two boards, three cards on the first one
    let (todo, done, a, b, c) = planner
        .transaction(|txn| {
            let todo = board(txn, "todo");
            let done = board(txn, "done");
            let list = txn.ordered_links(&todo, "Card", "board", "position")?;
            let cards: Vec<_> = ["a", "b", "c"].into_iter().map(|t| card(txn, t)).collect();
            for key in &cards {
                list.push(txn, key)?;
            }
            Ok((todo, done, cards[0].clone(), cards[1].clone(), cards[2].clone()))
        })
        .unwrap();

    // r2: codes through the indexed view
    planner
        .transaction(|txn| {
            let codes = txn.indexed_links(&todo, "Card", "board", "code")?;
            for (code, key) in [("T-1", &a), ("T-2", &b), ("T-3", &c)] {
                codes.insert(txn, Value::from(code), key)?;
            }
            Ok(())
        })
        .unwrap();
    let codes = planner.indexed_links(&todo, "Card", "board", "code").unwrap();
    assert_eq!(codes.get(&Value::from("T-2")).unwrap(), Some(b.clone()));

    // r3: a new card slots in at position 1
    let observer = db.session();
    let urgent = planner
        .transaction(|txn| {
            let urgent = card(txn, "urgent");
            txn.ordered_links(&todo, "Card", "board", "position")?
                .insert(txn, 1, &urgent)?;
            Ok(urgent)
        })
        .unwrap();

    let list = planner.ordered_links(&todo, "Card", "board", "position").unwrap();
    assert_eq!(titles(&db, &list.to_vec().unwrap()), ["a", "urgent", "b", "c"]);
    let observed = observer.ordered_links(&todo, "Card", "board", "position").unwrap();
    assert_eq!(titles(&db, &observed.to_vec().unwrap()), ["a", "b", "c"]);

    // r4: discussion and an audit trail on b
    let (comment, audit) = planner
        .transaction(|txn| {
            let comment = txn.create(
                "Comment",
                attrs([("text", Value::from("blocked")), ("card", reference(&b))]),
            )?;
            let audit = txn.create(
                "Audit",
                attrs([("note", Value::from("raised")), ("card", reference(&b))]),
            )?;
            Ok((comment, audit))
        })
        .unwrap();
    let before_delete = planner.revision();

    // r5: b is dropped; its comment goes with it, the audit keeps a historic
    // reference
    planner.transaction(|txn| txn.delete(&b)).unwrap();
    assert!(!planner.exists(&comment).unwrap());
    assert_eq!(
        planner.attribute(&audit, "card").unwrap(),
        Value::HistoricRef(b.object_id(), before_delete)
    );
    assert_eq!(
        planner.attribute(&b.at_revision(before_delete), "title").unwrap(),
        Value::from("b")
    );
    assert_eq!(titles(&db, &list.to_vec().unwrap()), ["a", "urgent", "c"]);
    assert_eq!(codes.get(&Value::from("T-2")).unwrap(), None);

    // r6: c moves to the done board in one transaction
    planner
        .transaction(|txn| {
            let from = txn.ordered_links(&todo, "Card", "board", "position")?;
            let to = txn.ordered_links(&done, "Card", "board", "position")?;
            let position = from.position(&c)?.ok_or_else(|| Error::not_found("c"))?;
            assert!(matches!(to.push(txn, &c), Err(Error::InvalidOperation(_))));
            from.remove(txn, position)?;
            to.push(txn, &c)?;
            assert_eq!(from.len()?, 2);
            assert_eq!(to.to_vec()?, vec![c.clone()]);
            Ok(())
        })
        .unwrap();

    let finished = planner.ordered_links(&done, "Card", "board", "position").unwrap();
    assert_eq!(finished.to_vec().unwrap(), vec![c.clone()]);
    assert_eq!(list.to_vec().unwrap(), vec![a.clone(), urgent]);
    assert_eq!(planner.scan(&TypeName::new("Card")).unwrap().len(), 3);

    // The observer catches up in one step
    observer.advance().unwrap();
    assert_eq!(observer.revision(), planner.revision());
    assert_eq!(titles(&db, &observed.to_vec().unwrap()), ["a", "urgent"]);

    let metrics = db.metrics();
    assert_eq!(metrics.total_committed, 6);
    assert_eq!(metrics.total_conflicts, 0);
    assert!(db.cache_stats().caches >= 3);
}

#[test]
fn scenario_failed_reorder_rolls_back() {
    let db = open_board();
    let mut session = db.session();
    let (todo, cards) = session
        .transaction(|txn| {
            let todo = board(txn, "todo");
            let list = txn.ordered_links(&todo, "Card", "board", "position")?;
            let cards: Vec<_> = ["x", "y"].into_iter().map(|t| card(txn, t)).collect();
            list.replace_all(txn, &cards)?;
            Ok((todo, cards))
        })
        .unwrap();

    // A failing closure rolls every list write back
    let err = session
        .transaction(|txn| {
            let list = txn.ordered_links(&todo, "Card", "board", "position")?;
            list.move_to(txn, 1, 0)?;
            assert_eq!(list.to_vec()?, vec![cards[1].clone(), cards[0].clone()]);
            list.insert(txn, 7, &cards[0])
        })
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)));

    let list = session.ordered_links(&todo, "Card", "board", "position").unwrap();
    assert_eq!(list.to_vec().unwrap(), cards);
    assert_eq!(db.latest_revision(), 1);
}
