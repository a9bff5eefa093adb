//! Nodes configured from their own directories

use crate::fixtures::*;
use chronicle::{Backend, Database, DatabaseConfig, Error, CONFIG_FILE_NAME};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn scenario_two_configured_nodes() {
    init_logging();
    let backend = Backend::in_memory(board_schema());

    let alice_dir = TempDir::new().unwrap();
    let alice = Database::open_dir(backend.clone(), alice_dir.path()).unwrap();
    assert!(alice_dir.path().join(CONFIG_FILE_NAME).exists());
    assert_eq!(alice.config(), &DatabaseConfig::default());

    let bob_dir = TempDir::new().unwrap();
    fs::write(
        bob_dir.path().join(CONFIG_FILE_NAME),
        "node_name = \"bob\"\nauthor = \"bob\"\nrefetch_timeout_ms = 40\n",
    )
    .unwrap();
    let bob = Database::open_dir(backend, bob_dir.path()).unwrap();
    assert_eq!(bob.config().refetch_timeout(), Duration::from_millis(40));

    // Bob commits, Alice picks it up
    let mut bob_session = bob.session();
    let todo = bob_session.transaction(|txn| Ok(board(txn, "todo"))).unwrap();
    assert_eq!(bob.history().get(1).unwrap().author, "bob");

    let mut alice_session = alice.session();
    assert_eq!(alice_session.refetch_default().unwrap(), 1);
    assert_eq!(alice.history().get(1).unwrap().author, "bob");

    // Alice's commit lands after Bob's; Bob times out waiting for more
    let card_key = alice_session
        .transaction(|txn| {
            let key = card(txn, "from alice");
            txn.ordered_links(&todo, "Card", "board", "position")?
                .push(txn, &key)?;
            Ok(key)
        })
        .unwrap();
    assert_eq!(alice.history().get(2).unwrap().author, "chronicle");

    assert_eq!(bob_session.refetch_default().unwrap(), 2);
    let list = bob_session
        .ordered_links(&todo, "Card", "board", "position")
        .unwrap();
    assert_eq!(list.to_vec().unwrap(), vec![card_key]);
    assert!(matches!(
        bob_session.refetch_default(),
        Err(Error::RefetchTimeout { revision: 2, .. })
    ));
}

#[test]
fn scenario_invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join(CONFIG_FILE_NAME),
        "history_retention = \"sometimes\"\n",
    )
    .unwrap();
    let err = Database::open_dir(Backend::in_memory(board_schema()), dir.path()).unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)));
}
