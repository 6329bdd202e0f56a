#![allow(missing_docs)]

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use lockpool::events::{self, UpdateOperation};
use lockpool::{LockId, LockKind, PoolError, PoolOptions, Registry, RemoveOutcome};
use tempfile::TempDir;

fn registry() -> (
    Registry,
    tokio::sync::mpsc::UnboundedReceiver<lockpool::LockAvailable>,
) {
    let (tx, rx) = events::availability_channel();
    (Registry::new(Arc::new(tx)), rx)
}

#[test]
fn open_twice_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (registry, _rx) = registry();
    registry.open("a.db", dir.path(), 1).unwrap();
    let err = registry.open("a.db", dir.path(), 3).unwrap_err();
    assert!(matches!(err, PoolError::AlreadyOpen { ref name } if name == "a.db"));
    assert_eq!(err.to_string(), "a.db is already open");
    assert_eq!(registry.pool("a.db").unwrap().max_reads(), 1);
}

#[test]
fn operations_on_unknown_names_report_not_open() {
    let dir = TempDir::new().unwrap();
    let (registry, _rx) = registry();
    let not_open = |res: lockpool::Result<()>| {
        matches!(res, Err(PoolError::NotOpen { ref name }) if name == "ghost.db")
    };
    assert!(not_open(registry.request_lock("ghost.db", LockId(1), LockKind::Read)));
    assert!(not_open(registry.dispatch("ghost.db", LockId(1), |_| {})));
    assert!(not_open(registry.attach("ghost.db", "x.db", dir.path(), "x")));
    assert!(not_open(registry.detach("ghost.db", "x")));
    assert!(not_open(registry.close("ghost.db")));
    assert!(registry
        .execute_literal("ghost.db", LockId(1), "SELECT 1")
        .is_err());
    // Release is silent.
    registry.release("ghost.db", LockId(1));
}

#[test]
fn notifications_carry_the_pool_name() {
    let dir = TempDir::new().unwrap();
    let (registry, mut rx) = registry();
    registry.open("left.db", dir.path(), 1).unwrap();
    registry.open("right.db", dir.path(), 1).unwrap();
    assert_eq!(registry.names(), vec!["left.db".to_string(), "right.db".to_string()]);

    registry.request_lock("right.db", LockId(7), LockKind::Write).unwrap();
    registry.request_lock("left.db", LockId(7), LockKind::Read).unwrap();
    let first = rx.try_recv().unwrap();
    let second = rx.try_recv().unwrap();
    assert_eq!((&*first.db, first.lock), ("right.db", LockId(7)));
    assert_eq!((&*second.db, second.lock), ("left.db", LockId(7)));
}

#[test]
fn close_stops_tracking_and_allows_reopen() {
    let dir = TempDir::new().unwrap();
    let (registry, mut rx) = registry();
    registry.open("c.db", dir.path(), 0).unwrap();
    registry.request_lock("c.db", LockId(1), LockKind::Write).unwrap();
    registry.request_lock("c.db", LockId(2), LockKind::Write).unwrap();
    let pool = registry.pool("c.db").unwrap();

    registry.close("c.db").unwrap();
    assert!(!registry.is_open("c.db"));
    assert!(pool.is_closed());
    // Late release after close is tolerated.
    registry.release("c.db", LockId(1));

    registry
        .open_with_options("c.db", dir.path(), &PoolOptions::default().with_max_reads(1))
        .unwrap();
    while rx.try_recv().is_ok() {}
    registry.request_lock("c.db", LockId(2), LockKind::Write).unwrap();
    assert_eq!(rx.try_recv().unwrap().lock, LockId(2));
}

#[test]
fn close_all_empties_the_registry() {
    let dir = TempDir::new().unwrap();
    let (registry, _rx) = registry();
    for name in ["one.db", "two.db", "three.db"] {
        registry.open(name, dir.path(), 1).unwrap();
    }
    let two = registry.pool("two.db").unwrap();
    registry.close_all();
    assert!(registry.names().is_empty());
    assert!(two.is_closed());
}

#[test]
fn remove_deletes_the_database_file() {
    let dir = TempDir::new().unwrap();
    let (registry, _rx) = registry();
    registry.open("gone.db", dir.path(), 1).unwrap();
    registry.request_lock("gone.db", LockId(1), LockKind::Write).unwrap();
    registry
        .execute_literal("gone.db", LockId(1), "CREATE TABLE t(x)")
        .unwrap()
        .blocking_recv()
        .unwrap()
        .unwrap();

    let outcome = registry.remove("gone.db", dir.path()).unwrap();
    assert_eq!(outcome, RemoveOutcome::Removed(dir.path().join("gone.db")));
    assert!(!registry.is_open("gone.db"));
    assert!(!dir.path().join("gone.db").exists());

    let again = registry.remove("gone.db", dir.path()).unwrap();
    assert!(matches!(again, RemoveOutcome::NotFound(_)));
}

#[test]
fn write_handle_changes_reach_update_listener() {
    let dir = TempDir::new().unwrap();
    let (tx, _rx) = events::availability_channel();
    let (updates_tx, mut updates) = events::update_channel();
    let registry = Registry::new(Arc::new(tx)).with_update_listener(Arc::new(updates_tx));
    registry.open("hooked.db", dir.path(), 1).unwrap();

    registry.request_lock("hooked.db", LockId(1), LockKind::Write).unwrap();
    registry
        .execute_literal(
            "hooked.db",
            LockId(1),
            "CREATE TABLE notes(body TEXT);
             INSERT INTO notes(body) VALUES ('a'), ('b');
             UPDATE notes SET body = 'c' WHERE rowid = 2;
             DELETE FROM notes WHERE rowid = 1;",
        )
        .unwrap()
        .blocking_recv()
        .unwrap()
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = updates.try_recv() {
        if event.table == "notes" {
            assert_eq!(&*event.db, "hooked.db");
            assert_eq!(event.database, "main");
            seen.push((event.operation, event.row_id));
        }
    }
    assert_eq!(
        seen,
        vec![
            (UpdateOperation::Insert, 1),
            (UpdateOperation::Insert, 2),
            (UpdateOperation::Update, 2),
            (UpdateOperation::Delete, 1),
        ]
    );
}

#[test]
fn options_loaded_from_toml_drive_the_pool() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("pool.toml");
    std::fs::write(&config, "max_reads = 3\nsynchronous = \"full\"\nbusy_timeout_ms = 500\n")
        .unwrap();
    let options = PoolOptions::load(&config).unwrap();

    let (registry, mut rx) = registry();
    registry
        .open_with_options("cfg.db", dir.path(), &options)
        .unwrap();
    let pool = registry.pool("cfg.db").unwrap();
    assert_eq!(pool.max_reads(), 3);

    registry.request_lock("cfg.db", LockId(1), LockKind::Read).unwrap();
    assert_eq!(rx.try_recv().unwrap().lock, LockId(1));
    let (tx, sync) = std::sync::mpsc::channel();
    registry
        .dispatch("cfg.db", LockId(1), move |conn| {
            let level: i64 = conn
                .query_row("PRAGMA synchronous", [], |row| row.get(0))
                .unwrap();
            tx.send(level).unwrap();
        })
        .unwrap();
    // FULL = 2
    assert_eq!(sync.recv_timeout(Duration::from_secs(10)).unwrap(), 2);
}

#[test]
fn concurrent_opens_of_one_name_register_a_single_pool() {
    let dir = TempDir::new().unwrap();
    let (registry, _rx) = registry();
    let registry = Arc::new(registry);
    let barrier = Arc::new(Barrier::new(4));
    let openers: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            let location = dir.path().to_path_buf();
            thread::spawn(move || {
                barrier.wait();
                registry.open("race.db", location, 1)
            })
        })
        .collect();
    let outcomes: Vec<_> = openers.into_iter().map(|t| t.join().unwrap()).collect();

    assert_eq!(outcomes.iter().filter(|res| res.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .filter_map(|res| res.as_ref().err())
        .all(|err| matches!(err, PoolError::AlreadyOpen { .. })));
    assert_eq!(registry.names(), vec!["race.db".to_string()]);
    let pool = registry.pool("race.db").unwrap();
    assert!(!pool.is_closed());
}

#[test]
fn remove_tolerates_a_concurrent_close() {
    let dir = TempDir::new().unwrap();
    let (registry, _rx) = registry();
    let registry = Arc::new(registry);
    for round in 0..20 {
        let name = format!("contested-{round}.db");
        registry.open(&name, dir.path(), 1).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let closer = {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            let name = name.clone();
            thread::spawn(move || {
                barrier.wait();
                registry.close(&name)
            })
        };
        barrier.wait();
        let removed = registry.remove(&name, dir.path());
        let closed = closer.join().unwrap();

        assert!(removed.is_ok(), "round {round}: {removed:?}");
        assert!(
            closed.is_ok() || matches!(closed, Err(PoolError::NotOpen { .. })),
            "round {round}: {closed:?}"
        );
        assert!(!registry.is_open(&name));
    }
}
