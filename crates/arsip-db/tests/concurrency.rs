//! Concurrency tests for the shared connection.
//!
//! These verify that concurrent first callers share a single open, that
//! concurrent sequence allocations never hand out the same value, and that
//! uncommitted writes stay invisible to concurrent readers. Close must wait
//! for the operation in flight before releasing the connection.

use arsip_db::{Database, DbError, DbSettings, DbTarget, DocumentNumber};
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_acquires_open_once() {
    let db = Database::in_memory();
    let mut handles = Vec::new();

    for _ in 0..32 {
        let db = db.clone();
        handles.push(tokio::spawn(async move { db.acquire().await }));
    }

    let mut acquired = Vec::new();
    for handle in handles {
        acquired.push(
            handle
                .await
                .expect("task should not panic")
                .expect("acquire should succeed"),
        );
    }

    assert_eq!(db.open_count(), 1, "store should be opened exactly once");
    let first = &acquired[0];
    assert!(acquired.iter().all(|h| h.same_as(first)));
}

async fn assert_unique_allocation(db: Database) {
    let mut handles = Vec::new();
    for _ in 0..50 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            db.next_sequence("2025", "SK", 3, 2025).await
        }));
    }

    let mut counters = Vec::new();
    for handle in handles {
        let number = handle
            .await
            .expect("task should not panic")
            .expect("allocation should succeed");
        let parsed: DocumentNumber = number.parse().expect("number should parse");
        assert_eq!(parsed.category_code, "SK");
        assert_eq!(parsed.month, 3);
        assert_eq!(parsed.year, 2025);
        counters.push(parsed.counter);
    }

    let distinct: HashSet<i64> = counters.iter().copied().collect();
    assert_eq!(distinct.len(), 50, "no document number may repeat");

    counters.sort_unstable();
    assert_eq!(counters, (1..=50).collect::<Vec<i64>>());
    assert_eq!(db.current_sequence_value("2025").await.unwrap(), Some(50));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_sequences_are_unique_in_memory() {
    assert_unique_allocation(Database::in_memory()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_sequences_are_unique_on_disk() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let db = Database::new(DbSettings::new(DbTarget::File(dir.path().join("arsip.db"))));
    assert_unique_allocation(db.clone()).await;
    db.close().await.expect("close should succeed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_scopes_do_not_share_counters() {
    let db = Database::in_memory();
    let mut handles = Vec::new();

    for i in 0..40 {
        let db = db.clone();
        let scope = if i % 2 == 0 { "2024" } else { "2025" };
        handles.push(tokio::spawn(async move {
            db.next_sequence_value(scope).await.map(|v| (scope, v))
        }));
    }

    let mut per_scope: Vec<(&str, i64)> = Vec::new();
    for handle in handles {
        per_scope.push(handle.await.unwrap().expect("allocation should succeed"));
    }

    for scope in ["2024", "2025"] {
        let mut values: Vec<i64> = per_scope
            .iter()
            .filter(|(s, _)| *s == scope)
            .map(|(_, v)| *v)
            .collect();
        values.sort_unstable();
        assert_eq!(values, (1..=20).collect::<Vec<i64>>(), "scope {scope}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_see_rolled_back_writes() {
    let db = Database::in_memory();
    db.execute("CREATE TABLE profiles (id INTEGER PRIMARY KEY, name TEXT)", &[])
        .await
        .unwrap();

    let (started_tx, started_rx) = tokio::sync::oneshot::channel();

    let writer = {
        let db = db.clone();
        tokio::spawn(async move {
            db.run_in_transaction(move |tx| {
                tx.execute("INSERT INTO profiles (name) VALUES ('Indah')", &[])?;
                tx.execute("INSERT INTO profiles (name) VALUES ('Joko')", &[])?;
                let _ = started_tx.send(());
                std::thread::sleep(Duration::from_millis(150));
                Err::<(), _>(DbError::InvalidDocumentNumber("abandon".into()))
            })
            .await
        })
    };

    started_rx.await.expect("writer should start");
    let rows = db
        .fetch_all("SELECT * FROM profiles", &[])
        .await
        .expect("read should succeed");
    assert!(rows.is_empty(), "uncommitted rows must not be visible");

    let result = writer.await.expect("writer should not panic");
    assert!(result.is_err());

    let rows = db.fetch_all("SELECT * FROM profiles", &[]).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_transaction_still_completes() {
    let db = Database::in_memory();
    db.execute("CREATE TABLE events (id INTEGER PRIMARY KEY, title TEXT)", &[])
        .await
        .unwrap();
    db.acquire().await.unwrap();

    let pending = db.run_in_transaction(|tx| {
        std::thread::sleep(Duration::from_millis(50));
        tx.execute("INSERT INTO events (title) VALUES ('Kelas Iklim')", &[])
    });

    // Poll once so the unit of work is handed to the blocking pool, then
    // drop the future.
    let _ = tokio::time::timeout(Duration::from_millis(10), pending).await;

    let rows = db.fetch_all("SELECT title FROM events", &[]).await.unwrap();
    assert_eq!(rows.len(), 1, "dropped caller must not abort the transaction");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_waits_for_in_flight_transaction() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let db = Database::new(DbSettings::new(DbTarget::File(dir.path().join("arsip.db"))));
    db.acquire().await.unwrap();

    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let writer = {
        let db = db.clone();
        tokio::spawn(async move {
            db.run_in_transaction(move |tx| {
                let _ = started_tx.send(());
                std::thread::sleep(Duration::from_millis(150));
                allocate_in_2025(tx)
            })
            .await
        })
    };

    started_rx.await.expect("writer should start");
    db.close().await.expect("close should succeed");

    assert_eq!(writer.await.unwrap().expect("writer should commit"), 1);
    assert_eq!(db.current_sequence_value("2025").await.unwrap(), Some(1));
    assert_eq!(db.open_count(), 2);
}

fn allocate_in_2025(tx: &arsip_db::Transaction<'_>) -> Result<i64, DbError> {
    arsip_db::allocate(tx, "2025")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handle_held_across_close_cannot_reach_a_second_connection() {
    let db = Database::in_memory();
    let held = db.acquire().await.unwrap();

    db.close().await.expect("close should not wait on idle holders");
    assert!(held.is_closed().await);

    let fresh = db.acquire().await.unwrap();
    assert!(!fresh.same_as(&held));
    assert_eq!(fresh.id(), 2);
    assert!(!fresh.is_closed().await);
}
