use arsip_db::{
    allocate, Database, DbError, DbSettings, DbTarget, DocumentNumber, OpenFailure, Page, Scalar,
    Transaction,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn text(s: &str) -> Scalar {
    Scalar::Text(s.to_string())
}

async fn speakers_db() -> Database {
    let db = Database::in_memory();
    db.execute(
        "CREATE TABLE speakers (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE)",
        &[],
    )
    .await
    .expect("failed to create table");
    for name in ["Ayu", "Bima", "Citra", "Dewi", "Eka"] {
        db.execute("INSERT INTO speakers (name) VALUES (?1)", &[text(name)])
            .await
            .expect("failed to seed speaker");
    }
    db
}

#[tokio::test]
async fn acquire_opens_lazily_and_reuses_handle() {
    let db = Database::in_memory();
    assert_eq!(db.open_count(), 0);
    assert!(!db.is_open().await);

    let first = db.acquire().await.expect("failed to acquire");
    let second = db.acquire().await.expect("failed to acquire");

    assert!(first.same_as(&second));
    assert_eq!(first.id(), 1);
    assert_eq!(db.open_count(), 1);
    assert!(db.is_open().await);
}

#[tokio::test]
async fn foreign_keys_enabled_on_open() {
    let db = Database::in_memory();
    let row = db
        .fetch_one("PRAGMA foreign_keys", &[])
        .await
        .expect("failed to query pragma")
        .expect("pragma should return a row");
    assert_eq!(row.get_index::<i64>(0).unwrap(), 1);

    let err = db
        .execute(
            "INSERT INTO mails (mail_number, subject, mail_type, mail_date, sender, recipient, category_id)
             VALUES ('0001/SK/I/2025', 's', 'OUTGOING', '2025-01-02', 'a', 'b', 999)",
            &[],
        )
        .await
        .expect_err("missing category should violate foreign key");
    assert!(err.as_statement().is_some_and(|e| e.is_foreign_key_violation()));
}

#[tokio::test]
async fn close_is_idempotent() {
    let db = Database::in_memory();
    db.close().await.expect("closing an unopened database should succeed");

    db.acquire().await.expect("failed to acquire");
    db.close().await.expect("first close should succeed");
    db.close().await.expect("second close should succeed");
    assert!(!db.is_open().await);
}

#[tokio::test]
async fn acquire_after_close_reopens() {
    let db = Database::in_memory();
    let before = db.acquire().await.expect("failed to acquire");
    db.close().await.expect("close should succeed");

    assert!(before.is_closed().await, "close should close the held handle");

    let after = db.acquire().await.expect("failed to re-acquire");
    assert!(!after.same_as(&before));
    assert!(!after.is_closed().await);
    assert_eq!(db.open_count(), 2);

    // The in-memory store starts over, with the schema reapplied.
    assert_eq!(db.current_sequence_value("2025").await.unwrap(), None);
}

#[tokio::test]
async fn failed_open_is_not_cached() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").expect("failed to write blocker");

    let db = Database::new(DbSettings::new(DbTarget::File(blocker.join("arsip.db"))));

    let err = db.acquire().await.expect_err("open under a file should fail");
    assert!(
        matches!(
            err,
            DbError::ConnectionOpen {
                source: OpenFailure::Directory(_),
                ..
            }
        ),
        "got {err:?}"
    );
    assert!(!db.is_open().await);
    assert_eq!(db.open_count(), 0);

    std::fs::remove_file(&blocker).expect("failed to remove blocker");
    db.acquire().await.expect("open should succeed once the path is usable");
    assert_eq!(db.open_count(), 1);
}

#[tokio::test]
async fn file_store_keeps_counters_across_reopen() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let db = Database::new(DbSettings::new(DbTarget::File(dir.path().join("arsip.db"))));

    assert_eq!(db.next_sequence_value("2025").await.unwrap(), 1);
    assert_eq!(db.next_sequence_value("2025").await.unwrap(), 2);
    db.close().await.expect("close should succeed");

    assert_eq!(db.next_sequence_value("2025").await.unwrap(), 3);
    assert_eq!(db.open_count(), 2);
    db.close().await.expect("close should succeed");
}

#[tokio::test]
async fn execute_reports_affected_rows_and_last_id() {
    let db = speakers_db().await;

    let inserted = db
        .execute("INSERT INTO speakers (name) VALUES (?1)", &[text("Fajar")])
        .await
        .expect("insert should succeed");
    assert_eq!(inserted.affected_rows, 1);
    assert_eq!(inserted.last_insert_id, 6);

    let deleted = db
        .execute("DELETE FROM speakers WHERE id <= ?1", &[Scalar::Integer(2)])
        .await
        .expect("delete should succeed");
    assert_eq!(deleted.affected_rows, 2);
}

#[tokio::test]
async fn unique_violation_surfaces_statement_error() {
    let db = speakers_db().await;
    let sql = "INSERT INTO speakers (name) VALUES (?1)";

    let err = db
        .execute(sql, &[text("Ayu")])
        .await
        .expect_err("duplicate name should fail");

    match &err {
        DbError::Statement(e) => {
            assert_eq!(e.sql, sql);
            assert_eq!(e.params, vec![text("Ayu")]);
            assert!(e.is_unique_violation());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().contains(sql));
}

#[tokio::test]
async fn fetch_one_distinguishes_not_found_from_error() {
    let db = speakers_db().await;

    let missing = db
        .fetch_one("SELECT * FROM speakers WHERE name = ?1", &[text("Nobody")])
        .await
        .expect("zero rows is not an error");
    assert!(missing.is_none());

    let found = db
        .fetch_one("SELECT id, name FROM speakers WHERE name = ?1", &[text("Citra")])
        .await
        .unwrap()
        .expect("row should exist");
    assert_eq!(found.get::<i64>("id").unwrap(), 3);

    let err = db
        .fetch_one("SELECT * FROM no_such_table", &[])
        .await
        .expect_err("bad table should fail");
    assert!(matches!(err, DbError::Statement(_)));
}

#[tokio::test]
async fn fetch_all_pages_in_engine_order() {
    let db = speakers_db().await;
    let page = Page::new(2, 2);

    let rows = db
        .fetch_all(
            "SELECT name FROM speakers ORDER BY id LIMIT ?1 OFFSET ?2",
            &page.params(),
        )
        .await
        .expect("query should succeed");

    let names: Vec<String> = rows.iter().map(|r| r.get("name").unwrap()).collect();
    assert_eq!(names, ["Citra", "Dewi"]);
}

#[derive(Debug)]
enum ExportError {
    Db(DbError),
    Full,
}

impl From<DbError> for ExportError {
    fn from(e: DbError) -> Self {
        ExportError::Db(e)
    }
}

#[tokio::test]
async fn for_each_row_streams_and_counts() {
    let db = speakers_db().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let count = db
        .for_each_row("SELECT name FROM speakers ORDER BY id", &[], move |row| {
            tx.send(row.get::<String>("name")?)
                .map_err(|_| ExportError::Full)
        })
        .await
        .expect("export should succeed");

    assert_eq!(count, 5);
    let mut names = Vec::new();
    while let Ok(name) = rx.try_recv() {
        names.push(name);
    }
    assert_eq!(names, ["Ayu", "Bima", "Citra", "Dewi", "Eka"]);
}

#[tokio::test]
async fn for_each_row_visitor_error_short_circuits() {
    let db = speakers_db().await;
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();

    let err = db
        .for_each_row("SELECT name FROM speakers ORDER BY id", &[], move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                Err(ExportError::Full)
            } else {
                Ok(())
            }
        })
        .await
        .expect_err("third row should abort the export");

    assert!(matches!(err, ExportError::Full));
    assert_eq!(seen.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn for_each_row_statement_error_is_converted() {
    let db = speakers_db().await;
    let err = db
        .for_each_row("SELECT * FROM missing", &[], |_| Ok::<(), ExportError>(()))
        .await
        .expect_err("missing table should fail");
    assert!(matches!(err, ExportError::Db(DbError::Statement(_))));
}

#[tokio::test]
async fn failed_unit_of_work_leaves_no_rows() {
    let db = speakers_db().await;
    db.execute("DELETE FROM speakers", &[]).await.unwrap();

    let result: Result<(), DbError> = db
        .run_in_transaction(|tx| {
            tx.execute("INSERT INTO speakers (name) VALUES ('Gilang')", &[])?;
            tx.execute("INSERT INTO speakers (name) VALUES ('Hana')", &[])?;
            Err(DbError::InvalidDocumentNumber("abort".into()))
        })
        .await;
    assert!(matches!(result, Err(DbError::InvalidDocumentNumber(_))));

    let rows = db.fetch_all("SELECT * FROM speakers", &[]).await.unwrap();
    assert!(rows.is_empty(), "rolled back rows must not be visible");
}

#[tokio::test]
async fn committed_unit_of_work_returns_value() {
    let db = speakers_db().await;

    let ids = db
        .run_in_transaction(|tx| {
            let a = tx.execute("INSERT INTO speakers (name) VALUES ('Gilang')", &[])?;
            let b = tx.execute("INSERT INTO speakers (name) VALUES ('Hana')", &[])?;
            let count = tx
                .fetch_one("SELECT COUNT(*) AS n FROM speakers", &[])?
                .map(|row| row.get::<i64>("n"))
                .transpose()?;
            Ok::<_, DbError>((a.last_insert_id, b.last_insert_id, count))
        })
        .await
        .expect("transaction should commit");

    assert_eq!(ids, (6, 7, Some(7)));
}

fn insert_mail(tx: &Transaction<'_>, subject: &str) -> Result<String, DbError> {
    let counter = allocate(tx, "2025")?;
    let number = DocumentNumber::new(counter, "SK", 3, 2025)?.to_string();
    tx.execute(
        "INSERT INTO mails (mail_number, subject, mail_type, mail_date, sender, recipient, category_id)
         VALUES (?1, ?2, 'OUTGOING', '2025-03-10', 'Sekretariat', 'Mitra', ?3)",
        &[Scalar::Text(number.clone()), text(subject), Scalar::Integer(1)],
    )?;
    Ok(number)
}

#[tokio::test]
async fn mail_insert_and_allocation_commit_together() {
    let db = Database::in_memory();
    db.execute(
        "INSERT INTO mail_categories (name, code) VALUES ('Surat Keputusan', 'SK')",
        &[],
    )
    .await
    .unwrap();

    let first = db
        .run_in_transaction(|tx| insert_mail(tx, "Undangan"))
        .await
        .unwrap();
    assert_eq!(first, "0001/SK/III/2025");

    // Violates NOT NULL on category_id, so the allocation rolls back with it.
    let err = db
        .run_in_transaction(|tx| {
            allocate(tx, "2025")?;
            tx.execute(
                "INSERT INTO mails (mail_number, subject, mail_type, mail_date, sender, recipient, category_id)
                 VALUES ('x', 's', 'OUTGOING', '2025-03-10', 'a', 'b', NULL)",
                &[],
            )
        })
        .await
        .expect_err("insert should fail");
    assert!(matches!(err, DbError::Statement(_)));
    assert_eq!(db.current_sequence_value("2025").await.unwrap(), Some(1));

    let second = db
        .run_in_transaction(|tx| insert_mail(tx, "Laporan"))
        .await
        .unwrap();
    assert_eq!(second, "0002/SK/III/2025");
}

#[tokio::test]
async fn deleting_a_mail_does_not_free_its_number() {
    let db = Database::in_memory();
    db.execute(
        "INSERT INTO mail_categories (name, code) VALUES ('Surat Keputusan', 'SK')",
        &[],
    )
    .await
    .unwrap();

    let first = db
        .run_in_transaction(|tx| insert_mail(tx, "Undangan"))
        .await
        .unwrap();
    assert_eq!(first, "0001/SK/III/2025");

    let deleted = db
        .execute("DELETE FROM mails WHERE mail_number = ?1", &[text(&first)])
        .await
        .unwrap();
    assert_eq!(deleted.affected_rows, 1);

    let second = db
        .run_in_transaction(|tx| insert_mail(tx, "Undangan Ulang"))
        .await
        .unwrap();
    assert_eq!(second, "0002/SK/III/2025");
}

#[tokio::test]
async fn next_sequence_formats_and_isolates_scopes() {
    let db = Database::in_memory();

    assert_eq!(
        db.next_sequence("2025", "SK", 3, 2025).await.unwrap(),
        "0001/SK/III/2025"
    );
    assert_eq!(
        db.next_sequence("2025", "ST", 4, 2025).await.unwrap(),
        "0002/ST/IV/2025"
    );
    assert_eq!(
        db.next_sequence("2024", "SK", 12, 2024).await.unwrap(),
        "0001/SK/XII/2024"
    );
    assert_eq!(db.current_sequence_value("2025").await.unwrap(), Some(2));
    assert_eq!(db.current_sequence_value("2024").await.unwrap(), Some(1));
    assert_eq!(db.current_sequence_value("2026").await.unwrap(), None);
}

#[tokio::test]
async fn next_sequence_rejects_bad_input_without_allocating() {
    let db = Database::in_memory();

    let err = db
        .next_sequence("2025", "SK", 13, 2025)
        .await
        .expect_err("month 13 is invalid");
    assert!(matches!(err, DbError::InvalidDocumentNumber(_)));

    let err = db
        .next_sequence("2025", "S/K", 1, 2025)
        .await
        .expect_err("slash in category is invalid");
    assert!(matches!(err, DbError::InvalidDocumentNumber(_)));

    assert_eq!(db.current_sequence_value("2025").await.unwrap(), None);
}

#[tokio::test]
async fn sequence_open_failure_is_an_allocation_error() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"file").unwrap();
    let db = Database::new(DbSettings::new(DbTarget::File(blocker.join("arsip.db"))));

    let err = db
        .next_sequence("2025", "SK", 1, 2025)
        .await
        .expect_err("open should fail");
    match err {
        DbError::SequenceAllocation { scope_key, source } => {
            assert_eq!(scope_key, "2025");
            assert!(matches!(*source, DbError::ConnectionOpen { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
