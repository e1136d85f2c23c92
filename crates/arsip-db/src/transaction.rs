//! All-or-nothing units of work.
//!
//! A unit of work is a closure that receives a [`Transaction`] and issues its
//! statements through it. It runs between `BEGIN IMMEDIATE` and `COMMIT`
//! while holding the connection lock, so no other caller's statements can
//! land inside it or observe its uncommitted writes.
//!
//! Transactions do not nest. A unit of work cannot reach the async
//! [`Database`] methods (they would wait on the lock it already holds), and
//! issuing `BEGIN` through [`Transaction::execute`] is rejected by SQLite with
//! a [`StatementError`](crate::StatementError).

use rusqlite::Connection;

use crate::connection::Database;
use crate::error::{DbError, TxStage};
use crate::query::{self, ExecuteResult, Row, Scalar};

/// Statement access inside a running transaction.
pub struct Transaction<'c> {
    conn: &'c Connection,
}

impl Transaction<'_> {
    /// Runs one mutating statement. See [`Database::execute`].
    ///
    /// # Errors
    ///
    /// Returns `DbError::Statement` if the statement fails.
    pub fn execute(&self, sql: &str, params: &[Scalar]) -> Result<ExecuteResult, DbError> {
        query::execute(self.conn, sql, params)
    }

    /// Returns the first matching row. See [`Database::fetch_one`].
    ///
    /// # Errors
    ///
    /// Returns `DbError::Statement` if the statement fails.
    pub fn fetch_one(&self, sql: &str, params: &[Scalar]) -> Result<Option<Row>, DbError> {
        query::fetch_one(self.conn, sql, params)
    }

    /// Returns all matching rows. See [`Database::fetch_all`].
    ///
    /// # Errors
    ///
    /// Returns `DbError::Statement` if the statement fails.
    pub fn fetch_all(&self, sql: &str, params: &[Scalar]) -> Result<Vec<Row>, DbError> {
        query::fetch_all(self.conn, sql, params)
    }

    /// Streams matching rows to `visitor`. See [`Database::for_each_row`].
    ///
    /// # Errors
    ///
    /// Returns the first visitor error, or the statement error converted
    /// into `E`.
    pub fn for_each_row<E, F>(
        &self,
        sql: &str,
        params: &[Scalar],
        visitor: F,
    ) -> Result<usize, E>
    where
        E: From<DbError>,
        F: FnMut(Row) -> Result<(), E>,
    {
        query::for_each_row(self.conn, sql, params, visitor).map_err(query::Halt::flatten)
    }
}

/// Runs `unit_of_work` inside `BEGIN IMMEDIATE` / `COMMIT`.
///
/// Any error from the unit of work or from `COMMIT` triggers a `ROLLBACK`,
/// and that original error is what the caller gets back.
pub(crate) fn run<T, E, F>(conn: &Connection, unit_of_work: F) -> Result<T, E>
where
    E: From<DbError>,
    F: FnOnce(&Transaction<'_>) -> Result<T, E>,
{
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|source| DbError::Transaction {
            stage: TxStage::Begin,
            source,
        })?;

    let outcome = unit_of_work(&Transaction { conn }).and_then(|value| {
        conn.execute_batch("COMMIT")
            .map_err(|source| DbError::Transaction {
                stage: TxStage::Commit,
                source,
            })?;
        Ok(value)
    });

    if outcome.is_err() {
        rollback(conn);
    }
    outcome
}

fn rollback(conn: &Connection) {
    // SQLite already rolled back on some errors (e.g. SQLITE_FULL).
    if conn.is_autocommit() {
        tracing::debug!("transaction already closed by the engine, skipping rollback");
        return;
    }
    match conn.execute_batch("ROLLBACK") {
        Ok(()) => tracing::debug!("transaction rolled back"),
        Err(e) => tracing::error!("rollback failed, returning the original error: {}", e),
    }
}

impl Database {
    /// Runs `unit_of_work` as one transaction on the shared connection.
    ///
    /// On success the unit of work's value is returned after `COMMIT`. On
    /// failure everything it wrote is rolled back and its error is returned
    /// unchanged; rollback problems are logged, never returned in its place.
    ///
    /// # Errors
    ///
    /// Returns the unit of work's error, `DbError::Transaction` (converted
    /// into `E`) if `BEGIN` or `COMMIT` fails, or any acquire error.
    pub async fn run_in_transaction<T, E, F>(&self, unit_of_work: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<DbError> + Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T, E> + Send + 'static,
    {
        let handle = self.acquire().await?;
        handle.run(move |conn| run(conn, unit_of_work)).await?
    }
}
