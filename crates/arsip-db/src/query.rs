//! Parameterized statement helpers.
//!
//! Every helper takes the SQL text and a slice of positional [`Scalar`]
//! parameters (`?1`, `?2`, ...). Values are only ever bound, never spliced
//! into the SQL string. Driver failures come back as
//! [`StatementError`](crate::StatementError) carrying the SQL and parameters.

use std::sync::Arc;

use rusqlite::types::{FromSql, Value, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::connection::Database;
use crate::error::{DbError, StatementError};

/// A positional statement parameter or column value.
pub type Scalar = Value;

/// Outcome of a mutating statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ExecuteResult {
    /// Number of rows inserted, updated, or deleted.
    pub affected_rows: usize,
    /// Rowid of the most recent successful insert on this connection.
    pub last_insert_id: i64,
}

/// An owned result row.
///
/// Column names are shared between all rows of one result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Column names, in select order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Column values, in select order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` for a row with no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value of the named column.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.values[idx])
    }

    /// Reads the named column as `T`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Column` if the column does not exist or the value
    /// cannot be converted.
    pub fn get<T: FromSql>(&self, column: &str) -> Result<T, DbError> {
        let value = self.value(column).ok_or_else(|| DbError::Column {
            column: column.to_string(),
            message: "no such column".to_string(),
        })?;
        convert(column, value)
    }

    /// Reads the column at `idx` as `T`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Column` if the index is out of range or the value
    /// cannot be converted.
    pub fn get_index<T: FromSql>(&self, idx: usize) -> Result<T, DbError> {
        let value = self.values.get(idx).ok_or_else(|| DbError::Column {
            column: idx.to_string(),
            message: "column index out of range".to_string(),
        })?;
        convert(&idx.to_string(), value)
    }

    /// Renders the row as a JSON object keyed by column name.
    ///
    /// Blobs are rendered as arrays of bytes.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .columns
            .iter()
            .zip(&self.values)
            .map(|(c, v)| (c.clone(), value_to_json(v)))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.columns.iter().zip(&self.values) {
            map.serialize_entry(column, &value_to_json(value))?;
        }
        map.end()
    }
}

fn convert<T: FromSql>(column: &str, value: &Value) -> Result<T, DbError> {
    T::column_result(ValueRef::from(value)).map_err(|e| DbError::Column {
        column: column.to_string(),
        message: e.to_string(),
    })
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Real(f) => serde_json::Value::from(*f),
        Value::Text(s) => serde_json::Value::from(s.as_str()),
        Value::Blob(b) => serde_json::Value::from(b.as_slice()),
    }
}

/// Runs one mutating statement.
pub(crate) fn execute(
    conn: &Connection,
    sql: &str,
    params: &[Scalar],
) -> Result<ExecuteResult, DbError> {
    let affected_rows = conn
        .prepare_cached(sql)
        .and_then(|mut stmt| stmt.execute(params_from_iter(params.iter())))
        .map_err(|e| StatementError::new(sql, params, e))?;

    Ok(ExecuteResult {
        affected_rows,
        last_insert_id: conn.last_insert_rowid(),
    })
}

/// Returns the first row, or `None` when the query matches nothing.
pub(crate) fn fetch_one(
    conn: &Connection,
    sql: &str,
    params: &[Scalar],
) -> Result<Option<Row>, DbError> {
    let mut first = None;
    for_each_row(conn, sql, params, |row| {
        first = Some(row);
        Err(Stop)
    })
    .or_else(|e| match e {
        Halt::Visitor(Stop) => Ok(1),
        Halt::Db(e) => Err(e),
    })?;
    Ok(first)
}

/// Returns every row in the order produced by the engine.
pub(crate) fn fetch_all(
    conn: &Connection,
    sql: &str,
    params: &[Scalar],
) -> Result<Vec<Row>, DbError> {
    let mut rows = Vec::new();
    for_each_row(conn, sql, params, |row| {
        rows.push(row);
        Ok::<(), DbError>(())
    })
    .map_err(Halt::flatten)?;
    Ok(rows)
}

/// Early-exit signal used by [`fetch_one`].
struct Stop;

/// Why row streaming stopped early.
pub(crate) enum Halt<E> {
    /// The visitor returned an error.
    Visitor(E),
    /// The engine returned an error.
    Db(DbError),
}

impl<E: From<DbError>> Halt<E> {
    /// Collapses both causes into the caller's error type.
    pub(crate) fn flatten(self) -> E {
        match self {
            Halt::Visitor(e) => e,
            Halt::Db(e) => E::from(e),
        }
    }
}

impl<E> From<DbError> for Halt<E> {
    fn from(e: DbError) -> Self {
        Halt::Db(e)
    }
}

/// Streams rows to `visitor` as the engine produces them.
///
/// Stops at the first visitor error, which is returned untouched so callers
/// can tell it apart from a statement failure.
pub(crate) fn for_each_row<E, F>(
    conn: &Connection,
    sql: &str,
    params: &[Scalar],
    mut visitor: F,
) -> Result<usize, Halt<E>>
where
    F: FnMut(Row) -> Result<(), E>,
{
    let stmt_err = |e: rusqlite::Error| DbError::from(StatementError::new(sql, params, e));

    let mut stmt = conn.prepare_cached(sql).map_err(stmt_err)?;
    let columns: Arc<[String]> = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let width = columns.len();

    let mut rows = stmt
        .query(params_from_iter(params.iter()))
        .map_err(stmt_err)?;

    let mut count = 0;
    while let Some(row) = rows.next().map_err(stmt_err)? {
        let values = (0..width)
            .map(|idx| row.get::<_, Value>(idx))
            .collect::<Result<Vec<_>, _>>()
            .map_err(stmt_err)?;

        visitor(Row {
            columns: Arc::clone(&columns),
            values,
        })
        .map_err(Halt::Visitor)?;
        count += 1;
    }

    Ok(count)
}

impl Database {
    /// Runs one mutating statement (insert, update, delete, DDL).
    ///
    /// # Errors
    ///
    /// Returns `DbError::Statement` with the SQL and parameters on any
    /// constraint violation or syntax error, or any acquire error.
    pub async fn execute(&self, sql: &str, params: &[Scalar]) -> Result<ExecuteResult, DbError> {
        let (sql, params) = (sql.to_string(), params.to_vec());
        self.with_connection(move |conn| execute(conn, &sql, &params)).await
    }

    /// Returns the first matching row, or `None` if nothing matches.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Statement` if the statement fails. Zero rows is not
    /// an error.
    pub async fn fetch_one(&self, sql: &str, params: &[Scalar]) -> Result<Option<Row>, DbError> {
        let (sql, params) = (sql.to_string(), params.to_vec());
        self.with_connection(move |conn| fetch_one(conn, &sql, &params)).await
    }

    /// Returns every matching row in engine order.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Statement` if the statement fails.
    pub async fn fetch_all(&self, sql: &str, params: &[Scalar]) -> Result<Vec<Row>, DbError> {
        let (sql, params) = (sql.to_string(), params.to_vec());
        self.with_connection(move |conn| fetch_all(conn, &sql, &params)).await
    }

    /// Streams matching rows to `visitor` one at a time and returns how many
    /// were delivered.
    ///
    /// The visitor runs on the blocking pool while the connection is locked,
    /// so every other caller waits until the walk ends. It must not block on
    /// a consumer and must never call back into this `Database`; page with
    /// `fetch_all` when the consumer sets the pace.
    ///
    /// # Errors
    ///
    /// The first visitor error stops delivery and is returned as is.
    /// Statement and acquire errors are converted into `E`.
    pub async fn for_each_row<E, F>(
        &self,
        sql: &str,
        params: &[Scalar],
        visitor: F,
    ) -> Result<usize, E>
    where
        E: From<DbError> + Send + 'static,
        F: FnMut(Row) -> Result<(), E> + Send + 'static,
    {
        let (sql, params) = (sql.to_string(), params.to_vec());
        let handle = self.acquire().await?;
        handle
            .run(move |conn| for_each_row(conn, &sql, &params, visitor).map_err(Halt::flatten))
            .await?
    }
}

/// Offset/limit window for paginated listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    page: u32,
    limit: u32,
}

impl Page {
    /// Largest page size a caller may request.
    pub const MAX_LIMIT: u32 = 100;

    /// Builds a page window, clamping `page` to at least 1 and `limit` to
    /// `1..=MAX_LIMIT`.
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }

    /// 1-based page number.
    pub fn page(&self) -> u32 {
        self.page
    }

    /// Rows per page.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Number of rows to skip.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }

    /// `[limit, offset]` as statement parameters, for `LIMIT ?n OFFSET ?m`.
    pub fn params(&self) -> [Scalar; 2] {
        [
            Value::Integer(i64::from(self.limit)),
            Value::Integer(self.offset() as i64),
        ]
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, 10)
    }
}
