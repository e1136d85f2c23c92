//! Error types for the database access layer.

use std::fmt;

use rusqlite::types::Value;
use thiserror::Error;

use crate::migrations::MigrationError;

/// Errors returned by every database operation.
#[derive(Debug, Error)]
pub enum DbError {
    /// The store could not be opened, configured, or migrated.
    ///
    /// The manager never caches a handle after this error; the next
    /// `acquire()` attempts a fresh open.
    #[error("failed to open database at {target}: {source}")]
    ConnectionOpen {
        /// Human readable description of the store (`:memory:` or a path).
        target: String,
        /// What went wrong during the open.
        source: OpenFailure,
    },

    /// A single statement failed to prepare, bind, or run.
    #[error(transparent)]
    Statement(#[from] StatementError),

    /// Transaction mechanics (`BEGIN` or `COMMIT`) failed.
    #[error("transaction {stage} failed: {source}")]
    Transaction {
        /// The step that failed.
        stage: TxStage,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// The sequence counter could not be advanced.
    ///
    /// Callers retry the whole operation, including choosing the scope key.
    #[error("failed to allocate sequence number for scope '{scope_key}': {source}")]
    SequenceAllocation {
        /// Scope whose counter was being advanced.
        scope_key: String,
        /// Cause of the failure.
        source: Box<DbError>,
    },

    /// The counter read back after the increment was not one more than the
    /// value read before it.
    #[error("counter moved unexpectedly: read {previous}, incremented to {found:?}")]
    InconsistentCounter {
        /// Value read before the increment.
        previous: i64,
        /// Value returned by the increment, if any row was updated.
        found: Option<i64>,
    },

    /// A document number component was out of range or malformed.
    #[error("invalid document number: {0}")]
    InvalidDocumentNumber(String),

    /// A column could not be read as the requested type.
    #[error("failed to read column '{column}': {message}")]
    Column {
        /// Column name or index.
        column: String,
        /// Conversion failure.
        message: String,
    },

    /// Closing the store failed.
    #[error("failed to close database: {0}")]
    Close(rusqlite::Error),

    /// The handle was used after `Database::close`. Acquire a fresh one.
    #[error("database handle is closed")]
    Closed,

    /// A blocking database task failed to complete.
    #[error("database worker failed: {0}")]
    Worker(String),
}

/// Cause of a [`DbError::ConnectionOpen`].
#[derive(Debug, Error)]
pub enum OpenFailure {
    /// The parent directory of the database file could not be created.
    #[error("could not create database directory: {0}")]
    Directory(#[from] std::io::Error),

    /// SQLite refused to open the file or apply a pragma.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// A pragma was accepted but reported an unexpected value.
    #[error("{0}")]
    Pragma(String),

    /// Schema migrations failed.
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// A failed statement, with enough context to diagnose it.
#[derive(Debug, Error)]
#[error("statement failed: {source} (sql: {sql}, params: {params:?})")]
pub struct StatementError {
    /// The SQL text as supplied by the caller.
    pub sql: String,
    /// The positional parameters that were bound.
    pub params: Vec<Value>,
    /// The underlying SQLite error.
    pub source: rusqlite::Error,
}

impl StatementError {
    pub(crate) fn new(sql: &str, params: &[Value], source: rusqlite::Error) -> Self {
        Self {
            sql: sql.to_string(),
            params: params.to_vec(),
            source,
        }
    }

    /// Returns `true` when the statement violated a `UNIQUE` or `PRIMARY KEY`
    /// constraint.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self.source.sqlite_error(),
            Some(e) if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        )
    }

    /// Returns `true` when the statement violated a foreign key constraint.
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(
            self.source.sqlite_error(),
            Some(e) if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
        )
    }
}

/// Transaction step, used in [`DbError::Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    /// `BEGIN IMMEDIATE`
    Begin,
    /// `COMMIT`
    Commit,
}

impl fmt::Display for TxStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxStage::Begin => f.write_str("begin"),
            TxStage::Commit => f.write_str("commit"),
        }
    }
}

impl DbError {
    /// Returns the statement error if this is (or wraps) one.
    pub fn as_statement(&self) -> Option<&StatementError> {
        match self {
            DbError::Statement(e) => Some(e),
            DbError::SequenceAllocation { source, .. } => source.as_statement(),
            _ => None,
        }
    }
}
