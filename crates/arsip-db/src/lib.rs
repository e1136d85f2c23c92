//! Database layer for the arsip content backend.
//!
//! Owns the one SQLite connection the process uses and everything that goes
//! through it: lazy opening, parameterized queries, transactions, and the
//! sequence counters behind document numbers such as `0090/SK/III/2025`.
//!
//! # Design decisions
//!
//! - **One connection, explicitly owned**: a [`Database`] is constructed by
//!   the application and passed to whoever needs it. It opens the store on
//!   first use; concurrent first callers wait for that single open instead of
//!   racing their own.
//! - **Blocking work off the runtime**: every statement runs on tokio's
//!   blocking pool while holding the connection lock. A transaction holds the
//!   lock for its whole unit of work, so units of work never interleave.
//! - **`BEGIN IMMEDIATE`**: transactions take the write lock up front, so two
//!   processes sharing a file also serialize their counter increments.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!` and applied on every physical open.
//!
//! # Usage
//!
//! ```rust,ignore
//! use arsip_db::{Database, DbSettings, DbTarget, Scalar};
//!
//! let db = Database::new(DbSettings::new(DbTarget::from_path("data/arsip.db")));
//! let number = db.next_sequence("2025", "SK", 3, 2025).await?;
//! let rows = db
//!     .fetch_all("SELECT * FROM mails WHERE category_id = ?1", &[Scalar::Integer(1)])
//!     .await?;
//! db.close().await?;
//! ```

mod connection;
mod error;
mod migrations;
mod query;
pub mod sequence;
mod transaction;

pub use connection::{Database, DbSettings, DbTarget, Handle};
pub use error::{DbError, OpenFailure, StatementError, TxStage};
pub use migrations::{run_migrations, MigrationError};
pub use query::{ExecuteResult, Page, Row, Scalar};
pub use sequence::{allocate, roman_month, validate_category_code, DocumentNumber};
pub use transaction::Transaction;
