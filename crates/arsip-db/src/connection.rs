//! Connection lifecycle: lazy single-flight open, pragmas, and close.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::error::{DbError, OpenFailure};
use crate::migrations::run_migrations;

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbTarget {
    /// A database file on disk. Missing parent directories are created.
    File(PathBuf),
    /// A private in-memory database, discarded on close. Used for stateless
    /// deployments and tests.
    Memory,
}

impl DbTarget {
    /// Interprets a configured path, treating `:memory:` as [`DbTarget::Memory`].
    pub fn from_path(path: &str) -> Self {
        if path == ":memory:" {
            DbTarget::Memory
        } else {
            DbTarget::File(PathBuf::from(path))
        }
    }
}

impl fmt::Display for DbTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbTarget::File(path) => write!(f, "{}", path.display()),
            DbTarget::Memory => f.write_str(":memory:"),
        }
    }
}

/// Runtime tunables applied every time the store is physically opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbSettings {
    /// The store to open.
    pub target: DbTarget,

    /// Busy timeout, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Page cache size (`PRAGMA cache_size`), file stores only.
    pub cache_size_pages: i64,
}

impl DbSettings {
    /// Settings for the given target with default tunables.
    pub fn new(target: DbTarget) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }

    /// In-memory settings.
    pub fn in_memory() -> Self {
        Self::new(DbTarget::Memory)
    }
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            target: DbTarget::Memory,
            busy_timeout_ms: 5_000,
            cache_size_pages: 10_000,
        }
    }
}

/// The live database handle.
///
/// Cloning is cheap and every clone refers to the same physical connection.
/// Statements and whole transactions run while holding the handle's lock, so
/// callers never interleave inside each other's transactions.
///
/// A handle kept past [`Database::close`] stays valid as a value, but every
/// operation through it fails with [`DbError::Closed`].
#[derive(Clone)]
pub struct Handle {
    id: u64,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("id", &self.id).finish()
    }
}

impl Handle {
    fn new(id: u64, conn: Connection) -> Self {
        Self {
            id,
            conn: Arc::new(Mutex::new(Some(conn))),
        }
    }

    /// Sequence number of the physical open that produced this handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns `true` if both handles refer to the same physical connection.
    pub fn same_as(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }

    /// Returns `true` once the connection behind this handle has been closed.
    ///
    /// Waits for an operation currently running on the handle to finish.
    pub async fn is_closed(&self) -> bool {
        let handle = self.clone();
        tokio::task::spawn_blocking(move || handle.lock().is_none())
            .await
            .unwrap_or(true)
    }

    /// Locks the connection slot.
    ///
    /// A poisoned lock means a unit of work panicked while holding it. The
    /// connection itself is still usable, but a transaction may have been
    /// left open; it is rolled back before the connection is handed out.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                let guard = poisoned.into_inner();
                self.conn.clear_poison();
                if let Some(conn) = guard.as_ref().filter(|c| !c.is_autocommit()) {
                    tracing::warn!(
                        handle = self.id,
                        "rolling back transaction abandoned by a panicked unit of work"
                    );
                    if let Err(e) = conn.execute_batch("ROLLBACK") {
                        tracing::error!(handle = self.id, "rollback after panic failed: {}", e);
                    }
                }
                guard
            }
        }
    }

    /// Runs `f` against the locked connection on the blocking thread pool.
    ///
    /// The closure runs to completion even if the returned future is dropped.
    pub(crate) async fn run<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&mut Connection) -> T + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = handle.lock();
            let Some(conn) = guard.as_mut() else {
                return Err(DbError::Closed);
            };
            Ok(f(conn))
        })
        .await
        .map_err(|e| DbError::Worker(e.to_string()))?
    }

    /// Takes the connection out of the slot and closes it. Blocks until the
    /// operation currently holding the lock has finished.
    fn shutdown(&self) -> Result<bool, DbError> {
        let Some(conn) = self.lock().take() else {
            return Ok(false);
        };
        conn.close().map_err(|(_, e)| DbError::Close(e))?;
        Ok(true)
    }
}

/// Owner of the single shared database connection.
///
/// Construct one per process (or per request scope in stateless
/// deployments) and share it by cloning; clones share the same slot. The
/// store is opened lazily by the first [`acquire`](Database::acquire).
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

struct Inner {
    settings: DbSettings,
    // Held across the open itself, so concurrent first callers wait for the
    // in-flight open instead of starting their own.
    slot: tokio::sync::Mutex<Option<Handle>>,
    opens: AtomicU64,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("target", &self.inner.settings.target)
            .field("opens", &self.open_count())
            .finish()
    }
}

impl Database {
    /// Creates a manager for the configured store without opening it.
    pub fn new(settings: DbSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                slot: tokio::sync::Mutex::new(None),
                opens: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a manager for a private in-memory store.
    pub fn in_memory() -> Self {
        Self::new(DbSettings::in_memory())
    }

    /// The settings this manager opens the store with.
    pub fn settings(&self) -> &DbSettings {
        &self.inner.settings
    }

    /// Returns the shared handle, opening the store if needed.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ConnectionOpen` if the store cannot be opened,
    /// configured, or migrated. Nothing is cached in that case, so the next
    /// call tries again.
    pub async fn acquire(&self) -> Result<Handle, DbError> {
        let mut slot = self.inner.slot.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }

        let settings = self.inner.settings.clone();
        let conn = tokio::task::spawn_blocking(move || open_connection(&settings))
            .await
            .map_err(|e| DbError::Worker(e.to_string()))??;

        let id = self.inner.opens.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = Handle::new(id, conn);
        *slot = Some(handle.clone());

        tracing::info!(
            target_db = %self.inner.settings.target,
            handle = id,
            "opened database"
        );
        Ok(handle)
    }

    /// Closes the store if it is open. Calling it again is a no-op.
    ///
    /// An operation already running on the connection finishes first. The
    /// slot stays locked until the physical connection is closed, so a
    /// concurrent `acquire` cannot open a second one alongside it. Handles
    /// still held by callers fail with [`DbError::Closed`] from then on.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Close` if SQLite reports an error while closing.
    /// The handle is discarded either way.
    pub async fn close(&self) -> Result<(), DbError> {
        let mut slot = self.inner.slot.lock().await;
        let Some(handle) = slot.take() else {
            tracing::debug!("close requested but database is not open");
            return Ok(());
        };

        let id = handle.id;
        let closed = tokio::task::spawn_blocking(move || handle.shutdown())
            .await
            .map_err(|e| DbError::Worker(e.to_string()))??;
        if closed {
            tracing::info!(handle = id, "closed database");
        }
        Ok(())
    }

    /// Returns `true` while a handle is cached.
    pub async fn is_open(&self) -> bool {
        self.inner.slot.lock().await.is_some()
    }

    /// Number of successful physical opens so far.
    pub fn open_count(&self) -> u64 {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Acquires the handle and runs `f` against the connection.
    pub(crate) async fn with_connection<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&mut Connection) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.acquire().await?;
        handle.run(f).await?
    }
}

fn open_connection(settings: &DbSettings) -> Result<Connection, DbError> {
    let fail = |source: OpenFailure| DbError::ConnectionOpen {
        target: settings.target.to_string(),
        source,
    };

    let conn = match &settings.target {
        DbTarget::Memory => Connection::open_in_memory(),
        DbTarget::File(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| fail(e.into()))?;
            }
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
            Connection::open_with_flags(path, flags)
        }
    }
    .map_err(|e| fail(e.into()))?;

    configure(&conn, settings).map_err(fail)?;

    let applied = run_migrations(&conn).map_err(|e| fail(e.into()))?;
    if applied > 0 {
        tracing::info!(count = applied, "applied database migrations");
    }

    Ok(conn)
}

/// Applies pragmas for a freshly opened connection.
fn configure(conn: &Connection, settings: &DbSettings) -> Result<(), OpenFailure> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(settings.busy_timeout_ms))?;

    if let DbTarget::File(_) = settings.target {
        // Also the first read of the file header, so a corrupt or foreign
        // file fails here.
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        if journal_mode != "wal" {
            return Err(OpenFailure::Pragma(format!(
                "failed to set WAL journal mode, got: {journal_mode}"
            )));
        }
        conn.execute_batch(&format!(
            "PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;
             PRAGMA cache_size = {};",
            settings.cache_size_pages
        ))?;
    }

    Ok(())
}
