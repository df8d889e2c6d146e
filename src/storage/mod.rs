//! # Storage Module - Mesh State Persistence
//!
//! Durable store for everything the bridge learns about the mesh: nodes,
//! telemetry samples, positions and the message log in both directions.
//!
//! ## Architecture
//!
//! ```text
//! data/
//! ├── meshbridge.db        ← SQLite database (WAL journal)
//! ├── meshbridge.db-wal
//! └── meshbridge.db.lock   ← exclusive advisory lock, one bridge per database
//! ```
//!
//! - One writer connection behind a mutex. Every write goes through
//!   [`Store::with_write`], an IMMEDIATE transaction that commits when the
//!   closure returns `Ok` and rolls back on any error path.
//! - A small pool of reader connections picked round-robin. WAL mode lets
//!   readers proceed while the writer holds its transaction.
//! - [`Store::close`] refuses new writes, waits for in-flight writes to drain
//!   (bounded by `drain_timeout_ms`), checkpoints the WAL and drops every
//!   connection.
//!
//! All `Store` methods are blocking. Async callers run them through
//! `tokio::task::spawn_blocking`; the store is `Clone` and cheap to move.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshbridge::storage::{Store, StoreOptions};
//!
//! fn main() -> Result<(), meshbridge::storage::StorageError> {
//!     let store = Store::open("data/meshbridge.db", StoreOptions::default())?;
//!     for node in store.active_nodes(60)? {
//!         println!("{} {}", node.node_id, node.display_name());
//!     }
//!     store.close()
//! }
//! ```
//!
//! Timestamps are stored as INTEGER UTC epoch milliseconds.

pub mod maintenance;
pub mod messages;
pub mod nodes;
pub mod positions;
pub mod schema;
pub mod telemetry;

pub use messages::{Direction, LinkQuality, Message, MessageStatistics, Talker};
pub use nodes::{Node, NodeSighting};
pub use positions::Position;
pub use telemetry::{TelemetryMetrics, TelemetrySample, TelemetrySummary};

use chrono::{DateTime, TimeZone, Utc};
use fs2::FileExt;
use log::{debug, info, warn};
use rusqlite::{Connection, ErrorCode, OpenFlags, Transaction, TransactionBehavior};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::StorageConfig;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("schema validation failed: table '{table}' is missing columns {missing:?}")]
    SchemaValidation { table: String, missing: Vec<String> },

    #[error("store is closed")]
    Closed,

    #[error("database {0} is already in use by another process")]
    AlreadyLocked(String),
}

impl StorageError {
    /// Busy/locked conditions that are worth one retry.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub read_connections: usize,
    pub busy_timeout: Duration,
    pub drain_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

impl From<&StorageConfig> for StoreOptions {
    fn from(cfg: &StorageConfig) -> Self {
        Self {
            read_connections: cfg.read_connections.max(1),
            busy_timeout: Duration::from_millis(cfg.busy_timeout_ms),
            drain_timeout: Duration::from_millis(cfg.drain_timeout_ms),
        }
    }
}

/// Handle to the mesh database. Clones share one pool.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    writer: Mutex<Option<Connection>>,
    readers: Vec<Mutex<Option<Connection>>>,
    read_cursor: AtomicUsize,
    closing: AtomicBool,
    in_flight: AtomicUsize,
    drain_timeout: Duration,
    lock_file: Mutex<Option<File>>,
}

/// Counts a write as in flight for the lifetime of the guard.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        InFlight(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Store {
    /// Open (creating if needed) the database at `path`, take the process
    /// lock, apply pragmas and run the schema migration. A schema that fails
    /// validation aborts the open.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let lock_path = lock_path_for(&path);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::AlreadyLocked(path.display().to_string()));
        }

        let mut writer = open_connection(&path, &options)?;
        schema::migrate(&mut writer)?;

        let mut readers = Vec::with_capacity(options.read_connections);
        for _ in 0..options.read_connections.max(1) {
            readers.push(Mutex::new(Some(open_connection(&path, &options)?)));
        }

        info!(
            "Opened store {} ({} reader connections, schema v{})",
            path.display(),
            readers.len(),
            schema::SCHEMA_VERSION
        );

        Ok(Self {
            inner: Arc::new(Inner {
                path,
                writer: Mutex::new(Some(writer)),
                readers,
                read_cursor: AtomicUsize::new(0),
                closing: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                drain_timeout: options.drain_timeout,
                lock_file: Mutex::new(Some(lock_file)),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Run `f` inside one IMMEDIATE write transaction.
    ///
    /// The transaction commits only if `f` returns `Ok`; an error (or a panic
    /// unwinding through here) drops the transaction, which rolls it back.
    pub fn with_write<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StorageError>,
    {
        self.with_writer(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Run `f` against a pooled reader connection.
    pub fn with_read<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        let len = self.inner.readers.len();
        let index = self.inner.read_cursor.fetch_add(1, Ordering::Relaxed) % len;
        let guard = lock(&self.inner.readers[index]);
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;
        f(conn)
    }

    /// Exclusive access to the writer connection outside a transaction
    /// (VACUUM and checkpoints cannot run inside one).
    pub(crate) fn with_writer<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError>,
    {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        let _in_flight = InFlight::enter(&self.inner.in_flight);
        // close() may have started between the check above and the increment
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        let mut guard = lock(&self.inner.writer);
        let conn = guard.as_mut().ok_or(StorageError::Closed)?;
        f(conn)
    }

    /// Number of writes currently in progress or waiting for the writer.
    pub fn in_flight_writes(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Size of the main database file as SQLite sees it.
    pub fn database_size_bytes(&self) -> Result<u64, StorageError> {
        self.with_read(|conn| {
            let pages: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
            Ok(u64::try_from(pages.saturating_mul(page_size)).unwrap_or(0))
        })
    }

    /// Graceful shutdown: stop accepting writes, drain in-flight writes
    /// (bounded), checkpoint and release every connection and the lock file.
    /// Calling it again is a no-op.
    pub fn close(&self) -> Result<(), StorageError> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let started = Instant::now();
        while self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            if started.elapsed() >= self.inner.drain_timeout {
                warn!(
                    "Store close: {} write(s) still in flight after {:?}, waiting on writer lock",
                    self.inner.in_flight.load(Ordering::SeqCst),
                    self.inner.drain_timeout
                );
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        // Taking the writer lock waits out a transaction that is mid-commit.
        if let Some(conn) = lock(&self.inner.writer).take() {
            if let Err(e) = checkpoint(&conn) {
                warn!("WAL checkpoint on close failed: {}", e);
            }
            if let Err(e) = conn.execute_batch("PRAGMA optimize;") {
                debug!("PRAGMA optimize on close failed: {}", e);
            }
            if let Err((_, e)) = conn.close() {
                warn!("Error closing writer connection: {}", e);
            }
        }
        for reader in &self.inner.readers {
            lock(reader).take();
        }
        if let Some(file) = lock(&self.inner.lock_file).take() {
            let _ = FileExt::unlock(&file);
        }
        info!(
            "Store {} closed in {:?}",
            self.inner.path.display(),
            started.elapsed()
        );
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.inner.path)
            .field("readers", &self.inner.readers.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn open_connection(path: &Path, options: &StoreOptions) -> Result<Connection, StorageError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(options.busy_timeout)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        warn!("journal_mode is '{}' instead of WAL for {}", mode, path.display());
    }
    conn.execute_batch(
        "PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -2000;
         PRAGMA temp_store = MEMORY;",
    )?;
    Ok(conn)
}

pub(crate) fn checkpoint(conn: &Connection) -> Result<(), StorageError> {
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
    Ok(())
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// `%term%` for a LIKE with `ESCAPE '\'`, with wildcards in `term` escaped.
pub(crate) fn like_contains(term: &str) -> String {
    let mut out = String::with_capacity(term.len() + 2);
    out.push('%');
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}

pub(crate) fn opt_u32(v: Option<i64>) -> Option<u32> {
    v.and_then(|v| u32::try_from(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_contains("50%_off"), "%50\\%\\_off%");
        assert_eq!(like_contains("a\\b"), "%a\\\\b%");
    }

    #[test]
    fn millis_round_trip_is_exact() {
        let ts = Utc.timestamp_millis_opt(1_700_000_123_456).single().unwrap();
        assert_eq!(from_millis(to_millis(ts)), ts);
    }

    #[test]
    fn second_open_of_same_database_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.db");
        let store = Store::open(&path, StoreOptions::default()).unwrap();
        match Store::open(&path, StoreOptions::default()) {
            Err(StorageError::AlreadyLocked(_)) => {}
            other => panic!("expected AlreadyLocked, got {:?}", other.map(|_| ())),
        }
        store.close().unwrap();
        let reopened = Store::open(&path, StoreOptions::default()).unwrap();
        reopened.close().unwrap();
    }

    #[test]
    fn closed_store_rejects_reads_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("mesh.db"), StoreOptions::default()).unwrap();
        store.close().unwrap();
        store.close().unwrap();
        assert!(matches!(store.with_read(|_| Ok(())), Err(StorageError::Closed)));
        assert!(matches!(store.with_write(|_| Ok(())), Err(StorageError::Closed)));
    }

    #[test]
    fn failed_write_closure_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("mesh.db"), StoreOptions::default()).unwrap();
        let res: Result<(), StorageError> = store.with_write(|tx| {
            tx.execute(
                "INSERT INTO nodes (node_id, first_seen) VALUES ('!00000001', 0)",
                [],
            )?;
            Err(StorageError::Closed)
        });
        assert!(res.is_err());
        assert!(store.get_node("!00000001").unwrap().is_none());
        assert_eq!(store.in_flight_writes(), 0);
    }
}
