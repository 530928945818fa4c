//! SQLite store shared by the hash cache, directory index and job queue.
//!
//! All mutations go through a single writer connection. File-backed stores
//! open a second, read-only connection so lookups never queue behind a long
//! indexing transaction (WAL). In-memory stores share one connection.

use crate::LookalikeError;
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Schema version stored in `PRAGMA user_version`
pub const SCHEMA_VERSION: i32 = 1;

/// Status of a stored hash record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HashStatus {
    Ok,
    Unreadable,
}

impl HashStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashStatus::Ok => "ok",
            HashStatus::Unreadable => "unreadable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(HashStatus::Ok),
            "unreadable" => Some(HashStatus::Unreadable),
            _ => None,
        }
    }
}

type Slot = Mutex<Option<Connection>>;

pub struct Store {
    writer: Slot,
    /// None for in-memory stores, which read through the writer
    reader: Option<Slot>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> crate::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Connection::open(path)?;
        init_schema(&writer)?;

        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(std::time::Duration::from_secs(5))?;

        debug!(path = %path.display(), "opened hash store");
        Ok(Self {
            writer: Mutex::new(Some(writer)),
            reader: Some(Mutex::new(Some(reader))),
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database (tests, one-shot CLI runs)
    pub fn open_in_memory() -> crate::Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            writer: Mutex::new(Some(conn)),
            reader: None,
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` inside an immediate write transaction, committing on success
    pub fn write<T, F>(&self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> crate::Result<T>,
    {
        let mut guard = lock(&self.writer)?;
        let conn = guard.as_mut().ok_or(LookalikeError::StoreClosed)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run `f` against the read connection
    pub fn read<T, F>(&self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&Connection) -> crate::Result<T>,
    {
        let slot = self.reader.as_ref().unwrap_or(&self.writer);
        let guard = lock(slot)?;
        let conn = guard.as_ref().ok_or(LookalikeError::StoreClosed)?;
        f(conn)
    }

    /// Release both connections. Safe to call more than once.
    pub fn close(&self) -> crate::Result<()> {
        if let Some(reader) = &self.reader {
            lock(reader)?.take();
        }
        if lock(&self.writer)?.take().is_some() {
            debug!("closed hash store");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.writer).map(|g| g.is_none()).unwrap_or(true)
    }
}

fn lock(slot: &Slot) -> crate::Result<MutexGuard<'_, Option<Connection>>> {
    slot.lock().map_err(|_| LookalikeError::StorePoisoned)
}

fn init_schema(conn: &Connection) -> crate::Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA busy_timeout = 5000;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        ",
    )?;

    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    // Fail fast on any other version; there are no in-place migrations
    if version != 0 && version != SCHEMA_VERSION {
        return Err(LookalikeError::SchemaVersionMismatch {
            found: version,
            expected: SCHEMA_VERSION,
        });
    }

    if version == 0 {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS directories (
                id INTEGER PRIMARY KEY,
                path TEXT UNIQUE NOT NULL,
                prefix_bits INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'idle',
                last_indexed_at INTEGER,
                created_at INTEGER NOT NULL
            );

            -- One row per normalized path; directory_id NULL for ad-hoc cache entries
            CREATE TABLE IF NOT EXISTS file_hashes (
                path TEXT PRIMARY KEY,
                directory_id INTEGER REFERENCES directories(id) ON DELETE CASCADE,
                size INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                hash_size INTEGER NOT NULL,
                hash_bits BLOB,
                prefix INTEGER,
                status TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_file_hashes_bucket
                ON file_hashes(directory_id, prefix);

            -- No foreign key: a job may outlive its directory and fail on its own
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                directory_id INTEGER,
                kind TEXT NOT NULL,
                params TEXT NOT NULL DEFAULT '{}',
                state TEXT NOT NULL,
                progress REAL NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER,
                last_error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_queue ON jobs(state, created_at, id);

            PRAGMA user_version = 1;
            ",
        )?;
    }

    Ok(())
}
