//! Tracked directories and their per-file hash records.

pub mod scan;

use crate::hash::HashBits;
use crate::paths::{file_key, now_secs};
use crate::store::{HashStatus, Store};
use crate::LookalikeError;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub use scan::list_images;

/// Default number of entries per upsert transaction
pub const UPSERT_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryStatus {
    Idle,
    Indexing,
}

impl DirectoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectoryStatus::Idle => "idle",
            DirectoryStatus::Indexing => "indexing",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "indexing" => DirectoryStatus::Indexing,
            _ => DirectoryStatus::Idle,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackedDirectory {
    pub id: i64,
    pub path: PathBuf,
    pub prefix_bits: u32,
    pub status: DirectoryStatus,
    pub last_indexed_at: Option<i64>,
    pub file_count: usize,
}

/// A stored hash record
#[derive(Debug, Clone, Serialize)]
pub struct HashRecord {
    pub path: PathBuf,
    pub directory_id: Option<i64>,
    pub size: i64,
    pub mtime: i64,
    pub hash_size: u32,
    pub hash: Option<HashBits>,
    pub prefix: Option<i64>,
    pub status: HashStatus,
    pub updated_at: i64,
}

/// One file to upsert into a directory
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: i64,
    pub mtime: i64,
    /// None records the file as unreadable
    pub hash: Option<HashBits>,
    /// Falls back to the batch default when None
    pub hash_size: Option<u32>,
}

/// Which records `delete_files` removes
#[derive(Debug, Clone)]
pub enum FileSelection {
    Paths(Vec<PathBuf>),
    All,
}

#[derive(Clone)]
pub struct DirectoryIndex {
    store: Arc<Store>,
    default_prefix_bits: u32,
    batch_size: usize,
}

impl DirectoryIndex {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            default_prefix_bits: 16,
            batch_size: UPSERT_CHUNK,
        }
    }

    pub fn with_defaults(mut self, prefix_bits: u32, batch_size: usize) -> Self {
        self.default_prefix_bits = prefix_bits;
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn default_prefix_bits(&self) -> u32 {
        self.default_prefix_bits
    }

    /// Start tracking a directory. Adding the same directory again returns
    /// the existing id and leaves its settings alone.
    pub fn add_directory(&self, path: &Path, prefix_bits: Option<u32>) -> crate::Result<i64> {
        let prefix_bits = prefix_bits.unwrap_or(self.default_prefix_bits);
        if !(1..=63).contains(&prefix_bits) {
            return Err(LookalikeError::InvalidPrefixBits(prefix_bits));
        }
        if !path.is_dir() {
            return Err(LookalikeError::DirectoryNotFound(path.to_path_buf()));
        }

        let key = file_key(path);
        let id = self.store.write(|tx| {
            tx.execute(
                "INSERT INTO directories (path, prefix_bits, status, created_at)
                 VALUES (?1, ?2, 'idle', ?3)
                 ON CONFLICT(path) DO NOTHING",
                params![key, prefix_bits, now_secs()],
            )?;
            Ok(tx.query_row(
                "SELECT id FROM directories WHERE path = ?1",
                params![key],
                |r| r.get(0),
            )?)
        })?;
        info!(id, path = %key, prefix_bits, "tracking directory");
        Ok(id)
    }

    pub fn list_directories(&self) -> crate::Result<Vec<TrackedDirectory>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(&format!("{DIRECTORY_SELECT} ORDER BY d.id"))?;
            let dirs = stmt
                .query_map([], directory_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(dirs)
        })
    }

    pub fn get_directory(&self, id: i64) -> crate::Result<TrackedDirectory> {
        self.store
            .read(|conn| Ok(fetch_directory(conn, id)?))?
            .ok_or(LookalikeError::UnknownDirectory(id))
    }

    /// Stop tracking a directory and drop all of its records
    pub fn remove_directory(&self, id: i64) -> crate::Result<()> {
        let removed = self.store.write(|tx| {
            Ok(tx.execute("DELETE FROM directories WHERE id = ?1", params![id])?)
        })?;
        if removed == 0 {
            return Err(LookalikeError::UnknownDirectory(id));
        }
        info!(id, "removed directory");
        Ok(())
    }

    pub fn set_directory_status(
        &self,
        id: i64,
        status: DirectoryStatus,
        indexed_at: Option<i64>,
    ) -> crate::Result<()> {
        let changed = self.store.write(|tx| {
            Ok(tx.execute(
                "UPDATE directories
                 SET status = ?2, last_indexed_at = COALESCE(?3, last_indexed_at)
                 WHERE id = ?1",
                params![id, status.as_str(), indexed_at],
            )?)
        })?;
        if changed == 0 {
            return Err(LookalikeError::UnknownDirectory(id));
        }
        Ok(())
    }

    /// Put directories left mid-index by a dead process back to idle
    pub fn reset_indexing_status(&self) -> crate::Result<usize> {
        self.store.write(|tx| {
            Ok(tx.execute(
                "UPDATE directories SET status = 'idle' WHERE status = 'indexing'",
                [],
            )?)
        })
    }

    pub fn upsert_file(
        &self,
        path: &Path,
        directory_id: i64,
        size: i64,
        mtime: i64,
        hash: Option<&HashBits>,
        hash_size: u32,
    ) -> crate::Result<()> {
        let entry = FileEntry {
            path: path.to_path_buf(),
            size,
            mtime,
            hash: hash.cloned(),
            hash_size: Some(hash_size),
        };
        self.bulk_upsert_files(&[entry], directory_id, hash_size)
            .map(|_| ())
    }

    /// Upsert records for one directory, one transaction per chunk. A row
    /// already owned by another directory moves to this one.
    /// Returns the number of rows written.
    pub fn bulk_upsert_files(
        &self,
        entries: &[FileEntry],
        directory_id: i64,
        default_hash_size: u32,
    ) -> crate::Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let prefix_bits = self.get_directory(directory_id)?.prefix_bits;
        let now = now_secs();

        let mut written = 0;
        for chunk in entries.chunks(self.batch_size) {
            let keys: Vec<String> = chunk.iter().map(|e| file_key(&e.path)).collect();
            written += self.store.write(|tx| {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO file_hashes
                        (path, directory_id, size, mtime, hash_size, hash_bits, prefix, status, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(path) DO UPDATE SET
                        directory_id = excluded.directory_id,
                        size = excluded.size,
                        mtime = excluded.mtime,
                        hash_size = excluded.hash_size,
                        hash_bits = excluded.hash_bits,
                        prefix = excluded.prefix,
                        status = excluded.status,
                        updated_at = excluded.updated_at",
                )?;
                for (key, entry) in keys.iter().zip(chunk) {
                    let status = match entry.hash {
                        Some(_) => HashStatus::Ok,
                        None => HashStatus::Unreadable,
                    };
                    stmt.execute(params![
                        key,
                        directory_id,
                        entry.size,
                        entry.mtime,
                        entry.hash_size.unwrap_or(default_hash_size),
                        entry.hash.as_ref().map(|h| h.as_bytes()),
                        entry.hash.as_ref().map(|h| h.prefix(prefix_bits) as i64),
                        status.as_str(),
                        now,
                    ])?;
                }
                Ok(chunk.len())
            })?;
        }
        debug!(directory_id, written, "upserted file records");
        Ok(written)
    }

    /// Ok records in a directory whose stored prefix equals `prefix`
    pub fn candidates_by_prefix(
        &self,
        directory_id: i64,
        prefix: u64,
        limit: usize,
    ) -> crate::Result<Vec<HashRecord>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "{RECORD_SELECT}
                 WHERE directory_id = ?1 AND prefix = ?2 AND status = 'ok'
                 ORDER BY path LIMIT ?3"
            ))?;
            let records = stmt
                .query_map(
                    params![directory_id, prefix as i64, limit as i64],
                    record_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    pub fn records_for_directory(&self, directory_id: i64) -> crate::Result<Vec<HashRecord>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "{RECORD_SELECT} WHERE directory_id = ?1 ORDER BY path"
            ))?;
            let records = stmt
                .query_map(params![directory_id], record_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    /// Records at or below `root`, whichever directory owns them
    pub fn records_under(&self, root: &Path) -> crate::Result<Vec<HashRecord>> {
        let (lo, hi) = key_range(&file_key(root));
        self.store.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "{RECORD_SELECT} WHERE path >= ?1 AND path < ?2 ORDER BY path"
            ))?;
            let records = stmt
                .query_map(params![lo, hi], record_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    pub fn delete_files(&self, directory_id: i64, selection: FileSelection) -> crate::Result<usize> {
        let keys: Vec<String> = match &selection {
            FileSelection::All => Vec::new(),
            FileSelection::Paths(paths) => paths.iter().map(|p| file_key(p)).collect(),
        };
        self.store.write(|tx| match &selection {
            FileSelection::All => Ok(tx.execute(
                "DELETE FROM file_hashes WHERE directory_id = ?1",
                params![directory_id],
            )?),
            FileSelection::Paths(_) => {
                let mut stmt = tx.prepare_cached(
                    "DELETE FROM file_hashes WHERE directory_id = ?1 AND path = ?2",
                )?;
                let mut removed = 0;
                for key in &keys {
                    removed += stmt.execute(params![directory_id, key])?;
                }
                Ok(removed)
            }
        })
    }

    /// Narrowest prefix_bits among tracked directories containing any of
    /// `paths`. None when no path falls under a tracked directory.
    pub fn prefix_bits_for_paths(&self, paths: &[PathBuf]) -> crate::Result<Option<u32>> {
        let dirs = self.list_directories()?;
        if dirs.is_empty() {
            return Ok(None);
        }
        let narrowest = paths
            .iter()
            .filter_map(|p| {
                dirs.iter()
                    .filter(|d| p.starts_with(&d.path))
                    .map(|d| d.prefix_bits)
                    .min()
            })
            .min();
        Ok(narrowest)
    }
}

/// Half-open key range holding every path below `root`
fn key_range(root: &str) -> (String, String) {
    let sep = std::path::MAIN_SEPARATOR;
    let root = root.trim_end_matches(sep);
    let next = char::from(sep as u8 + 1);
    (format!("{root}{sep}"), format!("{root}{next}"))
}

const DIRECTORY_SELECT: &str = "SELECT d.id, d.path, d.prefix_bits, d.status, d.last_indexed_at,
        (SELECT COUNT(*) FROM file_hashes f WHERE f.directory_id = d.id)
     FROM directories d";

const RECORD_SELECT: &str = "SELECT path, directory_id, size, mtime, hash_size, hash_bits, prefix, status, updated_at
     FROM file_hashes";

fn fetch_directory(conn: &Connection, id: i64) -> rusqlite::Result<Option<TrackedDirectory>> {
    conn.query_row(
        &format!("{DIRECTORY_SELECT} WHERE d.id = ?1"),
        params![id],
        directory_from_row,
    )
    .optional()
}

fn directory_from_row(row: &Row<'_>) -> rusqlite::Result<TrackedDirectory> {
    let path: String = row.get(1)?;
    let status: String = row.get(3)?;
    let file_count: i64 = row.get(5)?;
    Ok(TrackedDirectory {
        id: row.get(0)?,
        path: PathBuf::from(path),
        prefix_bits: row.get(2)?,
        status: DirectoryStatus::parse(&status),
        last_indexed_at: row.get(4)?,
        file_count: file_count as usize,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<HashRecord> {
    let path: String = row.get(0)?;
    let hash_size: u32 = row.get(4)?;
    let bits: Option<Vec<u8>> = row.get(5)?;
    let status: String = row.get(7)?;
    Ok(HashRecord {
        path: PathBuf::from(path),
        directory_id: row.get(1)?,
        size: row.get(2)?,
        mtime: row.get(3)?,
        hash_size,
        hash: bits.and_then(|b| HashBits::from_bytes(hash_size * hash_size, b)),
        prefix: row.get(6)?,
        status: HashStatus::parse(&status).unwrap_or(HashStatus::Unreadable),
        updated_at: row.get(8)?,
    })
}
