//! Persistent perceptual-hash cache.
//!
//! A cached hash is only returned while the file's size and mtime still match
//! what was recorded and the hash was computed at the requested size. Backend
//! failures never surface to readers: they are logged and reported as misses.

use crate::hash::HashBits;
use crate::paths::{canonical_path, file_key, file_stat, now_secs, path_key, FileStat};
use crate::store::{HashStatus, Store};
use crate::LookalikeError;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of probing the cache for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(HashBits),
    /// File is known to be undecodable and has not changed since
    Unreadable,
    Miss,
}

struct StoredRow {
    size: i64,
    mtime: i64,
    hash_size: u32,
    bits: Option<Vec<u8>>,
    status: Option<HashStatus>,
}

#[derive(Clone)]
pub struct HashCache {
    store: Arc<Store>,
}

impl HashCache {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Cache backed by its own database file
    pub fn open(path: &Path) -> crate::Result<Self> {
        Ok(Self::new(Arc::new(Store::open(path)?)))
    }

    pub fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(Arc::new(Store::open_in_memory()?)))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn get(&self, path: &Path, hash_size: u32) -> Option<HashBits> {
        match self.lookup_many(&[path.to_path_buf()], hash_size).pop() {
            Some(CacheLookup::Hit(bits)) => Some(bits),
            _ => None,
        }
    }

    /// Valid cached hashes keyed by the paths as given. Misses are omitted.
    pub fn bulk_get(&self, paths: &[PathBuf], hash_size: u32) -> HashMap<PathBuf, HashBits> {
        paths
            .iter()
            .zip(self.lookup_many(paths, hash_size))
            .filter_map(|(path, lookup)| match lookup {
                CacheLookup::Hit(bits) => Some((path.clone(), bits)),
                _ => None,
            })
            .collect()
    }

    /// Probe every path, one result per input in input order
    pub fn lookup_many(&self, paths: &[PathBuf], hash_size: u32) -> Vec<CacheLookup> {
        let keys: Vec<String> = paths.iter().map(|p| file_key(p)).collect();

        let rows = match self.store.read(|conn| load_rows(conn, &keys)) {
            Ok(rows) => rows,
            Err(LookalikeError::StoreClosed) => return vec![CacheLookup::Miss; paths.len()],
            Err(e) => {
                warn!(error = %e, "hash cache read failed, treating as miss");
                return vec![CacheLookup::Miss; paths.len()];
            }
        };

        paths
            .iter()
            .zip(rows)
            .map(|(path, row)| match row {
                Some(row) => classify(path, row, hash_size),
                None => CacheLookup::Miss,
            })
            .collect()
    }

    pub fn set(&self, path: &Path, hash: Option<&HashBits>, hash_size: u32) -> crate::Result<()> {
        self.set_many(&[(path.to_path_buf(), hash.cloned())], hash_size)
    }

    /// Store a batch in one transaction. `None` records the file as
    /// unreadable with zeroed metadata.
    pub fn set_many(
        &self,
        entries: &[(PathBuf, Option<HashBits>)],
        hash_size: u32,
    ) -> crate::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut rows: Vec<(String, FileStat, Option<&HashBits>)> = Vec::with_capacity(entries.len());
        for (path, hash) in entries {
            let canonical = canonical_path(path);
            let stat = match hash {
                Some(_) => match file_stat(&canonical) {
                    Ok(stat) => stat,
                    Err(e) => {
                        debug!(path = %canonical.display(), error = %e, "not caching hash of unstatable file");
                        continue;
                    }
                },
                None => FileStat { size: 0, mtime: 0 },
            };
            rows.push((path_key(&canonical), stat, hash.as_ref()));
        }

        let now = now_secs();
        self.store.write(|tx| {
            let mut owner = tx.prepare_cached(
                "SELECT d.prefix_bits FROM file_hashes f
                 JOIN directories d ON d.id = f.directory_id
                 WHERE f.path = ?1",
            )?;
            let mut upsert = tx.prepare_cached(
                "INSERT INTO file_hashes
                    (path, directory_id, size, mtime, hash_size, hash_bits, prefix, status, updated_at)
                 VALUES (?1, NULL, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(path) DO UPDATE SET
                    size = excluded.size,
                    mtime = excluded.mtime,
                    hash_size = excluded.hash_size,
                    hash_bits = excluded.hash_bits,
                    prefix = excluded.prefix,
                    status = excluded.status,
                    updated_at = excluded.updated_at",
            )?;

            for (key, stat, hash) in &rows {
                let prefix_bits: Option<u32> =
                    owner.query_row(params![key], |r| r.get(0)).optional()?;
                let prefix = match (hash, prefix_bits) {
                    (Some(h), Some(bits)) => Some(h.prefix(bits) as i64),
                    _ => None,
                };
                let status = if hash.is_some() {
                    HashStatus::Ok
                } else {
                    HashStatus::Unreadable
                };
                upsert.execute(params![
                    key,
                    stat.size,
                    stat.mtime,
                    hash_size,
                    hash.map(|h| h.as_bytes()),
                    prefix,
                    status.as_str(),
                    now,
                ])?;
            }
            Ok(())
        })
    }

    /// Drop every cache entry not owned by a tracked directory
    pub fn clear(&self) -> crate::Result<usize> {
        self.store.write(|tx| {
            Ok(tx.execute("DELETE FROM file_hashes WHERE directory_id IS NULL", [])?)
        })
    }

    /// Remove unscoped entries whose files no longer exist
    pub fn prune_missing(&self) -> crate::Result<usize> {
        let keys: Vec<String> = self.store.read(|conn| {
            let mut stmt = conn.prepare("SELECT path FROM file_hashes WHERE directory_id IS NULL")?;
            let keys = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })?;

        let gone: Vec<String> = keys
            .into_iter()
            .filter(|k| !Path::new(k).exists())
            .collect();
        if gone.is_empty() {
            return Ok(0);
        }

        self.store.write(|tx| {
            let mut stmt = tx.prepare_cached(
                "DELETE FROM file_hashes WHERE path = ?1 AND directory_id IS NULL",
            )?;
            let mut removed = 0;
            for key in &gone {
                removed += stmt.execute(params![key])?;
            }
            Ok(removed)
        })
    }

    /// Number of stored records, scoped or not
    pub fn len(&self) -> crate::Result<usize> {
        self.store.read(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM file_hashes", [], |r| r.get(0))?;
            Ok(n as usize)
        })
    }

    pub fn is_empty(&self) -> crate::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Release the backing store. Later reads miss and writes fail.
    pub fn close(&self) -> crate::Result<()> {
        self.store.close()
    }
}

fn load_rows(conn: &Connection, keys: &[String]) -> crate::Result<Vec<Option<StoredRow>>> {
    let mut stmt = conn.prepare_cached(
        "SELECT size, mtime, hash_size, hash_bits, status FROM file_hashes WHERE path = ?1",
    )?;
    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        let row = stmt
            .query_row(params![key], |r| {
                let status: String = r.get(4)?;
                Ok(StoredRow {
                    size: r.get(0)?,
                    mtime: r.get(1)?,
                    hash_size: r.get(2)?,
                    bits: r.get(3)?,
                    status: HashStatus::parse(&status),
                })
            })
            .optional()?;
        out.push(row);
    }
    Ok(out)
}

fn classify(path: &Path, row: StoredRow, hash_size: u32) -> CacheLookup {
    let current = file_stat(path).ok();
    let unchanged = current.is_some_and(|s| s.size == row.size && s.mtime == row.mtime);

    match row.status {
        Some(HashStatus::Ok) if unchanged && row.hash_size == hash_size => {
            let bits = row
                .bits
                .and_then(|b| HashBits::from_bytes(hash_size * hash_size, b));
            match bits {
                Some(bits) => CacheLookup::Hit(bits),
                None => {
                    warn!(path = %path.display(), "corrupt cached hash, ignoring");
                    CacheLookup::Miss
                }
            }
        }
        Some(HashStatus::Unreadable) if unchanged || (row.size == 0 && row.mtime == 0) => {
            CacheLookup::Unreadable
        }
        _ => CacheLookup::Miss,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn bits(seed: u8) -> HashBits {
        HashBits::from_bits((0..64u32).map(|i| (i * seed as u32 + seed as u32) % 5 < 2))
    }

    fn touch(path: &Path, secs_ago: u64) {
        let f = std::fs::File::options().write(true).open(path).unwrap();
        f.set_modified(SystemTime::now() - Duration::from_secs(secs_ago))
            .unwrap();
    }

    #[test]
    fn test_hit_requires_matching_metadata_and_size() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.png");
        std::fs::write(&file, b"one").unwrap();

        let cache = HashCache::in_memory().unwrap();
        cache.set(&file, Some(&bits(7)), 8).unwrap();

        assert_eq!(cache.get(&file, 8), Some(bits(7)));
        // Different hash size is a miss
        assert_eq!(cache.get(&file, 16), None);

        // Changing size invalidates
        std::fs::write(&file, b"longer").unwrap();
        assert_eq!(cache.get(&file, 8), None);
    }

    #[test]
    fn test_mtime_change_invalidates() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.png");
        std::fs::write(&file, b"same").unwrap();
        touch(&file, 3600);

        let cache = HashCache::in_memory().unwrap();
        cache.set(&file, Some(&bits(3)), 8).unwrap();
        assert!(cache.get(&file, 8).is_some());

        touch(&file, 10);
        assert_eq!(cache.get(&file, 8), None);
    }

    #[test]
    fn test_missing_file_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("gone.png");
        std::fs::write(&file, b"x").unwrap();
        let cache = HashCache::in_memory().unwrap();
        cache.set(&file, Some(&bits(5)), 8).unwrap();
        std::fs::remove_file(&file).unwrap();
        assert_eq!(cache.get(&file, 8), None);
    }

    #[test]
    fn test_unreadable_sentinel_short_circuits() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("broken.png");
        std::fs::write(&file, b"not an image").unwrap();

        let cache = HashCache::in_memory().unwrap();
        cache.set(&file, None, 16).unwrap();

        assert_eq!(cache.get(&file, 16), None);
        let lookups = cache.lookup_many(&[file.clone()], 16);
        assert_eq!(lookups, vec![CacheLookup::Unreadable]);
    }

    #[test]
    fn test_bulk_get_keys_are_paths_as_given() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        let cache = HashCache::in_memory().unwrap();
        cache
            .set_many(&[(a.clone(), Some(bits(1))), (b.clone(), None)], 8)
            .unwrap();

        let indirect = dir.path().join(".").join("a.png");
        let found = cache.bulk_get(&[indirect.clone(), b.clone()], 8);
        assert_eq!(found.len(), 1);
        assert_eq!(found.get(&indirect), Some(&bits(1)));
    }

    #[test]
    fn test_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.png");
        std::fs::write(&file, b"a").unwrap();
        let cache = HashCache::in_memory().unwrap();
        cache.set(&file, Some(&bits(1)), 8).unwrap();
        cache.set(&file, Some(&bits(2)), 8).unwrap();
        assert_eq!(cache.get(&file, 8), Some(bits(2)));
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_closed_cache_misses_and_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.png");
        std::fs::write(&file, b"a").unwrap();
        let cache = HashCache::in_memory().unwrap();
        cache.set(&file, Some(&bits(1)), 8).unwrap();

        cache.close().unwrap();
        cache.close().unwrap();
        assert_eq!(cache.get(&file, 8), None);
        assert!(matches!(
            cache.set(&file, Some(&bits(1)), 8),
            Err(LookalikeError::StoreClosed)
        ));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("cache.db");
        let file = dir.path().join("a.png");
        std::fs::write(&file, b"a").unwrap();

        HashCache::open(&db)
            .unwrap()
            .set(&file, Some(&bits(9)), 8)
            .unwrap();
        let reopened = HashCache::open(&db).unwrap();
        assert_eq!(reopened.get(&file, 8), Some(bits(9)));
    }

    #[test]
    fn test_prune_missing_and_clear() {
        let dir = TempDir::new().unwrap();
        let keep = dir.path().join("keep.png");
        let drop = dir.path().join("drop.png");
        std::fs::write(&keep, b"k").unwrap();
        std::fs::write(&drop, b"d").unwrap();

        let cache = HashCache::in_memory().unwrap();
        cache
            .set_many(&[(keep.clone(), Some(bits(1))), (drop.clone(), Some(bits(2)))], 8)
            .unwrap();
        std::fs::remove_file(&drop).unwrap();

        assert_eq!(cache.prune_missing().unwrap(), 1);
        assert_eq!(cache.len().unwrap(), 1);
        assert_eq!(cache.clear().unwrap(), 1);
        assert!(cache.is_empty().unwrap());
    }
}
