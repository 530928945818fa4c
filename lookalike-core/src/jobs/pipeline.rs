//! Job execution: incremental directory indexing, rehash and garbage collection.
//!
//! Decoding happens on the hash pool; every database write (record batches,
//! progress) happens on the calling worker thread as results arrive.
//!
//! A file belongs to the innermost tracked directory containing it. Indexing a
//! directory skips everything under a nested tracked directory, and takes over
//! unchanged records another directory (or the match cache) already holds
//! without hashing them again.

use super::{IndexJob, JobKind, JobQueue};
use crate::cache::HashCache;
use crate::config::Config;
use crate::hash::HashPool;
use crate::index::{list_images, DirectoryIndex, DirectoryStatus, FileEntry, FileSelection, HashRecord};
use crate::paths::{canonical_path, file_stat, is_strictly_under, now_secs, FileStat};
use crate::store::HashStatus;
use crate::LookalikeError;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What a finished job did
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobSummary {
    pub scanned: usize,
    pub unchanged: usize,
    pub hashed: usize,
    pub unreadable: usize,
    pub timed_out: usize,
    pub removed: usize,
}

pub(crate) struct JobContext<'a> {
    pub queue: &'a JobQueue,
    pub index: &'a DirectoryIndex,
    pub cache: &'a HashCache,
    pub pool: &'a HashPool,
    pub config: &'a Config,
}

pub(crate) fn run_job(ctx: &JobContext<'_>, job: &IndexJob) -> crate::Result<JobSummary> {
    let hash_size = job
        .hash_size_override()
        .unwrap_or(ctx.config.hashing.hash_size);

    match (job.kind, job.directory_id) {
        (JobKind::Index | JobKind::Refresh, Some(dir_id)) => {
            index_directory(ctx, job, dir_id, hash_size, false)
        }
        (JobKind::Rehash, Some(dir_id)) => index_directory(ctx, job, dir_id, hash_size, true),
        (JobKind::Gc, Some(dir_id)) => gc_directory(ctx, dir_id),
        (JobKind::Gc, None) => {
            let removed = ctx.cache.prune_missing()?;
            Ok(JobSummary {
                removed,
                ..JobSummary::default()
            })
        }
        (kind, None) => Err(LookalikeError::MissingDirectory(kind.to_string())),
    }
}

fn index_directory(
    ctx: &JobContext<'_>,
    job: &IndexJob,
    dir_id: i64,
    hash_size: u32,
    force: bool,
) -> crate::Result<JobSummary> {
    let dir = ctx.index.get_directory(dir_id)?;
    if !dir.path.is_dir() {
        return Err(LookalikeError::DirectoryVanished(dir.path));
    }

    ctx.index
        .set_directory_status(dir_id, DirectoryStatus::Indexing, None)?;
    let result = scan_and_hash(ctx, job, dir_id, &dir.path, hash_size, force);

    let indexed_at = result.as_ref().ok().map(|_| now_secs());
    if let Err(e) = ctx
        .index
        .set_directory_status(dir_id, DirectoryStatus::Idle, indexed_at)
    {
        warn!(dir_id, error = %e, "failed to reset directory status");
    }
    result
}

fn scan_and_hash(
    ctx: &JobContext<'_>,
    job: &IndexJob,
    dir_id: i64,
    root: &Path,
    hash_size: u32,
    force: bool,
) -> crate::Result<JobSummary> {
    let nested: Vec<PathBuf> = ctx
        .index
        .list_directories()?
        .into_iter()
        .filter(|d| d.id != dir_id && is_strictly_under(&d.path, root))
        .map(|d| d.path)
        .collect();
    let in_nested = |p: &Path| nested.iter().any(|n| p.starts_with(n));

    let mut files: Vec<PathBuf> = list_images(root, &ctx.config.scan)
        .map_err(|e| match e {
            LookalikeError::DirectoryNotFound(p) => LookalikeError::DirectoryVanished(p),
            other => other,
        })?
        .iter()
        .map(|p| canonical_path(p))
        .filter(|p| !in_nested(p.as_path()))
        .collect();
    files.sort();
    files.dedup();

    // Own rows first so they win over a same-path row seen under the root
    let mut existing: HashMap<PathBuf, HashRecord> = HashMap::new();
    let own = ctx.index.records_for_directory(dir_id)?;
    let under = ctx.index.records_under(root)?;
    for rec in own.into_iter().chain(under) {
        if rec.directory_id != Some(dir_id) && in_nested(rec.path.as_path()) {
            continue;
        }
        existing.entry(rec.path.clone()).or_insert(rec);
    }

    let mut summary = JobSummary {
        scanned: files.len(),
        ..JobSummary::default()
    };

    // Partition: unchanged fast-skip, adopt from another owner, or hash
    let mut to_hash: Vec<(PathBuf, FileStat)> = Vec::new();
    let mut adopted: Vec<FileEntry> = Vec::new();
    for path in &files {
        let stat = match file_stat(path) {
            Ok(s) => s,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "file vanished during scan");
                continue;
            }
        };
        if !force {
            if let Some(rec) = existing.get(path).filter(|r| is_current(r, stat, hash_size)) {
                summary.unchanged += 1;
                if rec.directory_id != Some(dir_id) {
                    adopted.push(FileEntry {
                        path: path.clone(),
                        size: stat.size,
                        mtime: stat.mtime,
                        hash: rec.hash.clone(),
                        hash_size: Some(hash_size),
                    });
                }
                continue;
            }
        }
        to_hash.push((path.clone(), stat));
    }
    if !adopted.is_empty() {
        debug!(dir_id, adopted = adopted.len(), "taking over existing records");
        ctx.index.bulk_upsert_files(&adopted, dir_id, hash_size)?;
    }

    // Only this directory's rows are pruned; nested ones wait for their owner
    let seen: HashSet<&PathBuf> = files.iter().collect();
    let vanished: Vec<PathBuf> = existing
        .values()
        .filter(|r| r.directory_id == Some(dir_id))
        .map(|r| &r.path)
        .filter(|p| !seen.contains(p) && !in_nested(p.as_path()))
        .cloned()
        .collect();
    if !vanished.is_empty() {
        summary.removed = ctx
            .index
            .delete_files(dir_id, FileSelection::Paths(vanished))?;
    }

    let total = to_hash.len();
    debug!(
        job_id = job.id,
        total,
        unchanged = summary.unchanged,
        removed = summary.removed,
        "hashing changed files"
    );
    if total == 0 {
        return Ok(summary);
    }

    let paths: Vec<PathBuf> = to_hash.iter().map(|(p, _)| p.clone()).collect();
    let batch_size = ctx.config.index.batch_size.max(1);
    let mut batch: Vec<FileEntry> = Vec::with_capacity(batch_size);
    let mut processed = 0usize;

    ctx.pool.hash_all(&paths, hash_size, |idx, result| {
        let (path, stat) = &to_hash[idx];
        let hash = match result {
            Ok(bits) => {
                summary.hashed += 1;
                Some(Some(bits))
            }
            Err(e) if e.is_persistent() => {
                debug!(path = %path.display(), error = %e, "recording unreadable image");
                summary.unreadable += 1;
                Some(None)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "hash not recorded");
                summary.timed_out += 1;
                None
            }
        };
        if let Some(hash) = hash {
            batch.push(FileEntry {
                path: path.clone(),
                size: stat.size,
                mtime: stat.mtime,
                hash,
                hash_size: Some(hash_size),
            });
        }
        if batch.len() >= batch_size {
            ctx.index.bulk_upsert_files(&batch, dir_id, hash_size)?;
            batch.clear();
        }

        processed += 1;
        ctx.queue
            .set_progress(job.id, processed as f64 / total as f64)
    })?;

    ctx.index.bulk_upsert_files(&batch, dir_id, hash_size)?;
    Ok(summary)
}

/// Record still describes the file on disk at the requested hash size
fn is_current(rec: &HashRecord, stat: FileStat, hash_size: u32) -> bool {
    let decodable = match rec.status {
        HashStatus::Ok => rec.hash.is_some(),
        HashStatus::Unreadable => true,
    };
    decodable && rec.size == stat.size && rec.mtime == stat.mtime && rec.hash_size == hash_size
}

fn gc_directory(ctx: &JobContext<'_>, dir_id: i64) -> crate::Result<JobSummary> {
    ctx.index.get_directory(dir_id)?;
    let records = ctx.index.records_for_directory(dir_id)?;
    let gone: Vec<PathBuf> = records
        .into_iter()
        .map(|r| r.path)
        .filter(|p| !p.exists())
        .collect();
    let removed = if gone.is_empty() {
        0
    } else {
        ctx.index.delete_files(dir_id, FileSelection::Paths(gone))?
    };
    info!(dir_id, removed, "pruned missing files");
    Ok(JobSummary {
        removed,
        ..JobSummary::default()
    })
}
