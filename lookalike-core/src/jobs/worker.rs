//! Background indexing worker.

use super::pipeline::{run_job, JobContext};
use super::{IndexJob, JobKind, JobQueue};
use crate::cache::HashCache;
use crate::config::Config;
use crate::hash::{panic_message, HashPool, ImageHasher};
use crate::index::{DirectoryIndex, DirectoryStatus};
use crate::LookalikeError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

struct Inner {
    queue: JobQueue,
    index: DirectoryIndex,
    cache: HashCache,
    pool: HashPool,
    config: Config,
}

/// Runs queued index jobs one at a time, either on demand (`run_next`,
/// `run_pending`) or on a background thread (`spawn`).
#[derive(Clone)]
pub struct IndexingWorker {
    inner: Arc<Inner>,
}

impl IndexingWorker {
    /// Worker sharing `cache`'s store for its index and job queue
    pub fn new(cache: HashCache, hasher: Arc<dyn ImageHasher>, config: Config) -> crate::Result<Self> {
        let pool = HashPool::from_config(hasher, &config)?;
        let store = Arc::clone(cache.store());
        let index = DirectoryIndex::new(Arc::clone(&store))
            .with_defaults(config.index.prefix_bits, config.index.batch_size);
        Ok(Self {
            inner: Arc::new(Inner {
                queue: JobQueue::new(store),
                cache,
                index,
                pool,
                config,
            }),
        })
    }

    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }

    pub fn index(&self) -> &DirectoryIndex {
        &self.inner.index
    }

    pub fn enqueue(
        &self,
        kind: JobKind,
        directory_id: Option<i64>,
        params: Option<serde_json::Value>,
    ) -> crate::Result<i64> {
        let id = self.inner.queue.enqueue(kind, directory_id, params)?;
        debug!(job_id = id, %kind, ?directory_id, "job queued");
        Ok(id)
    }

    pub fn job_status(&self, id: i64) -> crate::Result<IndexJob> {
        self.inner.queue.get(id)
    }

    /// Fail jobs and reset directories left mid-flight by a previous process
    pub fn recover(&self) -> crate::Result<usize> {
        let jobs = self.inner.queue.fail_interrupted()?;
        let dirs = self.inner.index.reset_indexing_status()?;
        if jobs > 0 || dirs > 0 {
            warn!(jobs, directories = dirs, "recovered from interrupted run");
        }
        Ok(jobs)
    }

    /// Run the oldest queued job to a terminal state. Returns the finished
    /// job, or None when the queue is empty.
    pub fn run_next(&self) -> crate::Result<Option<IndexJob>> {
        let Some(job) = self.inner.queue.dequeue()? else {
            return Ok(None);
        };
        info!(job_id = job.id, kind = %job.kind, directory_id = ?job.directory_id, "job started");

        let ctx = JobContext {
            queue: &self.inner.queue,
            index: &self.inner.index,
            cache: &self.inner.cache,
            pool: &self.inner.pool,
            config: &self.inner.config,
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_job(&ctx, &job)));

        match outcome {
            Ok(Ok(summary)) => match self.inner.queue.complete(job.id) {
                Ok(()) => info!(
                    job_id = job.id,
                    scanned = summary.scanned,
                    unchanged = summary.unchanged,
                    hashed = summary.hashed,
                    unreadable = summary.unreadable,
                    timed_out = summary.timed_out,
                    removed = summary.removed,
                    "job completed"
                ),
                Err(e) => {
                    warn!(job_id = job.id, error = %e, "could not record job completion");
                    self.settle_failed(job.id, &format!("completion not recorded: {e}"))?;
                }
            },
            Ok(Err(e)) => {
                warn!(job_id = job.id, error = %e, "job failed");
                self.settle_failed(job.id, &e.to_string())?;
            }
            Err(payload) => {
                let msg = panic_message(&*payload);
                error!(job_id = job.id, panic = %msg, "job panicked");
                if let Some(dir_id) = job.directory_id {
                    if let Err(e) =
                        self.inner
                            .index
                            .set_directory_status(dir_id, DirectoryStatus::Idle, None)
                    {
                        warn!(dir_id, error = %e, "failed to reset directory status");
                    }
                }
                self.settle_failed(job.id, &format!("panicked: {msg}"))?;
            }
        }

        self.inner.queue.get(job.id).map(Some)
    }

    /// Move a running job to Failed. A job already settled elsewhere (a
    /// concurrent `recover`) keeps its state.
    fn settle_failed(&self, id: i64, message: &str) -> crate::Result<()> {
        match self.inner.queue.fail(id, message) {
            Err(LookalikeError::InvalidTransition { from, .. }) => {
                warn!(job_id = id, state = %from, "job was already settled");
                Ok(())
            }
            other => other,
        }
    }

    /// Drain the queue synchronously
    pub fn run_pending(&self) -> crate::Result<Vec<IndexJob>> {
        let mut finished = Vec::new();
        while let Some(job) = self.run_next()? {
            finished.push(job);
        }
        Ok(finished)
    }

    /// Start the background loop. Interrupted jobs are recovered first.
    pub fn spawn(&self) -> crate::Result<WorkerHandle> {
        self.recover()?;
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (poll_min, poll_max) = self.inner.config.poll_bounds();
        let worker = self.clone();
        let thread = std::thread::Builder::new()
            .name("lookalike-worker".to_string())
            .spawn(move || worker.run_loop(&stop_rx, poll_min, poll_max))?;
        info!("indexing worker started");
        Ok(WorkerHandle {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    fn run_loop(&self, stop_rx: &Receiver<()>, poll_min: Duration, poll_max: Duration) {
        let mut backoff = poll_min;
        loop {
            if !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }

            let idle = match self.run_next() {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(error = %e, "worker iteration failed");
                    true
                }
            };
            if !idle {
                backoff = poll_min;
                continue;
            }

            match stop_rx.recv_timeout(backoff) {
                Err(RecvTimeoutError::Timeout) => backoff = (backoff * 2).min(poll_max),
                _ => break,
            }
        }
        info!("indexing worker stopped");
    }
}

/// Stops the background loop when dropped. The in-flight job finishes first.
pub struct WorkerHandle {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.stop_tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("indexing worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{DHasher, HashBits, HashError};
    use crate::jobs::JobState;
    use crate::store::HashStatus;
    use image::{Rgb, RgbImage};
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tempfile::TempDir;

    /// Real dhash plus a count of files opened
    struct CountingHasher {
        calls: Arc<AtomicUsize>,
    }

    impl ImageHasher for CountingHasher {
        fn hash_file(&self, path: &Path, hash_size: u32) -> Result<HashBits, HashError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            DHasher.hash_file(path, hash_size)
        }
    }

    fn write_png(path: &Path, seed: u32, size: u32) {
        let img = RgbImage::from_fn(size, size, |x, y| {
            let v = ((x * seed + y * (seed + 3)) % 256) as u8;
            Rgb([v, v.wrapping_add(40), 255 - v])
        });
        img.save(path).unwrap();
    }

    struct Fixture {
        _tmp: TempDir,
        root: std::path::PathBuf,
        worker: IndexingWorker,
        calls: Arc<AtomicUsize>,
        dir_id: i64,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("photos");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        write_png(&root.join("a.png"), 3, 32);
        write_png(&root.join("b.png"), 7, 32);
        write_png(&root.join("sub/c.png"), 11, 32);
        std::fs::write(root.join("broken.jpg"), b"this is not a jpeg").unwrap();
        std::fs::write(root.join("readme.txt"), b"ignored").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let mut config = Config::default();
        config.hashing.workers = 2;
        config.worker.poll_min = "10ms".to_string();
        config.worker.poll_max = "50ms".to_string();

        let cache = HashCache::open(&tmp.path().join("lookalike.db")).unwrap();
        let worker = IndexingWorker::new(
            cache,
            Arc::new(CountingHasher {
                calls: Arc::clone(&calls),
            }),
            config,
        )
        .unwrap();
        let dir_id = worker.index().add_directory(&root, None).unwrap();

        Fixture {
            _tmp: tmp,
            root,
            worker,
            calls,
            dir_id,
        }
    }

    fn run(f: &Fixture, kind: JobKind, params: Option<serde_json::Value>) -> IndexJob {
        let id = f.worker.enqueue(kind, Some(f.dir_id), params).unwrap();
        let done = f.worker.run_pending().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, id);
        done.into_iter().next().unwrap()
    }

    /// Files hashed by one Index job on `dir_id`
    fn hashes_for_index(f: &Fixture, dir_id: i64) -> usize {
        let before = f.calls.load(Ordering::SeqCst);
        f.worker.enqueue(JobKind::Index, Some(dir_id), None).unwrap();
        let done = f.worker.run_pending().unwrap();
        assert_eq!(done[0].state, JobState::Completed, "{:?}", done[0].last_error);
        f.calls.load(Ordering::SeqCst) - before
    }

    /// Fails every running job the way another process's recovery would
    struct InterruptingHasher {
        queue: JobQueue,
    }

    impl ImageHasher for InterruptingHasher {
        fn hash_file(&self, path: &Path, hash_size: u32) -> Result<HashBits, HashError> {
            self.queue.fail_interrupted().unwrap();
            DHasher.hash_file(path, hash_size)
        }
    }

    #[test]
    fn test_index_job_records_every_image() {
        let f = fixture();
        let job = run(&f, JobKind::Index, None);
        assert_eq!(job.state, JobState::Completed, "{:?}", job.last_error);
        assert_eq!(job.progress, 1.0);

        let records = f.worker.index().records_for_directory(f.dir_id).unwrap();
        assert_eq!(records.len(), 4);
        let unreadable: Vec<_> = records
            .iter()
            .filter(|r| r.status == HashStatus::Unreadable)
            .collect();
        assert_eq!(unreadable.len(), 1);
        assert!(unreadable[0].path.ends_with("broken.jpg"));
        assert!(unreadable[0].size > 0);
        assert!(records
            .iter()
            .filter(|r| r.status == HashStatus::Ok)
            .all(|r| r.hash.as_ref().is_some_and(|h| h.len() == 256)));

        let dir = f.worker.index().get_directory(f.dir_id).unwrap();
        assert_eq!(dir.status, DirectoryStatus::Idle);
        assert!(dir.last_indexed_at.is_some());
    }

    #[test]
    fn test_reindex_of_unchanged_tree_hashes_nothing() {
        let f = fixture();
        run(&f, JobKind::Index, None);
        let first = f.calls.load(Ordering::SeqCst);
        assert_eq!(first, 4);

        let job = run(&f, JobKind::Refresh, None);
        assert_eq!(job.state, JobState::Completed);
        // Unreadable file is not reopened either
        assert_eq!(f.calls.load(Ordering::SeqCst), first);
    }

    #[test]
    fn test_refresh_picks_up_changes() {
        let f = fixture();
        run(&f, JobKind::Index, None);
        let before = f.calls.load(Ordering::SeqCst);

        write_png(&f.root.join("a.png"), 5, 48);
        write_png(&f.root.join("new.png"), 13, 32);
        std::fs::remove_file(f.root.join("b.png")).unwrap();

        run(&f, JobKind::Refresh, None);
        assert_eq!(f.calls.load(Ordering::SeqCst), before + 2);

        let paths: Vec<String> = f
            .worker
            .index()
            .records_for_directory(f.dir_id)
            .unwrap()
            .iter()
            .map(|r| r.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(paths.contains(&"new.png".to_string()));
        assert!(!paths.contains(&"b.png".to_string()));
        assert_eq!(paths.len(), 4);
    }

    #[test]
    fn test_refresh_rehashes_undecodable_record() {
        let f = fixture();
        run(&f, JobKind::Index, None);
        let before = f.calls.load(Ordering::SeqCst);

        f.worker
            .index()
            .store()
            .write(|tx| {
                Ok(tx.execute(
                    "UPDATE file_hashes SET hash_bits = X'00' WHERE path LIKE '%a.png'",
                    [],
                )?)
            })
            .unwrap();

        run(&f, JobKind::Refresh, None);
        assert_eq!(f.calls.load(Ordering::SeqCst), before + 1);
        let records = f.worker.index().records_for_directory(f.dir_id).unwrap();
        assert!(records
            .iter()
            .filter(|r| r.status == HashStatus::Ok)
            .all(|r| r.hash.is_some()));
    }

    #[test]
    fn test_rehash_recomputes_everything() {
        let f = fixture();
        run(&f, JobKind::Index, None);
        let before = f.calls.load(Ordering::SeqCst);
        run(&f, JobKind::Rehash, None);
        assert_eq!(f.calls.load(Ordering::SeqCst), before * 2);
    }

    #[test]
    fn test_hash_size_param_overrides_config() {
        let f = fixture();
        run(&f, JobKind::Index, None);
        run(&f, JobKind::Refresh, Some(json!({"hash_size": 8})));
        assert_eq!(f.calls.load(Ordering::SeqCst), 8);

        let records = f.worker.index().records_for_directory(f.dir_id).unwrap();
        assert!(records.iter().all(|r| r.hash_size == 8));
        assert!(records
            .iter()
            .filter_map(|r| r.hash.as_ref())
            .all(|h| h.len() == 64));
    }

    #[test]
    fn test_unknown_directory_fails_job() {
        let f = fixture();
        let id = f.worker.enqueue(JobKind::Index, Some(9999), None).unwrap();
        f.worker.run_pending().unwrap();
        let job = f.worker.job_status(id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.last_error.unwrap().contains("9999"));
    }

    #[test]
    fn test_vanished_directory_fails_job() {
        let f = fixture();
        std::fs::remove_dir_all(&f.root).unwrap();
        let job = run(&f, JobKind::Refresh, None);
        assert_eq!(job.state, JobState::Failed);
        assert!(job.last_error.unwrap().contains("vanished"));
        assert_eq!(
            f.worker.index().get_directory(f.dir_id).unwrap().status,
            DirectoryStatus::Idle
        );
    }

    #[test]
    fn test_gc_prunes_missing_records() {
        let f = fixture();
        run(&f, JobKind::Index, None);
        std::fs::remove_file(f.root.join("sub/c.png")).unwrap();

        let job = run(&f, JobKind::Gc, None);
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(
            f.worker.index().records_for_directory(f.dir_id).unwrap().len(),
            3
        );
    }

    #[test]
    fn test_background_worker_drains_queue_and_stops() {
        let f = fixture();
        let handle = f.worker.spawn().unwrap();
        let id = f.worker.enqueue(JobKind::Index, Some(f.dir_id), None).unwrap();

        let deadline = Instant::now() + Duration::from_secs(20);
        let job = loop {
            let job = f.worker.job_status(id).unwrap();
            if job.state.is_terminal() || Instant::now() > deadline {
                break job;
            }
            std::thread::sleep(Duration::from_millis(20));
        };
        handle.stop();
        assert_eq!(job.state, JobState::Completed);
    }

    #[test]
    fn test_spawn_fails_jobs_left_running() {
        let f = fixture();
        let id = f.worker.enqueue(JobKind::Index, Some(f.dir_id), None).unwrap();
        // Simulate a crash after the job was claimed
        f.worker.queue().dequeue().unwrap();

        let handle = f.worker.spawn().unwrap();
        handle.stop();

        let job = f.worker.job_status(id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("interrupted"));
    }

    #[test]
    fn test_nested_directories_index_idempotently() {
        let f = fixture();
        let inner = f
            .worker
            .index()
            .add_directory(&f.root.join("sub"), None)
            .unwrap();

        let per_run: Vec<usize> = [f.dir_id, inner, f.dir_id, inner, f.dir_id]
            .iter()
            .map(|&id| hashes_for_index(&f, id))
            .collect();
        assert_eq!(per_run, vec![3, 1, 0, 0, 0]);

        let index = f.worker.index();
        assert_eq!(index.records_for_directory(f.dir_id).unwrap().len(), 3);
        let inner_records = index.records_for_directory(inner).unwrap();
        assert_eq!(inner_records.len(), 1);
        assert!(inner_records[0].path.ends_with("sub/c.png"));
    }

    #[test]
    fn test_nested_directory_takes_over_records_without_rehashing() {
        let f = fixture();
        assert_eq!(hashes_for_index(&f, f.dir_id), 4);

        let inner = f
            .worker
            .index()
            .add_directory(&f.root.join("sub"), None)
            .unwrap();
        assert_eq!(hashes_for_index(&f, inner), 0);
        assert_eq!(hashes_for_index(&f, f.dir_id), 0);

        let index = f.worker.index();
        assert_eq!(index.records_for_directory(f.dir_id).unwrap().len(), 3);
        let taken = index.records_for_directory(inner).unwrap();
        assert_eq!(taken.len(), 1);
        assert!(taken[0].hash.is_some());
    }

    #[test]
    fn test_job_settled_elsewhere_is_not_a_worker_error() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("photos");
        std::fs::create_dir_all(&root).unwrap();
        write_png(&root.join("a.png"), 3, 32);

        let cache = HashCache::open(&tmp.path().join("lookalike.db")).unwrap();
        let queue = JobQueue::new(Arc::clone(cache.store()));
        let worker =
            IndexingWorker::new(cache, Arc::new(InterruptingHasher { queue }), Config::default())
                .unwrap();
        let dir_id = worker.index().add_directory(&root, None).unwrap();
        let id = worker.enqueue(JobKind::Index, Some(dir_id), None).unwrap();

        let done = worker.run_pending().unwrap();
        assert_eq!(done.len(), 1);
        let job = worker.job_status(id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("interrupted"));
        assert_eq!(
            worker.index().get_directory(dir_id).unwrap().status,
            DirectoryStatus::Idle
        );
    }
}
