//! Bounded hashing pool with per-file timeouts.
//!
//! Decoding runs on a dedicated rayon pool; results stream back over a
//! crossbeam channel to the calling thread, which is the only place
//! `on_result` runs. A task's timeout clock starts when a pool thread picks it
//! up, not when it is queued.

use super::{HashBits, HashError, ImageHasher};
use crate::config::Config;
use crate::LookalikeError;
use crossbeam_channel::RecvTimeoutError;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

enum Event {
    Started(usize),
    Finished(usize, Result<HashBits, HashError>),
}

pub struct HashPool {
    pool: rayon::ThreadPool,
    hasher: Arc<dyn ImageHasher>,
    workers: usize,
    timeout: Duration,
}

impl HashPool {
    pub fn new(
        hasher: Arc<dyn ImageHasher>,
        workers: usize,
        timeout: Duration,
    ) -> crate::Result<Self> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("lookalike-hash-{i}"))
            .build()
            .map_err(|e| LookalikeError::Io(std::io::Error::other(e.to_string())))?;
        Ok(Self {
            pool,
            hasher,
            workers,
            timeout,
        })
    }

    /// Pool sized and timed from config
    pub fn from_config(hasher: Arc<dyn ImageHasher>, config: &Config) -> crate::Result<Self> {
        Self::new(hasher, config.hash_workers(), config.hash_timeout())
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Hash every path, calling `on_result(index, result)` exactly once per
    /// path in completion order. An error returned by `on_result` stops the
    /// run: queued tasks are skipped and the error is returned.
    pub fn hash_all<F>(&self, paths: &[PathBuf], hash_size: u32, mut on_result: F) -> crate::Result<()>
    where
        F: FnMut(usize, Result<HashBits, HashError>) -> crate::Result<()>,
    {
        if paths.is_empty() {
            return Ok(());
        }

        let (tx, rx) = crossbeam_channel::unbounded::<Event>();
        let cancelled = Arc::new(AtomicBool::new(false));

        for (idx, path) in paths.iter().enumerate() {
            let tx = tx.clone();
            let hasher = Arc::clone(&self.hasher);
            let cancelled = Arc::clone(&cancelled);
            let path = path.clone();
            self.pool.spawn(move || {
                if cancelled.load(Ordering::Relaxed) {
                    return;
                }
                if tx.send(Event::Started(idx)).is_err() {
                    return;
                }
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    hasher.hash_file(&path, hash_size)
                }))
                .unwrap_or_else(|payload| Err(HashError::Panicked(panic_message(&*payload))));
                let _ = tx.send(Event::Finished(idx, result));
            });
        }
        drop(tx);

        let outcome = self.collect(paths, &rx, &mut on_result);
        if outcome.is_err() {
            cancelled.store(true, Ordering::Relaxed);
        }
        outcome
    }

    fn collect<F>(
        &self,
        paths: &[PathBuf],
        rx: &crossbeam_channel::Receiver<Event>,
        on_result: &mut F,
    ) -> crate::Result<()>
    where
        F: FnMut(usize, Result<HashBits, HashError>) -> crate::Result<()>,
    {
        let timeout = self.timeout;
        let mut resolved = vec![false; paths.len()];
        let mut remaining = paths.len();
        let mut in_flight: HashMap<usize, Instant> = HashMap::new();
        let mut last_progress = Instant::now();

        while remaining > 0 {
            let wait = match in_flight.values().min() {
                Some(oldest) => (*oldest + timeout).saturating_duration_since(Instant::now()),
                None => timeout.saturating_sub(last_progress.elapsed()),
            }
            .max(Duration::from_millis(1));

            match rx.recv_timeout(wait) {
                Ok(Event::Started(idx)) => {
                    if !resolved[idx] {
                        in_flight.insert(idx, Instant::now());
                    }
                    last_progress = Instant::now();
                }
                Ok(Event::Finished(idx, result)) => {
                    in_flight.remove(&idx);
                    if resolved[idx] {
                        // Already reported as timed out
                        continue;
                    }
                    resolved[idx] = true;
                    remaining -= 1;
                    last_progress = Instant::now();
                    on_result(idx, result)?;
                }
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    let expired: Vec<usize> = in_flight
                        .iter()
                        .filter(|(_, started)| now.duration_since(**started) >= timeout)
                        .map(|(idx, _)| *idx)
                        .collect();
                    for idx in expired {
                        in_flight.remove(&idx);
                        resolved[idx] = true;
                        remaining -= 1;
                        last_progress = now;
                        warn!(path = %paths[idx].display(), ?timeout, "hashing timed out, skipping");
                        on_result(idx, Err(HashError::Timeout(timeout)))?;
                    }

                    // Every pool thread is stuck in an abandoned task
                    if in_flight.is_empty() && last_progress.elapsed() >= timeout {
                        for idx in 0..paths.len() {
                            if !resolved[idx] {
                                resolved[idx] = true;
                                remaining -= 1;
                                on_result(idx, Err(HashError::Timeout(timeout)))?;
                            }
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!(remaining, "hash pool channel closed early");
                    for idx in 0..paths.len() {
                        if !resolved[idx] {
                            resolved[idx] = true;
                            remaining -= 1;
                            on_result(
                                idx,
                                Err(HashError::Panicked("task dropped".to_string())),
                            )?;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
