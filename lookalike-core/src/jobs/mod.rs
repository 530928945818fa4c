//! Persistent FIFO job queue with an enforced state machine.
//!
//! `Queued -> Running -> {Completed | Failed}` and `Queued -> Cancelled`.
//! Every transition is a conditional UPDATE on the current state, so a job
//! can never leave a terminal state.

mod pipeline;
mod worker;

pub use pipeline::JobSummary;
pub use worker::{IndexingWorker, WorkerHandle};

use crate::paths::now_secs;
use crate::store::Store;
use crate::LookalikeError;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// First full scan of a directory (incremental if records exist)
    Index,
    /// Incremental rescan
    Refresh,
    /// Recompute every hash regardless of metadata
    Rehash,
    /// Prune records whose files are gone
    Gc,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Refresh => "refresh",
            Self::Rehash => "rehash",
            Self::Gc => "gc",
        }
    }

    pub fn requires_directory(self) -> bool {
        !matches!(self, Self::Gc)
    }
}

impl FromStr for JobKind {
    type Err = LookalikeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "index" => Ok(Self::Index),
            "refresh" => Ok(Self::Refresh),
            "rehash" => Ok(Self::Rehash),
            "gc" => Ok(Self::Gc),
            other => Err(LookalikeError::UnknownJobKind(other.to_string())),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexJob {
    pub id: i64,
    pub directory_id: Option<i64>,
    pub kind: JobKind,
    pub params: serde_json::Value,
    pub state: JobState,
    pub progress: f64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub last_error: Option<String>,
}

impl IndexJob {
    /// `{"hash_size": n}` in params overrides the configured hash size
    pub fn hash_size_override(&self) -> Option<u32> {
        self.params
            .get("hash_size")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32)
    }
}

/// Job counts by state
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobCounts {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<Store>,
}

impl JobQueue {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Add a job. The directory is not checked here: a job for an unknown
    /// directory is accepted and fails when it runs.
    ///
    /// Two requests are rejected up front instead of queueing a job that
    /// could never run: `MissingDirectory` for a directory-scoped kind
    /// (Index, Refresh, Rehash) without a `directory_id`, and
    /// `InvalidJobParams` for params that are not an object or carry a
    /// `hash_size` outside 2..=64.
    pub fn enqueue(
        &self,
        kind: JobKind,
        directory_id: Option<i64>,
        params: Option<serde_json::Value>,
    ) -> crate::Result<i64> {
        if kind.requires_directory() && directory_id.is_none() {
            return Err(LookalikeError::MissingDirectory(kind.to_string()));
        }
        let params = validate_params(params)?;
        let encoded = serde_json::to_string(&params)?;

        self.store.write(|tx| {
            tx.execute(
                "INSERT INTO jobs (directory_id, kind, params, state, progress, created_at)
                 VALUES (?1, ?2, ?3, 'queued', 0, ?4)",
                params![directory_id, kind.as_str(), encoded, now_secs()],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    pub fn get(&self, id: i64) -> crate::Result<IndexJob> {
        self.store
            .read(|conn| fetch_job(conn, id))?
            .ok_or(LookalikeError::JobNotFound(id))
    }

    /// Claim the oldest queued job, moving it to Running
    pub fn dequeue(&self) -> crate::Result<Option<IndexJob>> {
        self.store.write(|tx| {
            let next: Option<i64> = tx
                .query_row(
                    "SELECT id FROM jobs WHERE state = 'queued'
                     ORDER BY created_at, id LIMIT 1",
                    [],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(id) = next else {
                return Ok(None);
            };
            tx.execute(
                "UPDATE jobs SET state = 'running', started_at = ?2
                 WHERE id = ?1 AND state = 'queued'",
                params![id, now_secs()],
            )?;
            fetch_job(tx, id)
        })
    }

    /// Record progress on a running job. Progress never moves backwards.
    pub fn set_progress(&self, id: i64, progress: f64) -> crate::Result<()> {
        let progress = progress.clamp(0.0, 1.0);
        let changed = self.store.write(|tx| {
            Ok(tx.execute(
                "UPDATE jobs SET progress = MAX(progress, ?2)
                 WHERE id = ?1 AND state = 'running'",
                params![id, progress],
            )?)
        })?;
        if changed == 0 {
            return Err(self.transition_error(id, JobState::Running));
        }
        Ok(())
    }

    pub fn complete(&self, id: i64) -> crate::Result<()> {
        self.transition(id, JobState::Running, JobState::Completed, None)
    }

    pub fn fail(&self, id: i64, message: &str) -> crate::Result<()> {
        self.transition(id, JobState::Running, JobState::Failed, Some(message))
    }

    /// Cancel a job that has not started yet
    pub fn cancel(&self, id: i64) -> crate::Result<()> {
        self.transition(id, JobState::Queued, JobState::Cancelled, None)
    }

    /// Fail jobs a previous process left running. Returns how many.
    pub fn fail_interrupted(&self) -> crate::Result<usize> {
        self.store.write(|tx| {
            Ok(tx.execute(
                "UPDATE jobs SET state = 'failed', last_error = 'interrupted', finished_at = ?1
                 WHERE state = 'running'",
                params![now_secs()],
            )?)
        })
    }

    /// Most recent jobs first
    pub fn recent(&self, limit: usize) -> crate::Result<Vec<IndexJob>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{JOB_SELECT} ORDER BY created_at DESC, id DESC LIMIT ?1"
            ))?;
            let jobs = stmt
                .query_map(params![limit as i64], job_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            jobs.into_iter().collect()
        })
    }

    pub fn counts(&self) -> crate::Result<JobCounts> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
            let rows = stmt
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            let mut counts = JobCounts::default();
            for (state, n) in rows {
                let n = n as usize;
                match JobState::parse(&state) {
                    Some(JobState::Queued) => counts.queued = n,
                    Some(JobState::Running) => counts.running = n,
                    Some(JobState::Completed) => counts.completed = n,
                    Some(JobState::Failed) => counts.failed = n,
                    Some(JobState::Cancelled) => counts.cancelled = n,
                    None => {}
                }
            }
            Ok(counts)
        })
    }

    fn transition(
        &self,
        id: i64,
        from: JobState,
        to: JobState,
        error: Option<&str>,
    ) -> crate::Result<()> {
        let changed = self.store.write(|tx| {
            let sql = if to == JobState::Completed {
                "UPDATE jobs SET state = ?3, finished_at = ?4, last_error = ?5, progress = 1.0
                 WHERE id = ?1 AND state = ?2"
            } else {
                "UPDATE jobs SET state = ?3, finished_at = ?4, last_error = ?5
                 WHERE id = ?1 AND state = ?2"
            };
            Ok(tx.execute(
                sql,
                params![id, from.as_str(), to.as_str(), now_secs(), error],
            )?)
        })?;
        if changed == 0 {
            return Err(self.transition_error(id, to));
        }
        Ok(())
    }

    fn transition_error(&self, id: i64, to: JobState) -> LookalikeError {
        match self.get(id) {
            Ok(job) => LookalikeError::InvalidTransition {
                id,
                from: job.state.to_string(),
                to: to.to_string(),
            },
            Err(e) => e,
        }
    }
}

fn validate_params(params: Option<serde_json::Value>) -> crate::Result<serde_json::Value> {
    let params = match params {
        None | Some(serde_json::Value::Null) => serde_json::json!({}),
        Some(v @ serde_json::Value::Object(_)) => v,
        Some(other) => {
            return Err(LookalikeError::InvalidJobParams(format!(
                "expected an object, got {other}"
            )))
        }
    };
    if let Some(size) = params.get("hash_size") {
        match size.as_u64() {
            Some(n) if (2..=64).contains(&n) => {}
            _ => {
                return Err(LookalikeError::InvalidJobParams(format!(
                    "hash_size must be an integer between 2 and 64, got {size}"
                )))
            }
        }
    }
    Ok(params)
}

const JOB_SELECT: &str = "SELECT id, directory_id, kind, params, state, progress, created_at,
        started_at, finished_at, last_error
     FROM jobs";

fn fetch_job(conn: &Connection, id: i64) -> crate::Result<Option<IndexJob>> {
    let row = conn
        .query_row(
            &format!("{JOB_SELECT} WHERE id = ?1"),
            params![id],
            job_from_row,
        )
        .optional()?;
    row.transpose()
}

/// Decode a job row. Unknown kinds or states surface as errors rather than
/// being silently mapped.
fn job_from_row(row: &Row<'_>) -> rusqlite::Result<crate::Result<IndexJob>> {
    let id: i64 = row.get(0)?;
    let kind: String = row.get(2)?;
    let params: String = row.get(3)?;
    let state: String = row.get(4)?;

    let build = || -> crate::Result<IndexJob> {
        Ok(IndexJob {
            id,
            directory_id: row.get(1)?,
            kind: kind.parse()?,
            params: serde_json::from_str(&params)?,
            state: JobState::parse(&state).ok_or_else(|| LookalikeError::InvalidTransition {
                id,
                from: state.clone(),
                to: "?".to_string(),
            })?,
            progress: row.get(5)?,
            created_at: row.get(6)?,
            started_at: row.get(7)?,
            finished_at: row.get(8)?,
            last_error: row.get(9)?,
        })
    };
    Ok(build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> JobQueue {
        JobQueue::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[test]
    fn test_fifo_dequeue() {
        let q = queue();
        let a = q.enqueue(JobKind::Index, Some(1), None).unwrap();
        let b = q.enqueue(JobKind::Refresh, Some(2), None).unwrap();
        let c = q.enqueue(JobKind::Gc, None, None).unwrap();

        let order: Vec<i64> = std::iter::from_fn(|| q.dequeue().unwrap().map(|j| j.id)).collect();
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn test_dequeue_marks_running() {
        let q = queue();
        let id = q.enqueue(JobKind::Index, Some(1), None).unwrap();
        assert_eq!(q.get(id).unwrap().state, JobState::Queued);

        let job = q.dequeue().unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Running);
        assert!(job.started_at.is_some());
        assert!(q.dequeue().unwrap().is_none());
    }

    #[test]
    fn test_complete_sets_full_progress() {
        let q = queue();
        let id = q.enqueue(JobKind::Index, Some(1), None).unwrap();
        q.dequeue().unwrap();
        q.set_progress(id, 0.5).unwrap();
        q.set_progress(id, 0.25).unwrap();
        assert_eq!(q.get(id).unwrap().progress, 0.5);

        q.complete(id).unwrap();
        let job = q.get(id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress, 1.0);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let q = queue();
        let id = q.enqueue(JobKind::Index, Some(1), None).unwrap();
        q.dequeue().unwrap();
        q.fail(id, "disk on fire").unwrap();

        let job = q.get(id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("disk on fire"));

        for result in [q.complete(id), q.fail(id, "again"), q.cancel(id), q.set_progress(id, 0.9)] {
            assert!(matches!(result, Err(LookalikeError::InvalidTransition { .. })));
        }
    }

    #[test]
    fn test_cannot_skip_running() {
        let q = queue();
        let id = q.enqueue(JobKind::Index, Some(1), None).unwrap();
        match q.complete(id) {
            Err(LookalikeError::InvalidTransition { from, to, .. }) => {
                assert_eq!(from, "queued");
                assert_eq!(to, "completed");
            }
            other => panic!("expected invalid transition, got {other:?}"),
        }
    }

    #[test]
    fn test_cancel_only_queued() {
        let q = queue();
        let a = q.enqueue(JobKind::Index, Some(1), None).unwrap();
        let b = q.enqueue(JobKind::Index, Some(1), None).unwrap();
        q.cancel(b).unwrap();
        assert_eq!(q.get(b).unwrap().state, JobState::Cancelled);

        // Cancelled jobs are never dequeued
        assert_eq!(q.dequeue().unwrap().unwrap().id, a);
        assert!(q.dequeue().unwrap().is_none());
        assert!(q.cancel(a).is_err());
    }

    #[test]
    fn test_unknown_job_is_error() {
        let q = queue();
        assert!(matches!(q.get(42), Err(LookalikeError::JobNotFound(42))));
        assert!(matches!(q.complete(42), Err(LookalikeError::JobNotFound(42))));
    }

    #[test]
    fn test_fail_interrupted() {
        let q = queue();
        let a = q.enqueue(JobKind::Index, Some(1), None).unwrap();
        let b = q.enqueue(JobKind::Index, Some(1), None).unwrap();
        q.dequeue().unwrap();

        assert_eq!(q.fail_interrupted().unwrap(), 1);
        let job = q.get(a).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("interrupted"));
        assert_eq!(q.get(b).unwrap().state, JobState::Queued);
    }

    #[test]
    fn test_enqueue_validation() {
        let q = queue();
        assert!(matches!(
            q.enqueue(JobKind::Index, None, None),
            Err(LookalikeError::MissingDirectory(_))
        ));
        assert!(matches!(
            q.enqueue(JobKind::Index, Some(1), Some(json!([1, 2]))),
            Err(LookalikeError::InvalidJobParams(_))
        ));
        assert!(matches!(
            q.enqueue(JobKind::Index, Some(1), Some(json!({"hash_size": 1}))),
            Err(LookalikeError::InvalidJobParams(_))
        ));

        let id = q
            .enqueue(JobKind::Rehash, Some(1), Some(json!({"hash_size": 8})))
            .unwrap();
        assert_eq!(q.get(id).unwrap().hash_size_override(), Some(8));

        // Everything else queues, even for a directory nobody tracks
        assert!(q.enqueue(JobKind::Index, Some(424_242), None).is_ok());
        assert!(q.enqueue(JobKind::Gc, None, Some(serde_json::Value::Null)).is_ok());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Refresh".parse::<JobKind>().unwrap(), JobKind::Refresh);
        assert!(matches!(
            "defrag".parse::<JobKind>(),
            Err(LookalikeError::UnknownJobKind(_))
        ));
    }

    #[test]
    fn test_counts_and_recent() {
        let q = queue();
        let a = q.enqueue(JobKind::Index, Some(1), None).unwrap();
        let b = q.enqueue(JobKind::Gc, None, None).unwrap();
        q.dequeue().unwrap();

        let counts = q.counts().unwrap();
        assert_eq!(counts.running, 1);
        assert_eq!(counts.queued, 1);

        let recent: Vec<i64> = q.recent(10).unwrap().iter().map(|j| j.id).collect();
        assert_eq!(recent, vec![b, a]);
    }
}
