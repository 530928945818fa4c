use crate::error::AppError;
use crate::state::{blocking, SharedState};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use lookalike_core::{
    IndexJob, JobCounts, JobKind, MatchCriteria, MatchOutcome, MatchPair, TrackedDirectory,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

// GET /status
#[derive(Serialize)]
pub struct StatusResponse {
    pub service: String,
    pub version: String,
    pub started_at: String,
    pub directories: usize,
    pub jobs: JobCounts,
}

pub async fn status(State(state): State<SharedState>) -> Result<Json<StatusResponse>, AppError> {
    let st = Arc::clone(&state);
    let (directories, jobs) = blocking(move || {
        let dirs = st.worker.index().list_directories()?;
        Ok((dirs.len(), st.worker.queue().counts()?))
    })
    .await?;

    let started_at = OffsetDateTime::from_unix_timestamp(state.started_at)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_default();

    Ok(Json(StatusResponse {
        service: "lookalike".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at,
        directories,
        jobs,
    }))
}

// GET /directories
pub async fn list_directories(
    State(state): State<SharedState>,
) -> Result<Json<Vec<TrackedDirectory>>, AppError> {
    let dirs = blocking(move || state.worker.index().list_directories()).await?;
    Ok(Json(dirs))
}

// POST /directories
#[derive(Deserialize)]
pub struct AddDirectoryRequest {
    pub path: PathBuf,
    #[serde(default)]
    pub prefix_bits: Option<u32>,
}

pub async fn add_directory(
    State(state): State<SharedState>,
    Json(req): Json<AddDirectoryRequest>,
) -> Result<(StatusCode, Json<TrackedDirectory>), AppError> {
    let dir = blocking(move || {
        let index = state.worker.index();
        let id = index.add_directory(&req.path, req.prefix_bits)?;
        index.get_directory(id)
    })
    .await?;
    tracing::info!(id = dir.id, path = %dir.path.display(), "directory tracked");
    Ok((StatusCode::CREATED, Json(dir)))
}

// DELETE /directories/{id}
pub async fn remove_directory(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    blocking(move || state.worker.index().remove_directory(id)).await?;
    tracing::info!(id, "directory removed");
    Ok(Json(serde_json::json!({ "removed": id })))
}

// POST /jobs
#[derive(Deserialize)]
pub struct EnqueueRequest {
    pub kind: String,
    #[serde(default)]
    pub directory_id: Option<i64>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

pub async fn enqueue_job(
    State(state): State<SharedState>,
    Json(req): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<IndexJob>), AppError> {
    let kind: JobKind = req.kind.parse()?;
    let job = blocking(move || {
        let id = state.worker.enqueue(kind, req.directory_id, req.params)?;
        state.worker.job_status(id)
    })
    .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

// GET /jobs
#[derive(Deserialize)]
pub struct JobsQuery {
    #[serde(default = "default_jobs_limit")]
    pub limit: usize,
}

fn default_jobs_limit() -> usize {
    50
}

pub async fn list_jobs(
    State(state): State<SharedState>,
    Query(q): Query<JobsQuery>,
) -> Result<Json<Vec<IndexJob>>, AppError> {
    let jobs = blocking(move || state.worker.queue().recent(q.limit)).await?;
    Ok(Json(jobs))
}

// GET /jobs/{id}
pub async fn job_status(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<IndexJob>, AppError> {
    let job = blocking(move || state.worker.job_status(id)).await?;
    Ok(Json(job))
}

// POST /jobs/{id}/cancel
pub async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<IndexJob>, AppError> {
    let job = blocking(move || {
        state.worker.queue().cancel(id)?;
        state.worker.job_status(id)
    })
    .await?;
    tracing::info!(job_id = id, "job cancelled");
    Ok(Json(job))
}

// POST /matches
#[derive(Deserialize)]
pub struct MatchRequest {
    pub reference: Vec<PathBuf>,
    pub work: Vec<PathBuf>,
    /// Hash mode with configured defaults when omitted
    #[serde(default)]
    pub criteria: Option<MatchCriteria>,
}

pub async fn find_matches(
    State(state): State<SharedState>,
    Json(req): Json<MatchRequest>,
) -> Result<Json<MatchOutcome>, AppError> {
    let criteria = req.criteria.unwrap_or_else(|| {
        MatchCriteria::hash(state.config.hashing.hash_size, state.config.hashing.similarity)
    });
    let (ref_count, work_count) = (req.reference.len(), req.work.len());

    let outcome = blocking(move || state.engine.find_matches(&req.reference, &req.work, &criteria)).await?;
    tracing::info!(
        reference = ref_count,
        work = work_count,
        matches = outcome.matches.len(),
        "POST /matches"
    );
    Ok(Json(outcome))
}

// POST /directories/{id}/lookup
#[derive(Deserialize)]
pub struct LookupRequest {
    pub path: PathBuf,
    #[serde(default)]
    pub hash_size: Option<u32>,
    #[serde(default)]
    pub similarity_percent: Option<f64>,
    #[serde(default = "default_lookup_limit")]
    pub limit: usize,
}

fn default_lookup_limit() -> usize {
    50
}

pub async fn lookup(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<LookupRequest>,
) -> Result<Json<Vec<MatchPair>>, AppError> {
    let found = blocking(move || {
        let hashing = &state.config.hashing;
        state.engine.find_in_directory(
            &req.path,
            id,
            req.hash_size.unwrap_or(hashing.hash_size),
            req.similarity_percent.unwrap_or(hashing.similarity),
            req.limit,
        )
    })
    .await?;
    tracing::debug!(directory_id = id, found = found.len(), "directory lookup");
    Ok(Json(found))
}
