use crate::error::AppError;
use lookalike_core::{Config, IndexingWorker, MatchingEngine};
use std::sync::Arc;

pub type SharedState = Arc<AppState>;

/// Worker and engine share one store
pub struct AppState {
    pub config: Config,
    pub worker: IndexingWorker,
    pub engine: MatchingEngine,
    pub started_at: i64,
}

impl AppState {
    pub fn new(config: Config, worker: IndexingWorker, engine: MatchingEngine) -> Self {
        Self {
            config,
            worker,
            engine,
            started_at: lookalike_core::paths::now_secs(),
        }
    }
}

/// Run blocking store work off the async runtime
pub async fn blocking<T, F>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> lookalike_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(AppError::internal)?
        .map_err(AppError::from)
}
