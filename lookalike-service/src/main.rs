mod error;
mod routes;
mod state;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use lookalike_core::{Config, DHasher, HashCache, IndexingWorker, MatchingEngine};
use state::{AppState, SharedState};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lookalike-service")]
#[command(about = "Background image indexer with a JSON API", long_about = None)]
struct Args {
    /// Directory holding the database and config.toml
    #[arg(long, env = "LOOKALIKE_DATA_DIR", default_value = ".lookalike")]
    data_dir: PathBuf,

    #[arg(long, default_value_t = 3000)]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    bind: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Args::parse()).await {
        tracing::error!(error = %e, "lookalike-service exited with an error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_or_default(&args.data_dir.join("config.toml"))?;
    let cache = HashCache::open(&args.data_dir.join("lookalike.db"))?;
    let worker = IndexingWorker::new(cache.clone(), Arc::new(DHasher), config.clone())?;
    let engine = MatchingEngine::new(cache, Arc::new(DHasher), &config)?;
    let handle = worker.spawn()?;

    let state: SharedState = Arc::new(AppState::new(config, worker, engine));

    let app = Router::new()
        .route("/status", get(routes::status))
        .route(
            "/directories",
            get(routes::list_directories).post(routes::add_directory),
        )
        .route("/directories/{id}", axum::routing::delete(routes::remove_directory))
        .route("/directories/{id}/lookup", post(routes::lookup))
        .route("/jobs", get(routes::list_jobs).post(routes::enqueue_job))
        .route("/jobs/{id}", get(routes::job_status))
        .route("/jobs/{id}/cancel", post(routes::cancel_job))
        .route("/matches", post(routes::find_matches))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, data_dir = %args.data_dir.display(), "lookalike-service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    // Lets the in-flight job finish
    tokio::task::spawn_blocking(move || handle.stop()).await?;
    Ok(())
}
