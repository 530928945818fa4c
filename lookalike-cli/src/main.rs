//! Lookalike CLI - perceptual near-duplicate image search

use clap::{Parser, Subcommand};
use colored::Colorize;
use lookalike_core::config::DEFAULT_CONFIG;
use lookalike_core::index::list_images;
use lookalike_core::{
    Config, DHasher, ErrorEnvelope, HashCache, IndexJob, IndexingWorker, JobKind, JobState,
    LookalikeError, MatchCriteria, MatchingEngine, TrackedDirectory,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const DB_FILE: &str = "lookalike.db";
const CONFIG_FILE: &str = "config.toml";

#[derive(Parser)]
#[command(name = "lookalike")]
#[command(about = "Find near-duplicate images with perceptual hashing", long_about = None)]
struct Cli {
    /// Directory holding the database and config.toml
    #[arg(long, global = true, env = "LOOKALIKE_DATA_DIR", default_value = ".lookalike")]
    data_dir: PathBuf,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and config.toml
    Init,

    /// Start tracking a directory
    AddDir {
        path: PathBuf,
        /// Bucket granularity (top N hash bits, 1-63)
        #[arg(long)]
        prefix_bits: Option<u32>,
    },

    /// List tracked directories
    Dirs,

    /// Stop tracking a directory and drop its records
    RemoveDir { id: i64 },

    /// Index a tracked directory (incremental when records exist)
    Index {
        id: i64,
        #[command(flatten)]
        opts: JobOpts,
    },

    /// Rescan a tracked directory, hashing only new or changed files
    Refresh {
        id: i64,
        #[command(flatten)]
        opts: JobOpts,
    },

    /// Recompute every hash in a tracked directory
    Rehash {
        id: i64,
        #[command(flatten)]
        opts: JobOpts,
    },

    /// Prune records for files that no longer exist
    Gc {
        /// Directory to prune (the unscoped cache when omitted)
        id: Option<i64>,
        /// Only enqueue; do not run the queue
        #[arg(long)]
        no_wait: bool,
    },

    /// Show one job
    Job { id: i64 },

    /// List recent jobs
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Cancel a queued job
    Cancel { id: i64 },

    /// Compare a reference set against a working set
    Match {
        /// Reference directory or file
        reference: PathBuf,
        /// Working directory or file
        work: PathBuf,
        /// Similarity threshold in percent (default from config)
        #[arg(short, long)]
        similarity: Option<f64>,
        /// Hash grid size (default from config)
        #[arg(long)]
        hash_size: Option<u32>,
        /// Match on exact metadata fields instead of hashes (e.g. name,dimensions)
        #[arg(long, value_delimiter = ',')]
        fields: Option<Vec<String>>,
    },

    /// Find indexed files in a tracked directory that look like one image
    Lookup {
        /// Image to look up
        file: PathBuf,
        /// Tracked directory id
        #[arg(long)]
        dir: i64,
        /// Similarity threshold in percent (default from config)
        #[arg(short, long)]
        similarity: Option<f64>,
        /// Hash grid size (default from config)
        #[arg(long)]
        hash_size: Option<u32>,
        /// Most candidates to fetch from the index
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Reset the hash cache
    CacheClear {
        /// Delete the whole database, including tracked directories and jobs
        #[arg(long)]
        all: bool,
    },
}

#[derive(clap::Args)]
struct JobOpts {
    /// Override the configured hash size for this job
    #[arg(long)]
    hash_size: Option<u32>,
    /// Only enqueue; do not run the queue
    #[arg(long)]
    no_wait: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let data_dir = cli.data_dir.as_path();
    let json = cli.json;
    let result = match cli.command {
        Commands::Init => cmd_init(data_dir, json),
        Commands::AddDir { path, prefix_bits } => cmd_add_dir(data_dir, &path, prefix_bits, json),
        Commands::Dirs => cmd_dirs(data_dir, json),
        Commands::RemoveDir { id } => cmd_remove_dir(data_dir, id, json),
        Commands::Index { id, opts } => cmd_job(data_dir, JobKind::Index, Some(id), opts, json),
        Commands::Refresh { id, opts } => cmd_job(data_dir, JobKind::Refresh, Some(id), opts, json),
        Commands::Rehash { id, opts } => cmd_job(data_dir, JobKind::Rehash, Some(id), opts, json),
        Commands::Gc { id, no_wait } => {
            let opts = JobOpts {
                hash_size: None,
                no_wait,
            };
            cmd_job(data_dir, JobKind::Gc, id, opts, json)
        }
        Commands::Job { id } => cmd_job_status(data_dir, id, json),
        Commands::Jobs { limit } => cmd_jobs(data_dir, limit, json),
        Commands::Cancel { id } => cmd_cancel(data_dir, id, json),
        Commands::Match {
            reference,
            work,
            similarity,
            hash_size,
            fields,
        } => cmd_match(data_dir, &reference, &work, similarity, hash_size, fields, json),
        Commands::Lookup {
            file,
            dir,
            similarity,
            hash_size,
            limit,
        } => cmd_lookup(data_dir, &file, dir, similarity, hash_size, limit, json),
        Commands::CacheClear { all } => cmd_cache_clear(data_dir, all, json),
    };

    if let Err(e) = result {
        if json {
            let envelope = ErrorEnvelope::from(&e);
            match serde_json::to_string_pretty(&envelope) {
                Ok(body) => eprintln!("{body}"),
                Err(_) => eprintln!("{}", e),
            }
        } else {
            eprintln!("{}: {}", "Error".red(), e);
        }
        std::process::exit(1);
    }
}

/// The data directory's config plus its shared cache
struct Workspace {
    config: Config,
    cache: HashCache,
}

impl Workspace {
    fn open(data_dir: &Path) -> lookalike_core::Result<Self> {
        let config = Config::load_or_default(&data_dir.join(CONFIG_FILE))?;
        let cache = HashCache::open(&data_dir.join(DB_FILE))?;
        Ok(Self { config, cache })
    }

    fn worker(&self) -> lookalike_core::Result<IndexingWorker> {
        IndexingWorker::new(self.cache.clone(), Arc::new(DHasher), self.config.clone())
    }
}

fn print_json<T: Serialize>(value: &T) -> lookalike_core::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_time(secs: Option<i64>) -> String {
    secs.and_then(|s| OffsetDateTime::from_unix_timestamp(s).ok())
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| "never".to_string())
}

fn cmd_init(data_dir: &Path, json: bool) -> lookalike_core::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let config_path = data_dir.join(CONFIG_FILE);
    let created = !config_path.exists();
    if created {
        std::fs::write(&config_path, DEFAULT_CONFIG)?;
    }
    // Creates the schema
    HashCache::open(&data_dir.join(DB_FILE))?.close()?;

    if json {
        print_json(&serde_json::json!({
            "data_dir": data_dir,
            "config_created": created,
        }))
    } else {
        if created {
            println!("{} {}", "Created".green(), config_path.display());
        } else {
            println!("{} {}", "Exists".yellow(), config_path.display());
        }
        println!("{} {}", "Database".blue(), data_dir.join(DB_FILE).display());
        Ok(())
    }
}

fn cmd_add_dir(
    data_dir: &Path,
    path: &Path,
    prefix_bits: Option<u32>,
    json: bool,
) -> lookalike_core::Result<()> {
    let ws = Workspace::open(data_dir)?;
    let worker = ws.worker()?;
    let id = worker.index().add_directory(path, prefix_bits)?;
    let dir = worker.index().get_directory(id)?;

    if json {
        print_json(&dir)
    } else {
        println!("{}: {} {}", "Tracking".green(), dir.id.to_string().cyan(), dir.path.display());
        println!("Run `lookalike index {}` to hash its images", dir.id);
        Ok(())
    }
}

fn print_directory(dir: &TrackedDirectory) {
    let status = match dir.status.as_str() {
        "indexing" => dir.status.as_str().yellow(),
        s => s.normal(),
    };
    println!(
        "{}: {} [{}] {} files, prefix {} bits, indexed {}",
        dir.id.to_string().cyan(),
        dir.path.display(),
        status,
        dir.file_count,
        dir.prefix_bits,
        format_time(dir.last_indexed_at).dimmed()
    );
}

fn cmd_dirs(data_dir: &Path, json: bool) -> lookalike_core::Result<()> {
    let ws = Workspace::open(data_dir)?;
    let dirs = ws.worker()?.index().list_directories()?;

    if json {
        return print_json(&dirs);
    }
    if dirs.is_empty() {
        println!("No tracked directories. Add one with `lookalike add-dir <path>`.");
    }
    for dir in &dirs {
        print_directory(dir);
    }
    println!("({} directories)", dirs.len());
    Ok(())
}

fn cmd_remove_dir(data_dir: &Path, id: i64, json: bool) -> lookalike_core::Result<()> {
    let ws = Workspace::open(data_dir)?;
    ws.worker()?.index().remove_directory(id)?;

    if json {
        print_json(&serde_json::json!({ "removed": id }))
    } else {
        println!("{}: directory {}", "Removed".yellow(), id);
        Ok(())
    }
}

fn print_job(job: &IndexJob) {
    let state = match job.state {
        JobState::Completed => job.state.as_str().green(),
        JobState::Failed => job.state.as_str().red(),
        JobState::Cancelled => job.state.as_str().dimmed(),
        JobState::Running => job.state.as_str().yellow(),
        JobState::Queued => job.state.as_str().normal(),
    };
    let dir = job
        .directory_id
        .map(|d| format!(" dir {d}"))
        .unwrap_or_default();
    println!(
        "{}: {}{} [{}] {:.0}%",
        job.id.to_string().cyan(),
        job.kind,
        dir,
        state,
        job.progress * 100.0
    );
    if let Some(err) = &job.last_error {
        println!("  {}: {}", "error".red(), err);
    }
}

fn cmd_job(
    data_dir: &Path,
    kind: JobKind,
    directory_id: Option<i64>,
    opts: JobOpts,
    json: bool,
) -> lookalike_core::Result<()> {
    let ws = Workspace::open(data_dir)?;
    let worker = ws.worker()?;
    let params = opts
        .hash_size
        .map(|n| serde_json::json!({ "hash_size": n }));
    let id = worker.enqueue(kind, directory_id, params)?;

    if !opts.no_wait {
        worker.recover()?;
        worker.run_pending()?;
    }
    let job = worker.job_status(id)?;

    if json {
        print_json(&job)
    } else {
        print_job(&job);
        Ok(())
    }
}

fn cmd_job_status(data_dir: &Path, id: i64, json: bool) -> lookalike_core::Result<()> {
    let ws = Workspace::open(data_dir)?;
    let job = ws.worker()?.job_status(id)?;
    if json {
        print_json(&job)
    } else {
        print_job(&job);
        println!(
            "  created {}, finished {}",
            format_time(Some(job.created_at)),
            format_time(job.finished_at)
        );
        Ok(())
    }
}

fn cmd_jobs(data_dir: &Path, limit: usize, json: bool) -> lookalike_core::Result<()> {
    let ws = Workspace::open(data_dir)?;
    let worker = ws.worker()?;
    let jobs = worker.queue().recent(limit)?;
    let counts = worker.queue().counts()?;

    if json {
        return print_json(&serde_json::json!({ "jobs": jobs, "counts": counts }));
    }
    for job in &jobs {
        print_job(job);
    }
    println!(
        "({} queued, {} running, {} completed, {} failed, {} cancelled)",
        counts.queued, counts.running, counts.completed, counts.failed, counts.cancelled
    );
    Ok(())
}

fn cmd_cancel(data_dir: &Path, id: i64, json: bool) -> lookalike_core::Result<()> {
    let ws = Workspace::open(data_dir)?;
    let worker = ws.worker()?;
    worker.queue().cancel(id)?;
    let job = worker.job_status(id)?;
    if json {
        print_json(&job)
    } else {
        print_job(&job);
        Ok(())
    }
}

/// A directory expands to its images; anything else is taken as one file
fn expand_side(path: &Path, config: &Config) -> lookalike_core::Result<Vec<PathBuf>> {
    if path.is_dir() {
        list_images(path, &config.scan)
    } else if path.exists() {
        Ok(vec![path.to_path_buf()])
    } else {
        Err(LookalikeError::DirectoryNotFound(path.to_path_buf()))
    }
}

fn cmd_match(
    data_dir: &Path,
    reference: &Path,
    work: &Path,
    similarity: Option<f64>,
    hash_size: Option<u32>,
    fields: Option<Vec<String>>,
    json: bool,
) -> lookalike_core::Result<()> {
    let ws = Workspace::open(data_dir)?;
    let criteria = match fields {
        Some(fields) => MatchCriteria::Fields { fields },
        None => MatchCriteria::hash(
            hash_size.unwrap_or(ws.config.hashing.hash_size),
            similarity.unwrap_or(ws.config.hashing.similarity),
        ),
    };

    let ref_files = expand_side(reference, &ws.config)?;
    let work_files = expand_side(work, &ws.config)?;
    let engine = MatchingEngine::new(ws.cache.clone(), Arc::new(DHasher), &ws.config)?;
    let outcome = engine.find_matches(&ref_files, &work_files, &criteria)?;

    if json {
        return print_json(&outcome);
    }

    for pair in &outcome.matches {
        println!(
            "{} {} {} {}",
            pair.reference.display(),
            "~".dimmed(),
            pair.work.display(),
            format!("[{}]", pair.tag).cyan()
        );
    }
    for path in &outcome.unique_ref {
        println!("{}: {}", "unique ref".yellow(), path.display());
    }
    for path in &outcome.unique_work {
        println!("{}: {}", "unique work".yellow(), path.display());
    }

    let stats = &outcome.stats;
    println!(
        "({} matches, {} unique ref, {} unique work)",
        outcome.matches.len(),
        outcome.unique_ref.len(),
        outcome.unique_work.len()
    );
    if matches!(criteria, MatchCriteria::Hash { .. }) {
        println!(
            "({} files: {} cached, {} hashed, {} unreadable, {} timed out{})",
            stats.files,
            stats.cached,
            stats.computed,
            stats.unreadable,
            stats.timed_out,
            if stats.bucketed { ", bucketed" } else { "" }
        );
    }
    Ok(())
}

fn cmd_lookup(
    data_dir: &Path,
    file: &Path,
    dir: i64,
    similarity: Option<f64>,
    hash_size: Option<u32>,
    limit: usize,
    json: bool,
) -> lookalike_core::Result<()> {
    let ws = Workspace::open(data_dir)?;
    let engine = MatchingEngine::new(ws.cache.clone(), Arc::new(DHasher), &ws.config)?;
    let found = engine.find_in_directory(
        file,
        dir,
        hash_size.unwrap_or(ws.config.hashing.hash_size),
        similarity.unwrap_or(ws.config.hashing.similarity),
        limit,
    )?;

    if json {
        return print_json(&found);
    }
    if found.is_empty() {
        println!("No indexed lookalikes for {}", file.display());
        return Ok(());
    }
    for pair in &found {
        println!("{} {}", pair.reference.display(), format!("[{}]", pair.tag).cyan());
    }
    Ok(())
}

fn cmd_cache_clear(data_dir: &Path, all: bool, json: bool) -> lookalike_core::Result<()> {
    if all {
        // Works even when the schema no longer opens
        let db = data_dir.join(DB_FILE);
        let mut removed = false;
        for suffix in ["", "-wal", "-shm"] {
            let mut name = db.clone().into_os_string();
            name.push(suffix);
            let path = PathBuf::from(name);
            if path.exists() {
                std::fs::remove_file(&path)?;
                removed = true;
            }
        }
        return if json {
            print_json(&serde_json::json!({ "database_removed": removed }))
        } else {
            println!("{}: {}", "Deleted".yellow(), db.display());
            Ok(())
        };
    }

    let ws = Workspace::open(data_dir)?;
    let cleared = ws.cache.clear()?;
    if json {
        print_json(&serde_json::json!({ "cleared": cleared }))
    } else {
        println!("{}: {} cached hashes", "Cleared".yellow(), cleared);
        Ok(())
    }
}
