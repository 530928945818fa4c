//! Configuration for lookalike

use crate::LookalikeError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration as TOML
pub const DEFAULT_CONFIG: &str = r#"# Lookalike Configuration

[hashing]
# Hash grid dimension; 16 produces 256-bit difference hashes
hash_size = 16
# Default similarity threshold (percent) for matching
similarity = 90.0
# Hashing worker threads (0 = min(8, available cores))
workers = 0
# Per-file hashing timeout (e.g., "8s", "500ms")
timeout = "8s"

[index]
# Bucket granularity for newly tracked directories (top N hash bits)
prefix_bits = 16
# Files per write transaction during indexing
batch_size = 256
# Switch to bucketed comparison above this many files on either side
bucket_threshold = 200

[worker]
# Idle polling backoff bounds for the background job loop
poll_min = "50ms"
poll_max = "1s"

[scan]
# Image extensions considered by directory scans (lowercase, no dot)
extensions = ["jpg", "jpeg", "png", "tif", "tiff", "bmp", "gif", "webp"]
# Additional patterns to ignore during directory scans
ignore = [
    ".lookalike",
    "@eaDir",
    ".thumbnails",
]
"#;

/// Lookalike configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hashing: HashingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashingConfig {
    #[serde(default = "default_hash_size")]
    pub hash_size: u32,
    #[serde(default = "default_similarity")]
    pub similarity: f64,
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_prefix_bits")]
    pub prefix_bits: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_bucket_threshold")]
    pub bucket_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_min")]
    pub poll_min: String,
    #[serde(default = "default_poll_max")]
    pub poll_max: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_ignore_patterns")]
    pub ignore: Vec<String>,
}

// Default value functions
fn default_hash_size() -> u32 {
    16
}
fn default_similarity() -> f64 {
    90.0
}
fn default_timeout() -> String {
    "8s".to_string()
}
fn default_prefix_bits() -> u32 {
    16
}
fn default_batch_size() -> usize {
    256
}
fn default_bucket_threshold() -> usize {
    200
}
fn default_poll_min() -> String {
    "50ms".to_string()
}
fn default_poll_max() -> String {
    "1s".to_string()
}
fn default_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "tif", "tiff", "bmp", "gif", "webp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_ignore_patterns() -> Vec<String> {
    [".lookalike", "@eaDir", ".thumbnails"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            hash_size: default_hash_size(),
            similarity: default_similarity(),
            workers: 0,
            timeout: default_timeout(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            prefix_bits: default_prefix_bits(),
            batch_size: default_batch_size(),
            bucket_threshold: default_bucket_threshold(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_min: default_poll_min(),
            poll_max: default_poll_max(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            ignore: default_ignore_patterns(),
        }
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load config from a TOML file, falling back to defaults when it does not exist
    pub fn load_or_default(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse config from TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| LookalikeError::ConfigParse(e.to_string()))
    }

    /// Per-file hashing timeout
    pub fn hash_timeout(&self) -> Duration {
        parse_duration(&self.hashing.timeout).unwrap_or(Duration::from_secs(8))
    }

    /// Number of hashing threads: configured value, or min(8, available parallelism)
    pub fn hash_workers(&self) -> usize {
        if self.hashing.workers > 0 {
            return self.hashing.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(8)
    }

    /// Idle polling backoff bounds as (min, max)
    pub fn poll_bounds(&self) -> (Duration, Duration) {
        let min = parse_duration(&self.worker.poll_min).unwrap_or(Duration::from_millis(50));
        let max = parse_duration(&self.worker.poll_max).unwrap_or(Duration::from_secs(1));
        (min, max.max(min))
    }
}

/// Parse duration string (e.g., "500ms", "8s", "1m")
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(num) = s.strip_suffix("ms") {
        return num.parse().ok().map(Duration::from_millis);
    }

    let (at, _) = s.char_indices().last()?;
    let (num_str, unit) = s.split_at(at);
    let num: u64 = num_str.parse().ok()?;

    match unit {
        "s" => Some(Duration::from_secs(num)),
        "m" => Some(Duration::from_secs(num * 60)),
        "h" => Some(Duration::from_secs(num * 3600)),
        _ => None,
    }
}
