//! Lookalike Core - perceptual near-duplicate image search
//!
//! This library provides difference hashing, a persistent hash cache,
//! tracked-directory indexing with a background job queue, and matching
//! between a reference set and a working set of images.

pub mod cache;
pub mod config;
pub mod error;
pub mod hash;
pub mod index;
pub mod jobs;
pub mod matching;
pub mod paths;
pub mod store;

pub use cache::{CacheLookup, HashCache};
pub use config::Config;
pub use error::{ErrorEnvelope, LookalikeError};
pub use hash::{DHasher, HashBits, HashError, HashPool, ImageHasher};
pub use index::{DirectoryIndex, DirectoryStatus, FileEntry, FileSelection, HashRecord, TrackedDirectory};
pub use jobs::{IndexJob, IndexingWorker, JobCounts, JobKind, JobQueue, JobState, JobSummary, WorkerHandle};
pub use matching::{MatchCriteria, MatchOutcome, MatchPair, MatchStats, MatchTag, MatchingEngine};
pub use store::{HashStatus, Store, SCHEMA_VERSION};

/// Result type alias for lookalike operations
pub type Result<T> = std::result::Result<T, LookalikeError>;
