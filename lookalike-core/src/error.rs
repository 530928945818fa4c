//! Error types for lookalike operations

use serde::Serialize;
use std::path::PathBuf;

/// Structured error payload shared between the service and the CLI's JSON mode.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    pub hint: String,
}

impl ErrorEnvelope {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            hint: hint.into(),
        }
    }

    pub fn internal(msg: &str) -> Self {
        Self::new("internal_error", msg, "Check service logs for details")
    }
}

impl From<&LookalikeError> for ErrorEnvelope {
    fn from(err: &LookalikeError) -> Self {
        let (code, hint) = match err {
            LookalikeError::DirectoryNotFound(_) | LookalikeError::UnknownDirectory(_) => {
                ("directory_not_found", "Run `lookalike dirs` to list tracked directories")
            }
            LookalikeError::JobNotFound(_) => ("job_not_found", "Check the job ID and try again"),
            LookalikeError::InvalidPrefixBits(_)
            | LookalikeError::InvalidCriteria(_)
            | LookalikeError::UnknownJobKind(_)
            | LookalikeError::InvalidJobParams(_)
            | LookalikeError::MissingDirectory(_) => ("invalid_request", "Fix the request and retry"),
            LookalikeError::InvalidTransition { .. } => {
                ("invalid_transition", "Only queued jobs can be cancelled")
            }
            LookalikeError::SchemaVersionMismatch { .. } => {
                ("schema_mismatch", "Run `lookalike cache-clear --all` to rebuild the database")
            }
            _ => ("internal_error", "Check logs for details"),
        };
        Self::new(code, err.to_string(), hint)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LookalikeError {
    #[error("Directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("No tracked directory with id {0}")]
    UnknownDirectory(i64),

    #[error("Directory {} vanished while indexing", .0.display())]
    DirectoryVanished(PathBuf),

    #[error("Job {0} not found")]
    JobNotFound(i64),

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: String,
        to: String,
    },

    #[error("Job kind {0} requires a directory id")]
    MissingDirectory(String),

    #[error("Unknown job kind: {0}")]
    UnknownJobKind(String),

    #[error("Invalid job params: {0}")]
    InvalidJobParams(String),

    #[error("prefix_bits must be between 1 and 63, got {0}")]
    InvalidPrefixBits(u32),

    #[error("Invalid match criteria: {0}")]
    InvalidCriteria(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(String),

    #[error("Glob pattern error: {0}")]
    GlobPattern(String),

    #[error("Schema version mismatch: database is v{found}, expected v{expected}.")]
    SchemaVersionMismatch { found: i32, expected: i32 },

    #[error("Hash store is closed")]
    StoreClosed,

    #[error("Hash store lock poisoned")]
    StorePoisoned,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
