//! Metadata fields for exact-field matching.

use crate::paths::file_stat;
use serde::Serialize;
use std::fmt;
use std::path::Path;

/// A comparable metadata value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Int(i64),
    Dimensions(u32, u32),
}

impl FieldValue {
    /// Text is compared trimmed and case-insensitively
    pub fn normalized(self) -> Self {
        match self {
            FieldValue::Text(s) => FieldValue::Text(s.trim().to_lowercase()),
            other => other,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Int(n) => write!(f, "{n}"),
            FieldValue::Dimensions(w, h) => write!(f, "{w}x{h}"),
        }
    }
}

/// Source of per-file metadata fields. None means the field is unknown for
/// that file, and an unknown field never matches.
pub trait MetadataSource: Send + Sync {
    fn get_field(&self, path: &Path, name: &str) -> Option<FieldValue>;
}

/// Fields derivable from the filesystem and image header:
/// `name`, `stem`, `extension`, `size`, `mtime`, `dimensions`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsMetadata;

impl MetadataSource for FsMetadata {
    fn get_field(&self, path: &Path, name: &str) -> Option<FieldValue> {
        match name {
            "name" => path
                .file_name()
                .map(|n| FieldValue::Text(n.to_string_lossy().into_owned())),
            "stem" => path
                .file_stem()
                .map(|n| FieldValue::Text(n.to_string_lossy().into_owned())),
            "extension" => path
                .extension()
                .map(|e| FieldValue::Text(e.to_string_lossy().into_owned())),
            "size" => file_stat(path).ok().map(|s| FieldValue::Int(s.size)),
            "mtime" => file_stat(path).ok().map(|s| FieldValue::Int(s.mtime)),
            "dimensions" => image::image_dimensions(path)
                .ok()
                .map(|(w, h)| FieldValue::Dimensions(w, h)),
            _ => None,
        }
    }
}
