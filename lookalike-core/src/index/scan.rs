//! Image discovery for directory scans.

use crate::config::ScanConfig;
use crate::error::LookalikeError;
use ignore::WalkBuilder;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// OS metadata droppings that are never images
const JUNK_NAMES: &[&str] = &["thumbs.db", ".ds_store", "desktop.ini"];

/// Every image file under `root`, sorted.
///
/// Hidden entries, zero-byte files, AppleDouble `._*` files and anything
/// matching a configured ignore pattern are skipped. Only whitelisted
/// extensions are returned. `.gitignore` files are not consulted.
pub fn list_images(root: &Path, config: &ScanConfig) -> crate::Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(LookalikeError::DirectoryNotFound(root.to_path_buf()));
    }

    let ignore_set = build_ignore_set(&config.ignore)?;
    let extensions: HashSet<String> = config
        .extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect();

    let mut builder = WalkBuilder::new(root);
    builder.standard_filters(false);
    builder.hidden(true);
    builder.follow_links(false);

    let walk_root = root.to_path_buf();
    builder.filter_entry(move |entry| {
        let relative = entry.path().strip_prefix(&walk_root).unwrap_or(entry.path());
        relative.as_os_str().is_empty() || !ignore_set.is_match(relative)
    });

    let mut files = Vec::new();
    for entry in builder.build() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };

        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }

        let path = entry.path();
        if is_junk(path) || !has_image_extension(path, &extensions) {
            continue;
        }

        match entry.metadata() {
            Ok(meta) if meta.len() > 0 => files.push(path.to_path_buf()),
            Ok(_) => {}
            Err(e) => debug!(path = %path.display(), error = %e, "cannot stat, skipping"),
        }
    }

    files.sort();
    Ok(files)
}

fn build_ignore_set(patterns: &[String]) -> crate::Result<globset::GlobSet> {
    let mut builder = globset::GlobSetBuilder::new();
    for pattern in patterns {
        let glob_pattern = if pattern.contains('*') || pattern.contains('?') {
            pattern.clone()
        } else {
            format!("**/{}", pattern)
        };
        builder.add(
            globset::Glob::new(&glob_pattern)
                .map_err(|e| LookalikeError::GlobPattern(e.to_string()))?,
        );
    }
    builder
        .build()
        .map_err(|e| LookalikeError::GlobPattern(e.to_string()))
}

fn is_junk(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
        return true;
    };
    name.starts_with("._") || JUNK_NAMES.contains(&name.as_str())
}

fn has_image_extension(path: &Path, extensions: &HashSet<String>) -> bool {
    path.extension()
        .map(|e| extensions.contains(&e.to_string_lossy().to_lowercase()))
        .unwrap_or(false)
}
