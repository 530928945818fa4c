//! File identity helpers: path normalization and stat.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Size and modification time as compared by the hash cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: i64,
    /// Whole seconds since the Unix epoch
    pub mtime: i64,
}

/// Resolve symlinks and make absolute. Falls back to a lexical absolute
/// path when the file does not exist. Case-folded on Windows.
pub fn canonical_path(path: &Path) -> PathBuf {
    let resolved = fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf());
    fold_case(resolved)
}

#[cfg(windows)]
fn fold_case(path: PathBuf) -> PathBuf {
    PathBuf::from(path.to_string_lossy().to_lowercase())
}

#[cfg(not(windows))]
fn fold_case(path: PathBuf) -> PathBuf {
    path
}

/// Database key for a normalized path
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Database key for any path: normalized, then stringified
pub fn file_key(path: &Path) -> String {
    path_key(&canonical_path(path))
}

/// Whether `path` lies strictly below `root`
pub fn is_strictly_under(path: &Path, root: &Path) -> bool {
    path != root && path.starts_with(root)
}

pub fn file_stat(path: &Path) -> io::Result<FileStat> {
    let meta = fs::metadata(path)?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(FileStat {
        size: meta.len() as i64,
        mtime,
    })
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_canonical_path_resolves_dot_segments() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        let file = dir.path().join("a/x.png");
        std::fs::write(&file, b"x").unwrap();

        let indirect = dir.path().join("a/../a/./x.png");
        assert_eq!(canonical_path(&indirect), canonical_path(&file));
        assert!(canonical_path(&file).is_absolute());
    }

    #[test]
    fn test_canonical_path_of_missing_file_is_absolute() {
        let p = canonical_path(Path::new("does-not-exist.png"));
        assert!(p.is_absolute());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_resolves_to_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("real.png");
        std::fs::write(&target, b"x").unwrap();
        let link = dir.path().join("link.png");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert_eq!(canonical_path(&link), canonical_path(&target));
    }

    #[test]
    fn test_file_key_is_spelling_independent() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        let file = dir.path().join("a/x.png");
        std::fs::write(&file, b"x").unwrap();

        assert_eq!(file_key(&dir.path().join("a/./x.png")), file_key(&file));
        assert_eq!(file_key(&file), path_key(&canonical_path(&file)));
    }

    #[test]
    fn test_strictly_under() {
        let root = Path::new("/photos");
        assert!(is_strictly_under(Path::new("/photos/trip"), root));
        assert!(!is_strictly_under(root, root));
        assert!(!is_strictly_under(Path::new("/photos2/x.png"), root));
    }

    #[test]
    fn test_file_stat_reports_size() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f.bin");
        std::fs::write(&file, [0u8; 37]).unwrap();
        let stat = file_stat(&file).unwrap();
        assert_eq!(stat.size, 37);
        assert!(stat.mtime > 0);
    }
}
