//! Directory cache: per-directory mtime and subdirectory-set tracking,
//! so the event loop only pays for a `readdir` when a directory's
//! mtime actually moved.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::debug;

use crate::error::CacheError;

/// Subdirectories added/removed by a `refresh` call that actually scanned.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangeReport {
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl ChangeReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug)]
struct CachedDir {
    mtime: i64,
    subdirs: HashSet<PathBuf>,
    validated: bool,
}

/// Cache of directory mtimes and subdirectory sets, keyed by path.
#[derive(Debug, Default)]
pub struct DirectoryCache {
    entries: std::collections::HashMap<PathBuf, CachedDir>,
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refreshes the cache entry for `path`.
    ///
    /// Returns `(changed, report)`. `report` is `None` only on the fast
    /// path where the cached mtime still matches and no scan happened;
    /// otherwise it carries the added/removed subdirectories from this
    /// scan (empty when the scan found no structural change).
    pub fn refresh(&mut self, path: &Path) -> Result<(bool, Option<ChangeReport>), CacheError> {
        let mtime_start = stat_mtime(path)?;

        if let Some(existing) = self.entries.get(path) {
            if existing.validated && existing.mtime == mtime_start {
                return Ok((false, None));
            }
        }

        let (new_subdirs, skipped_symlinks) = scan_subdirs(path)?;
        let mtime_end = stat_mtime(path)?;

        if skipped_symlinks > 0 {
            debug!(
                path = %path.display(),
                skipped_symlinks,
                "skipped symlinked entries while scanning directory"
            );
        }

        let (added, removed) = match self.entries.get(path) {
            Some(existing) if existing.validated => diff_sets(&existing.subdirs, &new_subdirs),
            _ => (new_subdirs.iter().cloned().collect(), Vec::new()),
        };

        let changed = !added.is_empty() || !removed.is_empty() || mtime_end != mtime_start;

        self.entries.insert(
            path.to_path_buf(),
            CachedDir {
                mtime: mtime_start,
                subdirs: new_subdirs,
                validated: true,
            },
        );

        Ok((changed, Some(ChangeReport { added, removed })))
    }

    /// Subdirectories known for `path`, if it has a validated entry.
    pub fn subdirs(&self, path: &Path) -> Option<Vec<PathBuf>> {
        self.entries
            .get(path)
            .filter(|d| d.validated)
            .map(|d| d.subdirs.iter().cloned().collect())
    }

    pub fn invalidate(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    pub fn cleanup(&mut self) {
        self.entries.clear();
    }
}

fn diff_sets(old: &HashSet<PathBuf>, new: &HashSet<PathBuf>) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let added = new.difference(old).cloned().collect();
    let removed = old.difference(new).cloned().collect();
    (added, removed)
}

fn stat_mtime(path: &Path) -> Result<i64, CacheError> {
    let meta = fs::metadata(path).map_err(|source| CacheError::Stat {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(mtime_seconds(&meta))
}

fn mtime_seconds(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn scan_subdirs(path: &Path) -> Result<(HashSet<PathBuf>, usize), CacheError> {
    let read_dir = fs::read_dir(path).map_err(|source| CacheError::ReadDir {
        path: path.to_path_buf(),
        source,
    })?;

    let mut subdirs = HashSet::new();
    let mut skipped_symlinks = 0usize;

    for entry in read_dir {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };

        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(_) => continue,
        };

        if file_type.is_dir() {
            subdirs.insert(entry.path());
        } else if file_type.is_symlink() {
            skipped_symlinks += 1;
        } else if let Ok(meta) = fs::metadata(entry.path()) {
            if meta.is_dir() {
                subdirs.insert(entry.path());
            }
        }
    }

    Ok((subdirs, skipped_symlinks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    #[test]
    fn first_refresh_reports_all_subdirs_as_added() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("a")).unwrap();
        fs::create_dir(root.path().join("b")).unwrap();

        let mut cache = DirectoryCache::new();
        let (changed, report) = cache.refresh(root.path()).unwrap();
        assert!(changed);
        let report = report.unwrap();
        assert_eq!(report.added.len(), 2);
        assert!(report.removed.is_empty());
    }

    #[test]
    fn unchanged_mtime_short_circuits_without_scan() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("a")).unwrap();

        let mut cache = DirectoryCache::new();
        cache.refresh(root.path()).unwrap();

        let (changed, report) = cache.refresh(root.path()).unwrap();
        assert!(!changed);
        assert!(report.is_none());
    }

    #[test]
    fn new_subdirectory_is_reported_as_added() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("a")).unwrap();

        let mut cache = DirectoryCache::new();
        cache.refresh(root.path()).unwrap();

        fs::create_dir(root.path().join("b")).unwrap();
        let (_changed, report) = cache.refresh(root.path()).unwrap();
        let report = report.unwrap();
        assert_eq!(report.added, vec![root.path().join("b")]);
        assert!(report.removed.is_empty());
    }

    #[test]
    fn removed_subdirectory_is_reported() {
        let root = tempdir().unwrap();
        let sub = root.path().join("a");
        fs::create_dir(&sub).unwrap();

        let mut cache = DirectoryCache::new();
        cache.refresh(root.path()).unwrap();

        fs::remove_dir(&sub).unwrap();
        let (_changed, report) = cache.refresh(root.path()).unwrap();
        let report = report.unwrap();
        assert_eq!(report.removed, vec![sub]);
        assert!(report.added.is_empty());
    }

    #[test]
    fn symlinked_directories_are_skipped() {
        let root = tempdir().unwrap();
        let real = root.path().join("real");
        fs::create_dir(&real).unwrap();
        symlink(&real, root.path().join("link")).unwrap();

        let mut cache = DirectoryCache::new();
        let (_changed, report) = cache.refresh(root.path()).unwrap();
        let report = report.unwrap();
        assert_eq!(report.added, vec![real]);
    }
}
