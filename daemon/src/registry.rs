//! Watch registry: one kernel-backed watch per monitored directory,
//! stored in a slab with stable `usize` indices and a free list.
//!
//! `notify`'s high-level API does not expose a raw per-watch user-data
//! slot the way `kqueue`'s `EV_SET(..., udata)` does, so slot lookup on
//! event delivery goes back through the path index instead of an index
//! carried by the kernel itself. See DESIGN.md.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::dircache::DirectoryCache;
use crate::error::RegistryError;
use crate::queue::PathQueue;

const INITIAL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct WatchedDir {
    path: PathBuf,
    section: i64,
    dev: u64,
    ino: u64,
}

enum Slot {
    Free { next_free: Option<usize> },
    Active(WatchedDir),
}

/// Per-directory watch registry, backed by a single OS watcher instance.
pub struct WatchRegistry {
    watcher: RecommendedWatcher,
    slots: Vec<Slot>,
    free_head: Option<usize>,
    active_count: usize,
    index: HashMap<PathBuf, usize>,
}

impl WatchRegistry {
    pub fn new(event_tx: Sender<notify::Result<notify::Event>>) -> Result<Self, RegistryError> {
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = event_tx.send(res);
        })
        .map_err(|source| RegistryError::Watch {
            path: PathBuf::new(),
            source,
        })?;

        let mut slots = Vec::with_capacity(INITIAL_CAPACITY);
        build_free_list(&mut slots, 0, INITIAL_CAPACITY);

        Ok(Self {
            watcher,
            slots,
            free_head: Some(0),
            active_count: 0,
            index: HashMap::new(),
        })
    }

    pub fn count(&self) -> usize {
        self.active_count
    }

    /// Looks up the slot index currently holding `path`, if any (active or not).
    pub fn lookup(&self, path: &Path) -> Option<usize> {
        self.index.get(path).copied()
    }

    pub fn path_of(&self, index: usize) -> Option<&Path> {
        match self.slots.get(index) {
            Some(Slot::Active(dir)) => Some(dir.path.as_path()),
            _ => None,
        }
    }

    pub fn section_of(&self, index: usize) -> Option<i64> {
        match self.slots.get(index) {
            Some(Slot::Active(dir)) => Some(dir.section),
            _ => None,
        }
    }

    pub fn is_active(&self, index: usize) -> bool {
        matches!(self.slots.get(index), Some(Slot::Active(_)))
    }

    /// True iff `path` is indexed and its captured identity still matches
    /// the filesystem. Removes the slot (and returns false) on mismatch.
    pub fn validate(&mut self, path: &Path) -> bool {
        let Some(index) = self.index.get(path).copied() else {
            return false;
        };

        if self.identity_matches(index, path) {
            true
        } else {
            self.remove(index);
            false
        }
    }

    fn identity_matches(&self, index: usize, path: &Path) -> bool {
        let Some(Slot::Active(dir)) = self.slots.get(index) else {
            return false;
        };
        match fs::metadata(path) {
            Ok(meta) => meta.dev() == dir.dev && meta.ino() == dir.ino,
            Err(_) => false,
        }
    }

    /// Adds (or re-validates) a watch on `path` under `section`. Idempotent.
    pub fn add(&mut self, path: &Path, section: i64) -> Result<usize, RegistryError> {
        if let Some(existing) = self.index.get(path).copied() {
            if self.identity_matches(existing, path) {
                debug!(path = %path.display(), "directory already monitored and valid");
                return Ok(existing);
            }
            debug!(path = %path.display(), "directory identity stale, re-adding");
            self.remove(existing);
        }

        let file = fs::File::open(path).map_err(|source| RegistryError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let meta = file.metadata().map_err(|source| RegistryError::Stat {
            path: path.to_path_buf(),
            source,
        })?;

        let index = self.allocate_slot();
        self.slots[index] = Slot::Active(WatchedDir {
            path: path.to_path_buf(),
            section,
            dev: meta.dev(),
            ino: meta.ino(),
        });
        self.index.insert(path.to_path_buf(), index);

        if let Err(source) = self.watcher.watch(path, RecursiveMode::NonRecursive) {
            self.index.remove(path);
            self.free_slot(index);
            return Err(RegistryError::Watch {
                path: path.to_path_buf(),
                source,
            });
        }

        self.active_count += 1;
        debug!(path = %path.display(), index, "added directory to monitoring");
        Ok(index)
    }

    /// Removes a slot. Idempotent: removing a free or out-of-range slot is a no-op.
    pub fn remove(&mut self, index: usize) {
        let Some(Slot::Active(dir)) = self.slots.get(index) else {
            return;
        };
        let path = dir.path.clone();
        debug!(path = %path.display(), "removing directory from monitoring");

        let _ = self.watcher.unwatch(&path);
        self.index.remove(&path);
        self.free_slot(index);
        self.active_count -= 1;
    }

    fn allocate_slot(&mut self) -> usize {
        if self.free_head.is_none() {
            self.grow();
        }
        let index = self.free_head.expect("grow() guarantees a free slot");
        match self.slots[index] {
            Slot::Free { next_free } => self.free_head = next_free,
            Slot::Active(_) => unreachable!("free list points at an active slot"),
        }
        index
    }

    fn free_slot(&mut self, index: usize) {
        self.slots[index] = Slot::Free {
            next_free: self.free_head,
        };
        self.free_head = Some(index);
    }

    fn grow(&mut self) {
        let old_capacity = self.slots.len();
        let new_capacity = if old_capacity == 0 {
            INITIAL_CAPACITY
        } else {
            old_capacity * 2
        };
        build_free_list(&mut self.slots, old_capacity, new_capacity);
        self.free_head = Some(old_capacity);
        debug!(new_capacity, "grew watch registry slab");
    }

    /// Full-subtree registration: BFS from `root`, warming the cache then
    /// registering a watch for every directory visited. Tolerates
    /// per-directory errors.
    pub fn monitor_tree(&mut self, root: &Path, section: i64, cache: &mut DirectoryCache) {
        let mut queue = PathQueue::new();
        queue.enqueue(root.to_path_buf());

        while let Some(current) = queue.dequeue() {
            match cache.refresh(&current) {
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %current.display(), error = %e, "failed to warm cache, skipping subtree");
                    continue;
                }
            }

            if let Err(e) = self.add(&current, section) {
                warn!(path = %current.display(), error = %e, "failed to add directory to monitoring");
            }

            if let Some(subdirs) = cache.subdirs(&current) {
                for child in subdirs {
                    queue.enqueue(child);
                }
            }
        }
    }

    /// Incremental version: BFS that skips directories already validly
    /// watched. Returns the number of newly registered directories.
    pub fn monitor_scan(&mut self, root: &Path, section: i64, cache: &mut DirectoryCache) -> usize {
        let mut queue = PathQueue::new();
        queue.enqueue(root.to_path_buf());
        let mut added = 0usize;

        while let Some(current) = queue.dequeue() {
            if self.validate(&current) {
                if let Some(subdirs) = cache.subdirs(&current) {
                    for child in subdirs {
                        queue.enqueue(child);
                    }
                }
                continue;
            }

            if let Err(e) = cache.refresh(&current) {
                warn!(path = %current.display(), error = %e, "failed to refresh cache during scan");
                continue;
            }

            let before = self.count();
            if let Err(e) = self.add(&current, section) {
                warn!(path = %current.display(), error = %e, "failed to add directory during scan");
            } else if self.count() > before {
                added += 1;
            }

            if let Some(subdirs) = cache.subdirs(&current) {
                for child in subdirs {
                    queue.enqueue(child);
                }
            }
        }

        added
    }

    pub fn cleanup(&mut self) {
        let active: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| matches!(s, Slot::Active(_)).then_some(i))
            .collect();
        for index in active {
            self.remove(index);
        }
        self.slots.clear();
        self.index.clear();
        self.free_head = None;
        self.active_count = 0;
    }
}

fn build_free_list(slots: &mut Vec<Slot>, from: usize, to: usize) {
    slots.reserve(to - from);
    for i in from..to {
        let next_free = if i + 1 < to { Some(i + 1) } else { None };
        slots.push(Slot::Free { next_free });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use tempfile::tempdir;

    fn new_registry() -> WatchRegistry {
        let (tx, _rx) = channel();
        WatchRegistry::new(tx).expect("watcher init")
    }

    #[test]
    fn add_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut reg = new_registry();

        let first = reg.add(dir.path(), 1).unwrap();
        let second = reg.add(dir.path(), 1).unwrap();
        assert_eq!(first, second);
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn remove_then_add_gets_fresh_identity() {
        let dir = tempdir().unwrap();
        let mut reg = new_registry();

        let first = reg.add(dir.path(), 1).unwrap();
        reg.remove(first);
        assert_eq!(reg.count(), 0);

        let second = reg.add(dir.path(), 1).unwrap();
        assert_eq!(reg.count(), 1);
        assert!(reg.is_active(second));
    }

    #[test]
    fn validate_detects_stale_identity_after_delete_recreate() {
        let parent = tempdir().unwrap();
        let target = parent.path().join("x");
        std::fs::create_dir(&target).unwrap();

        let mut reg = new_registry();
        reg.add(&target, 1).unwrap();
        assert!(reg.validate(&target));

        std::fs::remove_dir(&target).unwrap();
        std::fs::create_dir(&target).unwrap();

        assert!(!reg.validate(&target));
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut reg = new_registry();
        let mut dirs = Vec::new();
        for _ in 0..(INITIAL_CAPACITY + 5) {
            let d = tempdir().unwrap();
            reg.add(d.path(), 1).unwrap();
            dirs.push(d);
        }
        assert_eq!(reg.count(), INITIAL_CAPACITY + 5);
    }
}
