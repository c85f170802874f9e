//! Pending-scan scheduler: coalesces a burst of directory-change events
//! into one debounced rescan request per affected subtree.
//!
//! Precedence on every incoming event, checked in order: an already
//! pending ancestor absorbs it; an exact-path match bumps its debounce
//! window; a set of pending descendants is consolidated into one entry
//! rooted at the new, shallower path; otherwise a new entry is opened,
//! evicting the oldest-scheduled entry if the table is full.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::debug;

struct PendingScan {
    path: PathBuf,
    section: i64,
    scheduled_at: Instant,
    is_pending: bool,
}

/// A triggered rescan, handed to the caller for dispatch to the remote client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyScan {
    pub path: PathBuf,
    pub section: i64,
}

pub struct Scheduler {
    scans: Vec<PendingScan>,
    capacity: usize,
    debounce: Duration,
}

impl Scheduler {
    pub fn new(capacity: usize, debounce: Duration) -> Self {
        Self {
            scans: Vec::with_capacity(capacity),
            capacity,
            debounce,
        }
    }

    /// Registers a change under `path`/`section`, applying the
    /// coalescing precedence described above.
    pub fn handle_event(&mut self, path: &Path, section: i64, now: Instant) {
        if let Some(idx) = self.find_pending_ancestor(path) {
            self.scans[idx].scheduled_at = now + self.debounce;
            debug!(path = %self.scans[idx].path.display(), "event absorbed by pending ancestor scan");
            return;
        }

        if let Some(idx) = self.find_pending_exact(path) {
            self.scans[idx].scheduled_at = now + self.debounce;
            debug!(path = %path.display(), "bumped debounce window for pending scan");
            return;
        }

        let descendants = self.find_pending_descendants(path);
        if !descendants.is_empty() {
            let (first, rest) = descendants.split_first().unwrap();
            let first = *first;
            self.scans[first].path = path.to_path_buf();
            self.scans[first].section = section;
            self.scans[first].scheduled_at = now + self.debounce;
            self.scans[first].is_pending = true;
            for &idx in rest {
                self.scans[idx].is_pending = false;
            }
            debug!(
                path = %path.display(),
                absorbed = rest.len() + 1,
                "consolidated descendant scans under new ancestor"
            );
            return;
        }

        self.insert_new(path, section, now);
    }

    fn find_pending_ancestor(&self, path: &Path) -> Option<usize> {
        self.scans.iter().position(|s| {
            s.is_pending && path != s.path.as_path() && path.starts_with(&s.path)
        })
    }

    fn find_pending_exact(&self, path: &Path) -> Option<usize> {
        self.scans
            .iter()
            .position(|s| s.is_pending && s.path == path)
    }

    fn find_pending_descendants(&self, path: &Path) -> Vec<usize> {
        self.scans
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_pending && s.path != path && s.path.starts_with(path))
            .map(|(i, _)| i)
            .collect()
    }

    fn insert_new(&mut self, path: &Path, section: i64, now: Instant) {
        let entry = PendingScan {
            path: path.to_path_buf(),
            section,
            scheduled_at: now + self.debounce,
            is_pending: true,
        };

        if let Some(free_idx) = self.scans.iter().position(|s| !s.is_pending) {
            self.scans[free_idx] = entry;
            return;
        }

        if self.scans.len() < self.capacity {
            self.scans.push(entry);
            return;
        }

        let oldest = self
            .scans
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.scheduled_at)
            .map(|(i, _)| i)
            .expect("capacity > 0 guarantees a slot");
        debug!(
            evicted = %self.scans[oldest].path.display(),
            new = %path.display(),
            "scan table full, evicting oldest scheduled entry"
        );
        self.scans[oldest] = entry;
    }

    /// Executes and clears every entry whose debounce window has elapsed.
    pub fn take_ready(&mut self, now: Instant) -> Vec<ReadyScan> {
        let mut ready = Vec::new();
        for scan in &mut self.scans {
            if scan.is_pending && scan.scheduled_at <= now {
                ready.push(ReadyScan {
                    path: scan.path.clone(),
                    section: scan.section,
                });
                scan.is_pending = false;
            }
        }
        if !ready.is_empty() {
            self.scans.retain(|s| s.is_pending);
        }
        ready
    }

    /// How long the event loop may block before the next scan comes due,
    /// or `None` if nothing is pending.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.scans
            .iter()
            .filter(|s| s.is_pending)
            .map(|s| s.scheduled_at)
            .min()
            .map(|at| at.saturating_duration_since(now))
    }

    pub fn pending_count(&self) -> usize {
        self.scans.iter().filter(|s| s.is_pending).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sched() -> Scheduler {
        Scheduler::new(8, Duration::from_secs(5))
    }

    #[test]
    fn new_path_opens_one_pending_entry() {
        let mut s = sched();
        let now = Instant::now();
        s.handle_event(Path::new("/media/movies/a"), 1, now);
        assert_eq!(s.pending_count(), 1);
    }

    #[test]
    fn second_event_on_same_path_bumps_window_not_count() {
        let mut s = sched();
        let now = Instant::now();
        s.handle_event(Path::new("/media/movies/a"), 1, now);
        s.handle_event(Path::new("/media/movies/a"), 1, now + Duration::from_secs(1));
        assert_eq!(s.pending_count(), 1);
    }

    #[test]
    fn pending_ancestor_absorbs_child_event() {
        let mut s = sched();
        let now = Instant::now();
        s.handle_event(Path::new("/media/movies"), 1, now);
        s.handle_event(Path::new("/media/movies/a/b"), 1, now + Duration::from_secs(1));
        assert_eq!(s.pending_count(), 1);
        let ready = s.take_ready(now + Duration::from_secs(10));
        assert_eq!(ready, vec![ReadyScan { path: PathBuf::from("/media/movies"), section: 1 }]);
    }

    #[test]
    fn new_ancestor_consolidates_pending_descendants() {
        let mut s = sched();
        let now = Instant::now();
        s.handle_event(Path::new("/media/movies/a"), 1, now);
        s.handle_event(Path::new("/media/movies/b"), 1, now);
        assert_eq!(s.pending_count(), 2);

        s.handle_event(Path::new("/media/movies"), 1, now + Duration::from_secs(1));
        assert_eq!(s.pending_count(), 1);

        let ready = s.take_ready(now + Duration::from_secs(20));
        assert_eq!(ready, vec![ReadyScan { path: PathBuf::from("/media/movies"), section: 1 }]);
    }

    #[test]
    fn full_table_evicts_oldest_scheduled_entry() {
        let mut s = Scheduler::new(2, Duration::from_secs(5));
        let now = Instant::now();
        s.handle_event(Path::new("/a"), 1, now);
        s.handle_event(Path::new("/b"), 1, now + Duration::from_secs(1));
        assert_eq!(s.pending_count(), 2);

        s.handle_event(Path::new("/c"), 1, now + Duration::from_secs(2));
        assert_eq!(s.pending_count(), 2);

        let ready = s.take_ready(now + Duration::from_secs(20));
        let paths: Vec<_> = ready.into_iter().map(|r| r.path).collect();
        assert!(paths.contains(&PathBuf::from("/b")));
        assert!(paths.contains(&PathBuf::from("/c")));
        assert!(!paths.contains(&PathBuf::from("/a")));
    }

    #[test]
    fn take_ready_only_returns_elapsed_entries() {
        let mut s = sched();
        let now = Instant::now();
        s.handle_event(Path::new("/a"), 1, now);
        assert!(s.take_ready(now).is_empty());
        assert_eq!(s.pending_count(), 1);

        let ready = s.take_ready(now + Duration::from_secs(6));
        assert_eq!(ready.len(), 1);
        assert_eq!(s.pending_count(), 0);
    }
}
