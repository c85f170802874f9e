//! Single-threaded event loop: blocks on one channel fed by a
//! filesystem-watch thread and a signal-delivery thread, dispatches
//! each event, then executes any rescans whose debounce window has
//! elapsed.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use notify::EventKind;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{debug, info, warn};

use crate::dircache::DirectoryCache;
use crate::registry::WatchRegistry;
use crate::remote::RemoteClient;
use crate::scheduler::Scheduler;

const IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

enum LoopEvent {
    Fs(notify::Result<notify::Event>),
    Shutdown,
    Reload,
}

pub struct EventLoop {
    registry: WatchRegistry,
    cache: DirectoryCache,
    scheduler: Scheduler,
    remote: RemoteClient,
    rx: Receiver<LoopEvent>,
    roots: Vec<(PathBuf, i64)>,
    running: bool,
}

impl EventLoop {
    pub fn new(remote: RemoteClient, debounce: Duration) -> anyhow::Result<Self> {
        let (tx, rx): (Sender<LoopEvent>, Receiver<LoopEvent>) = mpsc::channel();

        let (fs_tx, fs_rx) = mpsc::channel();
        let registry = WatchRegistry::new(fs_tx)?;

        let relay_tx = tx.clone();
        thread::spawn(move || {
            for res in fs_rx {
                if relay_tx.send(LoopEvent::Fs(res)).is_err() {
                    break;
                }
            }
        });

        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
        let signal_tx = tx;
        thread::spawn(move || {
            for signal in signals.forever() {
                let event = match signal {
                    SIGHUP => LoopEvent::Reload,
                    _ => LoopEvent::Shutdown,
                };
                if signal_tx.send(event).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            registry,
            cache: DirectoryCache::new(),
            scheduler: Scheduler::new(256, debounce),
            remote,
            rx,
            roots: Vec::new(),
            running: false,
        })
    }

    /// Registers a full subtree as a monitored root under `section`.
    pub fn add_root(&mut self, path: &Path, section: i64) {
        self.registry.monitor_tree(path, section, &mut self.cache);
        self.roots.push((path.to_path_buf(), section));
    }

    pub fn monitored_count(&self) -> usize {
        self.registry.count()
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        self.running = true;
        info!(directories = self.registry.count(), "entering event loop");

        while self.running {
            let now = Instant::now();
            let timeout = self.scheduler.next_timeout(now).unwrap_or(IDLE_TIMEOUT);

            match self.rx.recv_timeout(timeout) {
                Ok(LoopEvent::Fs(Ok(event))) => self.handle_fs_event(event),
                Ok(LoopEvent::Fs(Err(err))) => self.handle_fs_error(err),
                Ok(LoopEvent::Shutdown) => {
                    info!("shutdown requested, exiting event loop");
                    self.running = false;
                }
                Ok(LoopEvent::Reload) => {
                    info!("reload requested, re-validating monitored roots");
                    self.reload();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("event channel disconnected, exiting event loop");
                    self.running = false;
                }
            }

            self.dispatch_ready(Instant::now());
        }

        Ok(())
    }

    fn handle_fs_event(&mut self, event: notify::Event) {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }

        let mut dirs = HashSet::new();
        for path in &event.paths {
            if let Some(dir) = self.enclosing_watched_dir(path) {
                dirs.insert(dir);
            }
        }

        for dir in dirs {
            self.process_directory_change(&dir);
        }
    }

    fn enclosing_watched_dir(&self, path: &Path) -> Option<PathBuf> {
        if self.registry.lookup(path).is_some() {
            return Some(path.to_path_buf());
        }
        let parent = path.parent()?;
        if self.registry.lookup(parent).is_some() {
            return Some(parent.to_path_buf());
        }
        None
    }

    fn process_directory_change(&mut self, dir: &Path) {
        let Some(index) = self.registry.lookup(dir) else {
            return;
        };
        if !self.registry.is_active(index) {
            return;
        }
        let Some(section) = self.registry.section_of(index) else {
            return;
        };

        let is_dir = fs::metadata(dir).map(|m| m.is_dir()).unwrap_or(false);
        if !is_dir {
            debug!(path = %dir.display(), "watched path is no longer a directory, scheduling rescan");
            self.scheduler.handle_event(dir, section, Instant::now());
            return;
        }

        match self.cache.refresh(dir) {
            Ok((changed, Some(report))) => {
                for removed in &report.removed {
                    if let Some(idx) = self.registry.lookup(removed) {
                        self.registry.remove(idx);
                    }
                }
                for added in &report.added {
                    if let Err(e) = self.registry.add(added, section) {
                        warn!(path = %added.display(), error = %e, "failed to watch new subdirectory");
                    }
                }
                if changed {
                    debug!(path = %dir.display(), "directory changed");
                }
            }
            Ok((_, None)) => {}
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "failed to refresh directory cache, falling back to incremental scan");
                self.registry.monitor_scan(dir, section, &mut self.cache);
            }
        }

        debug!(path = %dir.display(), "scheduling rescan");
        self.scheduler.handle_event(dir, section, Instant::now());
    }

    fn handle_fs_error(&mut self, err: notify::Error) {
        warn!(error = %err, "filesystem watch backend reported an error");
        for path in &err.paths {
            if let Some(idx) = self.registry.lookup(path) {
                self.registry.remove(idx);
            }
        }
    }

    fn dispatch_ready(&mut self, now: Instant) {
        for ready in self.scheduler.take_ready(now) {
            match self.remote.trigger_scan(ready.section, &ready.path) {
                Ok(()) => info!(path = %ready.path.display(), section = ready.section, "triggered remote rescan"),
                Err(e) => warn!(path = %ready.path.display(), error = %e, "failed to trigger remote rescan"),
            }
        }
    }

    fn reload(&mut self) {
        let roots = self.roots.clone();
        for (path, section) in roots {
            let added = self.registry.monitor_scan(&path, section, &mut self.cache);
            if added > 0 {
                info!(path = %path.display(), added, "reload discovered new subdirectories");
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.registry.cleanup();
        self.cache.cleanup();
    }
}
