//! Platform-native watcher abstraction (§4.2).
//!
//! A capability set, not a class hierarchy: `{ start(on_event), stop,
//! add_root, remove_root, monitored_roots, statistics }`. Variant
//! selection happens once, at `Orchestrator::initialise`, with automatic
//! fallback to the next variant on start failure (`macOS_FSEvents` →
//! `Linux_inotify_or_fanotify` / `Windows_ReadDirectoryChangesW` →
//! `Polling`).

#[cfg(target_os = "macos")]
mod fsevent;
#[cfg(target_os = "macos")]
mod macos;

#[cfg(not(target_os = "macos"))]
mod cross_platform;
mod polling;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, WatchError};
use crate::stats::{WatcherStats, WatcherStatsSnapshot};
use crate::types::RawEvent;

#[cfg(target_os = "macos")]
pub use macos::FsEventsWatcher;

#[cfg(not(target_os = "macos"))]
pub use cross_platform::NotifyWatcher;

pub use polling::PollingWatcher;

/// One configured watch root.
#[derive(Debug, Clone)]
pub struct WatchRoot {
    pub path: PathBuf,
    pub is_directory: bool,
}

/// `on_event` is invoked for each RawEvent in OS-observed order per root,
/// always from the watcher's dedicated producer thread. Implementations
/// MUST NOT call an OS status syscall per event — attribute enrichment is
/// the Dispatcher's job (§4.2 "Attribute enrichment policy").
pub type WatcherCallback = Arc<dyn Fn(RawEvent) + Send + Sync>;

/// Platform-specific change source.
pub trait NativeWatcher: Send + Sync {
    /// Launches the dedicated producer task. Returns
    /// `PlatformWatcherUnavailable` if this variant cannot be started on
    /// the current host (missing kernel facility, permission denial).
    fn start(&self, on_event: WatcherCallback) -> Result<()>;

    /// Idempotent; returns only once the producer task has exited and all
    /// queued callbacks have been flushed.
    fn stop(&self);

    fn add_root(&self, root: WatchRoot) -> Result<()>;

    fn remove_root(&self, path: &Path) -> Result<()>;

    fn monitored_roots(&self) -> Vec<PathBuf>;

    fn statistics(&self) -> WatcherStatsSnapshot;
}

/// Selects and starts the best available watcher for the current
/// platform, falling back to `Polling` if the native variant refuses to
/// start. Mirrors the automatic-fallback rule in §4.2.
pub fn create_native_watcher(roots: Vec<WatchRoot>, on_event: WatcherCallback) -> Result<Box<dyn NativeWatcher>> {
    #[cfg(target_os = "macos")]
    {
        let watcher = Box::new(FsEventsWatcher::new(roots.clone()));
        match watcher.start(on_event.clone()) {
            Ok(()) => return Ok(watcher),
            Err(error) => {
                log::warn!("FSEvents watcher unavailable, falling back to polling: {error}");
            }
        }
    }

    #[cfg(not(target_os = "macos"))]
    {
        let watcher = Box::new(NotifyWatcher::new(roots.clone()));
        match watcher.start(on_event.clone()) {
            Ok(()) => return Ok(watcher),
            Err(error) => {
                log::warn!("native watcher unavailable, falling back to polling: {error}");
            }
        }
    }

    let fallback = Box::new(PollingWatcher::new(roots, std::time::Duration::from_secs(2)));
    fallback
        .start(on_event)
        .map_err(|error| WatchError::PlatformWatcherUnavailable(PathBuf::from(format!("{error}"))))?;
    Ok(fallback)
}

/// Shared root-set bookkeeping used by every variant: a `Mutex`-guarded
/// `Vec<WatchRoot>` plus the `WatcherStats` every variant reports through.
pub(crate) struct RootRegistry {
    roots: parking_lot::Mutex<Vec<WatchRoot>>,
    stats: WatcherStats,
}

impl RootRegistry {
    pub(crate) fn new(roots: Vec<WatchRoot>) -> Self {
        Self {
            roots: parking_lot::Mutex::new(roots),
            stats: WatcherStats::default(),
        }
    }

    pub(crate) fn add(&self, root: WatchRoot) {
        let mut roots = self.roots.lock();
        if !roots.iter().any(|r| r.path == root.path) {
            roots.push(root);
        }
    }

    pub(crate) fn remove(&self, path: &Path) {
        self.roots.lock().retain(|r| r.path != path);
    }

    pub(crate) fn paths(&self) -> Vec<PathBuf> {
        self.roots.lock().iter().map(|r| r.path.clone()).collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<WatchRoot> {
        self.roots.lock().clone()
    }

    pub(crate) fn stats(&self) -> &WatcherStats {
        &self.stats
    }
}
