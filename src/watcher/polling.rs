//! `Polling` NativeWatcher fallback (§4.2).
//!
//! One full directory walk per root per polling interval, compared
//! against a mutation-time+size fingerprint map kept only in memory.
//! Grounded on the walk-and-fingerprint shape common to pure-stdlib
//! polling watchers (e.g. notify's own `poll` backend): no kernel
//! facility is assumed, so this is what every platform falls back to.
//!
//! Never emits renames — a poll cycle only sees "gone" and "appeared",
//! which is reported as a Deleted/Created pair (Invariant R1's allowed
//! equivalent).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use super::{RootRegistry, WatchRoot, WatcherCallback};
use crate::error::{Result, WatchError};
use crate::stats::WatcherStatsSnapshot;
use crate::types::{ChangeKind, FileAttributes, PathKey, RawEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    size_bytes: u64,
    modified_at_unix_secs: u64,
}

pub struct PollingWatcher {
    registry: Arc<RootRegistry>,
    interval: Duration,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PollingWatcher {
    pub fn new(roots: Vec<WatchRoot>, interval: Duration) -> Self {
        Self {
            registry: Arc::new(RootRegistry::new(roots)),
            interval,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }
}

impl super::NativeWatcher for PollingWatcher {
    fn start(&self, on_event: WatcherCallback) -> Result<()> {
        let roots = self.registry.snapshot();
        if roots.is_empty() {
            return Err(WatchError::PlatformWatcherUnavailable(PathBuf::from("<no roots configured>")));
        }

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let registry = self.registry.clone();
        let interval = self.interval;

        let handle = std::thread::Builder::new()
            .name("watcher-polling".to_string())
            .spawn(move || poll_loop(registry, running, interval, on_event))
            .expect("failed to spawn polling watcher thread");
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn add_root(&self, root: WatchRoot) -> Result<()> {
        self.registry.add(root);
        Ok(())
    }

    fn remove_root(&self, path: &Path) -> Result<()> {
        self.registry.remove(path);
        Ok(())
    }

    fn monitored_roots(&self) -> Vec<PathBuf> {
        self.registry.paths()
    }

    fn statistics(&self) -> WatcherStatsSnapshot {
        self.registry.stats().snapshot()
    }
}

fn poll_loop(registry: Arc<RootRegistry>, running: Arc<AtomicBool>, interval: Duration, on_event: WatcherCallback) {
    let mut known: HashMap<PathBuf, Fingerprint> = HashMap::new();

    while running.load(Ordering::SeqCst) {
        for root in registry.snapshot() {
            walk_and_diff(&root.path, &mut known, &registry, &on_event);
        }
        std::thread::sleep(interval);
    }
}

fn walk_and_diff(
    root: &Path,
    known: &mut HashMap<PathBuf, Fingerprint>,
    registry: &Arc<RootRegistry>,
    on_event: &WatcherCallback,
) {
    let mut seen: HashMap<PathBuf, Fingerprint> = HashMap::new();
    walk_dir(root, &mut seen);

    for (path, fingerprint) in &seen {
        match known.get(path) {
            None => emit(on_event, registry, path, ChangeKind::Created),
            Some(previous) if previous != fingerprint => emit(on_event, registry, path, ChangeKind::Modified),
            _ => {}
        }
    }
    for path in known.keys() {
        if !seen.contains_key(path) {
            emit(on_event, registry, path, ChangeKind::Deleted);
        }
    }

    *known = seen;
}

fn walk_dir(dir: &Path, out: &mut HashMap<PathBuf, Fingerprint>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let Ok(attrs) = FileAttributes::probe(&path) else {
            continue;
        };
        if attrs.is_directory {
            walk_dir(&path, out);
        } else {
            out.insert(
                path,
                Fingerprint {
                    size_bytes: attrs.size_bytes,
                    modified_at_unix_secs: attrs.modified_at_unix_secs,
                },
            );
        }
    }
}

fn emit(on_event: &WatcherCallback, registry: &Arc<RootRegistry>, path: &Path, kind: ChangeKind) {
    let Some(key) = PathKey::new(path.to_path_buf()) else {
        return;
    };
    registry.stats().record_received();
    on_event(RawEvent::new(key, kind));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::NativeWatcher;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn detects_created_modified_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = PollingWatcher::new(
            vec![WatchRoot {
                path: dir.path().to_path_buf(),
                is_directory: true,
            }],
            Duration::from_millis(30),
        );

        let received: Arc<StdMutex<Vec<ChangeKind>>> = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = received.clone();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let callback: WatcherCallback = Arc::new(move |event| {
            received_clone.lock().unwrap().push(event.kind);
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        watcher.start(callback).unwrap();
        std::thread::sleep(Duration::from_millis(60));

        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        std::thread::sleep(Duration::from_millis(80));

        std::fs::write(dir.path().join("a.txt"), "hello world").unwrap();
        std::thread::sleep(Duration::from_millis(80));

        std::fs::remove_file(dir.path().join("a.txt")).unwrap();
        std::thread::sleep(Duration::from_millis(80));

        watcher.stop();

        let events = received.lock().unwrap();
        assert!(events.contains(&ChangeKind::Created));
        assert!(events.contains(&ChangeKind::Modified));
        assert!(events.contains(&ChangeKind::Deleted));
    }
}
