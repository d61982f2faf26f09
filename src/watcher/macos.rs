//! `macOS_FSEvents` NativeWatcher variant.
//!
//! Adapted from the event-classification and watcher-construction pattern
//! in the teacher's `watcher/events.rs::create_fsevent_watcher` /
//! `process_fsevent_batch`, re-targeted to emit `RawEvent` instead of
//! index-thread `WatcherEvent`s, and to the new `since_event_id`-less
//! start-from-now contract (resume-by-event-id belongs to the
//! IndexQueryProvider's checkpoint, not the steady-state watcher).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::fsevent::{FsEvent, FsEventFlags, FsEventScanType, FsEventStream};
use super::{RootRegistry, WatchRoot, WatcherCallback};
use crate::error::{Result, WatchError};
use crate::stats::WatcherStatsSnapshot;
use crate::types::{ChangeKind, PathKey, RawEvent};

const FSEVENTS_LATENCY_SECS: f64 = 0.05;

pub struct FsEventsWatcher {
    registry: Arc<RootRegistry>,
    streams: Mutex<Vec<FsEventStream>>,
    last_event_id: Arc<AtomicU64>,
    pending_rename_from: Arc<Mutex<Option<PathKey>>>,
}

impl FsEventsWatcher {
    pub fn new(roots: Vec<WatchRoot>) -> Self {
        Self {
            registry: Arc::new(RootRegistry::new(roots)),
            streams: Mutex::new(Vec::new()),
            last_event_id: Arc::new(AtomicU64::new(FsEventStream::current_event_id())),
            pending_rename_from: Arc::new(Mutex::new(None)),
        }
    }

    fn start_stream_for(&self, root: &WatchRoot, on_event: WatcherCallback) {
        let registry = self.registry.clone();
        let last_event_id = self.last_event_id.clone();
        let pending_rename_from = self.pending_rename_from.clone();
        let root_path = root.path.clone();

        let stream = FsEventStream::new(
            &root.path,
            &[],
            FsEventStream::current_event_id(),
            FSEVENTS_LATENCY_SECS,
            move |events| {
                handle_batch(&root_path, events, &on_event, &registry, &last_event_id, &pending_rename_from);
            },
        );
        self.streams.lock().push(stream);
    }
}

impl super::NativeWatcher for FsEventsWatcher {
    fn start(&self, on_event: WatcherCallback) -> Result<()> {
        let roots = self.registry.snapshot();
        if roots.is_empty() {
            return Err(WatchError::PlatformWatcherUnavailable(PathBuf::from("<no roots configured>")));
        }
        for root in &roots {
            self.start_stream_for(root, on_event.clone());
        }
        Ok(())
    }

    fn stop(&self) {
        // Dropping each FsEventStream stops its run loop (RAII, see
        // fsevent.rs); the thread then finishes flushing and exits.
        self.streams.lock().clear();
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

fn handle_batch(
    root: &Path,
    events: Vec<FsEvent>,
    on_event: &WatcherCallback,
    registry: &Arc<RootRegistry>,
    last_event_id: &AtomicU64,
    pending_rename_from: &Mutex<Option<PathKey>>,
) {
    if events.is_empty() {
        return;
    }

    let max_event_id = events.iter().map(|e| e.event_id).max().unwrap_or(0);
    if max_event_id > 0 {
        last_event_id.fetch_max(max_event_id, Ordering::Relaxed);
    }

    let needs_rescan = events.iter().any(|event| {
        event.scan_type == FsEventScanType::ReScan
            || (matches!(event.scan_type, FsEventScanType::SingleNode | FsEventScanType::Folder)
                && event.path == root)
    });

    if needs_rescan {
        // A coarse rescan signal carries no single path; emit it as
        // Unknown on the root itself, per §4.2's failure model ("emit a
        // synthetic Unknown event for the affected root").
        if let Some(key) = PathKey::new(root.to_path_buf()) {
            registry.stats().record_received();
            on_event(RawEvent::new(key, ChangeKind::Unknown));
        }
        return;
    }

    for event in events {
        if event.scan_type == FsEventScanType::Nop {
            continue;
        }
        let Some(key) = PathKey::new(event.path.clone()) else {
            continue;
        };
        registry.stats().record_received();
        on_event(build_raw_event(key, &event.path, event.flags, pending_rename_from));
    }
}

/// FSEvents delivers both halves of a rename as `ITEM_RENAMED` with no
/// flag distinguishing them; the two legs are disambiguated by whether
/// the reported path still exists on disk (the departed path doesn't,
/// the arrived one does), same as `classify_kind`'s pure mapping below
/// for every other flag.
fn build_raw_event(
    key: PathKey,
    raw_path: &Path,
    flags: FsEventFlags,
    pending_rename_from: &Mutex<Option<PathKey>>,
) -> RawEvent {
    match classify_kind(flags, raw_path) {
        ChangeKind::RenamedFrom => {
            *pending_rename_from.lock() = Some(key.clone());
            RawEvent::new(key, ChangeKind::RenamedFrom)
        }
        ChangeKind::RenamedTo => match pending_rename_from.lock().take() {
            Some(previous) => RawEvent::renamed_to(key, previous),
            None => RawEvent::new(key, ChangeKind::RenamedTo),
        },
        kind => RawEvent::new(key, kind),
    }
}

fn classify_kind(flags: FsEventFlags, path: &Path) -> ChangeKind {
    if flags.contains(FsEventFlags::ITEM_REMOVED) {
        ChangeKind::Deleted
    } else if flags.contains(FsEventFlags::ITEM_RENAMED) {
        if event_path_exists(path) {
            ChangeKind::RenamedTo
        } else {
            ChangeKind::RenamedFrom
        }
    } else if flags.contains(FsEventFlags::ITEM_CREATED) {
        ChangeKind::Created
    } else if flags.contains(FsEventFlags::ITEM_MODIFIED) {
        ChangeKind::Modified
    } else {
        ChangeKind::Unknown
    }
}

fn event_path_exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_prioritises_removed_over_other_flags() {
        let flags = FsEventFlags::ITEM_REMOVED | FsEventFlags::ITEM_MODIFIED;
        assert_eq!(classify_kind(flags, Path::new("/does/not/exist")), ChangeKind::Deleted);
    }

    #[test]
    fn classify_maps_created() {
        assert_eq!(
            classify_kind(FsEventFlags::ITEM_CREATED, Path::new("/does/not/exist")),
            ChangeKind::Created
        );
    }

    #[test]
    fn rename_pairing_resolves_via_existence_check() {
        let dir = tempfile::tempdir().unwrap();
        let from_path = dir.path().join("old.txt");
        let to_path = dir.path().join("new.txt");
        std::fs::write(&to_path, b"hi").unwrap();

        let pending = Mutex::new(None);
        let from_key = PathKey::new(from_path.clone()).unwrap();
        let from_event = build_raw_event(from_key.clone(), &from_path, FsEventFlags::ITEM_RENAMED, &pending);
        assert_eq!(from_event.kind, ChangeKind::RenamedFrom);
        assert_eq!(*pending.lock(), Some(from_key.clone()));

        let to_key = PathKey::new(to_path.clone()).unwrap();
        let to_event = build_raw_event(to_key, &to_path, FsEventFlags::ITEM_RENAMED, &pending);
        assert_eq!(to_event.kind, ChangeKind::RenamedTo);
        assert_eq!(to_event.previous_path, Some(from_key));
        assert!(pending.lock().is_none());
    }
}
