//! `Linux_inotify_or_fanotify` / `Windows_ReadDirectoryChangesW` NativeWatcher
//! variant, backed by the `notify` crate's recommended watcher.
//!
//! Adapted from the teacher's `watcher/events.rs::create_index_watcher`
//! construction pattern, re-targeted to emit `RawEvent` rather than
//! `WatcherEvent::PathsChanged` batches.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;

use super::{RootRegistry, WatchRoot, WatcherCallback};
use crate::error::{Result, WatchError};
use crate::stats::WatcherStatsSnapshot;
use crate::types::{ChangeKind, PathKey, RawEvent};

pub struct NotifyWatcher {
    registry: Arc<RootRegistry>,
    inner: Mutex<Option<RecommendedWatcher>>,
    pending_rename_from: Arc<Mutex<Option<PathKey>>>,
}

impl NotifyWatcher {
    pub fn new(roots: Vec<WatchRoot>) -> Self {
        Self {
            registry: Arc::new(RootRegistry::new(roots)),
            inner: Mutex::new(None),
            pending_rename_from: Arc::new(Mutex::new(None)),
        }
    }
}

impl super::NativeWatcher for NotifyWatcher {
    fn start(&self, on_event: WatcherCallback) -> Result<()> {
        let roots = self.registry.snapshot();
        if roots.is_empty() {
            return Err(WatchError::PlatformWatcherUnavailable(PathBuf::from("<no roots configured>")));
        }

        let registry = self.registry.clone();
        let pending_rename_from = self.pending_rename_from.clone();
        let mut watcher = recommended_watcher(move |event_result: notify::Result<Event>| {
            handle_notify_event(event_result, &on_event, &registry, &pending_rename_from);
        })
        .map_err(|error| {
            WatchError::PlatformWatcherUnavailable(PathBuf::from(format!("notify init failed: {error}")))
        })?;

        for root in &roots {
            let (watch_target, recursive_mode) = if root.is_directory {
                (root.path.clone(), RecursiveMode::Recursive)
            } else {
                (
                    root.path.parent().map(Path::to_path_buf).unwrap_or_else(|| root.path.clone()),
                    RecursiveMode::NonRecursive,
                )
            };
            watcher.watch(&watch_target, recursive_mode).map_err(|error| {
                WatchError::PlatformWatcherUnavailable(PathBuf::from(format!(
                    "failed to watch {}: {error}",
                    watch_target.display()
                )))
            })?;
        }

        *self.inner.lock() = Some(watcher);
        Ok(())
    }

    fn stop(&self) {
        // Dropping the RecommendedWatcher unwatches every root and joins
        // its internal worker.
        *self.inner.lock() = None;
    }

    fn add_root(&self, root: WatchRoot) -> Result<()> {
        if let Some(watcher) = self.inner.lock().as_mut() {
            let mode = if root.is_directory {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            watcher
                .watch(&root.path, mode)
                .map_err(|error| WatchError::Internal(format!("failed to watch {}: {error}", root.path.display())))?;
        }
        self.registry.add(root);
        Ok(())
    }

    fn remove_root(&self, path: &Path) -> Result<()> {
        if let Some(watcher) = self.inner.lock().as_mut() {
            let _ = watcher.unwatch(path);
        }
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

fn handle_notify_event(
    event_result: notify::Result<Event>,
    on_event: &WatcherCallback,
    registry: &Arc<RootRegistry>,
    pending_rename_from: &Mutex<Option<PathKey>>,
) {
    use notify::event::{ModifyKind, RenameMode};

    let event = match event_result {
        Ok(event) => event,
        Err(_) => {
            // notify's own error channel carries no path; surfaced as a
            // queue-overflow style Unknown on every monitored root so the
            // Orchestrator can schedule a bounded rescan (§4.2, §7
            // WatcherQueueOverflow).
            for path in registry.paths() {
                if let Some(key) = PathKey::new(path) {
                    on_event(RawEvent::new(key, ChangeKind::Unknown));
                }
            }
            return;
        }
    };

    if matches!(event.kind, EventKind::Access(_)) {
        return;
    }

    // Some backends (notably Windows) report a rename as a single event
    // carrying both paths instead of two separately-tracked From/To
    // events; handle that shape directly rather than losing rename
    // semantics into the generic Modify fallback.
    if matches!(event.kind, EventKind::Modify(ModifyKind::Name(RenameMode::Both))) && event.paths.len() == 2 {
        let (from_key, to_key) = (PathKey::new(event.paths[0].clone()), PathKey::new(event.paths[1].clone()));
        if let (Some(from_key), Some(to_key)) = (from_key, to_key) {
            registry.stats().record_received();
            on_event(RawEvent::new(from_key.clone(), ChangeKind::RenamedFrom));
            registry.stats().record_received();
            on_event(RawEvent::renamed_to(to_key, from_key));
        }
        return;
    }

    let kind = classify_kind(&event.kind);
    for path in event.paths {
        let Some(key) = PathKey::new(path) else { continue };
        registry.stats().record_received();
        let raw = match kind {
            ChangeKind::RenamedFrom => {
                *pending_rename_from.lock() = Some(key.clone());
                RawEvent::new(key, ChangeKind::RenamedFrom)
            }
            ChangeKind::RenamedTo => match pending_rename_from.lock().take() {
                Some(previous) => RawEvent::renamed_to(key, previous),
                None => RawEvent::new(key, ChangeKind::RenamedTo),
            },
            other => RawEvent::new(key, other),
        };
        on_event(raw);
    }
}

fn classify_kind(kind: &EventKind) -> ChangeKind {
    use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
    match kind {
        EventKind::Create(CreateKind::Any | CreateKind::File | CreateKind::Folder) => ChangeKind::Created,
        EventKind::Remove(RemoveKind::Any | RemoveKind::File | RemoveKind::Folder) => ChangeKind::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeKind::RenamedFrom,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeKind::RenamedTo,
        EventKind::Modify(_) => ChangeKind::Modified,
        _ => ChangeKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_from_then_to_pairs_via_tracking() {
        let registry = Arc::new(RootRegistry::new(Vec::new()));
        let pending = Mutex::new(None);
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let on_event: WatcherCallback = Arc::new(move |event| received_clone.lock().push(event));

        let from_event = notify::Result::Ok(Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Name(notify::event::RenameMode::From)),
            paths: vec![PathBuf::from("/a/old.txt")],
            attrs: Default::default(),
        });
        handle_notify_event(from_event, &on_event, &registry, &pending);

        let to_event = notify::Result::Ok(Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Name(notify::event::RenameMode::To)),
            paths: vec![PathBuf::from("/a/new.txt")],
            attrs: Default::default(),
        });
        handle_notify_event(to_event, &on_event, &registry, &pending);

        let events = received.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ChangeKind::RenamedFrom);
        assert_eq!(events[1].kind, ChangeKind::RenamedTo);
        assert!(events[1].previous_path.is_some());
        assert!(events[1].previous_path.as_ref().unwrap().as_path().ends_with("old.txt"));
    }
}
