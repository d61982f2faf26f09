//! Core data model shared by every pipeline component.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::canonicalize_existing_path;

/// A canonicalised absolute filesystem path.
///
/// Equality is byte-exact on the canonical form. Canonicalisation falls
/// back to the original path when the filesystem can't resolve it (the
/// path may no longer exist, e.g. for a `Deleted` event) — that is still
/// a valid, stable key as long as it was canonical at the time it was
/// first observed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathKey(PathBuf);

impl PathKey {
    /// Builds a PathKey from a filesystem path, canonicalising where possible.
    ///
    /// Returns `None` if `path` is not valid UTF-8-representable (contains
    /// unpaired surrogates or invalid byte sequences on platforms where
    /// that is detectable), per the boundary-rejection rule.
    pub fn new(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        if path.to_str().is_none() && cfg!(not(unix)) {
            // On non-Unix platforms a path that isn't representable as
            // valid UTF-16/UTF-8 cannot be round-tripped safely; reject it.
            return None;
        }
        Some(Self(canonicalize_existing_path(path)))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl std::fmt::Display for PathKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// The kind of change a watcher or scan observed for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    RenamedFrom,
    RenamedTo,
    Unknown,
}

/// Lazily-populated file metadata.
///
/// Absent when the path no longer exists or the enriching status syscall
/// failed; absence is never itself an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub size_bytes: u64,
    pub modified_at_unix_secs: u64,
    pub is_directory: bool,
}

impl FileAttributes {
    pub fn probe(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::symlink_metadata(path)?;
        let modified_at_unix_secs = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(Self {
            size_bytes: metadata.len(),
            modified_at_unix_secs,
            is_directory: metadata.is_dir(),
        })
    }
}

/// An event as emitted by a NativeWatcher, before coalescing.
///
/// Invariant R1: for every OS-observed rename of P to Q, either a
/// `RenamedFrom(P)` + `RenamedTo(Q, previous=P)` pair, or a
/// `Deleted(P)` + `Created(Q)` pair, is emitted — the pipeline treats the
/// latter as semantically equivalent once coalesced.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub path: PathKey,
    pub kind: ChangeKind,
    pub previous_path: Option<PathKey>,
    pub observed_at: Instant,
}

impl RawEvent {
    pub fn new(path: PathKey, kind: ChangeKind) -> Self {
        Self {
            path,
            kind,
            previous_path: None,
            observed_at: Instant::now(),
        }
    }

    pub fn renamed_to(path: PathKey, previous: PathKey) -> Self {
        Self {
            path,
            kind: ChangeKind::RenamedTo,
            previous_path: Some(previous),
            observed_at: Instant::now(),
        }
    }
}

/// An event pending a debounce window's expiry inside the EventCoalescer.
///
/// Invariants C1/C2 are maintained by `EventCoalescer`, not by this type
/// itself — `PendingEntry` is just the value the pending map stores.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub event: RawEvent,
    pub scheduled_at: Instant,
    pub merged_count: u32,
}

/// The value ultimately handed to the outbound sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub path: String,
    pub name: String,
    pub extension: String,
    pub directory: String,
    pub is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    pub event_type: OutboundEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub content_extracted: bool,
    pub origin: EventOrigin,
    pub observed_at: u64,
}

/// Wire-level discriminant for `OutboundEvent::event_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundEventType {
    Created,
    Modified,
    Deleted,
    RenamedOld,
    RenamedNew,
}

impl OutboundEventType {
    /// Maps a coalesced ChangeKind onto the wire vocabulary.
    ///
    /// `RenamedFrom`/`RenamedTo` map onto `renamed_old`/`renamed_new`;
    /// `Unknown` has no wire representation and must be handled by the
    /// caller before reaching this conversion (it never reaches the sink).
    pub fn from_change_kind(kind: ChangeKind) -> Option<Self> {
        match kind {
            ChangeKind::Created => Some(Self::Created),
            ChangeKind::Modified => Some(Self::Modified),
            ChangeKind::Deleted => Some(Self::Deleted),
            ChangeKind::RenamedFrom => Some(Self::RenamedOld),
            ChangeKind::RenamedTo => Some(Self::RenamedNew),
            ChangeKind::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    Watcher,
    InitialScan,
}

/// One run of the bulk enumerator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSession {
    pub session_id: Uuid,
    pub started_at: u64,
    pub scan_type: ScanType,
    pub completed: bool,
    pub error: Option<String>,
}

impl ScanSession {
    pub fn new(scan_type: ScanType) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: unix_now_secs(),
            scan_type,
            completed: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanType {
    Full,
    Incremental,
    Resume,
}

/// Progress within a single labelled query batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_index: u32,
    pub query_label: String,
    pub files_found: u64,
    pub files_processed: u64,
    pub started_at: u64,
    pub completed_at: Option<u64>,
    pub completed: bool,
}

/// Durable record of bulk-scan progress, written by ScanProgressStore.
///
/// Invariant S1 (`current_batch_index <= total_batches_of(config_fingerprint)`)
/// is enforced by the reader (`ScanProgressStore::load`), not by this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: Uuid,
    pub current_batch_index: u32,
    pub current_query_label: String,
    pub total_files_processed: u64,
    pub recorded_at: u64,
    pub completed_query_labels: BTreeSet<String>,
    pub config_fingerprint: Vec<u8>,
}

pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn unix_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_event_type_maps_change_kinds() {
        assert_eq!(
            OutboundEventType::from_change_kind(ChangeKind::Deleted),
            Some(OutboundEventType::Deleted)
        );
        assert_eq!(
            OutboundEventType::from_change_kind(ChangeKind::RenamedFrom),
            Some(OutboundEventType::RenamedOld)
        );
        assert_eq!(OutboundEventType::from_change_kind(ChangeKind::Unknown), None);
    }

    #[test]
    fn path_key_canonicalises_existing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hi").unwrap();
        let key = PathKey::new(file.clone()).unwrap();
        assert!(key.as_path().ends_with("a.txt"));
    }
}
