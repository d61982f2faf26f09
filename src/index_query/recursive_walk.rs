//! `RecursiveWalk` IndexQueryProvider fallback.
//!
//! Used whenever no OS content index is reachable. Walks each watch root
//! directly instead of querying an index — the one variant that pays the
//! full tree-walk cost, which is why it is last in the selection order.
//!
//! The recursive, ignore-aware, parallel-friendly walk shape is grounded
//! on the teacher's Cardinal-style `index/fswalk.rs`; unlike that walker
//! this one does not build a `Node` tree for a persistent searchable
//! index, it streams `OutboundEvent` records straight to `record_sink`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{IndexQueryProvider, ProgressSink, RecordSink, ScanStatsSnapshot, ThrottleLevel};
use crate::checkpoint::ScanProgressStore;
use crate::config::WatchConfig;
use crate::error::Result;
use crate::filter::PathFilter;
use crate::types::{
    BatchProgress, Checkpoint, ChangeKind, EventOrigin, FileAttributes, OutboundEventType, PathKey, ScanSession,
    ScanType,
};

const INTER_BATCH_PAUSE: Duration = Duration::from_millis(200);
const REDUCED_INTER_BATCH_PAUSE: Duration = Duration::from_millis(800);

pub struct RecursiveWalkProvider {
    roots: Mutex<Vec<PathBuf>>,
    filter: Mutex<Arc<PathFilter>>,
    progress_store: Arc<ScanProgressStore>,
    config_fingerprint: Mutex<Vec<u8>>,
    paused: Arc<AtomicBool>,
    reduced: Arc<AtomicBool>,
    stats: ScanStats,
}

#[derive(Default)]
struct ScanStats {
    files_found: AtomicU64,
    files_processed: AtomicU64,
    batches_completed: std::sync::atomic::AtomicU32,
}

impl RecursiveWalkProvider {
    pub fn new(progress_store: Arc<ScanProgressStore>) -> Self {
        Self {
            roots: Mutex::new(Vec::new()),
            filter: Mutex::new(Arc::new(PathFilter::from_config(&WatchConfig::default()))),
            progress_store,
            config_fingerprint: Mutex::new(Vec::new()),
            paused: Arc::new(AtomicBool::new(false)),
            reduced: Arc::new(AtomicBool::new(false)),
            stats: ScanStats::default(),
        }
    }

    fn inter_batch_pause(&self) -> Duration {
        if self.reduced.load(Ordering::Acquire) {
            REDUCED_INTER_BATCH_PAUSE
        } else {
            INTER_BATCH_PAUSE
        }
    }
}

impl IndexQueryProvider for RecursiveWalkProvider {
    fn initialise(&self, config: &WatchConfig) -> Result<()> {
        *self.roots.lock() = config.watch_roots.clone();
        *self.filter.lock() = Arc::new(PathFilter::from_config(config));
        *self.config_fingerprint.lock() = config.fingerprint();
        Ok(())
    }

    fn run_scan(&self, progress_sink: ProgressSink, record_sink: RecordSink) -> Result<()> {
        let roots = self.roots.lock().clone();
        let fingerprint = self.config_fingerprint.lock().clone();
        let total_batches = roots.len() as u32;

        let existing = self.progress_store.load(&fingerprint, total_batches);
        let (session, start_index, mut completed_labels) = match existing {
            Some(checkpoint) => {
                log::info!(
                    "resuming scan session={} at batch={} query_label={}",
                    checkpoint.session_id,
                    checkpoint.current_batch_index,
                    checkpoint.current_query_label
                );
                (
                    ScanSession {
                        session_id: checkpoint.session_id,
                        started_at: checkpoint.recorded_at,
                        scan_type: ScanType::Resume,
                        completed: false,
                        error: None,
                    },
                    checkpoint.current_batch_index,
                    checkpoint.completed_query_labels,
                )
            }
            None => (ScanSession::new(ScanType::Full), 0, std::collections::BTreeSet::new()),
        };

        for (index, root) in roots.iter().enumerate() {
            let batch_index = index as u32;
            if batch_index < start_index {
                continue;
            }
            let label = root.to_string_lossy().into_owned();
            if completed_labels.contains(&label) {
                continue;
            }

            if self.paused.load(Ordering::Acquire) {
                self.persist_checkpoint(&session, batch_index, &label, &completed_labels, &fingerprint);
                return Ok(());
            }

            let mut progress = BatchProgress {
                batch_index,
                query_label: label.clone(),
                files_found: 0,
                files_processed: 0,
                started_at: crate::types::unix_now_secs(),
                completed_at: None,
                completed: false,
            };

            self.walk_root(root, &record_sink, &mut progress);
            progress.completed = true;
            progress.completed_at = Some(crate::types::unix_now_secs());
            progress_sink(progress);

            completed_labels.insert(label.clone());
            self.stats.batches_completed.fetch_add(1, Ordering::Relaxed);
            self.persist_checkpoint(&session, batch_index + 1, &label, &completed_labels, &fingerprint);

            std::thread::sleep(self.inter_batch_pause());
        }

        self.progress_store.clear();
        Ok(())
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    fn throttle(&self, level: ThrottleLevel) {
        self.reduced.store(level == ThrottleLevel::Reduced, Ordering::Release);
        match level {
            ThrottleLevel::Paused => self.pause(),
            ThrottleLevel::Normal | ThrottleLevel::Reduced => self.resume(),
        }
    }

    fn statistics(&self) -> ScanStatsSnapshot {
        ScanStatsSnapshot {
            files_found: self.stats.files_found.load(Ordering::Relaxed),
            files_processed: self.stats.files_processed.load(Ordering::Relaxed),
            batches_completed: self.stats.batches_completed.load(Ordering::Relaxed),
        }
    }
}

impl RecursiveWalkProvider {
    fn persist_checkpoint(
        &self,
        session: &ScanSession,
        current_batch_index: u32,
        current_query_label: &str,
        completed_query_labels: &std::collections::BTreeSet<String>,
        fingerprint: &[u8],
    ) {
        self.progress_store.save(&Checkpoint {
            session_id: session.session_id,
            current_batch_index,
            current_query_label: current_query_label.to_string(),
            total_files_processed: self.stats.files_processed.load(Ordering::Relaxed),
            recorded_at: crate::types::unix_now_secs(),
            completed_query_labels: completed_query_labels.clone(),
            config_fingerprint: fingerprint.to_vec(),
        });
    }

    fn walk_root(&self, root: &Path, record_sink: &RecordSink, progress: &mut BatchProgress) {
        let filter = self.filter.lock().clone();
        self.walk_dir(root, &filter, record_sink, progress);
    }

    fn walk_dir(&self, dir: &Path, filter: &PathFilter, record_sink: &RecordSink, progress: &mut BatchProgress) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Some(key) = PathKey::new(path.clone()) else { continue };

            self.stats.files_found.fetch_add(1, Ordering::Relaxed);
            progress.files_found += 1;

            let Ok(attrs) = FileAttributes::probe(&path) else { continue };
            let admitted = filter.admits(&key, ChangeKind::Created, || Ok(attrs));
            if !admitted {
                if attrs.is_directory {
                    // An excluded directory prunes the whole subtree.
                    continue;
                }
                continue;
            }

            if attrs.is_directory {
                self.walk_dir(&path, filter, record_sink, progress);
                continue;
            }

            let record = crate::types::OutboundEvent {
                path: path.to_string_lossy().into_owned(),
                name: path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
                extension: path
                    .extension()
                    .map(|e| e.to_string_lossy().to_ascii_lowercase())
                    .unwrap_or_default(),
                directory: path.parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default(),
                is_directory: false,
                size: Some(attrs.size_bytes),
                modified_time: Some(attrs.modified_at_unix_secs),
                old_path: None,
                event_type: OutboundEventType::Created,
                content: None,
                content_extracted: false,
                origin: EventOrigin::InitialScan,
                observed_at: crate::types::unix_now_millis(),
            };

            if record_sink(record) {
                self.stats.files_processed.fetch_add(1, Ordering::Relaxed);
                progress.files_processed += 1;
            }

            if self.stats.files_found.load(Ordering::Relaxed) % 500 == 0 && self.paused.load(Ordering::Acquire) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkOutcome;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn emits_created_records_for_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hi").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "hi").unwrap();

        let store_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ScanProgressStore::new(store_dir.path()));
        let provider = RecursiveWalkProvider::new(store);

        let config = WatchConfig {
            watch_roots: vec![dir.path().to_path_buf()],
            ..WatchConfig::default()
        };
        provider.initialise(&config).unwrap();

        let records: Arc<StdMutex<Vec<crate::types::OutboundEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let records_clone = records.clone();
        let record_sink: RecordSink = Arc::new(move |record| {
            records_clone.lock().unwrap().push(record);
            true
        });
        let progress_sink: ProgressSink = Arc::new(|_| {});

        provider.run_scan(progress_sink, record_sink).unwrap();

        let records = records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.origin == EventOrigin::InitialScan));
        let _ = SinkOutcome::Ok;
    }

    #[test]
    fn resumes_from_checkpoint_skipping_completed_labels() {
        let dir = tempfile::tempdir().unwrap();
        let root_a = dir.path().join("a");
        let root_b = dir.path().join("b");
        std::fs::create_dir_all(&root_a).unwrap();
        std::fs::create_dir_all(&root_b).unwrap();
        std::fs::write(root_a.join("x.txt"), "hi").unwrap();
        std::fs::write(root_b.join("y.txt"), "hi").unwrap();

        let store_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ScanProgressStore::new(store_dir.path()));
        let config = WatchConfig {
            watch_roots: vec![root_a.clone(), root_b.clone()],
            ..WatchConfig::default()
        };

        let mut completed = std::collections::BTreeSet::new();
        completed.insert(root_a.to_string_lossy().into_owned());
        store.save(&Checkpoint {
            session_id: uuid::Uuid::new_v4(),
            current_batch_index: 1,
            current_query_label: root_a.to_string_lossy().into_owned(),
            total_files_processed: 1,
            recorded_at: crate::types::unix_now_secs(),
            completed_query_labels: completed,
            config_fingerprint: config.fingerprint(),
        });

        let provider = RecursiveWalkProvider::new(store);
        provider.initialise(&config).unwrap();

        let records: Arc<StdMutex<Vec<crate::types::OutboundEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let records_clone = records.clone();
        let record_sink: RecordSink = Arc::new(move |record| {
            records_clone.lock().unwrap().push(record);
            true
        });
        provider.run_scan(Arc::new(|_| {}), record_sink).unwrap();

        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].path.contains("y.txt"));
    }
}
