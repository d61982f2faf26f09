//! `Linux_locate` IndexQueryProvider variant.
//!
//! Shells out to `locate`/`plocate`, one query batch per configured root
//! (the labelling scheme §4.5 step 2 prescribes for this backend). The
//! `mlocate` database is maintained by the host, outside this crate's
//! control; a missing or stale database surfaces as a scan error, not a
//! crash — the Orchestrator is free to fall back to `RecursiveWalk`.

use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{IndexQueryProvider, ProgressSink, RecordSink, ScanStatsSnapshot, ThrottleLevel};
use crate::checkpoint::ScanProgressStore;
use crate::config::WatchConfig;
use crate::error::{Result, WatchError};
use crate::filter::PathFilter;
use crate::types::{
    BatchProgress, Checkpoint, ChangeKind, EventOrigin, FileAttributes, OutboundEventType, PathKey, ScanSession,
    ScanType,
};

const INTER_BATCH_PAUSE: Duration = Duration::from_millis(200);
const REDUCED_INTER_BATCH_PAUSE: Duration = Duration::from_millis(800);

pub struct LocateQueryProvider {
    roots: Mutex<Vec<PathBuf>>,
    filter: Mutex<Arc<PathFilter>>,
    progress_store: Arc<ScanProgressStore>,
    config_fingerprint: Mutex<Vec<u8>>,
    paused: Arc<AtomicBool>,
    reduced: Arc<AtomicBool>,
    files_found: AtomicU64,
    files_processed: AtomicU64,
    batches_completed: std::sync::atomic::AtomicU32,
}

impl LocateQueryProvider {
    pub fn new(progress_store: Arc<ScanProgressStore>) -> Self {
        Self {
            roots: Mutex::new(Vec::new()),
            filter: Mutex::new(Arc::new(PathFilter::from_config(&WatchConfig::default()))),
            progress_store,
            config_fingerprint: Mutex::new(Vec::new()),
            paused: Arc::new(AtomicBool::new(false)),
            reduced: Arc::new(AtomicBool::new(false)),
            files_found: AtomicU64::new(0),
            files_processed: AtomicU64::new(0),
            batches_completed: std::sync::atomic::AtomicU32::new(0),
        }
    }

    fn inter_batch_pause(&self) -> Duration {
        if self.reduced.load(Ordering::Acquire) {
            REDUCED_INTER_BATCH_PAUSE
        } else {
            INTER_BATCH_PAUSE
        }
    }

    fn locate(&self, root: &PathBuf) -> std::io::Result<Vec<PathBuf>> {
        let prefix = root.to_string_lossy().into_owned();
        let output = Command::new("locate").arg("--regex").arg(format!("^{}", regex_escape(&prefix))).output()?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.lines().map(PathBuf::from).collect())
    }
}

impl IndexQueryProvider for LocateQueryProvider {
    fn initialise(&self, config: &WatchConfig) -> Result<()> {
        *self.roots.lock() = config.watch_roots.clone();
        *self.filter.lock() = Arc::new(PathFilter::from_config(config));
        *self.config_fingerprint.lock() = config.fingerprint();
        Ok(())
    }

    fn run_scan(&self, progress_sink: ProgressSink, record_sink: RecordSink) -> Result<()> {
        let roots = self.roots.lock().clone();
        let fingerprint = self.config_fingerprint.lock().clone();
        let filter = self.filter.lock().clone();
        let total_batches = roots.len() as u32;

        let (session, start_index, mut completed_labels) = match self.progress_store.load(&fingerprint, total_batches)
        {
            Some(checkpoint) => (
                ScanSession {
                    session_id: checkpoint.session_id,
                    started_at: checkpoint.recorded_at,
                    scan_type: ScanType::Resume,
                    completed: false,
                    error: None,
                },
                checkpoint.current_batch_index,
                checkpoint.completed_query_labels,
            ),
            None => (ScanSession::new(ScanType::Full), 0, std::collections::BTreeSet::new()),
        };

        for (index, root) in roots.iter().enumerate() {
            let batch_index = index as u32;
            let label = root.to_string_lossy().into_owned();
            if batch_index < start_index || completed_labels.contains(&label) {
                continue;
            }
            if self.paused.load(Ordering::Acquire) {
                self.persist(&session, batch_index, &label, &completed_labels, &fingerprint);
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

            let results = self
                .locate(root)
                .map_err(|error| WatchError::Internal(format!("locate query for {} failed: {error}", root.display())))?;
            for path in results {
                self.files_found.fetch_add(1, Ordering::Relaxed);
                progress.files_found += 1;
                if let Some(record) = to_outbound_record(&path, &filter) {
                    if record_sink(record) {
                        self.files_processed.fetch_add(1, Ordering::Relaxed);
                        progress.files_processed += 1;
                    }
                }
            }

            progress.completed = true;
            progress.completed_at = Some(crate::types::unix_now_secs());
            progress_sink(progress);

            completed_labels.insert(label.clone());
            self.batches_completed.fetch_add(1, Ordering::Relaxed);
            self.persist(&session, batch_index + 1, &label, &completed_labels, &fingerprint);

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
            files_found: self.files_found.load(Ordering::Relaxed),
            files_processed: self.files_processed.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
        }
    }
}

impl LocateQueryProvider {
    fn persist(
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
            total_files_processed: self.files_processed.load(Ordering::Relaxed),
            recorded_at: crate::types::unix_now_secs(),
            completed_query_labels: completed_query_labels.clone(),
            config_fingerprint: fingerprint.to_vec(),
        });
    }
}

fn to_outbound_record(path: &PathBuf, filter: &PathFilter) -> Option<crate::types::OutboundEvent> {
    let key = PathKey::new(path.clone())?;
    let attrs = FileAttributes::probe(path).ok()?;
    if !filter.admits(&key, ChangeKind::Created, || Ok(attrs)) {
        return None;
    }
    Some(crate::types::OutboundEvent {
        path: path.to_string_lossy().into_owned(),
        name: path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        extension: path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase()).unwrap_or_default(),
        directory: path.parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default(),
        is_directory: attrs.is_directory,
        size: Some(attrs.size_bytes),
        modified_time: Some(attrs.modified_at_unix_secs),
        old_path: None,
        event_type: OutboundEventType::Created,
        content: None,
        content_extracted: false,
        origin: EventOrigin::InitialScan,
        observed_at: crate::types::unix_now_millis(),
    })
}

fn regex_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if "\\^$.|?*+()[]{}".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
