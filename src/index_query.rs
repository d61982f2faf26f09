//! Bulk enumeration of pre-existing files via an OS-maintained content
//! index (§4.5).
//!
//! A capability set: `{ initialise(config), run_scan(progress_sink,
//! record_sink), pause, resume, throttle(level), statistics }`. Variants:
//! `macOS_SpotlightQuery`, `Linux_locate`, `Windows_Search_or_MFT`,
//! `RecursiveWalk` (fallback, used whenever no OS index is reachable).

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "linux")]
mod linux;
mod recursive_walk;

use std::sync::Arc;

use crate::checkpoint::ScanProgressStore;
use crate::config::WatchConfig;
use crate::error::Result;
use crate::types::{BatchProgress, OutboundEvent};

#[cfg(target_os = "macos")]
pub use macos::SpotlightQueryProvider;
#[cfg(target_os = "linux")]
pub use linux::LocateQueryProvider;
pub use recursive_walk::RecursiveWalkProvider;

/// One labelled slice of the index's result space (e.g. "documents",
/// "images", or — for `locate` — one configured root).
#[derive(Debug, Clone)]
pub struct QueryBatch {
    pub label: String,
}

/// Ambient host pressure a throttle decision is based on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleLevel {
    Normal,
    Reduced,
    Paused,
}

pub type ProgressSink = Arc<dyn Fn(BatchProgress) + Send + Sync>;
pub type RecordSink = Arc<dyn Fn(OutboundEvent) -> bool + Send + Sync>;

/// Platform-specific bulk listing of pre-existing files.
pub trait IndexQueryProvider: Send + Sync {
    fn initialise(&self, config: &WatchConfig) -> Result<()>;

    /// Runs the full batch plan (or resumes one from a Checkpoint),
    /// reporting per-batch progress to `progress_sink` and admitted
    /// records to `record_sink`. Blocks until the scan completes, is
    /// paused, or is cancelled.
    fn run_scan(&self, progress_sink: ProgressSink, record_sink: RecordSink) -> Result<()>;

    /// Freezes emission at the next record boundary; the implementation
    /// is responsible for persisting a Checkpoint before returning.
    fn pause(&self);

    fn resume(&self);

    fn throttle(&self, level: ThrottleLevel);

    fn statistics(&self) -> ScanStatsSnapshot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanStatsSnapshot {
    pub files_found: u64,
    pub files_processed: u64,
    pub batches_completed: u32,
}

/// Selects the best available bulk-enumeration backend for the current
/// platform, falling back to `RecursiveWalk` if the OS content index is
/// unreachable. Mirrors the automatic-selection-with-fallback shape of
/// `watcher::create_native_watcher`.
pub fn create_index_query_provider(
    progress_store: Arc<ScanProgressStore>,
    config: &WatchConfig,
) -> Result<Arc<dyn IndexQueryProvider>> {
    #[cfg(target_os = "macos")]
    {
        let provider: Arc<dyn IndexQueryProvider> = Arc::new(SpotlightQueryProvider::new(progress_store.clone()));
        match provider.initialise(config) {
            Ok(()) => return Ok(provider),
            Err(error) => {
                log::warn!("Spotlight query provider unavailable, falling back to recursive walk: {error}");
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let provider: Arc<dyn IndexQueryProvider> = Arc::new(LocateQueryProvider::new(progress_store.clone()));
        match provider.initialise(config) {
            Ok(()) => return Ok(provider),
            Err(error) => {
                log::warn!("locate query provider unavailable, falling back to recursive walk: {error}");
            }
        }
    }

    let fallback: Arc<dyn IndexQueryProvider> = Arc::new(RecursiveWalkProvider::new(progress_store));
    fallback.initialise(config)?;
    Ok(fallback)
}
