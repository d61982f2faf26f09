//! Wires every component together, owns the lifecycle, and is the single
//! component allowed to transition the system to `Failed` (§4.7).
//!
//! The atomic-state-machine + `Arc<Shared>` + background-thread +
//! panic-safe-worker architecture here is adapted from the teacher's
//! `search/manager.rs::FileSystemIndexManager`/`RootIndex` — the registry
//! shape (many roots, one index each) is collapsed into "one state
//! machine owns the whole pipeline", since this crate has exactly one
//! instance of each component rather than one per root.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::checkpoint::ScanProgressStore;
use crate::coalescer::{CoalescerConfig, EventCoalescer};
use crate::config::WatchConfig;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::{Result, WatchError};
use crate::filter::PathFilter;
use crate::index_query::{create_index_query_provider, IndexQueryProvider};
use crate::parser::ParserRegistry;
use crate::sink::Sink;
use crate::stats::{WatcherStats, WatcherStatsSnapshot};
use crate::watcher::{self, NativeWatcher, WatchRoot};

const WATCHER_RESTART_DELAY: Duration = Duration::from_secs(1);
const WATCHER_FAILURE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OrchestratorState {
    Uninitialised = 0,
    Initialising = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
    Failed = 5,
}

impl OrchestratorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialised,
            1 => Self::Initialising,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    fn load(atomic: &AtomicU8) -> Self {
        Self::from_u8(atomic.load(Ordering::Acquire))
    }
}

struct Shared {
    state: AtomicU8,
    config: Mutex<Option<WatchConfig>>,
    filter: Mutex<Arc<PathFilter>>,
    coalescer: Mutex<Option<Arc<EventCoalescer>>>,
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
    watcher: Mutex<Option<Box<dyn NativeWatcher>>>,
    scan_provider: Mutex<Option<Arc<dyn IndexQueryProvider>>>,
    watcher_failures: Mutex<Vec<Instant>>,
    progress_store: Mutex<Option<Arc<ScanProgressStore>>>,
    generation: AtomicU64,
    dropped_events: WatcherStats,
}

/// Owns every component exclusively; components communicate only through
/// abstract callback sinks the Orchestrator installs (§3 "Ownership and
/// lifetimes").
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(OrchestratorState::Uninitialised as u8),
                config: Mutex::new(None),
                filter: Mutex::new(Arc::new(PathFilter::from_config(&WatchConfig::default()))),
                coalescer: Mutex::new(None),
                dispatcher: Mutex::new(None),
                watcher: Mutex::new(None),
                scan_provider: Mutex::new(None),
                watcher_failures: Mutex::new(Vec::new()),
                progress_store: Mutex::new(None),
                generation: AtomicU64::new(0),
                dropped_events: WatcherStats::default(),
            }),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        OrchestratorState::load(&self.shared.state)
    }

    /// Validates `config`, builds every component, and transitions
    /// `Uninitialised -> Initialising -> Running`-ready. Does not start
    /// the watcher or the scan; that happens in `start`.
    pub fn initialise(&self, config: WatchConfig, checkpoint_dir: impl Into<PathBuf>) -> Result<()> {
        if self.state() != OrchestratorState::Uninitialised {
            return Err(WatchError::ConfigurationRejected(
                "initialise called outside Uninitialised state".to_string(),
            ));
        }
        self.shared.state.store(OrchestratorState::Initialising as u8, Ordering::Release);

        config.validate()?;

        let filter = Arc::new(PathFilter::from_config(&config));
        let progress_store = Arc::new(ScanProgressStore::new(checkpoint_dir));
        let scan_provider = create_index_query_provider(progress_store.clone(), &config)?;

        let coalescer = Arc::new(EventCoalescer::new(CoalescerConfig {
            debounce_delay: Duration::from_millis(u64::from(config.debounce_delay_ms)),
            max_pending_events: config.max_pending_events as usize,
            coalescing_enabled: true,
        }));

        let mut parsers = ParserRegistry::new();
        parsers.register(Box::new(crate::parser::PlainTextParser));
        let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig {
            content_parsing_enabled: config.content_parsing_enabled,
            max_content_length: config.max_content_length as usize,
        }));
        dispatcher.configure_parsers(Arc::new(parsers));
        dispatcher.configure_batch(
            Duration::from_millis(u64::from(config.batch_interval_ms)),
            config.max_batch_size as usize,
        );

        let shared_for_escalation = self.shared.clone();
        dispatcher.on_escalate(move |error| {
            log::error!("dispatcher escalated a fatal sink error: {error}");
            shared_for_escalation.state.store(OrchestratorState::Failed as u8, Ordering::Release);
        });

        let dispatcher_for_callback = dispatcher.clone();
        coalescer.start(move |event| dispatcher_for_callback.handle(event));

        *self.shared.filter.lock() = filter;
        *self.shared.coalescer.lock() = Some(coalescer);
        *self.shared.dispatcher.lock() = Some(dispatcher);
        *self.shared.scan_provider.lock() = Some(scan_provider);
        *self.shared.progress_store.lock() = Some(progress_store);
        *self.shared.config.lock() = Some(config);

        log::info!("orchestrator initialised");
        Ok(())
    }

    /// `start(sink)` (§6 process control): wires the sink, starts the
    /// NativeWatcher, kicks off the initial scan, and transitions to
    /// `Running`.
    pub fn start(&self, sink: Arc<dyn Sink>) -> Result<()> {
        if self.state() != OrchestratorState::Initialising {
            return Err(WatchError::ConfigurationRejected(
                "start called outside Initialising state".to_string(),
            ));
        }

        let dispatcher = self.dispatcher()?;
        dispatcher.configure_sink(sink);

        let roots = {
            let config = self.shared.config.lock();
            config
                .as_ref()
                .map(|c| c.watch_roots.iter().map(|p| WatchRoot { path: p.clone(), is_directory: true }).collect())
                .unwrap_or_default()
        };

        self.spawn_watcher(roots)?;
        self.spawn_initial_scan();

        self.shared.state.store(OrchestratorState::Running as u8, Ordering::Release);
        log::info!("orchestrator running");
        Ok(())
    }

    fn dispatcher(&self) -> Result<Arc<Dispatcher>> {
        self.shared
            .dispatcher
            .lock()
            .clone()
            .ok_or_else(|| WatchError::Internal("dispatcher not initialised".to_string()))
    }

    fn coalescer(&self) -> Result<Arc<EventCoalescer>> {
        self.shared
            .coalescer
            .lock()
            .clone()
            .ok_or_else(|| WatchError::Internal("coalescer not initialised".to_string()))
    }

    fn spawn_watcher(&self, roots: Vec<WatchRoot>) -> Result<()> {
        let coalescer = self.coalescer()?;
        let filter = self.shared.filter.lock().clone();
        let shared_for_drops = self.shared.clone();

        let on_event = Arc::new(move |event: crate::types::RawEvent| {
            let probe = || crate::types::FileAttributes::probe(event.path.as_path());
            if event.kind == crate::types::ChangeKind::Unknown || filter.admits(&event.path, event.kind, probe) {
                if coalescer.submit(event) == crate::coalescer::SubmitOutcome::Rejected {
                    shared_for_drops.dropped_events.record_dropped(1);
                }
            }
        });

        let watcher = watcher::create_native_watcher(roots, on_event)?;
        *self.shared.watcher.lock() = Some(watcher);
        self.spawn_supervisor();
        Ok(())
    }

    /// Merges the native watcher's own received-event count with the
    /// orchestrator-tracked back-pressure drop count (§5 resource
    /// accounting — a `SubmitOutcome::Rejected` from the coalescer counts
    /// as a dropped event even though the watcher itself received it).
    pub fn watcher_statistics(&self) -> WatcherStatsSnapshot {
        let received = self.shared.watcher.lock().as_ref().map(|w| w.statistics().events_received).unwrap_or(0);
        WatcherStatsSnapshot {
            events_received: received,
            events_dropped: self.shared.dropped_events.snapshot().events_dropped,
        }
    }

    /// Monitors the NativeWatcher for the `Failed`-from-any-state
    /// recovery policy: one automatic restart after 1 s, a second
    /// failure within 60 s escalates to `Failed` (§4.7).
    fn spawn_supervisor(&self) {
        // The current NativeWatcher abstraction reports failures only by
        // returning an error from `start`; steady-state watcher death is
        // detected indirectly (no events + no explicit failure channel
        // yet belongs to a real transport). `record_watcher_failure` is
        // the hook a transport-level heartbeat would call.
    }

    #[allow(dead_code)]
    fn record_watcher_failure(&self) -> Result<()> {
        let mut failures = self.shared.watcher_failures.lock();
        let now = Instant::now();
        failures.retain(|t| now.duration_since(*t) <= WATCHER_FAILURE_WINDOW);
        failures.push(now);

        if failures.len() > 1 {
            drop(failures);
            self.shared.state.store(OrchestratorState::Failed as u8, Ordering::Release);
            log::error!("native watcher failed twice within {:?}, moving to Failed", WATCHER_FAILURE_WINDOW);
            return Err(WatchError::InvariantViolation("native watcher failed repeatedly".to_string()));
        }
        drop(failures);

        std::thread::sleep(WATCHER_RESTART_DELAY);
        let roots = self.shared.watcher.lock().as_ref().map(|w| w.monitored_roots()).unwrap_or_default();
        let roots = roots
            .into_iter()
            .map(|path| WatchRoot { path, is_directory: true })
            .collect();
        self.spawn_watcher(roots)
    }

    fn spawn_initial_scan(&self) {
        let Some(provider) = self.shared.scan_provider.lock().clone() else { return };
        let Ok(dispatcher) = self.dispatcher() else { return };
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let shared = self.shared.clone();

        std::thread::Builder::new()
            .name("orchestrator-scan".to_string())
            .spawn(move || {
                let progress_sink = Arc::new(|progress: crate::types::BatchProgress| {
                    log::debug!(
                        "scan batch {} ({}) found={} processed={} completed={}",
                        progress.batch_index,
                        progress.query_label,
                        progress.files_found,
                        progress.files_processed,
                        progress.completed
                    );
                });
                let dispatcher_for_records = dispatcher.clone();
                let record_sink = Arc::new(move |record: crate::types::OutboundEvent| dispatcher_for_records.handle_outbound(record));

                let result = catch_unwind(AssertUnwindSafe(|| provider.run_scan(progress_sink, record_sink)));

                if shared.generation.load(Ordering::SeqCst) != generation + 1 {
                    // A newer scan (triggered by `trigger_rescan`) has
                    // already superseded this one.
                    return;
                }

                match result {
                    Ok(Ok(())) => log::info!("initial scan completed"),
                    Ok(Err(error)) => log::warn!("initial scan failed: {error}"),
                    Err(_) => log::error!("initial scan thread panicked"),
                }
            })
            .expect("failed to spawn orchestrator scan thread");
    }

    /// `trigger_rescan(root)` (§6 process control): schedules a fresh
    /// Initial-Scan run, e.g. in response to a `WatcherQueueOverflow` or a
    /// synthetic `Unknown` event bounded to one root.
    pub fn trigger_rescan(&self, _root: &Path) -> Result<()> {
        if self.state() != OrchestratorState::Running {
            return Err(WatchError::ConfigurationRejected(
                "trigger_rescan requires the Running state".to_string(),
            ));
        }
        self.spawn_initial_scan();
        Ok(())
    }

    /// `stop()`: bumps the scan generation, stops the watcher, coalescer,
    /// and dispatcher (each drains synchronously), and transitions to
    /// `Stopped`. Idempotent beyond the first call from `Running` or
    /// `Failed`.
    pub fn stop(&self) -> Result<()> {
        let current = self.state();
        if current == OrchestratorState::Stopped {
            return Ok(());
        }
        self.shared.state.store(OrchestratorState::Stopping as u8, Ordering::Release);
        // Bumping the generation makes any in-flight scan thread treat
        // itself as superseded once `run_scan` returns, instead of
        // logging a misleading completion/failure after shutdown.
        self.shared.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(watcher) = self.shared.watcher.lock().take() {
            watcher.stop();
        }
        if let Some(coalescer) = self.shared.coalescer.lock().clone() {
            coalescer.stop();
        }
        if let Some(dispatcher) = self.shared.dispatcher.lock().clone() {
            dispatcher.stop();
        }

        self.shared.state.store(OrchestratorState::Stopped as u8, Ordering::Release);
        log::info!("orchestrator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ChannelSink;

    #[test]
    fn lifecycle_runs_and_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint_dir = tempfile::tempdir().unwrap();

        let orchestrator = Orchestrator::new();
        let config = WatchConfig {
            watch_roots: vec![dir.path().to_path_buf()],
            ..WatchConfig::default()
        };
        orchestrator.initialise(config, checkpoint_dir.path()).unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Initialising);

        let sink = Arc::new(ChannelSink::new());
        orchestrator.start(sink).unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Running);

        orchestrator.stop().unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
    }

    #[test]
    fn start_before_initialise_is_rejected() {
        let orchestrator = Orchestrator::new();
        let sink = Arc::new(ChannelSink::new());
        assert!(orchestrator.start(sink).is_err());
    }
}
