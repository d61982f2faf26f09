//! Batching dispatcher: attribute enrichment, parser invocation, sink
//! delivery, and the back-pressure boundary (§4.4).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::WatchError;
use crate::parser::ParserRegistry;
use crate::sink::{Sink, SinkOutcome};
use crate::stats::DispatcherStats;
use crate::types::{ChangeKind, FileAttributes, OutboundEvent, OutboundEventType, RawEvent};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub content_parsing_enabled: bool,
    pub max_content_length: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            content_parsing_enabled: false,
            max_content_length: 50_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BatchConfig {
    interval: Duration,
    max_size: usize,
}

struct Shared {
    config: DispatcherConfig,
    sink: RwLock<Option<Arc<dyn Sink>>>,
    parsers: RwLock<Arc<ParserRegistry>>,
    stats: DispatcherStats,
    queue: Mutex<Vec<OutboundEvent>>,
    wake: Condvar,
    running: Mutex<bool>,
    batch: RwLock<Option<BatchConfig>>,
    /// Set once the sink has proven durably unavailable (a `FatalError`, or
    /// a `RetryableError` that survived every backoff attempt). While this
    /// is set, `handle` returns `false` without attempting delivery — the
    /// signal the Coalescer needs to start rejecting submitters (§4.4).
    paused: AtomicBool,
    on_escalate: Mutex<Option<Arc<dyn Fn(WatchError) + Send + Sync>>>,
}

/// Turns coalesced `RawEvent`s into delivered `OutboundEvent`s.
///
/// `handle` returns `true` once the event has been accepted — delivered
/// immediately in unbatched mode, or queued in batched mode — and `false`
/// when the sink is paused, which is the signal the EventCoalescer's flush
/// callback forwards straight through to its own back-pressure path.
pub struct Dispatcher {
    shared: Arc<Shared>,
    batch_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                sink: RwLock::new(None),
                parsers: RwLock::new(Arc::new(ParserRegistry::new())),
                stats: DispatcherStats::default(),
                queue: Mutex::new(Vec::new()),
                wake: Condvar::new(),
                running: Mutex::new(true),
                batch: RwLock::new(None),
                paused: AtomicBool::new(false),
                on_escalate: Mutex::new(None),
            }),
            batch_thread: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.shared.stats
    }

    pub fn is_accepting(&self) -> bool {
        !self.shared.paused.load(Ordering::Acquire)
    }

    pub fn configure_sink(&self, sink: Arc<dyn Sink>) {
        *self.shared.sink.write() = Some(sink);
        self.shared.paused.store(false, Ordering::Release);
    }

    pub fn configure_parsers(&self, parsers: Arc<ParserRegistry>) {
        *self.shared.parsers.write() = parsers;
    }

    /// Subscribes to fatal escalations (`SinkFatal` or retry exhaustion).
    /// The Orchestrator is the only intended subscriber.
    pub fn on_escalate<F>(&self, callback: F)
    where
        F: Fn(WatchError) + Send + Sync + 'static,
    {
        *self.shared.on_escalate.lock() = Some(Arc::new(callback));
    }

    /// Switches the dispatcher into batched mode and starts the batch
    /// flush task: size ≥ `max_size`, `interval` elapsed, or `stop`.
    pub fn configure_batch(&self, interval: Duration, max_size: usize) {
        *self.shared.batch.write() = Some(BatchConfig { interval, max_size });

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("dispatcher-batch".to_string())
            .spawn(move || batch_flush_loop(shared))
            .expect("failed to spawn dispatcher batch thread");
        *self.batch_thread.lock() = Some(handle);
    }

    /// `handle(event) -> bool` (§4.4 step 1-4).
    pub fn handle(&self, event: RawEvent) -> bool {
        if self.shared.paused.load(Ordering::Acquire) {
            return false;
        }
        let Some(outbound) = self.build_outbound(&event) else {
            // ChangeKind::Unknown carries no wire representation; the
            // caller observes it only as a rescan trigger, never a sink write.
            return true;
        };
        self.accept(outbound)
    }

    /// Accepts an already-built `OutboundEvent`, bypassing attribute
    /// enrichment and parser invocation — used by the bulk-scan path,
    /// whose records are already fully formed (§4.5 step 4).
    pub fn handle_outbound(&self, event: OutboundEvent) -> bool {
        if self.shared.paused.load(Ordering::Acquire) {
            return false;
        }
        self.accept(event)
    }

    /// `handle_batch(events)`: the optimised path when a batch has already
    /// accumulated upstream. Builds every OutboundEvent up front, then
    /// delivers (or queues) them together, preserving insertion order.
    pub fn handle_batch(&self, events: Vec<RawEvent>) -> bool {
        if self.shared.paused.load(Ordering::Acquire) {
            return false;
        }
        let outbound: Vec<OutboundEvent> = events.iter().filter_map(|e| self.build_outbound(e)).collect();
        if outbound.is_empty() {
            return true;
        }

        if let Some(batch) = *self.shared.batch.read() {
            let mut queue = self.shared.queue.lock();
            queue.extend(outbound);
            let ready = queue.len() >= batch.max_size;
            drop(queue);
            if ready {
                self.shared.wake.notify_one();
            }
            true
        } else {
            self.deliver_with_retry(outbound)
        }
    }

    fn accept(&self, outbound: OutboundEvent) -> bool {
        if let Some(batch) = *self.shared.batch.read() {
            let mut queue = self.shared.queue.lock();
            queue.push(outbound);
            let ready = queue.len() >= batch.max_size;
            drop(queue);
            if ready {
                self.shared.wake.notify_one();
            }
            true
        } else {
            self.deliver_with_retry(vec![outbound])
        }
    }

    fn build_outbound(&self, event: &RawEvent) -> Option<OutboundEvent> {
        let event_type = OutboundEventType::from_change_kind(event.kind)?;
        let path = event.path.as_path();

        let attrs = if event.kind == ChangeKind::Deleted {
            None
        } else {
            FileAttributes::probe(path).ok()
        };

        let content = if self.shared.config.content_parsing_enabled && event.kind != ChangeKind::Deleted {
            self.extract_content(path)
        } else {
            None
        };

        Some(OutboundEvent {
            path: path.to_string_lossy().into_owned(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            extension: path
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default(),
            directory: path
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            is_directory: attrs.map(|a| a.is_directory).unwrap_or(false),
            size: attrs.map(|a| a.size_bytes),
            modified_time: attrs.map(|a| a.modified_at_unix_secs),
            old_path: event.previous_path.as_ref().map(|p| p.to_string()),
            event_type,
            content: content.as_ref().map(|(text, _)| text.clone()),
            content_extracted: content.is_some(),
            origin: crate::types::EventOrigin::Watcher,
            observed_at: crate::types::unix_now_millis(),
        })
    }

    /// Invokes the configured parser for `path`'s extension, if any,
    /// applying the §6 truncation-marker rule. Runs the parse call on a
    /// watchdog thread bounded by `DEFAULT_PARSER_TIMEOUT` — a stalled
    /// third-party parser must not block the dispatcher thread forever.
    /// Failures and timeouts are swallowed here (§4.4 step 2);
    /// `content_extracted` reflects only whether this returns `Some`.
    fn extract_content(&self, path: &Path) -> Option<(String, crate::parser::ParsedMetadata)> {
        let extension = path.extension()?.to_string_lossy().to_ascii_lowercase();
        let parsers = self.shared.parsers.read().clone();
        parsers.find_for_extension(&extension)?;

        let max_bytes = self.shared.config.max_content_length;
        let path_owned = path.to_path_buf();
        let path_for_thread = path_owned.clone();

        let (result_tx, result_rx) = std::sync::mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name("dispatcher-parser".to_string())
            .spawn(move || {
                let outcome = parsers
                    .find_for_extension(&extension)
                    .map(|parser| parser.parse(&path_for_thread, max_bytes));
                let _ = result_tx.send(outcome);
            });
        if spawned.is_err() {
            log::warn!("failed to spawn parser watchdog thread for {}", path.display());
            return None;
        }

        match result_rx.recv_timeout(crate::parser::DEFAULT_PARSER_TIMEOUT) {
            Ok(Some(Ok((text, metadata)))) => Some((truncate_with_marker(text, max_bytes), metadata)),
            Ok(Some(Err(error))) => {
                log::debug!("content parser failed for {}: {}", path.display(), error);
                None
            }
            Ok(None) => None,
            Err(_) => {
                log::warn!("{}", WatchError::ParserTimeout(path_owned));
                None
            }
        }
    }

    /// Delivers `events` to the sink, retrying `SinkRetryable` outcomes
    /// with exponential backoff (base 500 ms, max 3 attempts) before
    /// escalating. A `FatalError`, or retry exhaustion, pauses the
    /// dispatcher and notifies the escalation subscriber.
    fn deliver_with_retry(&self, events: Vec<OutboundEvent>) -> bool {
        let Some(sink) = self.shared.sink.read().clone() else {
            // No sink configured yet: treat as accepted but undeliverable,
            // matching an embedder that hasn't called `start` yet.
            return true;
        };

        let mut delay = RETRY_BASE_DELAY;
        for attempt in 0..RETRY_MAX_ATTEMPTS {
            let started = Instant::now();
            let outcome = if events.len() == 1 {
                sink.deliver(events[0].clone())
            } else {
                sink.deliver_batch(events.clone())
            };
            self.shared
                .stats
                .record_sink_call(started.elapsed().as_micros() as u64);

            match outcome {
                SinkOutcome::Ok => return true,
                SinkOutcome::RetryableError => {
                    self.shared.stats.record_retry();
                    if attempt + 1 < RETRY_MAX_ATTEMPTS {
                        std::thread::sleep(delay);
                        delay *= 2;
                        continue;
                    }
                    self.escalate(WatchError::SinkRetryable(
                        "sink did not recover within max retry attempts".to_string(),
                    ));
                    return false;
                }
                SinkOutcome::FatalError => {
                    self.escalate(WatchError::SinkFatal("sink reported a fatal error".to_string()));
                    return false;
                }
            }
        }
        false
    }

    fn escalate(&self, error: WatchError) {
        self.shared.paused.store(true, Ordering::Release);
        if let Some(callback) = self.shared.on_escalate.lock().clone() {
            callback(error);
        }
    }

    /// Flushes the queue once, delivering whatever has accumulated.
    /// Called on size/interval triggers and once more, synchronously, on
    /// `stop`.
    fn flush_batch(&self) {
        let events = std::mem::take(&mut *self.shared.queue.lock());
        if events.is_empty() {
            return;
        }
        self.deliver_with_retry(events);
    }

    pub fn stop(&self) {
        *self.shared.running.lock() = false;
        self.shared.wake.notify_all();
        if let Some(handle) = self.batch_thread.lock().take() {
            let _ = handle.join();
        }
        self.flush_batch();
    }
}

fn truncate_with_marker(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str(" ... [truncated]");
    truncated
}

fn batch_flush_loop(shared: Arc<Shared>) {
    loop {
        let mut queue_guard = shared.queue.lock();
        if !*shared.running.lock() {
            return;
        }
        let interval = shared
            .batch
            .read()
            .map(|b| b.interval)
            .unwrap_or(Duration::from_millis(300));
        let _ = shared.wake.wait_for(&mut queue_guard, interval);
        drop(queue_guard);

        if !*shared.running.lock() {
            return;
        }
        flush_queue(&shared);
    }
}

fn flush_queue(shared: &Arc<Shared>) {
    let events = std::mem::take(&mut *shared.queue.lock());
    if events.is_empty() {
        return;
    }
    let Some(sink) = shared.sink.read().clone() else {
        return;
    };
    let started = Instant::now();
    let len = events.len();
    let outcome = if len == 1 {
        sink.deliver(events.into_iter().next().unwrap())
    } else {
        sink.deliver_batch(events)
    };
    shared
        .stats
        .record_sink_call(started.elapsed().as_micros() as u64);
    match outcome {
        SinkOutcome::Ok => {}
        SinkOutcome::RetryableError => shared.stats.record_retry(),
        SinkOutcome::FatalError => shared.paused.store(true, Ordering::Release),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ChannelSink;
    use crate::types::PathKey;
    use std::sync::atomic::AtomicU32;

    fn event(path: &str, kind: ChangeKind) -> RawEvent {
        RawEvent::new(PathKey::new(path).unwrap(), kind)
    }

    #[test]
    fn unbatched_delivery_reaches_sink_immediately() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        let sink = Arc::new(ChannelSink::new());
        dispatcher.configure_sink(sink.clone());

        let accepted = dispatcher.handle(event("/a/b.txt", ChangeKind::Created));
        assert!(accepted);
        assert_eq!(sink.take_delivered().len(), 1);
    }

    #[test]
    fn deleted_events_carry_no_size() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        let sink = Arc::new(ChannelSink::new());
        dispatcher.configure_sink(sink.clone());

        dispatcher.handle(event("/a/c.txt", ChangeKind::Deleted));
        let delivered = sink.take_delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].event_type, OutboundEventType::Deleted);
        assert!(delivered[0].size.is_none());
    }

    struct FatalSink;
    impl Sink for FatalSink {
        fn deliver(&self, _event: OutboundEvent) -> SinkOutcome {
            SinkOutcome::FatalError
        }
    }

    #[test]
    fn fatal_sink_pauses_dispatcher_and_escalates() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        dispatcher.configure_sink(Arc::new(FatalSink));

        let escalations = Arc::new(AtomicU32::new(0));
        let escalations_clone = escalations.clone();
        dispatcher.on_escalate(move |_| {
            escalations_clone.fetch_add(1, Ordering::Relaxed);
        });

        let accepted = dispatcher.handle(event("/a", ChangeKind::Created));
        assert!(!accepted);
        assert!(!dispatcher.is_accepting());
        assert_eq!(escalations.load(Ordering::Relaxed), 1);

        // Once paused, further events are refused without touching the sink.
        let accepted_again = dispatcher.handle(event("/b", ChangeKind::Created));
        assert!(!accepted_again);
    }

    struct FlakySink {
        remaining_failures: std::sync::atomic::AtomicU32,
    }
    impl Sink for FlakySink {
        fn deliver(&self, _event: OutboundEvent) -> SinkOutcome {
            if self.remaining_failures.fetch_sub(1, Ordering::Relaxed) > 0 {
                SinkOutcome::RetryableError
            } else {
                SinkOutcome::Ok
            }
        }
    }

    #[test]
    fn retryable_errors_recover_within_max_attempts() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        dispatcher.configure_sink(Arc::new(FlakySink {
            remaining_failures: std::sync::atomic::AtomicU32::new(1),
        }));

        let accepted = dispatcher.handle(event("/a", ChangeKind::Created));
        assert!(accepted);
        assert!(dispatcher.is_accepting());
        assert!(dispatcher.stats().snapshot().sink_retries_total >= 1);
    }

    #[test]
    fn batched_mode_queues_until_flush() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        let sink = Arc::new(ChannelSink::new());
        dispatcher.configure_sink(sink.clone());
        dispatcher.configure_batch(Duration::from_millis(20), 100);

        dispatcher.handle(event("/a", ChangeKind::Created));
        assert!(sink.take_delivered().is_empty());

        std::thread::sleep(Duration::from_millis(80));
        dispatcher.stop();
        assert_eq!(sink.take_delivered().len(), 1);
    }

    #[test]
    fn batch_flushes_on_size_trigger() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        let sink = Arc::new(ChannelSink::new());
        dispatcher.configure_sink(sink.clone());
        dispatcher.configure_batch(Duration::from_secs(10), 2);

        dispatcher.handle(event("/a", ChangeKind::Created));
        dispatcher.handle(event("/b", ChangeKind::Created));

        std::thread::sleep(Duration::from_millis(50));
        dispatcher.stop();
        assert_eq!(sink.take_delivered().len(), 2);
    }

    #[test]
    fn truncation_marker_is_appended() {
        let text = "a".repeat(10);
        let truncated = truncate_with_marker(text, 5);
        assert_eq!(truncated, format!("{} ... [truncated]", "a".repeat(5)));
    }
}
