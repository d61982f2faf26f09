//! Per-path coalescing debouncer (§4.3).

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::stats::CoalescerStats;
use crate::types::{ChangeKind, PathKey, PendingEntry, RawEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    pub debounce_delay: Duration,
    pub max_pending_events: usize,
    pub coalescing_enabled: bool,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            debounce_delay: Duration::from_millis(100),
            max_pending_events: 1000,
            coalescing_enabled: true,
        }
    }
}

/// Returns `true` once the event has been handed off successfully. `false`
/// means the downstream consumer (the Dispatcher) is not currently
/// accepting work; the coalescer re-queues the event with a short retry
/// delay instead of dropping it, which is how sink back-pressure
/// eventually propagates into `submit` returning `Rejected` (§4.4).
type ExpiredCallback = dyn Fn(RawEvent) -> bool + Send + Sync;

struct Shared {
    pending: Mutex<HashMap<PathKey, PendingEntry>>,
    wake: Condvar,
    running: Mutex<bool>,
    config: CoalescerConfig,
    stats: CoalescerStats,
    on_expired: Mutex<Option<Arc<ExpiredCallback>>>,
}

/// Transforms a high-rate stream of `RawEvent` into a low-rate stream of
/// at-most-one-event-per-path-per-window.
pub struct EventCoalescer {
    shared: Arc<Shared>,
    flush_thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventCoalescer {
    pub fn new(config: CoalescerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                wake: Condvar::new(),
                running: Mutex::new(false),
                config,
                stats: CoalescerStats::default(),
                on_expired: Mutex::new(None),
            }),
            flush_thread: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> &CoalescerStats {
        &self.shared.stats
    }

    /// Launches the flush task. `on_expired` is invoked once per expired
    /// entry, always outside the pending-map lock.
    pub fn start<F>(&self, on_expired: F)
    where
        F: Fn(RawEvent) -> bool + Send + Sync + 'static,
    {
        *self.shared.on_expired.lock() = Some(Arc::new(on_expired));
        *self.shared.running.lock() = true;

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("coalescer-flush".to_string())
            .spawn(move || flush_loop(shared))
            .expect("failed to spawn coalescer flush thread");
        *self.flush_thread.lock() = Some(handle);
    }

    /// `submit(RawEvent) -> Accepted|Rejected`. Rejected is the only
    /// outcome for events refused outright (back-pressure, §4.3 step 2).
    pub fn submit(&self, event: RawEvent) -> SubmitOutcome {
        if !self.shared.config.coalescing_enabled {
            self.shared.stats.submits_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            if let Some(callback) = self.shared.on_expired.lock().clone() {
                callback(event);
            }
            return SubmitOutcome::Accepted;
        }

        let mut pending = self.shared.pending.lock();
        let key = event.path.clone();
        let already_pending = pending.contains_key(&key);

        if !already_pending && pending.len() >= self.shared.config.max_pending_events {
            self.shared
                .stats
                .rejections_total
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return SubmitOutcome::Rejected;
        }

        self.shared
            .stats
            .submits_total
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let scheduled_at = Instant::now() + self.shared.config.debounce_delay;
        if let Some(existing) = pending.get_mut(&key) {
            merge_event(existing, event, scheduled_at);
            self.shared
                .stats
                .merges_total
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        } else {
            pending.insert(
                key,
                PendingEntry {
                    event,
                    scheduled_at,
                    merged_count: 0,
                },
            );
        }
        self.shared
            .stats
            .pending_size
            .store(pending.len() as u64, std::sync::atomic::Ordering::Relaxed);
        drop(pending);
        self.shared.wake.notify_one();
        SubmitOutcome::Accepted
    }

    /// Idempotent: the second call observes the flush thread already
    /// stopped and returns immediately without re-draining.
    pub fn stop(&self) {
        *self.shared.running.lock() = false;
        self.shared.wake.notify_all();
        if let Some(handle) = self.flush_thread.lock().take() {
            let _ = handle.join();
        }
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

/// Applies the §4.3 step-4 merge rule in place.
fn merge_event(existing: &mut PendingEntry, incoming: RawEvent, scheduled_at: Instant) {
    if incoming.kind == ChangeKind::Deleted {
        existing.event = incoming;
    } else if existing.event.kind == ChangeKind::Deleted {
        // A Modified arriving after a Deleted within the same window is dropped.
    } else {
        existing.event = incoming;
    }
    existing.scheduled_at = scheduled_at;
    existing.merged_count += 1;
}

fn flush_loop(shared: Arc<Shared>) {
    loop {
        let mut pending = shared.pending.lock();
        if !*shared.running.lock() {
            // Drain everything once, synchronously, before exiting.
            let expired: Vec<RawEvent> = pending.drain().map(|(_, entry)| entry.event).collect();
            drop(pending);
            emit_all(&shared, expired);
            return;
        }

        let now = Instant::now();
        let next_deadline = pending.values().map(|entry| entry.scheduled_at).min();

        let ready_keys: Vec<PathKey> = pending
            .iter()
            .filter(|(_, entry)| entry.scheduled_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let expired: Vec<RawEvent> = ready_keys
            .into_iter()
            .filter_map(|key| pending.remove(&key))
            .map(|entry| entry.event)
            .collect();
        shared
            .stats
            .pending_size
            .store(pending.len() as u64, std::sync::atomic::Ordering::Relaxed);

        if expired.is_empty() {
            match next_deadline {
                Some(deadline) if deadline > now => {
                    let timeout = deadline - now;
                    let _ = shared.wake.wait_for(&mut pending, timeout);
                }
                Some(_) => {
                    // Deadline already passed concurrently with this
                    // iteration; loop again immediately.
                }
                None => {
                    shared.wake.wait(&mut pending);
                }
            }
            continue;
        }
        drop(pending);
        emit_all(&shared, expired);
    }
}

fn emit_all(shared: &Arc<Shared>, events: Vec<RawEvent>) {
    const RETRY_DELAY: Duration = Duration::from_millis(50);

    let Some(callback) = shared.on_expired.lock().clone() else {
        return;
    };
    let mut requeue = Vec::new();
    for event in events {
        if !callback(event.clone()) {
            requeue.push(event);
        }
    }
    if requeue.is_empty() {
        return;
    }
    let scheduled_at = Instant::now() + RETRY_DELAY;
    let mut pending = shared.pending.lock();
    for event in requeue {
        pending
            .entry(event.path.clone())
            .or_insert_with(|| PendingEntry {
                event,
                scheduled_at,
                merged_count: 0,
            });
    }
    shared
        .stats
        .pending_size
        .store(pending.len() as u64, std::sync::atomic::Ordering::Relaxed);
    drop(pending);
    shared.wake.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn event(path: &str, kind: ChangeKind) -> RawEvent {
        RawEvent::new(PathKey::new(path).unwrap(), kind)
    }

    #[test]
    fn rapid_modifications_coalesce_to_one_modified_event() {
        let coalescer = EventCoalescer::new(CoalescerConfig {
            debounce_delay: Duration::from_millis(50),
            ..CoalescerConfig::default()
        });
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = received.clone();
        coalescer.start(move |event| {
            received_clone.lock().unwrap().push(event);
            true
        });

        for _ in 0..30 {
            coalescer.submit(event("/a/b.txt", ChangeKind::Modified));
        }

        std::thread::sleep(Duration::from_millis(150));
        coalescer.stop();

        let events = received.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Modified);
    }

    #[test]
    fn create_modify_delete_coalesces_to_deleted() {
        let coalescer = EventCoalescer::new(CoalescerConfig {
            debounce_delay: Duration::from_millis(50),
            ..CoalescerConfig::default()
        });
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = received.clone();
        coalescer.start(move |event| {
            received_clone.lock().unwrap().push(event);
            true
        });

        coalescer.submit(event("/a/c.txt", ChangeKind::Created));
        coalescer.submit(event("/a/c.txt", ChangeKind::Modified));
        coalescer.submit(event("/a/c.txt", ChangeKind::Deleted));

        std::thread::sleep(Duration::from_millis(150));
        coalescer.stop();

        let events = received.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Deleted);
    }

    #[test]
    fn modified_after_deleted_in_same_window_is_dropped() {
        let coalescer = EventCoalescer::new(CoalescerConfig {
            debounce_delay: Duration::from_millis(50),
            ..CoalescerConfig::default()
        });
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = received.clone();
        coalescer.start(move |event| {
            received_clone.lock().unwrap().push(event);
            true
        });

        coalescer.submit(event("/a/d.txt", ChangeKind::Deleted));
        coalescer.submit(event("/a/d.txt", ChangeKind::Modified));

        std::thread::sleep(Duration::from_millis(150));
        coalescer.stop();

        let events = received.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Deleted);
    }

    #[test]
    fn queue_overflow_rejects_new_path() {
        let coalescer = EventCoalescer::new(CoalescerConfig {
            debounce_delay: Duration::from_secs(10),
            max_pending_events: 2,
            ..CoalescerConfig::default()
        });
        coalescer.start(|_| true);

        assert_eq!(
            coalescer.submit(event("/a", ChangeKind::Created)),
            SubmitOutcome::Accepted
        );
        assert_eq!(
            coalescer.submit(event("/b", ChangeKind::Created)),
            SubmitOutcome::Accepted
        );
        assert_eq!(
            coalescer.submit(event("/c", ChangeKind::Created)),
            SubmitOutcome::Rejected
        );
        assert_eq!(coalescer.pending_len(), 2);
        coalescer.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let coalescer = EventCoalescer::new(CoalescerConfig {
            debounce_delay: Duration::from_secs(10),
            ..CoalescerConfig::default()
        });
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_clone = count.clone();
        coalescer.start(move |_| {
            count_clone.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            true
        });
        coalescer.submit(event("/a", ChangeKind::Created));
        coalescer.stop();
        coalescer.stop();
        assert_eq!(count.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
