//! Resource-accounting counters (§5).
//!
//! Every field is a bare atomic updated with relaxed arithmetic; there is
//! no aggregate lock. This mirrors the teacher's `IndexBuildProgress`
//! pattern of exposing live counters by reference rather than snapshotting
//! behind a mutex.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct WatcherStats {
    pub events_received: AtomicU64,
    pub events_dropped: AtomicU64,
}

impl WatcherStats {
    pub fn record_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        self.events_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WatcherStatsSnapshot {
        WatcherStatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherStatsSnapshot {
    pub events_received: u64,
    pub events_dropped: u64,
}

#[derive(Debug, Default)]
pub struct CoalescerStats {
    pub pending_size: AtomicU64,
    pub submits_total: AtomicU64,
    pub merges_total: AtomicU64,
    pub rejections_total: AtomicU64,
}

impl CoalescerStats {
    pub fn snapshot(&self) -> CoalescerStatsSnapshot {
        let submits = self.submits_total.load(Ordering::Relaxed);
        let merges = self.merges_total.load(Ordering::Relaxed);
        CoalescerStatsSnapshot {
            pending_size: self.pending_size.load(Ordering::Relaxed),
            submits_total: submits,
            // Coalescing ratio: fraction of submits that were absorbed into
            // an existing pending entry rather than starting a new one.
            coalescing_ratio: if submits == 0 {
                0.0
            } else {
                merges as f64 / submits as f64
            },
            rejections_total: self.rejections_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoalescerStatsSnapshot {
    pub pending_size: u64,
    pub submits_total: u64,
    pub coalescing_ratio: f64,
    pub rejections_total: u64,
}

#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub sink_latency_micros_total: AtomicU64,
    pub sink_calls_total: AtomicU64,
    pub sink_retries_total: AtomicU64,
}

impl DispatcherStats {
    pub fn record_sink_call(&self, latency_micros: u64) {
        self.sink_calls_total.fetch_add(1, Ordering::Relaxed);
        self.sink_latency_micros_total
            .fetch_add(latency_micros, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.sink_retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        let calls = self.sink_calls_total.load(Ordering::Relaxed);
        let latency_total = self.sink_latency_micros_total.load(Ordering::Relaxed);
        DispatcherStatsSnapshot {
            sink_calls_total: calls,
            average_sink_latency_micros: if calls == 0 { 0 } else { latency_total / calls },
            sink_retries_total: self.sink_retries_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStatsSnapshot {
    pub sink_calls_total: u64,
    pub average_sink_latency_micros: u64,
    pub sink_retries_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalescing_ratio_is_zero_with_no_submits() {
        let stats = CoalescerStats::default();
        assert_eq!(stats.snapshot().coalescing_ratio, 0.0);
    }

    #[test]
    fn coalescing_ratio_reflects_merges() {
        let stats = CoalescerStats::default();
        stats.submits_total.fetch_add(4, Ordering::Relaxed);
        stats.merges_total.fetch_add(3, Ordering::Relaxed);
        assert_eq!(stats.snapshot().coalescing_ratio, 0.75);
    }

    #[test]
    fn dispatcher_average_latency() {
        let stats = DispatcherStats::default();
        stats.record_sink_call(100);
        stats.record_sink_call(300);
        assert_eq!(stats.snapshot().average_sink_latency_micros, 200);
    }
}
