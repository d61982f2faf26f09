//! Outbound sink abstraction (§6).
//!
//! The transport that actually ships events to the consumer process is
//! out of scope; this crate only defines and drives the trait boundary.

use crate::types::OutboundEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    Ok,
    RetryableError,
    FatalError,
}

/// The outbound interface to the transport.
///
/// Implementors are expected to be cheap to clone (an `Arc`-wrapped
/// channel handle, typically) since the Dispatcher holds one per batch
/// task.
pub trait Sink: Send + Sync {
    fn deliver(&self, event: OutboundEvent) -> SinkOutcome;

    /// Default batch delivery is sequential `deliver` calls, stopping (and
    /// reporting the first non-`Ok` outcome) at the first failure — this
    /// matches the documented "flush order within a batch is insertion
    /// order" contract without requiring every sink to special-case
    /// batches.
    fn deliver_batch(&self, events: Vec<OutboundEvent>) -> SinkOutcome {
        for event in events {
            match self.deliver(event) {
                SinkOutcome::Ok => continue,
                other => return other,
            }
        }
        SinkOutcome::Ok
    }
}

/// An in-memory sink for tests and for embedders without a transport yet.
#[derive(Default)]
pub struct ChannelSink {
    delivered: parking_lot::Mutex<Vec<OutboundEvent>>,
}

impl ChannelSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_delivered(&self) -> Vec<OutboundEvent> {
        std::mem::take(&mut self.delivered.lock())
    }
}

impl Sink for ChannelSink {
    fn deliver(&self, event: OutboundEvent) -> SinkOutcome {
        self.delivered.lock().push(event);
        SinkOutcome::Ok
    }
}
