//! Cross-platform filesystem-change observation.
//!
//! Watches a set of root directories for changes, coalesces bursts of
//! events per path, enriches and batches them for an outbound sink, and
//! separately walks an OS content index to enumerate pre-existing files.
//! An [`Orchestrator`] owns the whole pipeline's lifecycle; everything
//! else in this crate is a capability set it wires together, not a class
//! hierarchy an embedder is expected to subclass.
//!
//! Transport, process lifecycle, CLI, and the exact index-backend
//! syscalls are deliberately out of scope — this crate defines and
//! drives the trait boundaries around them.

pub mod cancel;
pub mod checkpoint;
pub mod coalescer;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod index_query;
pub mod orchestrator;
pub mod parser;
pub mod sink;
pub mod stats;
pub mod types;
pub mod watcher;

pub use coalescer::{CoalescerConfig, EventCoalescer, SubmitOutcome};
pub use config::WatchConfig;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{Result, WatchError};
pub use filter::PathFilter;
pub use orchestrator::{Orchestrator, OrchestratorState};
pub use parser::{ContentParser, ParserRegistry, PlainTextParser};
pub use sink::{ChannelSink, Sink, SinkOutcome};
pub use types::{ChangeKind, Checkpoint, OutboundEvent, OutboundEventType, PathKey, RawEvent};
pub use watcher::{create_native_watcher, NativeWatcher, WatchRoot};
