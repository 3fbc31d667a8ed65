//! # vendtally-core
//!
//! Core library for vendtally - an anonymous dispense counter for vending
//! machines and similar embedded devices.
//!
//! This library provides:
//! - A fixed-capacity ring buffer of recent dispense events
//! - Windowed per-category aggregation
//! - A sync scheduler that forwards aggregates to an external sink
//! - Counter lifecycle with state persistence across restarts
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! ```text
//! record_event ──► RingBuffer ──► lifetime total ──► "sync due" flag
//!                                                        │
//!                  SyncDriver / poll() ◄─────────────────┘
//!                        │
//!                        ▼
//!          aggregate([window_start, now]) ──► NetworkSink
//!                                                 │ success
//!                                                 ▼
//!                                   window advances, BlobStore persisted
//! ```
//!
//! Host collaborators are traits: [`Clock`], [`BlobStore`] and
//! [`NetworkSink`]. Logging goes through `tracing`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use vendtally_core::{Counter, CounterConfig, ManualClock, MemoryBlobStore, NullSink};
//!
//! let mut counter = Counter::new(ManualClock::new(1_700_000_000), MemoryBlobStore::new(), NullSink);
//! counter.init(Some(CounterConfig::for_machine(12345))).expect("valid config");
//!
//! counter.record_event(12345, 7).expect("event accepted");
//! let stats = counter.get_stats().expect("initialized");
//! assert_eq!(stats.total_events, 1);
//!
//! counter.deinit().expect("shutdown");
//! ```

// Re-export commonly used items at the crate root
pub use aggregate::{aggregate, Aggregate};
pub use buffer::RingBuffer;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, CounterConfig};
pub use counter::{send_pending, Counter, SharedSink};
pub use driver::SyncDriver;
pub use error::{Error, Result};
pub use scheduler::{PendingSync, SyncOutcome, SyncReport, SyncScheduler, SyncState, SyncStep};
pub use sink::{HttpSink, NetworkSink, NullSink, SyncRequest};
pub use store::{BlobStore, MemoryBlobStore, PersistedState, SqliteBlobStore};
pub use types::*;

// Public modules
pub mod aggregate;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod counter;
pub mod driver;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod sink;
pub mod store;
pub mod types;

/// Library version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
