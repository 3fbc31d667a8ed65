//! Core domain types for vendtally
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Dispense event** | A single recorded occurrence of a category being dispensed |
//! | **Category** | 1-255 id of the kind of item dispensed; 0 is invalid |
//! | **Window** | The time range `[last_aggregation, now]` summarized by one sync |
//! | **Sync** | Summarizing the current window and forwarding it to the sink |
//! | **Lifetime total** | All-time count of accepted events, independent of the buffer |

use serde::{Deserialize, Serialize};

/// Seconds since the Unix epoch
pub type Timestamp = u64;

/// Identifier of a dispensed item kind
pub type CategoryId = u8;

/// A single dispense event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Event {
    /// When the event was recorded
    pub timestamp: Timestamp,
    /// Machine that recorded it
    pub machine_id: u32,
    /// What was dispensed (1-255)
    pub category: CategoryId,
}

impl Event {
    pub fn new(timestamp: Timestamp, machine_id: u32, category: CategoryId) -> Self {
        Self {
            timestamp,
            machine_id,
            category,
        }
    }
}

/// Snapshot of counter statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterStats {
    /// Events accepted since the counter was first created
    pub total_events: u64,
    /// Events currently held in the ring buffer
    pub buffered_events: usize,
    /// Time of the last successful sync (0 = never)
    pub last_sync: Timestamp,
    /// Start of the open aggregation window
    pub window_start: Timestamp,
    /// A sync request is waiting for the driver
    pub sync_pending: bool,
}
