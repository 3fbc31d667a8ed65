//! Sync scheduling state machine
//!
//! ```text
//!            begin (force / poll)
//!   ┌──────┐ ─────────────────────► ┌─────────┐
//!   │ Idle │                        │ Syncing │ ── payload handed to the sink
//!   └──────┘ ◄───────────────────── └─────────┘
//!             finish (sent / failed)
//! ```
//!
//! A sync is split in two so the sink can run without the counter being
//! borrowed: [`SyncScheduler::begin`] aggregates the window into an owned
//! [`PendingSync`] and enters `Syncing`; [`SyncScheduler::finish`] commits or
//! drops that result and is the only way back to `Idle`. A trigger while
//! `Syncing` fails immediately; nothing is queued.
//!
//! The window `[last_aggregation, now]` only moves forward after the sink
//! accepted an aggregate. An empty window is left open so sparse events
//! coalesce into one eventual report, and a failed send leaves it open so the
//! same window is aggregated again next time.
//!
//! `max_retry_attempts` is not consulted here. It rides along in the
//! [`SyncRequest`] for the sink to bound its own retries.

use crate::aggregate::aggregate;
use crate::buffer::RingBuffer;
use crate::config::CounterConfig;
use crate::error::{Error, Result};
use crate::sink::SyncRequest;
use crate::types::Timestamp;

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
}

/// What a sync trigger did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Poll found no pending sync request
    Idle,
    /// External sink is disabled
    Disabled,
    /// The aggregation interval has not elapsed yet
    NotDue,
    /// The window holds no events; it stays open
    NothingToSend,
    /// The sink accepted the window's aggregate
    Sent(SyncReport),
}

/// Summary of a delivered window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub period_start: Timestamp,
    pub period_end: Timestamp,
    pub total_events: u32,
}

/// An aggregated window waiting for the sink
///
/// Owns everything the sink needs, so it can be sent after the counter has
/// been released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSync {
    endpoint: String,
    api_key: Option<String>,
    payload: Vec<u8>,
    max_retries: u32,
    report: SyncReport,
    /// Counter session the window was taken from
    pub(crate) session: u64,
}

impl PendingSync {
    /// Request to hand to a [`NetworkSink`](crate::sink::NetworkSink)
    pub fn request(&self) -> SyncRequest<'_> {
        SyncRequest {
            endpoint: &self.endpoint,
            api_key: self.api_key.as_deref(),
            payload: &self.payload,
            max_retries: self.max_retries,
        }
    }

    pub fn report(&self) -> SyncReport {
        self.report
    }
}

/// Result of starting a sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStep {
    /// Finished without involving the sink
    Done(SyncOutcome),
    /// The window must be sent, then passed to `finish`
    Send(PendingSync),
}

/// Decides when to aggregate and forward, and tracks window boundaries
#[derive(Debug, Clone)]
pub struct SyncScheduler {
    state: SyncState,
    /// Start of the open window
    last_aggregation: Timestamp,
    last_sync: Timestamp,
    /// Raised by the event path, consumed by the driver
    sync_due: bool,
}

impl SyncScheduler {
    pub fn new(last_aggregation: Timestamp, last_sync: Timestamp) -> Self {
        Self {
            state: SyncState::Idle,
            last_aggregation,
            last_sync,
            sync_due: false,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Start of the currently open window
    pub fn last_aggregation(&self) -> Timestamp {
        self.last_aggregation
    }

    pub fn last_sync(&self) -> Timestamp {
        self.last_sync
    }

    /// Whether a full interval has passed since the window opened
    pub fn interval_elapsed(&self, now: Timestamp, interval: u64) -> bool {
        now.saturating_sub(self.last_aggregation) >= interval
    }

    /// Request a sync from the driver
    pub fn mark_due(&mut self) {
        self.sync_due = true;
    }

    pub fn is_due(&self) -> bool {
        self.sync_due
    }

    /// Consume a pending sync request
    pub fn take_due(&mut self) -> bool {
        std::mem::take(&mut self.sync_due)
    }

    /// Drop any pending sync request
    pub fn clear_due(&mut self) {
        self.sync_due = false;
    }

    /// Start one sync attempt
    ///
    /// Stays `Idle` unless a non-empty window has to be sent, in which case
    /// the scheduler is `Syncing` until [`finish`](Self::finish).
    pub fn begin(
        &mut self,
        now: Timestamp,
        buffer: &RingBuffer,
        config: &CounterConfig,
    ) -> Result<SyncStep> {
        if !config.enable_external_api {
            return Ok(SyncStep::Done(SyncOutcome::Disabled));
        }

        if self.state == SyncState::Syncing {
            return Err(Error::ApiError("sync already in progress".to_string()));
        }

        if !self.interval_elapsed(now, config.aggregation_interval) {
            return Ok(SyncStep::Done(SyncOutcome::NotDue));
        }

        let window = aggregate(buffer, config.machine_id, self.last_aggregation, now);
        if window.is_empty() {
            tracing::debug!(
                period_start = window.period_start,
                period_end = window.period_end,
                "Nothing to send, window stays open"
            );
            return Ok(SyncStep::Done(SyncOutcome::NothingToSend));
        }

        let pending = PendingSync {
            endpoint: config.api_endpoint.clone(),
            api_key: config.api_key().map(str::to_string),
            payload: window.to_payload()?,
            max_retries: config.max_retry_attempts,
            report: SyncReport {
                period_start: window.period_start,
                period_end: window.period_end,
                total_events: window.total_events,
            },
            session: 0,
        };

        self.state = SyncState::Syncing;
        Ok(SyncStep::Send(pending))
    }

    /// Apply the sink's verdict on a pending window and return to `Idle`
    ///
    /// On success the window closes at the time it was aggregated, so events
    /// recorded while the send was in flight belong to the next window.
    pub fn finish(&mut self, report: SyncReport, sent: Result<()>) -> Result<SyncOutcome> {
        self.state = SyncState::Idle;

        match sent {
            Ok(()) => {
                self.last_sync = report.period_end;
                self.last_aggregation = report.period_end;
                tracing::info!(
                    period_start = report.period_start,
                    period_end = report.period_end,
                    total_events = report.total_events,
                    "Consumption data synced successfully"
                );
                Ok(SyncOutcome::Sent(report))
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    period_start = report.period_start,
                    total_events = report.total_events,
                    "Failed to sync consumption data"
                );
                Err(e)
            }
        }
    }
}
