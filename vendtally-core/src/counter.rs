//! Counter lifecycle and public operations
//!
//! A [`Counter`] is an explicitly owned handle over the ring buffer, the
//! sync scheduler and the host collaborators (clock, blob store, sink).
//! Several independent counters can live in one process.
//!
//! ## Concurrency contract
//!
//! Every mutating operation takes `&mut self`, so access is serialized by
//! whoever owns the counter. To share one across threads, wrap it in a
//! `Mutex` (see [`SyncDriver`](crate::driver::SyncDriver)); the counter does
//! no locking of its own.
//!
//! ## Event path vs. sync path
//!
//! [`Counter::record_event`] never touches the network. When the window is
//! due it only raises a flag. The flag is consumed by [`Counter::poll`], or,
//! for a counter shared behind a lock, by the split form
//! [`begin_poll`](Counter::begin_poll) / [`complete_sync`](Counter::complete_sync)
//! so the send itself runs with the lock released.

use std::sync::{Arc, Mutex, PoisonError};

use crate::buffer::RingBuffer;
use crate::clock::Clock;
use crate::config::{CounterConfig, MAX_RING_BUFFER_SIZE};
use crate::error::{Error, Result};
use crate::scheduler::{PendingSync, SyncOutcome, SyncScheduler, SyncStep};
use crate::sink::NetworkSink;
use crate::store::{BlobStore, PersistedState, SNAPSHOT_VERSION};
use crate::types::{CategoryId, CounterStats, Event, Timestamp};

/// State that only exists while the counter is initialized
struct ActiveState {
    config: CounterConfig,
    /// Lifetime count of accepted events, never decremented
    total_events: u64,
    buffer: RingBuffer,
    scheduler: SyncScheduler,
    /// Distinguishes this init from earlier ones
    session: u64,
}

impl ActiveState {
    fn snapshot(&self) -> PersistedState {
        PersistedState {
            version: SNAPSHOT_VERSION,
            config: self.config.clone(),
            total_events: self.total_events,
            last_aggregation: self.scheduler.last_aggregation(),
            last_sync: self.scheduler.last_sync(),
        }
    }
}

/// Sink shared between a counter and whoever sends on its behalf
pub type SharedSink<N> = Arc<Mutex<N>>;

/// Anonymous dispense counter
pub struct Counter<C, S, N> {
    clock: C,
    store: S,
    sink: SharedSink<N>,
    active: Option<ActiveState>,
    sessions: u64,
}

fn not_initialized() -> Error {
    Error::InvalidConfig("counter is not initialized".to_string())
}

fn persist<S: BlobStore>(store: &mut S, active: &ActiveState) -> Result<()> {
    let blob = active.snapshot().encode()?;
    store.write(&blob)
}

/// Hand a pending window to the sink
///
/// Only the sink is locked; the counter stays free for the event path.
pub fn send_pending<N: NetworkSink>(sink: &Mutex<N>, pending: &PendingSync) -> Result<()> {
    // Sink state is delivery stats only; a poisoned lock is still usable
    let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
    sink.send(&pending.request())
}

impl<C, S, N> Counter<C, S, N>
where
    C: Clock,
    S: BlobStore,
    N: NetworkSink,
{
    /// Create an uninitialized counter over the given collaborators
    pub fn new(clock: C, store: S, sink: N) -> Self {
        Self {
            clock,
            store,
            sink: Arc::new(Mutex::new(sink)),
            active: None,
            sessions: 0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.active.is_some()
    }

    /// Initialize the counter
    ///
    /// A supplied config is validated and takes precedence over any persisted
    /// one; `None` adopts the persisted config, or the defaults as-is when
    /// there is none. Prior counters are restored from the blob store when
    /// present and well-formed, otherwise counting starts from zero with a
    /// window opening now.
    /// Calling this on an initialized counter does nothing.
    pub fn init(&mut self, config: Option<CounterConfig>) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }

        let explicit = config.is_some();
        let requested = match config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => CounterConfig::default(),
        };

        let now = self.clock.now();
        let (config, total_events, last_aggregation, last_sync) =
            match self.restore(explicit.then_some(requested.machine_id)) {
                Some(state) => {
                    let config = if explicit { requested } else { state.config };
                    tracing::info!(
                        total_events = state.total_events,
                        window_start = state.last_aggregation,
                        last_sync = state.last_sync,
                        "Restored counter state"
                    );
                    (
                        config,
                        state.total_events,
                        state.last_aggregation,
                        state.last_sync,
                    )
                }
                None => (requested, 0, now, 0),
            };

        let buffer = RingBuffer::with_capacity(config.ring_buffer_size as usize)?;

        tracing::info!(
            machine_id = config.machine_id,
            ring_buffer_size = config.ring_buffer_size,
            aggregation_interval = config.aggregation_interval,
            external_api = config.enable_external_api,
            "Consumption counter initialized"
        );

        self.sessions += 1;
        self.active = Some(ActiveState {
            config,
            total_events,
            buffer,
            scheduler: SyncScheduler::new(last_aggregation, last_sync),
            session: self.sessions,
        });
        Ok(())
    }

    /// Load the persisted state if it is usable
    ///
    /// With an explicit machine id, state recorded by another machine is
    /// discarded.
    fn restore(&mut self, machine_id: Option<u32>) -> Option<PersistedState> {
        let blob = match self.store.read() {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                tracing::info!("No persisted counter state, starting fresh");
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read persisted state, starting fresh");
                return None;
            }
        };

        let state = match PersistedState::decode(&blob) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable persisted state");
                return None;
            }
        };

        let capacity = state.config.ring_buffer_size;
        if capacity == 0 || capacity > MAX_RING_BUFFER_SIZE {
            tracing::warn!(capacity, "Discarding persisted state with invalid capacity");
            return None;
        }

        if let Some(requested) = machine_id {
            if state.config.machine_id != requested {
                tracing::warn!(
                    persisted = state.config.machine_id,
                    requested,
                    "Discarding persisted state from another machine"
                );
                return None;
            }
        }

        Some(state)
    }

    /// Shut the counter down
    ///
    /// Attempts one final sync when the sink is enabled, persists the state
    /// and releases the buffer. Sync and persist failures are logged, not
    /// returned. Does nothing on an uninitialized counter.
    pub fn deinit(&mut self) -> Result<()> {
        self.close(true)
    }

    /// Shut the counter down, optionally without the final sync
    ///
    /// For hosts that just attempted a sync themselves and do not want a
    /// failing sink retried again on the way out.
    pub fn close(&mut self, final_sync: bool) -> Result<()> {
        let Some(active) = self.active.as_ref() else {
            return Ok(());
        };

        if final_sync && active.config.enable_external_api {
            match self.sync_now(false) {
                Ok(outcome) => tracing::info!(?outcome, "Final sync on shutdown"),
                Err(e) => tracing::warn!(error = %e, "Final sync on shutdown failed"),
            }
        }

        if let Err(e) = self.checkpoint() {
            tracing::warn!(error = %e, "Failed to persist counter state on shutdown");
        }

        self.active = None;
        tracing::info!("Consumption counter deinitialized");
        Ok(())
    }

    /// Record one dispense event
    ///
    /// Fast path: validates, appends to the ring buffer and bumps the
    /// lifetime counter. If the window is due, a sync request is raised for
    /// the next [`poll`](Self::poll).
    pub fn record_event(&mut self, machine_id: u32, category: CategoryId) -> Result<()> {
        let now = self.clock.now();
        let active = self.active.as_mut().ok_or_else(not_initialized)?;

        if machine_id != active.config.machine_id {
            return Err(Error::InvalidParameter(format!(
                "machine id {} does not match configured {}",
                machine_id, active.config.machine_id
            )));
        }
        if category == 0 {
            return Err(Error::InvalidParameter(
                "category id must be nonzero".to_string(),
            ));
        }

        active.buffer.append(Event::new(now, machine_id, category));
        active.total_events += 1;

        if active.config.enable_external_api
            && !active.scheduler.is_due()
            && active
                .scheduler
                .interval_elapsed(now, active.config.aggregation_interval)
        {
            active.scheduler.mark_due();
            tracing::debug!(now, "Aggregation window due, sync requested");
        }

        Ok(())
    }

    /// Run a pending sync request, if any
    ///
    /// Meant to be called periodically from a driver loop. A failed attempt
    /// is not re-queued; the next recorded event raises a new request.
    pub fn poll(&mut self) -> Result<SyncOutcome> {
        self.sync_now(true)
    }

    /// Attempt a sync immediately
    ///
    /// Still subject to the aggregation interval; a window that is not due
    /// yet returns [`SyncOutcome::NotDue`] without touching the sink.
    pub fn force_sync(&mut self) -> Result<SyncOutcome> {
        self.sync_now(false)
    }

    /// First half of [`poll`](Self::poll)
    ///
    /// Consumes a pending sync request and aggregates the window. A
    /// [`SyncStep::Send`] must be delivered (see [`send_pending`]) and then
    /// passed to [`complete_sync`](Self::complete_sync); until then further
    /// triggers fail with "sync already in progress".
    pub fn begin_poll(&mut self) -> Result<SyncStep> {
        let active = self.active.as_mut().ok_or_else(not_initialized)?;
        if !active.scheduler.take_due() {
            return Ok(SyncStep::Done(SyncOutcome::Idle));
        }
        self.begin_sync()
    }

    /// First half of [`force_sync`](Self::force_sync)
    pub fn begin_sync(&mut self) -> Result<SyncStep> {
        let now = self.clock.now();
        let active = self.active.as_mut().ok_or_else(not_initialized)?;

        let step = active.scheduler.begin(now, &active.buffer, &active.config)?;
        Ok(match step {
            SyncStep::Send(mut pending) => {
                pending.session = active.session;
                SyncStep::Send(pending)
            }
            done => done,
        })
    }

    /// Second half of a sync: commit or fail back to idle
    ///
    /// A result from before the last re-initialization is discarded.
    pub fn complete_sync(
        &mut self,
        pending: PendingSync,
        sent: Result<()>,
    ) -> Result<SyncOutcome> {
        let active = self.active.as_mut().ok_or_else(not_initialized)?;
        if pending.session != active.session {
            tracing::warn!(
                period_start = pending.report().period_start,
                "Discarding sync result from a previous counter session"
            );
            return Err(Error::ApiError(
                "sync started before the counter was reinitialized".to_string(),
            ));
        }

        let outcome = active.scheduler.finish(pending.report(), sent)?;
        if let Err(e) = persist(&mut self.store, active) {
            tracing::warn!(error = %e, "Failed to persist counter state after sync");
        }
        Ok(outcome)
    }

    fn sync_now(&mut self, only_if_due: bool) -> Result<SyncOutcome> {
        let step = if only_if_due {
            self.begin_poll()?
        } else {
            self.begin_sync()?
        };

        match step {
            SyncStep::Done(outcome) => Ok(outcome),
            SyncStep::Send(pending) => {
                let sent = send_pending(&self.sink, &pending);
                self.complete_sync(pending, sent)
            }
        }
    }

    /// Current statistics
    pub fn get_stats(&self) -> Result<CounterStats> {
        let active = self.active.as_ref().ok_or_else(not_initialized)?;
        Ok(CounterStats {
            total_events: active.total_events,
            buffered_events: active.buffer.len(),
            last_sync: active.scheduler.last_sync(),
            window_start: active.scheduler.last_aggregation(),
            sync_pending: active.scheduler.is_due(),
        })
    }

    /// Events currently buffered, oldest first
    pub fn buffered_events(&self) -> Result<Vec<Event>> {
        let active = self.active.as_ref().ok_or_else(not_initialized)?;
        Ok(active.buffer.iter().copied().collect())
    }

    /// Replace the active configuration
    ///
    /// The ring buffer capacity and machine id are fixed at init; changing
    /// either is rejected with [`Error::InvalidParameter`].
    pub fn update_config(&mut self, config: CounterConfig) -> Result<()> {
        let active = self.active.as_mut().ok_or_else(not_initialized)?;
        config.validate()?;

        if config.ring_buffer_size != active.config.ring_buffer_size {
            return Err(Error::InvalidParameter(format!(
                "ring_buffer_size is fixed at {} while running",
                active.config.ring_buffer_size
            )));
        }
        if config.machine_id != active.config.machine_id {
            return Err(Error::InvalidParameter(format!(
                "machine_id is fixed at {} while running",
                active.config.machine_id
            )));
        }

        if !config.enable_external_api {
            active.scheduler.clear_due();
        }
        active.config = config;
        tracing::info!(
            aggregation_interval = active.config.aggregation_interval,
            external_api = active.config.enable_external_api,
            "Counter configuration updated"
        );

        if let Err(e) = persist(&mut self.store, active) {
            tracing::warn!(error = %e, "Failed to persist counter state after config update");
        }
        Ok(())
    }

    /// Active configuration
    pub fn get_config(&self) -> Result<CounterConfig> {
        let active = self.active.as_ref().ok_or_else(not_initialized)?;
        Ok(active.config.clone())
    }

    /// Persist the current state now
    ///
    /// The counter already persists after each sync, config change and on
    /// shutdown; hosts that want the lifetime total to survive a crash can
    /// call this on their own cadence.
    pub fn checkpoint(&mut self) -> Result<()> {
        let active = self.active.as_ref().ok_or_else(not_initialized)?;
        persist(&mut self.store, active)
    }

    /// Boot notification from the host
    pub fn on_boot(&self) {
        tracing::info!(initialized = self.is_initialized(), "Consumption module boot event");
    }

    /// Shutdown notification from the host
    pub fn on_shutdown(&self) {
        tracing::info!(
            initialized = self.is_initialized(),
            "Consumption module shutdown event"
        );
    }

    /// Host-specific error report, logged for diagnostics
    pub fn on_error(&self, error_code: u16) {
        tracing::error!(error_code, "Consumption module error: {}", error_code);
    }

    /// Start of the currently open window
    pub fn window_start(&self) -> Result<Timestamp> {
        let active = self.active.as_ref().ok_or_else(not_initialized)?;
        Ok(active.scheduler.last_aggregation())
    }

    /// Shared handle to the sink
    pub fn sink(&self) -> &SharedSink<N> {
        &self.sink
    }
}
