//! Background sync driver
//!
//! Consumes the "sync due" requests raised by the event path. The driver
//! owns a thread that periodically polls the shared counter. The counter
//! lock is held only to aggregate the window and to commit the result; the
//! send runs unlocked, so `record_event` on other threads is never held up
//! by the network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::counter::{send_pending, Counter};
use crate::error::{Error, Result};
use crate::scheduler::{SyncOutcome, SyncStep};
use crate::sink::NetworkSink;
use crate::store::BlobStore;

/// Upper bound on how long `stop` waits for the thread to notice
const STOP_CHECK: Duration = Duration::from_millis(50);

/// Counter shared between the event path and the driver
pub type SharedCounter<C, S, N> = Arc<Mutex<Counter<C, S, N>>>;

/// Periodic poller running on its own thread
pub struct SyncDriver {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SyncDriver {
    /// Start polling `counter` every `poll_interval`
    pub fn spawn<C, S, N>(counter: SharedCounter<C, S, N>, poll_interval: Duration) -> Result<Self>
    where
        C: Clock + Send + 'static,
        S: BlobStore + Send + 'static,
        N: NetworkSink + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();

        let handle = thread::Builder::new()
            .name("vendtally-sync".to_string())
            .spawn(move || run_loop(counter, poll_interval, r))?;

        tracing::info!(poll_ms = poll_interval.as_millis() as u64, "Sync driver started");

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Sync driver thread panicked");
            }
            tracing::info!("Sync driver stopped");
        }
    }
}

impl Drop for SyncDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop<C, S, N>(counter: SharedCounter<C, S, N>, poll_interval: Duration, running: Arc<AtomicBool>)
where
    C: Clock,
    S: BlobStore,
    N: NetworkSink,
{
    let mut iteration = 0u64;

    while running.load(Ordering::SeqCst) {
        // Sleep in short slices so stop() is not held up by a long interval
        let deadline = Instant::now() + poll_interval;
        while running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(std::cmp::min(deadline - now, STOP_CHECK));
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }

        iteration += 1;
        let Some(result) = poll_once(&counter) else {
            tracing::error!("Counter lock poisoned, sync driver exiting");
            running.store(false, Ordering::SeqCst);
            break;
        };

        match result {
            Ok(SyncOutcome::Idle) => {}
            Ok(outcome) => tracing::debug!(iteration, ?outcome, "Sync driver iteration"),
            // Deinitialized underneath us; keep waiting in case it comes back
            Err(Error::InvalidConfig(_)) => {}
            Err(e) => tracing::warn!(iteration, error = %e, "Sync driver iteration failed"),
        }
    }
}

/// One poll with the counter unlocked during the send
///
/// `None` when the counter lock is poisoned.
fn poll_once<C, S, N>(counter: &SharedCounter<C, S, N>) -> Option<Result<SyncOutcome>>
where
    C: Clock,
    S: BlobStore,
    N: NetworkSink,
{
    let (step, sink) = {
        let mut guard = counter.lock().ok()?;
        let step = guard.begin_poll();
        (step, guard.sink().clone())
    };

    let pending = match step {
        Ok(SyncStep::Send(pending)) => pending,
        Ok(SyncStep::Done(outcome)) => return Some(Ok(outcome)),
        Err(e) => return Some(Err(e)),
    };

    let sent = send_pending(&sink, &pending);
    let mut guard = counter.lock().ok()?;
    Some(guard.complete_sync(pending, sent))
}
