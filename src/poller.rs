//! Instrument poller: a producer thread feeding the orchestrator.
//!
//! # Architecture
//!
//! ```text
//!  orchestrator thread                      poller thread
//!  -------------------                      -------------
//!  PollerControl::request_setpoint ──┐
//!  PollerControl::pause / resume ────┼──>  PollerWorker::iterate
//!                                    │        apply pending setpoint
//!                                    │        measure
//!  SampleQueue::try_pop  <───────────┴────── SampleQueue::push
//!  SampleQueue::clear
//! ```
//!
//! The two sides share only the [`SampleQueue`] and the [`PollerControl`]
//! signals. Control signals are atomics: the orchestrator writes them and the
//! poller reads them, so neither side ever blocks on the other.

use crate::error::{AppResult, TestbedError};
use crate::instrument::SecondaryInstrument;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// One multi-channel reading from the instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// One value per configured instrument channel
    pub values: Vec<f64>,
    /// Setpoint in force when the reading was taken, if any was applied
    pub setpoint: Option<f64>,
    /// When the reading was taken
    pub captured_at: Instant,
}

impl Sample {
    /// Reading taken now, with no setpoint attached.
    pub fn new(values: Vec<f64>) -> Self {
        Self {
            values,
            setpoint: None,
            captured_at: Instant::now(),
        }
    }

    /// Attach the setpoint in force when the reading was taken.
    pub fn at_setpoint(mut self, setpoint: f64) -> Self {
        self.setpoint = Some(setpoint);
        self
    }

    /// Whether the reading was taken at `setpoint`.
    pub fn taken_at(&self, setpoint: f64) -> bool {
        self.setpoint == Some(setpoint)
    }
}

// =============================================================================
// Hand-off queue
// =============================================================================

#[derive(Debug)]
struct QueueInner {
    samples: VecDeque<Sample>,
    closed: bool,
}

/// Bounded, thread-safe hand-off queue.
///
/// Every operation holds the same lock for its whole duration, so `clear`
/// is atomic with respect to concurrent pushes: a racing sample is either
/// removed whole or survives whole.
#[derive(Debug)]
pub struct SampleQueue {
    inner: Mutex<QueueInner>,
    not_full: Condvar,
    capacity: usize,
}

impl SampleQueue {
    /// Queue holding at most `capacity` samples (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                samples: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Maximum number of queued samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block until there is room, then enqueue.
    ///
    /// Returns the sample back if the queue has been closed.
    pub fn push(&self, sample: Sample) -> Result<(), Sample> {
        let mut inner = self.inner.lock();
        while inner.samples.len() >= self.capacity && !inner.closed {
            self.not_full.wait(&mut inner);
        }
        if inner.closed {
            return Err(sample);
        }
        inner.samples.push_back(sample);
        Ok(())
    }

    /// Enqueue without waiting. Returns the sample back if full or closed.
    pub fn try_push(&self, sample: Sample) -> Result<(), Sample> {
        let mut inner = self.inner.lock();
        if inner.closed || inner.samples.len() >= self.capacity {
            return Err(sample);
        }
        inner.samples.push_back(sample);
        Ok(())
    }

    /// Non-blocking pop of the oldest sample.
    pub fn try_pop(&self) -> AppResult<Sample> {
        let sample = self
            .inner
            .lock()
            .samples
            .pop_front()
            .ok_or(TestbedError::QueueEmpty)?;
        self.not_full.notify_one();
        Ok(sample)
    }

    /// Drop every queued sample. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut inner = self.inner.lock();
            let dropped = inner.samples.len();
            inner.samples.clear();
            dropped
        };
        self.not_full.notify_all();
        dropped
    }

    /// Wake blocked producers and refuse further pushes.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.not_full.notify_all();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of queued samples.
    pub fn len(&self) -> usize {
        self.inner.lock().samples.len()
    }

    /// Whether no sample is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Control signals
// =============================================================================

/// Bit pattern meaning "no request". A NaN, which never passes range validation.
const NO_SETPOINT: u64 = u64::MAX;

/// Single-slot setpoint request: last write wins, taking it empties the slot.
#[derive(Debug)]
pub struct PendingSetpoint(AtomicU64);

impl Default for PendingSetpoint {
    fn default() -> Self {
        Self(AtomicU64::new(NO_SETPOINT))
    }
}

impl PendingSetpoint {
    /// Replace any pending request.
    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    /// Remove and return the pending request.
    pub fn take(&self) -> Option<f64> {
        Self::decode(self.0.swap(NO_SETPOINT, Ordering::AcqRel))
    }

    /// Pending request, left in place.
    pub fn peek(&self) -> Option<f64> {
        Self::decode(self.0.load(Ordering::Acquire))
    }

    /// Put a value back unless a newer request arrived meanwhile.
    fn restore(&self, value: f64) {
        let _ = self.0.compare_exchange(
            NO_SETPOINT,
            value.to_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn decode(bits: u64) -> Option<f64> {
        (bits != NO_SETPOINT).then(|| f64::from_bits(bits))
    }
}

/// Signals written by the orchestrator and read by the poller.
#[derive(Debug)]
pub struct PollerControl {
    paused: AtomicBool,
    pending: PendingSetpoint,
    range: RangeInclusive<f64>,
}

impl PollerControl {
    /// New control block, paused, accepting setpoints within `range`.
    pub fn new(range: RangeInclusive<f64>) -> Self {
        Self {
            paused: AtomicBool::new(true),
            pending: PendingSetpoint::default(),
            range,
        }
    }

    /// Stop the poller touching the instrument after its current iteration.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Let the poller run.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// Whether the poller is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Setpoints `request_setpoint` accepts.
    pub fn setpoint_range(&self) -> &RangeInclusive<f64> {
        &self.range
    }

    /// Ask the poller to apply `value` on its next iteration.
    ///
    /// Out-of-range values are rejected and leave any pending request untouched.
    pub fn request_setpoint(&self, value: f64) -> AppResult<()> {
        if !self.range.contains(&value) {
            return Err(TestbedError::OutOfRange {
                value,
                min: *self.range.start(),
                max: *self.range.end(),
            });
        }
        self.pending.store(value);
        debug!(setpoint = value, "Setpoint requested");
        Ok(())
    }

    /// Request not yet applied by the poller.
    pub fn pending_setpoint(&self) -> Option<f64> {
        self.pending.peek()
    }
}

// =============================================================================
// Worker
// =============================================================================

/// What one loop iteration did.
#[derive(Debug, Clone, PartialEq)]
pub enum Iteration {
    /// Paused; nothing touched.
    Idle,
    /// A sample was handed to the queue.
    Published,
    /// Applying the pending setpoint failed; it stays pending.
    SetpointFailed,
    /// The measurement failed; logged and skipped.
    MeasureFailed,
    /// The queue is closed; the worker should exit.
    Closed,
}

/// Counters kept by the worker.
#[derive(Debug, Default)]
pub struct PollerStats {
    /// Iterations run while not paused
    pub iterations: AtomicU64,
    /// Samples handed to the queue
    pub samples_published: AtomicU64,
    /// Failed setpoint writes and measurements
    pub failures: AtomicU64,
    /// Setpoints written to the instrument
    pub setpoints_applied: AtomicU64,
}

/// Loop body of the poller, separate from the thread so tests can step it.
pub struct PollerWorker<I> {
    instrument: I,
    control: Arc<PollerControl>,
    queue: Arc<SampleQueue>,
    stats: Arc<PollerStats>,
    /// Last setpoint the instrument accepted
    applied: Option<f64>,
}

impl<I: SecondaryInstrument> PollerWorker<I> {
    /// Worker driving `instrument` and publishing into `queue`.
    pub fn new(instrument: I, control: Arc<PollerControl>, queue: Arc<SampleQueue>) -> Self {
        Self {
            instrument,
            control,
            queue,
            stats: Arc::new(PollerStats::default()),
            applied: None,
        }
    }

    /// Shared handle on the counters.
    pub fn stats(&self) -> Arc<PollerStats> {
        Arc::clone(&self.stats)
    }

    /// The instrument being polled.
    pub fn instrument(&self) -> &I {
        &self.instrument
    }

    /// Run one iteration: apply a pending setpoint, measure, publish.
    pub fn iterate(&mut self) -> Iteration {
        if self.control.is_paused() {
            return Iteration::Idle;
        }
        self.stats.iterations.fetch_add(1, Ordering::Relaxed);

        if let Some(setpoint) = self.control.pending.take() {
            match self.instrument.apply_setpoint(setpoint) {
                Ok(()) => {
                    self.applied = Some(setpoint);
                    self.stats.setpoints_applied.fetch_add(1, Ordering::Relaxed);
                    info!(setpoint, instrument = %self.instrument.name(), "Setpoint applied");
                }
                Err(e) => {
                    // Retry next iteration unless superseded
                    self.control.pending.restore(setpoint);
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(setpoint, error = %e, "Failed to apply setpoint");
                    return Iteration::SetpointFailed;
                }
            }
        }

        let values = match self.instrument.measure() {
            Ok(values) => values,
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, instrument = %self.instrument.name(), "Measurement failed");
                return Iteration::MeasureFailed;
            }
        };

        let sample = match self.applied {
            Some(setpoint) => Sample::new(values).at_setpoint(setpoint),
            None => Sample::new(values),
        };
        match self.queue.push(sample) {
            Ok(()) => {
                self.stats.samples_published.fetch_add(1, Ordering::Relaxed);
                Iteration::Published
            }
            Err(_) => Iteration::Closed,
        }
    }
}

// =============================================================================
// Thread handle
// =============================================================================

/// Running poller thread. Dropping it stops and joins the thread.
pub struct InstrumentPoller {
    running: Arc<AtomicBool>,
    control: Arc<PollerControl>,
    queue: Arc<SampleQueue>,
    stats: Arc<PollerStats>,
    handle: Option<JoinHandle<()>>,
}

impl InstrumentPoller {
    /// Start the poller thread. It begins in whatever pause state `control` holds.
    pub fn spawn<I>(
        instrument: I,
        control: Arc<PollerControl>,
        queue: Arc<SampleQueue>,
        idle_interval: Duration,
    ) -> AppResult<Self>
    where
        I: SecondaryInstrument + 'static,
    {
        let mut worker = PollerWorker::new(instrument, Arc::clone(&control), Arc::clone(&queue));
        let stats = worker.stats();
        let running = Arc::new(AtomicBool::new(true));

        let handle = thread::Builder::new()
            .name("instrument-poller".to_string())
            .spawn({
                let running = Arc::clone(&running);
                move || {
                    info!(instrument = %worker.instrument().name(), "Poller started");
                    while running.load(Ordering::Acquire) {
                        match worker.iterate() {
                            Iteration::Idle | Iteration::SetpointFailed | Iteration::MeasureFailed => {
                                thread::sleep(idle_interval)
                            }
                            Iteration::Published => {}
                            Iteration::Closed => break,
                        }
                    }
                    debug!("Poller thread exiting");
                }
            })?;

        Ok(Self {
            running,
            control,
            queue,
            stats,
            handle: Some(handle),
        })
    }

    /// Control block shared with the orchestrator.
    pub fn control(&self) -> &Arc<PollerControl> {
        &self.control
    }

    /// Queue the thread publishes into.
    pub fn queue(&self) -> &Arc<SampleQueue> {
        &self.queue
    }

    /// Counters updated by the thread.
    pub fn stats(&self) -> &PollerStats {
        &self.stats
    }

    /// Whether the thread is still alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.running.store(false, Ordering::Release);
        self.control.pause();
        self.queue.close();

        if let Err(e) = handle.join() {
            error!("Poller thread panicked: {:?}", e);
        }
        info!(
            iterations = self.stats.iterations.load(Ordering::Relaxed),
            samples = self.stats.samples_published.load(Ordering::Relaxed),
            failures = self.stats.failures.load(Ordering::Relaxed),
            "Poller stopped"
        );
    }
}

impl Drop for InstrumentPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
