//! Orchestrator: the tick loop that ties the testbed together.
//!
//! A [`Testbed`] is the control surface a presentation layer talks to. While a
//! session runs, every tick
//!
//! 1. takes at most one sample taken at the current setpoint from the poller's
//!    hand-off queue, falling back to the previous one when there is none,
//! 2. reads the device channels over the command channel,
//! 3. appends the combined record to the telemetry log,
//! 4. tails the log and computes window statistics,
//! 5. runs the control step, which advances the setpoint once the dwell time
//!    has passed and the window is stable.
//!
//! Advancing the setpoint drops every queued sample, so records at the new
//! setpoint never carry readings from the old one.
//!
//! All session resources (ports, poller thread, queue, log target) live in a
//! session value created by `start` and dropped by `stop`.

use crate::config::TestbedConfig;
use crate::device::{DeviceClient, DynStream};
use crate::error::{AppResult, TestbedError};
use crate::instrument::{ScpiInstrument, SecondaryInstrument};
use crate::poller::{InstrumentPoller, PollerControl, Sample, SampleQueue};
use crate::protocol::CommandChannel;
use crate::scheduler::{TickControl, TickTask};
use crate::stats::WindowStats;
use crate::telemetry::{ClearOutcome, TailWindow, TelemetryLog, TelemetryRecord};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Tunables of the control step, editable while a session runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlParameters {
    /// Setpoint currently requested from the instrument
    pub setpoint: f64,
    /// Increment applied on each advance
    pub setpoint_step: f64,
    /// Advancing past this value finishes the experiment
    pub setpoint_max: f64,
    /// Minimum dwell at one setpoint before it may advance
    pub transition_interval: Duration,
    /// Largest RMS deviation that counts as stable
    pub stability_threshold: f64,
    /// Record field the statistics are computed over
    pub stats_field: usize,
    /// Records in the tail window
    pub window_size: usize,
}

/// Opens the hardware a session needs.
pub trait SessionFactory {
    fn open_device(&mut self) -> AppResult<DeviceClient<DynStream>>;

    fn open_instrument(&mut self) -> AppResult<Box<dyn SecondaryInstrument>>;
}

/// Opens the serial ports named in the configuration.
pub struct SerialSessionFactory {
    config: TestbedConfig,
}

impl SerialSessionFactory {
    /// Factory for the ports named in `config`.
    pub fn new(config: TestbedConfig) -> Self {
        Self { config }
    }
}

impl SessionFactory for SerialSessionFactory {
    fn open_device(&mut self) -> AppResult<DeviceClient<DynStream>> {
        let port = CommandChannel::open_serial(&self.config.device)?.into_inner();
        Ok(DeviceClient::new(
            CommandChannel::new(Box::new(port) as DynStream),
            self.config.device.exchange_timeout(),
        ))
    }

    fn open_instrument(&mut self) -> AppResult<Box<dyn SecondaryInstrument>> {
        Ok(Box::new(ScpiInstrument::open_serial(&self.config.instrument)?))
    }
}

/// State of one tick, handed to the presentation layer.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Record appended this tick
    pub record: TelemetryRecord,
    /// Tail of the current log, including `record`
    pub window: TailWindow,
    /// Statistics over `window`, `None` when it is empty
    pub stats: Option<WindowStats>,
    /// Setpoint in force during the tick
    pub setpoint: f64,
    /// Index of the current log target
    pub step: usize,
}

/// Result of one [`Testbed::tick`].
#[derive(Debug)]
pub enum TickOutcome {
    /// No session is running.
    Idle,
    /// A record was appended; the setpoint is unchanged.
    Recorded(Snapshot),
    /// The tick failed; the session keeps running and the next tick retries.
    Failed {
        /// Why the tick failed
        error: TestbedError,
        /// Failed ticks in a row, this one included
        consecutive: u32,
    },
    /// The window was stable and a new setpoint was requested.
    Advanced {
        /// Setpoint now requested from the poller
        setpoint: f64,
        /// State of the tick that triggered the advance
        snapshot: Snapshot,
    },
    /// The next setpoint would exceed the maximum; the session was stopped.
    Finished {
        /// State of the final tick
        snapshot: Snapshot,
    },
    /// Too many consecutive failures; the session was stopped.
    Halted {
        /// Failure of the last tick
        error: TestbedError,
    },
}

/// Point-in-time view of a running session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    /// Index of the current log target
    pub step: usize,
    /// Setpoint in force
    pub setpoint: f64,
    /// Current log target
    pub log_path: PathBuf,
    /// Device exchanges attempted
    pub exchanges: u64,
    /// Device exchanges that failed
    pub exchange_failures: u64,
    /// Samples the poller has published
    pub samples_published: u64,
    /// Failed ticks since the last success
    pub consecutive_failures: u32,
}

struct Session {
    device: DeviceClient<DynStream>,
    poller: InstrumentPoller,
    control: Arc<PollerControl>,
    queue: Arc<SampleQueue>,
    log: TelemetryLog,
    /// Start of the dwell at the current setpoint
    reference: Instant,
    step: usize,
    last_sample: Option<Sample>,
    consecutive_failures: u32,
}

impl Session {
    /// Forget every sample taken before the latest setpoint request.
    fn discard_samples(&mut self) {
        let dropped = self.queue.clear();
        self.last_sample = None;
        debug!(dropped, "Samples from the previous setpoint discarded");
    }

    fn shutdown(mut self) {
        self.control.pause();
        let dropped = self.queue.clear();
        self.poller.shutdown();
        debug!(dropped, "Session resources released");
    }
}

/// Static settings taken from the configuration at construction.
#[derive(Debug, Clone)]
struct Layout {
    device_channels: Vec<u8>,
    sample_width: usize,
    log_dir: PathBuf,
    archive_dir: PathBuf,
    prefix: String,
    precision: usize,
    record_len_hint: usize,
    setpoint_min: f64,
    setpoint_max: f64,
    idle_interval: Duration,
    queue_capacity: usize,
    max_consecutive_failures: u32,
}

impl Layout {
    fn record_width(&self) -> usize {
        self.device_channels.len() + self.sample_width
    }

    fn log_path(&self, step: usize) -> PathBuf {
        self.log_dir.join(format!("{}_{:03}.csv", self.prefix, step))
    }

    fn archive_label(&self, setpoint: f64) -> String {
        format!("{}_setpoint_{:.3}", self.prefix, setpoint)
    }

    fn open_log(&self, step: usize) -> TelemetryLog {
        TelemetryLog::new(self.log_path(step), self.precision)
            .with_record_len_hint(self.record_len_hint)
    }
}

/// Control surface of the testbed: one session at a time.
pub struct Testbed<F> {
    factory: F,
    layout: Layout,
    params: ControlParameters,
    session: Option<Session>,
    /// Log target of the running or most recent session
    log_path: PathBuf,
}

impl<F: SessionFactory> Testbed<F> {
    /// Validate `config` and prepare an idle testbed.
    pub fn new(config: &TestbedConfig, factory: F) -> AppResult<Self> {
        config.validate().map_err(TestbedError::Configuration)?;

        let layout = Layout {
            device_channels: config.device.channels.clone(),
            sample_width: config.instrument.channels.len(),
            log_dir: config.telemetry.directory.clone(),
            archive_dir: config.telemetry.archive_directory.clone(),
            prefix: config.telemetry.file_prefix.clone(),
            precision: config.telemetry.precision,
            record_len_hint: config.telemetry.record_len_hint,
            setpoint_min: config.control.setpoint_min,
            setpoint_max: config.control.setpoint_max,
            idle_interval: Duration::from_millis(config.instrument.idle_interval_ms),
            queue_capacity: config.instrument.queue_capacity,
            max_consecutive_failures: config.control.max_consecutive_failures,
        };
        let log_path = layout.log_path(0);

        Ok(Self {
            factory,
            layout,
            params: config.control_parameters(),
            session: None,
            log_path,
        })
    }

    /// Whether a session is running.
    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Control parameters in force.
    pub fn parameters(&self) -> &ControlParameters {
        &self.params
    }

    /// Log target of the running or most recent session.
    pub fn current_log_path(&self) -> &Path {
        &self.log_path
    }

    /// Status of the running session, if any.
    pub fn status(&self) -> Option<SessionStatus> {
        self.session.as_ref().map(|s| {
            let channel = s.device.channel().stats();
            SessionStatus {
                step: s.step,
                setpoint: self.params.setpoint,
                log_path: s.log.path().to_path_buf(),
                exchanges: channel.exchanges,
                exchange_failures: channel.failures,
                samples_published: s.poller.stats().samples_published.load(Ordering::Relaxed),
                consecutive_failures: s.consecutive_failures,
            }
        })
    }

    /// Open the hardware and start polling at the current setpoint.
    pub fn start(&mut self, now: Instant) -> AppResult<()> {
        if self.session.is_some() {
            return Err(TestbedError::SessionAlreadyRunning);
        }

        let device = self.factory.open_device()?;
        let instrument = self.factory.open_instrument()?;

        let control = Arc::new(PollerControl::new(
            self.layout.setpoint_min..=self.layout.setpoint_max,
        ));
        control.request_setpoint(self.params.setpoint)?;
        let queue = Arc::new(SampleQueue::new(self.layout.queue_capacity));

        let instrument_name = instrument.name();
        let poller = InstrumentPoller::spawn(
            instrument,
            Arc::clone(&control),
            Arc::clone(&queue),
            self.layout.idle_interval,
        )?;
        control.resume();

        let log = self.layout.open_log(0);
        self.log_path = log.path().to_path_buf();
        info!(
            instrument = %instrument_name,
            setpoint = self.params.setpoint,
            log = %self.log_path.display(),
            "Session started"
        );

        self.session = Some(Session {
            device,
            poller,
            control,
            queue,
            log,
            reference: now,
            step: 0,
            last_sample: None,
            consecutive_failures: 0,
        });
        Ok(())
    }

    /// Pause and stop the poller, drop pending samples and close the ports.
    pub fn stop(&mut self) -> AppResult<()> {
        let session = self.session.take().ok_or(TestbedError::SessionNotRunning)?;
        let step = session.step;
        session.shutdown();
        info!(step, "Session stopped");
        Ok(())
    }

    /// Delete the current log file.
    pub fn clear_log(&mut self) -> AppResult<ClearOutcome> {
        TelemetryLog::new(&self.log_path, self.layout.precision).clear()
    }

    /// Replace the control parameters.
    ///
    /// Parameters the running configuration cannot honour are rejected
    /// without side effects. A changed setpoint is forwarded to a running
    /// poller and samples taken at the old setpoint are dropped.
    pub fn update_parameters(&mut self, params: ControlParameters) -> AppResult<()> {
        self.check_parameters(&params)?;

        if let Some(session) = self.session.as_mut() {
            if params.setpoint != self.params.setpoint {
                session.control.request_setpoint(params.setpoint)?;
                session.discard_samples();
            }
        }
        debug!(?params, "Control parameters updated");
        self.params = params;
        Ok(())
    }

    fn check_parameters(&self, params: &ControlParameters) -> AppResult<()> {
        let (min, max) = (self.layout.setpoint_min, self.layout.setpoint_max);
        if !(min..=max).contains(&params.setpoint) {
            return Err(TestbedError::OutOfRange {
                value: params.setpoint,
                min,
                max,
            });
        }
        if params.setpoint_max > max {
            return Err(TestbedError::OutOfRange {
                value: params.setpoint_max,
                min,
                max,
            });
        }
        if params.setpoint_step.is_nan() || params.setpoint_step <= 0.0 {
            return Err(TestbedError::Configuration(format!(
                "setpoint_step must be positive, got {}",
                params.setpoint_step
            )));
        }
        if params.window_size == 0 {
            return Err(TestbedError::Configuration(
                "window_size must be at least 1".to_string(),
            ));
        }
        let width = self.layout.record_width();
        if params.stats_field >= width {
            return Err(TestbedError::Configuration(format!(
                "stats_field {} beyond record width {}",
                params.stats_field, width
            )));
        }
        Ok(())
    }

    /// Run one tick at `now`.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        let Some(session) = self.session.as_mut() else {
            return TickOutcome::Idle;
        };

        let result = match record_tick(session, &self.layout, &self.params) {
            Ok(snapshot) => self.control_step(now, snapshot),
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) => {
                if let Some(session) = self.session.as_mut() {
                    session.consecutive_failures = 0;
                }
                outcome
            }
            Err(error) => self.tick_failed(error),
        }
    }

    fn tick_failed(&mut self, error: TestbedError) -> TickOutcome {
        let Some(session) = self.session.as_mut() else {
            return TickOutcome::Idle;
        };
        session.consecutive_failures += 1;
        let consecutive = session.consecutive_failures;
        let limit = self.layout.max_consecutive_failures;

        if limit > 0 && consecutive >= limit {
            error!(error = %error, consecutive, "Too many consecutive failures, halting session");
            if let Some(session) = self.session.take() {
                session.shutdown();
            }
            return TickOutcome::Halted { error };
        }

        warn!(error = %error, consecutive, "Tick failed");
        TickOutcome::Failed { error, consecutive }
    }

    fn control_step(&mut self, now: Instant, snapshot: Snapshot) -> AppResult<TickOutcome> {
        let Some(session) = self.session.as_mut() else {
            return Ok(TickOutcome::Idle);
        };

        let dwell = now.saturating_duration_since(session.reference);
        let stable = snapshot
            .stats
            .is_some_and(|s| s.is_stable(self.params.stability_threshold));
        // The dwell must strictly exceed the transition interval
        if dwell <= self.params.transition_interval || !stable {
            return Ok(TickOutcome::Recorded(snapshot));
        }

        let next = self.params.setpoint + self.params.setpoint_step;
        let finished = next > self.params.setpoint_max;
        if !finished {
            let range = session.control.setpoint_range();
            if !range.contains(&next) {
                return Err(TestbedError::OutOfRange {
                    value: next,
                    min: *range.start(),
                    max: *range.end(),
                });
            }
        }

        session.log.archive(
            &self.layout.archive_dir,
            &self.layout.archive_label(self.params.setpoint),
            &snapshot.window.records,
        )?;

        if finished {
            info!(
                setpoint = self.params.setpoint,
                next, "Setpoint range exhausted, finishing"
            );
            if let Some(session) = self.session.take() {
                session.shutdown();
            }
            return Ok(TickOutcome::Finished { snapshot });
        }

        session.control.request_setpoint(next)?;
        session.discard_samples();
        session.reference = now;
        session.step += 1;
        session.log = self.layout.open_log(session.step);
        self.log_path = session.log.path().to_path_buf();
        self.params.setpoint = next;

        info!(
            setpoint = next,
            step = session.step,
            log = %self.log_path.display(),
            "Setpoint advanced"
        );
        Ok(TickOutcome::Advanced {
            setpoint: next,
            snapshot,
        })
    }
}

/// Steps 1 to 4 of a tick: gather readings, append, tail, summarise.
fn record_tick(
    session: &mut Session,
    layout: &Layout,
    params: &ControlParameters,
) -> AppResult<Snapshot> {
    // A sample measured before the current setpoint was applied is stale
    loop {
        match session.queue.try_pop() {
            Ok(sample) if sample.taken_at(params.setpoint) => {
                session.last_sample = Some(sample);
                break;
            }
            Ok(sample) => trace!(setpoint = ?sample.setpoint, "Stale sample dropped"),
            Err(TestbedError::QueueEmpty) => break,
            Err(e) => return Err(e),
        }
    }

    let mut fields = session.device.read_channels(&layout.device_channels)?;
    match &session.last_sample {
        Some(sample) => fields.extend(&sample.values),
        None => fields.extend(std::iter::repeat(f64::NAN).take(layout.sample_width)),
    }

    let record = TelemetryRecord::now(fields);
    session.log.append(&record)?;

    let window = session.log.tail(params.window_size)?;
    let stats = WindowStats::compute(&window.records, params.stats_field);

    Ok(Snapshot {
        record,
        window,
        stats,
        setpoint: params.setpoint,
        step: session.step,
    })
}

impl<F: SessionFactory> TickTask for Testbed<F> {
    fn tick(&mut self, now: Instant) -> TickControl {
        match Testbed::tick(self, now) {
            TickOutcome::Idle | TickOutcome::Finished { .. } | TickOutcome::Halted { .. } => {
                TickControl::Stop
            }
            _ => TickControl::Continue,
        }
    }
}

impl<F> Drop for Testbed<F> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.shutdown();
        }
    }
}
