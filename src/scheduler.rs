//! Fixed-interval task execution.
//!
//! Work that runs periodically implements [`TickTask`] and receives the tick
//! instant as an argument, so it never reads the clock itself. Production code
//! drives it with [`FixedInterval::run`]; tests call [`FixedInterval::run_ticks`]
//! with synthetic instants and no timer at all.

use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Whether the runner should keep ticking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    /// Wait for the next tick
    Continue,
    /// Return from the runner
    Stop,
}

/// Work run once per tick.
pub trait TickTask {
    fn tick(&mut self, now: Instant) -> TickControl;
}

impl<F> TickTask for F
where
    F: FnMut(Instant) -> TickControl,
{
    fn tick(&mut self, now: Instant) -> TickControl {
        self(now)
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The task returned [`TickControl::Stop`].
    Completed,
    /// Ctrl-C was received.
    Interrupted,
}

/// Runs a [`TickTask`] at a fixed period.
pub struct FixedInterval;

impl FixedInterval {
    /// Tick `task` every `interval` until it stops or ctrl-c arrives.
    ///
    /// The first tick fires immediately. A tick that overruns delays the
    /// following ones instead of bursting to catch up. The task runs on the
    /// runtime thread, so it must not hold it longer than one exchange timeout.
    pub async fn run<T: TickTask + ?Sized>(task: &mut T, interval: Duration) -> RunExit {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        let mut ticks = 0u64;
        loop {
            tokio::select! {
                at = ticker.tick() => {
                    ticks += 1;
                    if task.tick(at.into_std()) == TickControl::Stop {
                        info!(ticks, "Task finished");
                        return RunExit::Completed;
                    }
                }
                _ = &mut shutdown => {
                    info!(ticks, "Interrupted, stopping tick loop");
                    return RunExit::Interrupted;
                }
            }
        }
    }

    /// Drive `task` by hand for at most `count` ticks spaced `interval` apart,
    /// starting at `start`. Returns the number of ticks executed.
    pub fn run_ticks<T: TickTask + ?Sized>(
        task: &mut T,
        start: Instant,
        interval: Duration,
        count: usize,
    ) -> usize {
        for i in 0..count {
            let now = start + interval * i as u32;
            if task.tick(now) == TickControl::Stop {
                debug!(ticks = i + 1, "Task stopped during manual run");
                return i + 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_ticks_use_synthetic_instants() {
        let start = Instant::now();
        let mut seen = Vec::new();
        let mut task = |now: Instant| {
            seen.push(now.duration_since(start));
            TickControl::Continue
        };

        let ran = FixedInterval::run_ticks(&mut task, start, Duration::from_secs(1), 3);
        assert_eq!(ran, 3);
        assert_eq!(
            seen,
            vec![
                Duration::ZERO,
                Duration::from_secs(1),
                Duration::from_secs(2)
            ]
        );
    }

    #[test]
    fn manual_run_stops_early() {
        let mut calls = 0;
        let mut task = |_now: Instant| {
            calls += 1;
            if calls == 2 {
                TickControl::Stop
            } else {
                TickControl::Continue
            }
        };
        let ran = FixedInterval::run_ticks(&mut task, Instant::now(), Duration::from_millis(10), 10);
        assert_eq!(ran, 2);
    }

    #[tokio::test]
    async fn timer_run_ends_when_task_stops() {
        let mut calls = 0;
        let mut task = |_now: Instant| {
            calls += 1;
            if calls == 3 {
                TickControl::Stop
            } else {
                TickControl::Continue
            }
        };

        let exit = FixedInterval::run(&mut task, Duration::from_millis(5)).await;
        assert_eq!(exit, RunExit::Completed);
        assert_eq!(calls, 3);
    }
}
