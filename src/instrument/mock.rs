//! A mock instrument that records every call and serves scripted readings.
//!
//! Clones share state, so a test keeps one clone for inspection and hands the
//! other to the poller.

use super::SecondaryInstrument;
use crate::error::{AppResult, TestbedError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// One call observed by the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentEvent {
    /// `disable_output`
    OutputOff,
    /// `set_setpoint` with this value
    Setpoint(f64),
    /// `enable_output`
    OutputOn,
    /// `measure`
    Measure,
}

#[derive(Debug, Default)]
struct MockState {
    events: Vec<InstrumentEvent>,
    scripted: VecDeque<AppResult<Vec<f64>>>,
    setpoint: f64,
    fail_setpoint: bool,
}

/// Scriptable in-memory [`SecondaryInstrument`].
#[derive(Debug, Clone)]
pub struct MockInstrument {
    channels: usize,
    state: Arc<Mutex<MockState>>,
}

impl MockInstrument {
    /// Mock reporting `channels` values per measurement.
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Queue a reading returned by the next `measure` call.
    pub fn push_reading(&self, reading: Vec<f64>) {
        self.state.lock().scripted.push_back(Ok(reading));
    }

    /// Make the next `measure` call fail.
    pub fn push_failure(&self, message: &str) {
        self.state
            .lock()
            .scripted
            .push_back(Err(TestbedError::Instrument(message.to_string())));
    }

    /// Make setpoint writes fail until cleared.
    pub fn fail_setpoints(&self, fail: bool) {
        self.state.lock().fail_setpoint = fail;
    }

    /// Every call observed so far, in order.
    pub fn events(&self) -> Vec<InstrumentEvent> {
        self.state.lock().events.clone()
    }

    /// Setpoints written so far, in order.
    pub fn applied_setpoints(&self) -> Vec<f64> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                InstrumentEvent::Setpoint(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    /// Number of `measure` calls so far.
    pub fn measure_count(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| **e == InstrumentEvent::Measure)
            .count()
    }
}

impl SecondaryInstrument for MockInstrument {
    fn name(&self) -> String {
        "Mock Instrument".to_string()
    }

    fn disable_output(&mut self) -> AppResult<()> {
        self.state.lock().events.push(InstrumentEvent::OutputOff);
        Ok(())
    }

    fn set_setpoint(&mut self, value: f64) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.fail_setpoint {
            return Err(TestbedError::Instrument("setpoint rejected".to_string()));
        }
        state.events.push(InstrumentEvent::Setpoint(value));
        state.setpoint = value;
        Ok(())
    }

    fn enable_output(&mut self) -> AppResult<()> {
        self.state.lock().events.push(InstrumentEvent::OutputOn);
        Ok(())
    }

    /// Scripted readings first; afterwards every channel reads the current setpoint.
    fn measure(&mut self) -> AppResult<Vec<f64>> {
        let mut state = self.state.lock();
        state.events.push(InstrumentEvent::Measure);
        match state.scripted.pop_front() {
            Some(result) => result,
            None => Ok(vec![state.setpoint; self.channels]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_setpoint_records_reconfiguration_sequence() {
        let mut instrument = MockInstrument::new(2);
        instrument.apply_setpoint(1.5).unwrap();

        assert_eq!(
            instrument.events(),
            vec![
                InstrumentEvent::OutputOff,
                InstrumentEvent::Setpoint(1.5),
                InstrumentEvent::OutputOn
            ]
        );
        assert_eq!(instrument.measure().unwrap(), vec![1.5, 1.5]);
    }

    #[test]
    fn scripted_results_come_first() {
        let observer = MockInstrument::new(2);
        let mut instrument = observer.clone();
        observer.push_reading(vec![1.0, 2.0]);
        observer.push_failure("overload");

        assert_eq!(instrument.measure().unwrap(), vec![1.0, 2.0]);
        assert!(instrument.measure().is_err());
        assert_eq!(instrument.measure().unwrap(), vec![0.0, 0.0]);
        assert_eq!(observer.measure_count(), 3);
    }

    #[test]
    fn failed_setpoint_leaves_output_off() {
        let mut instrument = MockInstrument::new(1);
        instrument.fail_setpoints(true);

        assert!(instrument.apply_setpoint(3.0).is_err());
        assert_eq!(instrument.events(), vec![InstrumentEvent::OutputOff]);
    }
}
