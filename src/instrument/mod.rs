//! Secondary measurement instrument.
//!
//! The poller drives the instrument through the synchronous [`SecondaryInstrument`]
//! trait, so the same loop runs against the SCPI driver on a real bench and
//! against [`MockInstrument`] in tests.
//!
//! - [`scpi`]: SCPI over a serial line (source/measure unit or DMM with scan card)
//! - [`mock`]: scripted instrument that records every call

pub mod mock;
pub mod scpi;

pub use mock::{InstrumentEvent, MockInstrument};
pub use scpi::ScpiInstrument;

use crate::error::AppResult;

/// Synchronous query interface of the instrument sampled by the poller.
pub trait SecondaryInstrument: Send {
    /// Human readable name for logs.
    fn name(&self) -> String;

    fn disable_output(&mut self) -> AppResult<()>;

    fn set_setpoint(&mut self, value: f64) -> AppResult<()>;

    fn enable_output(&mut self) -> AppResult<()>;

    /// One multi-channel measurement, one value per configured channel.
    fn measure(&mut self) -> AppResult<Vec<f64>>;

    /// Reconfigure to a new setpoint: output off, new value, output on.
    ///
    /// The output is left disabled if setting the value fails.
    fn apply_setpoint(&mut self, value: f64) -> AppResult<()> {
        self.disable_output()?;
        self.set_setpoint(value)?;
        self.enable_output()
    }
}

impl<T: SecondaryInstrument + ?Sized> SecondaryInstrument for Box<T> {
    fn name(&self) -> String {
        (**self).name()
    }

    fn disable_output(&mut self) -> AppResult<()> {
        (**self).disable_output()
    }

    fn set_setpoint(&mut self, value: f64) -> AppResult<()> {
        (**self).set_setpoint(value)
    }

    fn enable_output(&mut self) -> AppResult<()> {
        (**self).enable_output()
    }

    fn measure(&mut self) -> AppResult<Vec<f64>> {
        (**self).measure()
    }

    fn apply_setpoint(&mut self, value: f64) -> AppResult<()> {
        (**self).apply_setpoint(value)
    }
}
