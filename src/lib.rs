//! # Testbed DAQ Core Library
//!
//! This crate is the core library of the `testbed` controller. It drives a
//! device-under-test over a framed serial protocol, samples a secondary
//! instrument on its own thread, logs combined telemetry to an append-only
//! time series, and feeds a recent-history window back to the control step.
//! Keeping it a library lets the CLI (`main.rs`) and a future presentation
//! layer share the same control surface.
//!
//! ## Crate Structure
//!
//! - **`config`**: Typed configuration loaded with `figment` from TOML plus
//!   `TESTBED_` environment overrides. See `config::TestbedConfig`.
//! - **`error`**: The `TestbedError` enum used across the crate.
//! - **`tracing_init`**: `tracing-subscriber` setup (pretty, compact or JSON).
//! - **`protocol`**: Frame codec, reply state machine and the command channel.
//! - **`device`**: Typed client for the device-under-test.
//! - **`instrument`**: The `SecondaryInstrument` trait, a SCPI serial driver
//!   and a mock.
//! - **`poller`**: Instrument poller thread and its hand-off queue.
//! - **`telemetry`**: Telemetry record format, log file and tail reader.
//! - **`stats`**: Window statistics and the stability check.
//! - **`scheduler`**: Fixed-interval execution of tick tasks.
//! - **`orchestrator`**: The `Testbed` tick loop and session lifecycle.

pub mod config;
pub mod device;
pub mod error;
pub mod instrument;
pub mod orchestrator;
pub mod poller;
pub mod protocol;
pub mod scheduler;
pub mod stats;
pub mod telemetry;
pub mod tracing_init;

pub use config::TestbedConfig;
pub use error::{AppResult, TestbedError};
pub use orchestrator::{SerialSessionFactory, SessionFactory, Testbed, TickOutcome};
