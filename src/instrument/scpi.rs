//! SCPI instrument on a serial line.
//!
//! Commands are plain ASCII terminated by a configurable line terminator.
//! Queries read until the response terminator (`\n`) or the read timeout.
//!
//! | Operation | Command |
//! |---|---|
//! | disable output | `OUTP OFF` |
//! | set setpoint | `VOLT <value>` |
//! | enable output | `OUTP ON` |
//! | measure | `MEAS:VOLT:DC? (@101,102)` → `+1.2E-03,+3.4E-03` |

use super::SecondaryInstrument;
use crate::config::InstrumentConfig;
use crate::error::{AppResult, TestbedError};
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const RESPONSE_TERMINATOR: char = '\n';

/// Instrument driven by ASCII SCPI commands over `P`.
pub struct ScpiInstrument<P> {
    port: P,
    name: String,
    terminator: String,
    channels: Vec<u16>,
    timeout: Duration,
}

impl ScpiInstrument<Box<dyn SerialPort>> {
    /// Open the instrument's serial port.
    pub fn open_serial(config: &InstrumentConfig) -> AppResult<Self> {
        let port = serialport::new(&config.port, config.baud_rate)
            .timeout(Duration::from_millis(config.read_timeout_ms.min(50)))
            .open()?;
        debug!(port = %config.port, baud = config.baud_rate, "Opened instrument serial port");
        Ok(Self::new(port, config))
    }
}

impl<P: Read + Write + Send> ScpiInstrument<P> {
    /// Driver talking over `port` with the settings in `config`.
    pub fn new(port: P, config: &InstrumentConfig) -> Self {
        Self {
            port,
            name: format!("SCPI@{}", config.port),
            terminator: config.terminator.clone(),
            channels: config.channels.clone(),
            timeout: Duration::from_millis(config.read_timeout_ms),
        }
    }

    /// Give the port back.
    pub fn into_inner(self) -> P {
        self.port
    }

    fn write_line(&mut self, command: &str) -> AppResult<()> {
        let line = format!("{}{}", command, self.terminator);
        trace!(instrument = %self.name, "Sending '{}'", line.escape_default());
        self.port
            .write_all(line.as_bytes())
            .map_err(|e| TestbedError::Instrument(format!("write '{}' failed: {}", command, e)))?;
        self.port.flush()?;
        Ok(())
    }

    /// Send a query and read one terminated response line.
    pub fn query(&mut self, command: &str) -> AppResult<String> {
        self.write_line(command)?;

        let mut buffer = [0u8; 256];
        let mut response = String::new();
        let start = Instant::now();

        while start.elapsed() < self.timeout {
            match self.port.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    response.push_str(&String::from_utf8_lossy(&buffer[..n]));
                    if response.contains(RESPONSE_TERMINATOR) {
                        trace!(instrument = %self.name, "Received '{}'", response.escape_default());
                        return Ok(response.trim().to_string());
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Err(TestbedError::Instrument(format!(
            "no terminated response to '{}' within {:?} (partial: '{}')",
            command,
            self.timeout,
            response.escape_default()
        )))
    }

    fn scan_list(&self) -> String {
        let channels: Vec<String> = self.channels.iter().map(u16::to_string).collect();
        format!("(@{})", channels.join(","))
    }
}

/// Parse a comma separated list of readings.
pub fn parse_readings(response: &str, expected: usize) -> AppResult<Vec<f64>> {
    let readings = response
        .split(',')
        .map(|field| {
            field.trim().parse::<f64>().map_err(|e| {
                TestbedError::Instrument(format!("unparseable reading '{}': {}", field, e))
            })
        })
        .collect::<AppResult<Vec<f64>>>()?;

    if readings.len() != expected {
        return Err(TestbedError::Instrument(format!(
            "expected {} readings, got {} in '{}'",
            expected,
            readings.len(),
            response
        )));
    }
    Ok(readings)
}

impl<P: Read + Write + Send> SecondaryInstrument for ScpiInstrument<P> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn disable_output(&mut self) -> AppResult<()> {
        self.write_line("OUTP OFF")
    }

    fn set_setpoint(&mut self, value: f64) -> AppResult<()> {
        self.write_line(&format!("VOLT {:.6}", value))
    }

    fn enable_output(&mut self) -> AppResult<()> {
        self.write_line("OUTP ON")
    }

    fn measure(&mut self) -> AppResult<Vec<f64>> {
        let command = format!("MEAS:VOLT:DC? {}", self.scan_list());
        let response = self.query(&command)?;
        parse_readings(&response, self.channels.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mock_serial;

    fn config() -> InstrumentConfig {
        InstrumentConfig {
            port: "mock".to_string(),
            read_timeout_ms: 200,
            ..Default::default()
        }
    }

    #[test]
    fn apply_setpoint_sends_three_commands_in_order() {
        let (port, mut harness) = mock_serial::new();
        let mut instrument = ScpiInstrument::new(port, &config());

        instrument.apply_setpoint(2.5).unwrap();

        harness.expect_write(b"OUTP OFF\n");
        harness.expect_write(b"VOLT 2.500000\n");
        harness.expect_write(b"OUTP ON\n");
    }

    #[test]
    fn measure_queries_scan_list() {
        let (port, mut harness) = mock_serial::new();
        let mut instrument = ScpiInstrument::new(port, &config());

        harness.send_response(b"+1.25E-03,-4.0E-04\r\n").unwrap();
        let readings = instrument.measure().unwrap();

        harness.expect_write(b"MEAS:VOLT:DC? (@101,102)\n");
        assert_eq!(readings, vec![1.25e-3, -4.0e-4]);
    }

    #[test]
    fn missing_terminator_times_out() {
        let (port, harness) = mock_serial::new();
        let mut instrument = ScpiInstrument::new(port, &config());

        harness.send_response(b"+1.0").unwrap();
        let err = instrument.measure().unwrap_err();
        assert!(matches!(err, TestbedError::Instrument(_)));
        assert!(err.to_string().contains("partial: '+1.0'"));
    }

    #[test]
    fn parse_readings_checks_count_and_format() {
        assert_eq!(parse_readings(" 1.0 , 2.0", 2).unwrap(), vec![1.0, 2.0]);
        assert!(parse_readings("1.0", 2).is_err());
        assert!(parse_readings("1.0,abc", 2).is_err());
    }
}
