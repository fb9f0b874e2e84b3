//! Typed client for the device-under-test.
//!
//! Wraps a [`CommandChannel`] and turns the raw command table into methods with
//! real argument and return types.

use crate::error::{AppResult, TestbedError};
use crate::protocol::{ArgValue, Command, CommandChannel};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

/// Object-safe duplex stream, so sessions can hold a serial port or a mock.
pub trait DuplexStream: Read + Write + Send {}
impl<T: Read + Write + Send> DuplexStream for T {}

/// Boxed stream used by sessions.
pub type DynStream = Box<dyn DuplexStream>;

/// Acknowledgement returned by a setpoint write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetpointAck {
    /// Status byte echoed by the device
    pub status: u8,
    /// Device-specific detail byte
    pub detail: u8,
}

/// Typed calls on top of a [`CommandChannel`].
pub struct DeviceClient<S> {
    channel: CommandChannel<S>,
    timeout: Duration,
}

impl<S: Read + Write> DeviceClient<S> {
    /// Wrap `channel`, giving every exchange `timeout`.
    pub fn new(channel: CommandChannel<S>, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    /// The underlying channel, for its statistics.
    pub fn channel(&self) -> &CommandChannel<S> {
        &self.channel
    }

    /// Address / configuration query. The device echoes its view of the four bytes.
    pub fn query_config(&mut self, request: [u8; 4]) -> AppResult<[u8; 4]> {
        let args = request.map(ArgValue::U8);
        let reply = self
            .channel
            .send_command(Command::QueryConfig, &args, self.timeout)?;

        let mut out = [0u8; 4];
        for (slot, value) in out.iter_mut().zip(&reply) {
            *slot = expect_u8(Command::QueryConfig, value)?;
        }
        Ok(out)
    }

    /// Measure one channel.
    pub fn read_channel(&mut self, channel: u8) -> AppResult<f32> {
        let reply = self.channel.send_command(
            Command::ReadChannel,
            &[ArgValue::U8(channel)],
            self.timeout,
        )?;
        reply
            .first()
            .and_then(ArgValue::as_f32)
            .ok_or_else(|| layout_violation(Command::ReadChannel))
    }

    /// Measure several channels in order. Stops at the first failed exchange.
    pub fn read_channels(&mut self, channels: &[u8]) -> AppResult<Vec<f64>> {
        let mut readings = Vec::with_capacity(channels.len());
        for &channel in channels {
            readings.push(f64::from(self.read_channel(channel)?));
        }
        debug!(?readings, "Device channels read");
        Ok(readings)
    }

    /// Write a setpoint and return the device acknowledgement.
    pub fn write_setpoint(&mut self, value: f32) -> AppResult<SetpointAck> {
        let reply = self.channel.send_command(
            Command::WriteSetpoint,
            &[ArgValue::F32(value)],
            self.timeout,
        )?;
        match reply.as_slice() {
            [status, detail] => Ok(SetpointAck {
                status: expect_u8(Command::WriteSetpoint, status)?,
                detail: expect_u8(Command::WriteSetpoint, detail)?,
            }),
            _ => Err(layout_violation(Command::WriteSetpoint)),
        }
    }
}

fn expect_u8(command: Command, value: &ArgValue) -> AppResult<u8> {
    value.as_u8().ok_or_else(|| layout_violation(command))
}

fn layout_violation(command: Command) -> TestbedError {
    TestbedError::MalformedFrame(format!("reply does not match the {} layout", command))
}
