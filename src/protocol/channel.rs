//! Command channel: one synchronous request/response exchange at a time.
//!
//! `send` takes `&mut self`, so a channel can never have two exchanges in
//! flight; callers that share a channel across threads wrap it in a mutex.
//! Failed exchanges are not retried here. The orchestrator issues a fresh
//! exchange on its next tick.

use super::frame::{self, ArgValue, Command};
use super::receiver::{Deadline, FrameReceiver, RxState};
use crate::config::DeviceConfig;
use crate::error::{AppResult, TestbedError};
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

/// Exchange counters, for status displays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Exchanges attempted
    pub exchanges: u64,
    /// Exchanges that failed
    pub failures: u64,
    /// Bytes discarded while resynchronising
    pub discarded_bytes: u64,
}

/// Owns the duplex byte stream to the device-under-test.
pub struct CommandChannel<S> {
    stream: S,
    stats: ChannelStats,
}

impl CommandChannel<Box<dyn SerialPort>> {
    /// Open the serial port described by `config`.
    pub fn open_serial(config: &DeviceConfig) -> AppResult<Self> {
        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .open()?;
        debug!(port = %config.port, baud = config.baud_rate, "Opened device serial port");
        Ok(Self::new(port))
    }
}

impl<S: Read + Write> CommandChannel<S> {
    /// Channel over an already open stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            stats: ChannelStats::default(),
        }
    }

    /// Counters since the channel was created.
    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// Mutable access to the stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Give the stream back.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Run one exchange: send the request for `command_id` and decode its reply.
    ///
    /// Blocks for at most `overall_timeout` (plus one port read timeout).
    #[instrument(level = "debug", skip(self, args), err)]
    pub fn send(
        &mut self,
        command_id: u8,
        args: &[ArgValue],
        overall_timeout: Duration,
    ) -> AppResult<Vec<ArgValue>> {
        self.stats.exchanges += 1;
        let result = self.exchange(command_id, args, overall_timeout);
        if let Err(e) = &result {
            self.stats.failures += 1;
            if e.is_recoverable() {
                warn!(command = command_id, error = %e, "Exchange failed");
            }
        }
        result
    }

    /// Typed convenience over [`send`](Self::send).
    pub fn send_command(
        &mut self,
        command: Command,
        args: &[ArgValue],
        overall_timeout: Duration,
    ) -> AppResult<Vec<ArgValue>> {
        self.send(command.id(), args, overall_timeout)
    }

    fn exchange(
        &mut self,
        command_id: u8,
        args: &[ArgValue],
        overall_timeout: Duration,
    ) -> AppResult<Vec<ArgValue>> {
        let request = frame::encode(command_id, args)?;
        let deadline = Deadline::after(overall_timeout);

        trace!(bytes = ?request, "Sending frame");
        self.stream.write_all(&request)?;
        self.stream.flush()?;

        let reply = self.receive(&deadline)?;
        if reply.command_id != command_id {
            return Err(TestbedError::UnexpectedReply {
                expected: command_id,
                got: reply.command_id,
            });
        }
        frame::decode_response(command_id, &reply.payload)
    }

    fn receive(&mut self, deadline: &Deadline) -> AppResult<frame::Frame> {
        let mut receiver = FrameReceiver::new();
        let mut chunk = [0u8; frame::MAX_FRAME_LEN];

        let result = loop {
            if receiver.state() == RxState::Done {
                break receiver.finish();
            }
            if deadline.expired() {
                break Err(TestbedError::ProtocolTimeout {
                    timeout_ms: deadline.budget().as_millis(),
                });
            }

            let wanted = receiver.bytes_wanted();
            match self.stream.read(&mut chunk[..wanted]) {
                Ok(0) => {
                    break Err(TestbedError::ShortRead {
                        expected: receiver.expected_len().unwrap_or(frame::MIN_FRAME_LEN),
                        received: receiver.buffered(),
                    })
                }
                Ok(n) => {
                    for &byte in &chunk[..n] {
                        receiver.feed(byte);
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {}
                Err(e) => break Err(TestbedError::Io(e)),
            }
        };

        self.stats.discarded_bytes += receiver.discarded() as u64;
        if receiver.discarded() > 0 {
            debug!(discarded = receiver.discarded(), "Resynchronised on reply");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::encode_response;
    use crate::protocol::mock_serial;
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_millis(300);

    #[test]
    fn read_channel_exchange() {
        let (port, mut harness) = mock_serial::new();
        let mut channel = CommandChannel::new(port);

        let reply = encode_response(0x02, &[ArgValue::F32(21.25)]).unwrap();
        harness.send_response(&reply).unwrap();

        let values = channel.send(0x02, &[ArgValue::U8(1)], TIMEOUT).unwrap();
        assert_eq!(values, vec![ArgValue::F32(21.25)]);

        let request = frame::encode(0x02, &[ArgValue::U8(1)]).unwrap();
        harness.expect_write(&request);
        assert_eq!(channel.stats().exchanges, 1);
        assert_eq!(channel.stats().failures, 0);
    }

    #[test]
    fn noise_before_reply_is_skipped() {
        let (port, harness) = mock_serial::new();
        let mut channel = CommandChannel::new(port);

        let mut bytes = vec![0x11, 0xFA, 0x00, 0x42];
        bytes.extend(encode_response(0x03, &[ArgValue::U8(6), ArgValue::U8(0)]).unwrap());
        harness.send_response(&bytes).unwrap();

        let values = channel
            .send(0x03, &[ArgValue::F32(4.05)], TIMEOUT)
            .unwrap();
        assert_eq!(values, vec![ArgValue::U8(6), ArgValue::U8(0)]);
        assert_eq!(channel.stats().discarded_bytes, 4);
    }

    #[test]
    fn silent_device_times_out() {
        let (port, _harness) = mock_serial::new();
        let mut channel = CommandChannel::new(port);

        let start = Instant::now();
        let err = channel
            .send(0x02, &[ArgValue::U8(0)], Duration::from_millis(60))
            .unwrap_err();

        assert!(matches!(err, TestbedError::ProtocolTimeout { timeout_ms: 60 }));
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(channel.stats().failures, 1);
    }

    #[test]
    fn noise_only_still_times_out() {
        let (port, harness) = mock_serial::new();
        let mut channel = CommandChannel::new(port);
        harness.send_response(&[0x01; 32]).unwrap();

        let err = channel
            .send(0x02, &[ArgValue::U8(0)], Duration::from_millis(40))
            .unwrap_err();
        assert!(matches!(err, TestbedError::ProtocolTimeout { .. }));
    }

    /// Replays canned input and reports end-of-file afterwards.
    struct Replay {
        input: std::io::Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Read for Replay {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Replay {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn closed_stream_mid_payload_is_short_read() {
        let reply = encode_response(0x02, &[ArgValue::F32(1.0)]).unwrap();
        let mut channel = CommandChannel::new(Replay {
            input: std::io::Cursor::new(reply[..5].to_vec()),
            written: Vec::new(),
        });

        let err = channel.send(0x02, &[ArgValue::U8(0)], TIMEOUT).unwrap_err();
        assert!(matches!(
            err,
            TestbedError::ShortRead {
                expected: 9,
                received: 5
            }
        ));
        assert_eq!(channel.into_inner().written.len(), 6);
    }

    #[test]
    fn dropped_device_is_io_error() {
        let (port, harness) = mock_serial::new();
        let mut channel = CommandChannel::new(port);
        drop(harness);

        let err = channel.send(0x02, &[ArgValue::U8(0)], TIMEOUT).unwrap_err();
        assert!(matches!(err, TestbedError::Io(_)));
    }

    #[test]
    fn corrupted_reply_is_checksum_mismatch() {
        let (port, harness) = mock_serial::new();
        let mut channel = CommandChannel::new(port);

        let mut reply = encode_response(0x02, &[ArgValue::F32(3.5)]).unwrap();
        reply[4] ^= 0x80;
        harness.send_response(&reply).unwrap();

        let err = channel.send(0x02, &[ArgValue::U8(0)], TIMEOUT).unwrap_err();
        assert!(matches!(err, TestbedError::ChecksumMismatch { .. }));
    }

    #[test]
    fn reply_for_other_command_is_rejected() {
        let (port, harness) = mock_serial::new();
        let mut channel = CommandChannel::new(port);

        let reply = encode_response(0x03, &[ArgValue::U8(0), ArgValue::U8(0)]).unwrap();
        harness.send_response(&reply).unwrap();

        let err = channel.send(0x02, &[ArgValue::U8(0)], TIMEOUT).unwrap_err();
        assert!(matches!(
            err,
            TestbedError::UnexpectedReply {
                expected: 0x02,
                got: 0x03
            }
        ));
    }

    #[test]
    fn programmer_errors_never_touch_the_stream() {
        let (port, mut harness) = mock_serial::new();
        let mut channel = CommandChannel::new(port);

        assert!(matches!(
            channel.send(0x99, &[], TIMEOUT),
            Err(TestbedError::UnknownCommand(0x99))
        ));
        assert!(matches!(
            channel.send(0x01, &[ArgValue::U8(1)], TIMEOUT),
            Err(TestbedError::ArgumentArityMismatch { .. })
        ));
        assert!(harness.next_request(Duration::from_millis(30)).is_none());
    }
}
