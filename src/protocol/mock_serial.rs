//! Mock serial port for testing the framed protocol without hardware
//!
//! This module provides `MockSerialPort`, which implements `std::io::Read` and
//! `std::io::Write`, and a corresponding `MockDeviceHarness` that plays the part
//! of the device-under-test from within tests.
//!
//! # Architecture
//!
//! A pair of channels simulates the bidirectional link:
//! - `MockSerialPort` (given to the code under test): reads block for at most the
//!   configured read timeout and then fail with `ErrorKind::TimedOut`, exactly like
//!   a `serialport` port. Once the harness is dropped, reads return `Ok(0)`.
//! - `MockDeviceHarness` (kept in the test): asserts on written bytes and scripts replies.
//!
//! # Example
//!
//! ```rust,ignore
//! let (port, mut harness) = mock_serial::new();
//! let mut channel = CommandChannel::new(port);
//!
//! let device = harness.serve(|frame| {
//!     Some(encode_response(frame.command_id, &[ArgValue::F32(21.5)]).unwrap())
//! });
//! let reply = channel.send(0x02, &[ArgValue::U8(0)], Duration::from_millis(200))?;
//! ```

use super::frame::Frame;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SendError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Read timeout used by [`new`].
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// The client-facing side of the mock serial port
#[derive(Debug)]
pub struct MockSerialPort {
    /// Channel to send written data to the harness
    writes_tx: Sender<Vec<u8>>,
    /// Channel to receive data from the harness to be read
    reads_rx: Receiver<Vec<u8>>,
    /// Data received from the harness but not yet read by the client
    read_buffer: VecDeque<u8>,
    read_timeout: Duration,
}

/// The test-facing side for controlling the mock serial port
#[derive(Debug)]
pub struct MockDeviceHarness {
    /// Channel to receive data written by the client
    writes_rx: Receiver<Vec<u8>>,
    /// Channel to send data to the client for it to read
    reads_tx: Sender<Vec<u8>>,
    /// Data received from the client but not yet consumed by the test
    write_buffer: Vec<u8>,
}

/// Creates a new connected pair of `MockSerialPort` and `MockDeviceHarness`
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    with_read_timeout(DEFAULT_READ_TIMEOUT)
}

/// Like [`new`], with an explicit per-read timeout.
pub fn with_read_timeout(read_timeout: Duration) -> (MockSerialPort, MockDeviceHarness) {
    let (client_to_harness_tx, client_to_harness_rx) = mpsc::channel();
    let (harness_to_client_tx, harness_to_client_rx) = mpsc::channel();

    let port = MockSerialPort {
        writes_tx: client_to_harness_tx,
        reads_rx: harness_to_client_rx,
        read_buffer: VecDeque::new(),
        read_timeout,
    };

    let harness = MockDeviceHarness {
        writes_rx: client_to_harness_rx,
        reads_tx: harness_to_client_tx,
        write_buffer: Vec::new(),
    };

    (port, harness)
}

impl MockSerialPort {
    fn drain_into(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.read_buffer.len());
        for (slot, byte) in buf.iter_mut().zip(self.read_buffer.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

impl Read for MockSerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.read_buffer.is_empty() {
            return Ok(self.drain_into(buf));
        }

        match self.reads_rx.recv_timeout(self.read_timeout) {
            Ok(chunk) => {
                self.read_buffer.extend(chunk);
                Ok(self.drain_into(buf))
            }
            Err(RecvTimeoutError::Timeout) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "mock serial read timed out",
            )),
            // Harness dropped: end-of-file
            Err(RecvTimeoutError::Disconnected) => Ok(0),
        }
    }
}

impl Write for MockSerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writes_tx
            .send(buf.to_vec())
            .map(|_| buf.len())
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "mock device harness disconnected",
                )
            })
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl MockDeviceHarness {
    /// Queue bytes for the client to read.
    pub fn send_response(&self, bytes: &[u8]) -> Result<(), SendError<Vec<u8>>> {
        self.reads_tx.send(bytes.to_vec())
    }

    /// Collect written bytes until at least `len` are buffered or `timeout` passes.
    fn fill_write_buffer(&mut self, len: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.write_buffer.len() < len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.writes_rx.recv_timeout(remaining) {
                Ok(chunk) => self.write_buffer.extend(chunk),
                Err(_) => return false,
            }
        }
        true
    }

    /// Assert that the client wrote exactly `expected` next.
    ///
    /// # Panics
    /// Panics if the bytes differ or do not arrive within one second.
    pub fn expect_write(&mut self, expected: &[u8]) {
        assert!(
            self.fill_write_buffer(expected.len(), Duration::from_secs(1)),
            "timed out waiting for {} written bytes, got {:02X?}",
            expected.len(),
            self.write_buffer
        );
        let actual: Vec<u8> = self.write_buffer.drain(..expected.len()).collect();
        assert_eq!(actual, expected, "unexpected bytes written to mock port");
    }

    /// Wait for the next complete request frame written by the client.
    ///
    /// Returns `None` on timeout, on disconnect, or if the bytes do not form a valid frame.
    pub fn next_request(&mut self, timeout: Duration) -> Option<Frame> {
        if !self.fill_write_buffer(3, timeout) {
            return None;
        }
        let len = self.write_buffer[2] as usize;
        if !self.fill_write_buffer(len, timeout) {
            return None;
        }
        let bytes: Vec<u8> = self.write_buffer.drain(..len).collect();
        Frame::parse(&bytes).ok()
    }

    /// Answer requests on a background thread until the client side is dropped.
    ///
    /// `handler` returns the raw bytes to send back, or `None` to stay silent
    /// (which makes the client run into its timeout).
    pub fn serve<F>(mut self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(Frame) -> Option<Vec<u8>> + Send + 'static,
    {
        thread::spawn(move || loop {
            match self.writes_rx.recv_timeout(Duration::from_millis(20)) {
                Ok(chunk) => self.write_buffer.extend(chunk),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
            while self.write_buffer.len() >= 3 && self.write_buffer.len() >= self.write_buffer[2] as usize {
                let len = self.write_buffer[2] as usize;
                let bytes: Vec<u8> = self.write_buffer.drain(..len.max(1)).collect();
                let Ok(frame) = Frame::parse(&bytes) else {
                    continue;
                };
                if let Some(reply) = handler(frame) {
                    if self.send_response(&reply).is_err() {
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_bytes_reach_harness() {
        let (mut port, mut harness) = new();
        port.write_all(b"\xFA\xAF").unwrap();
        port.write_all(b"\x05").unwrap();
        harness.expect_write(&[0xFA, 0xAF, 0x05]);
    }

    #[test]
    fn reads_time_out_then_deliver() {
        let (mut port, harness) = new();
        let mut buf = [0u8; 4];

        let err = port.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        harness.send_response(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(port.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(port.read(&mut buf).unwrap(), 2);
    }

    #[test]
    fn dropped_harness_reads_as_eof() {
        let (mut port, harness) = new();
        drop(harness);
        let mut buf = [0u8; 1];
        assert_eq!(port.read(&mut buf).unwrap(), 0);
        assert!(port.write(&[1]).is_err());
    }
}
