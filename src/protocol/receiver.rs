//! Byte-fed reply receiver.
//!
//! The receiver is a pure state machine: the channel reads bytes from the port
//! and feeds them in one at a time, and the machine decides when a frame is
//! complete. Timeouts live outside the machine in [`Deadline`], so both halves
//! can be tested without a port.
//!
//! ```text
//! SeekingSync --0xFA--> ReadingHeader --0xAF, len--> ReadingPayload --len-3 bytes--> Done
//!      ^                      |
//!      +---- other byte ------+
//! ```

use super::frame::{Frame, MIN_FRAME_LEN, SYNC_0, SYNC_1};
use crate::error::AppResult;
use std::time::{Duration, Instant};
use tracing::trace;

/// Receiver state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// Discarding bytes until the first sync byte.
    SeekingSync,
    /// Sync byte seen; expecting the address byte and the length byte.
    ReadingHeader,
    /// Header accepted; `remaining` bytes of command id, payload and checksum to go.
    ReadingPayload { remaining: usize },
    /// A complete frame is buffered.
    Done,
}

/// Accumulates one reply frame from an unreliable byte stream.
#[derive(Debug)]
pub struct FrameReceiver {
    state: RxState,
    buffer: Vec<u8>,
    discarded: usize,
}

impl Default for FrameReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReceiver {
    /// Receiver waiting for the first sync byte.
    pub fn new() -> Self {
        Self {
            state: RxState::SeekingSync,
            buffer: Vec::with_capacity(16),
            discarded: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> RxState {
        self.state
    }

    /// Bytes thrown away while resynchronising.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Bytes buffered for the frame in progress.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Total length of the frame in progress, once the length byte is known.
    pub fn expected_len(&self) -> Option<usize> {
        self.buffer.get(2).map(|&len| len as usize)
    }

    /// How many bytes can be read without running past the current frame.
    pub fn bytes_wanted(&self) -> usize {
        match self.state {
            RxState::SeekingSync => 1,
            RxState::ReadingHeader => 3 - self.buffer.len(),
            RxState::ReadingPayload { remaining } => remaining,
            RxState::Done => 0,
        }
    }

    /// Feed one byte and return the new state.
    pub fn feed(&mut self, byte: u8) -> RxState {
        self.state = match self.state {
            RxState::SeekingSync => {
                if byte == SYNC_0 {
                    self.buffer.clear();
                    self.buffer.push(byte);
                    RxState::ReadingHeader
                } else {
                    self.discarded += 1;
                    RxState::SeekingSync
                }
            }
            RxState::ReadingHeader if self.buffer.len() == 1 => {
                if byte == SYNC_1 {
                    self.buffer.push(byte);
                    RxState::ReadingHeader
                } else {
                    self.resync(byte)
                }
            }
            RxState::ReadingHeader => {
                let length = byte as usize;
                if length < MIN_FRAME_LEN {
                    trace!(length, "Implausible length byte, resynchronising");
                    self.resync(byte)
                } else {
                    self.buffer.push(byte);
                    RxState::ReadingPayload {
                        remaining: length - 3,
                    }
                }
            }
            RxState::ReadingPayload { remaining } => {
                self.buffer.push(byte);
                if remaining == 1 {
                    RxState::Done
                } else {
                    RxState::ReadingPayload {
                        remaining: remaining - 1,
                    }
                }
            }
            RxState::Done => RxState::Done,
        };
        self.state
    }

    /// Drop the partial header and start over. `byte` may itself open a new frame.
    fn resync(&mut self, byte: u8) -> RxState {
        self.discarded += self.buffer.len();
        self.buffer.clear();
        if byte == SYNC_0 {
            self.buffer.push(byte);
            RxState::ReadingHeader
        } else {
            self.discarded += 1;
            RxState::SeekingSync
        }
    }

    /// Validate the buffered frame. Only meaningful in [`RxState::Done`].
    pub fn finish(&self) -> AppResult<Frame> {
        Frame::parse(&self.buffer)
    }
}

/// Absolute time budget for one exchange.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    /// Deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self::starting_at(Instant::now(), budget)
    }

    /// Deadline `budget` after `start`.
    pub fn starting_at(start: Instant, budget: Duration) -> Self {
        Self { start, budget }
    }

    /// Total budget.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time since the deadline started.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Whether the budget is used up.
    pub fn expired(&self) -> bool {
        self.elapsed() >= self.budget
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TestbedError;
    use crate::protocol::frame::{encode_response, ArgValue};

    fn feed_all(receiver: &mut FrameReceiver, bytes: &[u8]) -> RxState {
        let mut state = receiver.state();
        for &b in bytes {
            state = receiver.feed(b);
        }
        state
    }

    #[test]
    fn clean_frame_walks_every_state() {
        let frame = encode_response(0x03, &[ArgValue::U8(1), ArgValue::U8(2)]).unwrap();
        let mut rx = FrameReceiver::new();

        assert_eq!(rx.feed(frame[0]), RxState::ReadingHeader);
        assert_eq!(rx.feed(frame[1]), RxState::ReadingHeader);
        assert_eq!(rx.feed(frame[2]), RxState::ReadingPayload { remaining: 4 });
        assert_eq!(feed_all(&mut rx, &frame[3..]), RxState::Done);

        let parsed = rx.finish().unwrap();
        assert_eq!(parsed.command_id, 0x03);
        assert_eq!(parsed.payload, vec![1, 2]);
        assert_eq!(rx.discarded(), 0);
    }

    #[test]
    fn leading_noise_is_discarded() {
        let frame = encode_response(0x02, &[ArgValue::F32(1.5)]).unwrap();
        let mut bytes = vec![0x00, 0x13, 0xAF, 0xFA, 0x55];
        bytes.extend_from_slice(&frame);

        let mut rx = FrameReceiver::new();
        assert_eq!(feed_all(&mut rx, &bytes), RxState::Done);
        assert_eq!(rx.finish().unwrap().command_id, 0x02);
        // 0x00, 0x13, 0xAF, then the false start 0xFA 0x55
        assert_eq!(rx.discarded(), 5);
    }

    #[test]
    fn repeated_sync_byte_restarts_header() {
        let frame = encode_response(0x03, &[ArgValue::U8(0), ArgValue::U8(0)]).unwrap();
        let mut bytes = vec![0xFA];
        bytes.extend_from_slice(&frame);

        let mut rx = FrameReceiver::new();
        assert_eq!(feed_all(&mut rx, &bytes), RxState::Done);
        assert!(rx.finish().is_ok());
    }

    #[test]
    fn implausible_length_resynchronises() {
        let mut rx = FrameReceiver::new();
        assert_eq!(feed_all(&mut rx, &[0xFA, 0xAF, 0x02]), RxState::SeekingSync);
        assert_eq!(rx.discarded(), 3);
    }

    #[test]
    fn corrupted_checksum_surfaces_on_finish() {
        let mut frame = encode_response(0x02, &[ArgValue::F32(7.0)]).unwrap();
        let last = frame.len() - 1;
        frame[last] = frame[last].wrapping_add(1);

        let mut rx = FrameReceiver::new();
        assert_eq!(feed_all(&mut rx, &frame), RxState::Done);
        assert!(matches!(
            rx.finish(),
            Err(TestbedError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn bytes_wanted_never_overruns_frame() {
        let frame = encode_response(0x01, &[ArgValue::U8(1); 4]).unwrap();
        let mut rx = FrameReceiver::new();
        assert_eq!(rx.bytes_wanted(), 1);
        rx.feed(frame[0]);
        assert_eq!(rx.bytes_wanted(), 2);
        rx.feed(frame[1]);
        rx.feed(frame[2]);
        assert_eq!(rx.bytes_wanted(), frame.len() - 3);
        assert_eq!(rx.expected_len(), Some(frame.len()));
    }

    #[test]
    fn deadline_expiry() {
        let past = Instant::now() - Duration::from_millis(50);
        let deadline = Deadline::starting_at(past, Duration::from_millis(10));
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);

        let fresh = Deadline::after(Duration::from_secs(60));
        assert!(!fresh.expired());
        assert!(fresh.remaining() > Duration::from_secs(59));
    }
}
