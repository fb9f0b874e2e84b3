//! Framed request/response protocol spoken by the device-under-test.
//!
//! - [`frame`]: command table, argument encoding and checksum
//! - [`receiver`]: reply state machine and exchange deadline
//! - [`channel`]: one synchronous exchange at a time over any `Read + Write`
//! - [`mock_serial`]: in-memory port and device harness for tests

pub mod channel;
pub mod frame;
pub mod mock_serial;
pub mod receiver;

pub use channel::{ChannelStats, CommandChannel};
pub use frame::{decode_response, encode, ArgValue, Command, FieldType, Frame};
pub use receiver::{Deadline, FrameReceiver, RxState};
