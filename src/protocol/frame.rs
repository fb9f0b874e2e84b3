//! Frame codec for the device-under-test serial protocol.
//!
//! Requests and replies share one frame shape:
//!
//! ```text
//! [0xFA][0xAF][length][command_id][payload ...][checksum]
//! ```
//!
//! - `length` is the total frame length, header and checksum included
//!   (`4 + payload.len() + 1`).
//! - `checksum` is the additive sum of every preceding byte, mod 256.
//! - Every command has a fixed request layout and a fixed response layout
//!   (see [`Command`]). Multi-byte values are little-endian.
//!
//! # Known limitation
//!
//! The checksum is an 8-bit additive sum, not a CRC. Byte reorderings and
//! compensating errors go undetected, so it only catches gross line noise. It is
//! not a security property.

use crate::error::{AppResult, TestbedError};
use std::fmt;
use tracing::instrument;

/// First sync byte; the receiver resynchronises on it.
pub const SYNC_0: u8 = 0xFA;
/// Second sync byte (the "address" byte on the reply path).
pub const SYNC_1: u8 = 0xAF;
/// Sync bytes, length byte and command id.
pub const HEADER_LEN: usize = 4;
/// Smallest possible frame: header plus checksum, no payload.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 1;
/// The length byte caps a frame at 255 bytes.
pub const MAX_FRAME_LEN: usize = u8::MAX as usize;

/// Wire type of one field in a command layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Unsigned byte
    U8,
    /// IEEE-754 single precision, little-endian
    F32,
}

impl FieldType {
    /// Encoded size in bytes.
    pub const fn size(self) -> usize {
        match self {
            FieldType::U8 => 1,
            FieldType::F32 => 4,
        }
    }
}

/// One typed argument of a request or response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgValue {
    /// One byte
    U8(u8),
    /// Four bytes, little-endian
    F32(f32),
}

impl ArgValue {
    /// Wire type of this value.
    pub fn field_type(&self) -> FieldType {
        match self {
            ArgValue::U8(_) => FieldType::U8,
            ArgValue::F32(_) => FieldType::F32,
        }
    }

    /// The value if it is a `U8`.
    pub fn as_u8(&self) -> Option<u8> {
        match self {
            ArgValue::U8(v) => Some(*v),
            ArgValue::F32(_) => None,
        }
    }

    /// The value if it is an `F32`.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            ArgValue::F32(v) => Some(*v),
            ArgValue::U8(_) => None,
        }
    }
}

/// Commands understood by the device-under-test.
///
/// The identifiers and layouts are fixed by the device firmware and must not change.
///
/// | id | command | request | response |
/// |------|-----------------|---------------|-----------|
/// | 0x01 | `QueryConfig`   | u8 u8 u8 u8   | u8 u8 u8 u8 |
/// | 0x02 | `ReadChannel`   | u8            | f32       |
/// | 0x03 | `WriteSetpoint` | f32           | u8 u8     |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Device address / configuration query
    QueryConfig = 0x01,
    /// Single channel measurement
    ReadChannel = 0x02,
    /// Setpoint write, acknowledged with two status bytes
    WriteSetpoint = 0x03,
}

impl Command {
    /// Every supported command, by id.
    pub const ALL: [Command; 3] = [
        Command::QueryConfig,
        Command::ReadChannel,
        Command::WriteSetpoint,
    ];

    /// Command id on the wire.
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Look up a command id, failing with `UnknownCommand`.
    pub fn from_id(id: u8) -> AppResult<Self> {
        match id {
            0x01 => Ok(Command::QueryConfig),
            0x02 => Ok(Command::ReadChannel),
            0x03 => Ok(Command::WriteSetpoint),
            other => Err(TestbedError::UnknownCommand(other)),
        }
    }

    /// Argument types sent with the request.
    pub const fn request_layout(self) -> &'static [FieldType] {
        match self {
            Command::QueryConfig => &[FieldType::U8, FieldType::U8, FieldType::U8, FieldType::U8],
            Command::ReadChannel => &[FieldType::U8],
            Command::WriteSetpoint => &[FieldType::F32],
        }
    }

    /// Argument types returned in the reply.
    pub const fn response_layout(self) -> &'static [FieldType] {
        match self {
            Command::QueryConfig => &[FieldType::U8, FieldType::U8, FieldType::U8, FieldType::U8],
            Command::ReadChannel => &[FieldType::F32],
            Command::WriteSetpoint => &[FieldType::U8, FieldType::U8],
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, self.id())
    }
}

/// Additive checksum: sum of `bytes` mod 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn layout_size(layout: &[FieldType]) -> usize {
    layout.iter().map(|f| f.size()).sum()
}

fn describe(types: impl Iterator<Item = FieldType>) -> String {
    let names: Vec<&str> = types
        .map(|t| match t {
            FieldType::U8 => "u8",
            FieldType::F32 => "f32",
        })
        .collect();
    format!("[{}]", names.join(", "))
}

fn serialize_layout(command: u8, layout: &[FieldType], args: &[ArgValue]) -> AppResult<Vec<u8>> {
    let matches = layout.len() == args.len()
        && layout
            .iter()
            .zip(args)
            .all(|(expected, arg)| *expected == arg.field_type());
    if !matches {
        return Err(TestbedError::ArgumentArityMismatch {
            command,
            expected: describe(layout.iter().copied()),
            got: describe(args.iter().map(ArgValue::field_type)),
        });
    }

    let mut payload = Vec::with_capacity(layout_size(layout));
    for arg in args {
        match arg {
            ArgValue::U8(v) => payload.push(*v),
            ArgValue::F32(v) => payload.extend_from_slice(&v.to_le_bytes()),
        }
    }
    Ok(payload)
}

fn deserialize_layout(command: u8, layout: &[FieldType], payload: &[u8]) -> AppResult<Vec<ArgValue>> {
    let needed = layout_size(layout);
    if payload.len() < needed {
        return Err(TestbedError::ShortPayload {
            command,
            needed,
            got: payload.len(),
        });
    }

    let mut offset = 0;
    let mut values = Vec::with_capacity(layout.len());
    for field in layout {
        match field {
            FieldType::U8 => values.push(ArgValue::U8(payload[offset])),
            FieldType::F32 => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&payload[offset..offset + 4]);
                values.push(ArgValue::F32(f32::from_le_bytes(raw)));
            }
        }
        offset += field.size();
    }
    Ok(values)
}

fn wrap_frame(command_id: u8, payload: &[u8]) -> Vec<u8> {
    let length = HEADER_LEN + payload.len() + 1;
    let mut frame = Vec::with_capacity(length);
    frame.extend_from_slice(&[SYNC_0, SYNC_1, length as u8, command_id]);
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));
    frame
}

/// Serialise only the request payload of `command_id` (no header, no checksum).
pub fn encode_payload(command_id: u8, args: &[ArgValue]) -> AppResult<Vec<u8>> {
    let command = Command::from_id(command_id)?;
    serialize_layout(command_id, command.request_layout(), args)
}

/// Build a complete request frame.
#[instrument(level = "trace", skip(args), err)]
pub fn encode(command_id: u8, args: &[ArgValue]) -> AppResult<Vec<u8>> {
    let payload = encode_payload(command_id, args)?;
    Ok(wrap_frame(command_id, &payload))
}

/// Decode a reply payload (command id and checksum already stripped).
///
/// Bytes beyond the layout are ignored.
pub fn decode_response(command_id: u8, payload: &[u8]) -> AppResult<Vec<ArgValue>> {
    let command = Command::from_id(command_id)?;
    deserialize_layout(command_id, command.response_layout(), payload)
}

/// Decode a request payload. Device-side counterpart of [`encode_payload`].
pub fn decode_request(command_id: u8, payload: &[u8]) -> AppResult<Vec<ArgValue>> {
    let command = Command::from_id(command_id)?;
    deserialize_layout(command_id, command.request_layout(), payload)
}

/// Serialise a reply payload. Device-side counterpart of [`decode_response`].
pub fn encode_response_payload(command_id: u8, args: &[ArgValue]) -> AppResult<Vec<u8>> {
    let command = Command::from_id(command_id)?;
    serialize_layout(command_id, command.response_layout(), args)
}

/// Build a complete reply frame, as the device would send it.
pub fn encode_response(command_id: u8, args: &[ArgValue]) -> AppResult<Vec<u8>> {
    let payload = encode_response_payload(command_id, args)?;
    Ok(wrap_frame(command_id, &payload))
}

/// A complete frame split into its parts, checksum verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command id byte
    pub command_id: u8,
    /// Bytes between the command id and the checksum
    pub payload: Vec<u8>,
}

impl Frame {
    /// Parse one complete frame, verifying sync bytes, length and checksum.
    pub fn parse(bytes: &[u8]) -> AppResult<Self> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(TestbedError::MalformedFrame(format!(
                "{} bytes is shorter than the minimum frame",
                bytes.len()
            )));
        }
        if bytes[0] != SYNC_0 || bytes[1] != SYNC_1 {
            return Err(TestbedError::MalformedFrame(format!(
                "bad sync bytes {:02X} {:02X}",
                bytes[0], bytes[1]
            )));
        }
        if bytes[2] as usize != bytes.len() {
            return Err(TestbedError::MalformedFrame(format!(
                "length byte {} but frame has {} bytes",
                bytes[2],
                bytes.len()
            )));
        }

        let (body, tail) = bytes.split_at(bytes.len() - 1);
        let expected = checksum(body);
        if tail[0] != expected {
            return Err(TestbedError::ChecksumMismatch {
                expected,
                actual: tail[0],
            });
        }

        Ok(Self {
            command_id: bytes[3],
            payload: body[HEADER_LEN..].to_vec(),
        })
    }
}
