//! Integration tests for the command channel over the mock serial link.
//!
//! The device side runs on its own thread and answers with the framing quirks
//! seen on real hardware: line noise before the sync bytes, split writes, and
//! the occasional corrupted frame.

use std::thread;
use std::time::Duration;
use testbed_daq::protocol::frame::{self, decode_request, encode_response};
use testbed_daq::protocol::{mock_serial, ArgValue, Command, CommandChannel};
use testbed_daq::TestbedError;

const TIMEOUT: Duration = Duration::from_millis(300);

/// Reply expected from a well-behaved device for each command.
fn device_reply(command_id: u8, args: &[ArgValue]) -> Vec<ArgValue> {
    match command_id {
        0x01 => args.to_vec(),
        0x02 => vec![ArgValue::F32(-12.5)],
        _ => vec![ArgValue::U8(0x06), ArgValue::U8(0x01)],
    }
}

#[test]
fn test_every_command_round_trips_through_noisy_link() {
    let (port, mut harness) = mock_serial::new();
    let device = thread::spawn(move || {
        for _ in 0..Command::ALL.len() {
            let request = harness.next_request(Duration::from_secs(1)).unwrap();
            let args = decode_request(request.command_id, &request.payload).unwrap();
            let reply = encode_response(request.command_id, &device_reply(request.command_id, &args)).unwrap();

            // Noise, then the reply split across two writes
            harness.send_response(&[0x00, 0xFA, 0x13, 0x55]).unwrap();
            let (head, tail) = reply.split_at(3);
            harness.send_response(head).unwrap();
            thread::sleep(Duration::from_millis(5));
            harness.send_response(tail).unwrap();
        }
    });

    let mut channel = CommandChannel::new(port);
    let requests = [
        (Command::QueryConfig, vec![ArgValue::U8(1), ArgValue::U8(2), ArgValue::U8(3), ArgValue::U8(4)]),
        (Command::ReadChannel, vec![ArgValue::U8(7)]),
        (Command::WriteSetpoint, vec![ArgValue::F32(4.05)]),
    ];
    for (command, args) in &requests {
        let reply = channel.send_command(*command, args, TIMEOUT).unwrap();
        assert_eq!(reply, device_reply(command.id(), args), "{}", command);
    }

    device.join().unwrap();
    let stats = channel.stats();
    assert_eq!(stats.exchanges, 3);
    assert_eq!(stats.failures, 0);
    assert!(stats.discarded_bytes >= 3 * 3);
}

#[test]
fn test_corrupted_reply_fails_then_next_exchange_succeeds() {
    let (port, mut harness) = mock_serial::new();
    let device = thread::spawn(move || {
        let request = harness.next_request(Duration::from_secs(1)).unwrap();
        let mut reply = encode_response(request.command_id, &[ArgValue::F32(1.0)]).unwrap();
        let last = reply.len() - 1;
        reply[last] = reply[last].wrapping_add(1);
        harness.send_response(&reply).unwrap();

        let request = harness.next_request(Duration::from_secs(1)).unwrap();
        let reply = encode_response(request.command_id, &[ArgValue::F32(2.0)]).unwrap();
        harness.send_response(&reply).unwrap();
        harness
    });

    let mut channel = CommandChannel::new(port);
    let err = channel
        .send_command(Command::ReadChannel, &[ArgValue::U8(0)], TIMEOUT)
        .unwrap_err();
    assert!(matches!(err, TestbedError::ChecksumMismatch { .. }));

    let reply = channel
        .send_command(Command::ReadChannel, &[ArgValue::U8(0)], TIMEOUT)
        .unwrap();
    assert_eq!(reply, vec![ArgValue::F32(2.0)]);
    assert_eq!(channel.stats().failures, 1);

    drop(device.join().unwrap());
}

#[test]
fn test_unknown_command_never_touches_the_wire() {
    let (port, mut harness) = mock_serial::new();
    let mut channel = CommandChannel::new(port);

    let err = channel.send(0x42, &[], TIMEOUT).unwrap_err();
    assert!(matches!(err, TestbedError::UnknownCommand(0x42)));
    assert!(harness.next_request(Duration::from_millis(50)).is_none());
}

#[test]
fn test_setpoint_frame_layout() {
    let bytes = frame::encode(Command::WriteSetpoint.id(), &[ArgValue::F32(4.05)]).unwrap();
    assert_eq!(bytes.len(), 9);
    assert_eq!(&bytes[..4], &[0xFA, 0xAF, 0x09, 0x03]);
    assert_eq!(&bytes[4..8], &4.05f32.to_le_bytes());
    assert_eq!(bytes[8], frame::checksum(&bytes[..8]));
}
