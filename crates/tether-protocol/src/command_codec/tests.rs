//! Tests for command and datagram encoding and decoding.

use tether_core::error::DecodingErrorKind;

use super::{CommandDecoder, CommandEncoder, ProtocolHeader};
use crate::command::{
    Command, CommandKind, ConnectParams, FragmentParams, ProtocolCommand, FLAG_ACKNOWLEDGE,
    FLAG_UNSEQUENCED,
};

fn every_kind() -> Vec<Command> {
    let params = ConnectParams { mtu: 1400, window_size: 32768, channel_count: 2, ..Default::default() };
    let fragment = FragmentParams { data_length: 0, fragment_count: 3, total_length: 30, ..Default::default() };
    vec![
        Command::new(0, 0xFF, ProtocolCommand::Acknowledge { received_reliable_sequence_number: 1, received_sent_time: 2 }),
        Command::new(FLAG_ACKNOWLEDGE, 0xFF, ProtocolCommand::Connect { params, data: 42 }),
        Command::new(FLAG_ACKNOWLEDGE, 0xFF, ProtocolCommand::VerifyConnect(params)),
        Command::new(FLAG_UNSEQUENCED, 0xFF, ProtocolCommand::Disconnect { data: 0 }),
        Command::new(FLAG_ACKNOWLEDGE, 0xFF, ProtocolCommand::Ping),
        Command::new(FLAG_ACKNOWLEDGE, 0, ProtocolCommand::SendReliable { data_length: 0 }),
        Command::new(0, 0, ProtocolCommand::SendUnreliable { unreliable_sequence_number: 1, data_length: 0 }),
        Command::new(FLAG_ACKNOWLEDGE, 0, ProtocolCommand::SendFragment(fragment)),
        Command::new(FLAG_UNSEQUENCED, 0, ProtocolCommand::SendUnsequenced { unsequenced_group: 1, data_length: 0 }),
        Command::new(FLAG_ACKNOWLEDGE, 0xFF, ProtocolCommand::BandwidthLimit { incoming_bandwidth: 1, outgoing_bandwidth: 2 }),
        Command::new(FLAG_ACKNOWLEDGE, 0xFF, ProtocolCommand::ThrottleConfigure {
            packet_throttle_interval: 5000,
            packet_throttle_acceleration: 2,
            packet_throttle_deceleration: 2,
        }),
        Command::new(0, 0, ProtocolCommand::SendUnreliableFragment(fragment)),
    ]
}

#[test]
fn test_encoded_size_matches_fixed_size_for_every_kind() {
    for command in every_kind() {
        let encoded = CommandEncoder::encode_command(&command).unwrap();
        assert_eq!(encoded.len(), command.size(), "{:?}", command.kind());
    }
}

#[test]
fn test_fields_are_big_endian() {
    let mut command = Command::new(
        0,
        2,
        ProtocolCommand::SendUnreliable { unreliable_sequence_number: 0x0102, data_length: 0x0304 },
    );
    command.header.reliable_sequence_number = 0xA0B0;
    let encoded = CommandEncoder::encode_command(&command).unwrap();
    assert_eq!(encoded, vec![7, 2, 0xA0, 0xB0, 0x01, 0x02, 0x03, 0x04]);
}

#[test]
fn test_datagram_with_payloads_decodes_in_order() {
    let mut body = Vec::new();
    let mut reliable = Command::new(FLAG_ACKNOWLEDGE, 1, ProtocolCommand::SendReliable { data_length: 3 });
    reliable.header.reliable_sequence_number = 9;
    CommandEncoder::encode_command_into(&mut body, &reliable).unwrap();
    body.extend_from_slice(b"abc");
    CommandEncoder::encode_command_into(&mut body, &Command::new(FLAG_ACKNOWLEDGE, 0xFF, ProtocolCommand::Ping)).unwrap();

    let decoded = CommandDecoder::decode_commands(&body).unwrap();
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded[0].command, reliable);
    assert_eq!(decoded[0].payload, b"abc");
    assert_eq!(decoded[1].command.kind(), CommandKind::Ping);
    assert!(decoded[1].payload.is_empty());
}

#[test]
fn test_truncated_command_rejects_datagram() {
    let encoded = CommandEncoder::encode_command(&Command::new(
        FLAG_ACKNOWLEDGE,
        0xFF,
        ProtocolCommand::Disconnect { data: 5 },
    ))
    .unwrap();
    let result = CommandDecoder::decode_commands(&encoded[..6]);
    assert_eq!(result.unwrap_err(), DecodingErrorKind::Truncated);
}

#[test]
fn test_declared_payload_longer_than_datagram_is_rejected() {
    let mut body = CommandEncoder::encode_command(&Command::new(
        FLAG_ACKNOWLEDGE,
        0,
        ProtocolCommand::SendReliable { data_length: 100 },
    ))
    .unwrap();
    body.extend_from_slice(&[0; 10]);
    assert_eq!(CommandDecoder::decode_commands(&body).unwrap_err(), DecodingErrorKind::Truncated);
}

#[test]
fn test_unknown_kind_is_rejected() {
    let body = [0x0D, 0, 0, 0];
    assert_eq!(
        CommandDecoder::decode_commands(&body).unwrap_err(),
        DecodingErrorKind::UnknownCommand(13)
    );
    let body = [0x00, 0, 0, 0];
    assert_eq!(
        CommandDecoder::decode_commands(&body).unwrap_err(),
        DecodingErrorKind::UnknownCommand(0)
    );
}

#[test]
fn test_header_layout() {
    let header = ProtocolHeader { peer_id: 0x123, session_id: 2, compressed: true, sent_time: Some(0xBEEF) };
    let mut buffer = Vec::new();
    header.encode_into(&mut buffer).unwrap();
    assert_eq!(buffer, vec![0x80 | 0x40 | 0x20 | 0x01, 0x23, 0xBE, 0xEF]);

    let (decoded, size) = ProtocolHeader::decode(&buffer).unwrap();
    assert_eq!(size, 4);
    assert_eq!(decoded, header);
}

#[test]
fn test_header_without_sent_time_is_two_bytes() {
    let header = ProtocolHeader { peer_id: 0xFFF, session_id: 0, compressed: false, sent_time: None };
    let mut buffer = Vec::new();
    header.encode_into(&mut buffer).unwrap();
    assert_eq!(buffer.len(), 2);
    assert_eq!(ProtocolHeader::decode(&buffer).unwrap(), (header, 2));
    assert_eq!(ProtocolHeader::decode(&[0x80]).unwrap_err(), DecodingErrorKind::HeaderTooShort);
    assert_eq!(ProtocolHeader::decode(&[0x80, 0x00, 0x01]).unwrap_err(), DecodingErrorKind::HeaderTooShort);
}
