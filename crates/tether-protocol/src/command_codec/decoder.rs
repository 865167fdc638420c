//! Datagram decoding.
//!
//! A datagram body is a run of commands, each immediately followed by its payload when
//! it carries application data. Decoding is all-or-nothing: an unknown kind, a command
//! cut short, or a payload running past the end rejects the whole datagram.

use std::io::{self, Cursor};

use byteorder::{BigEndian, ReadBytesExt};
use tether_core::error::DecodingErrorKind;

use crate::command::{
    Command, CommandHeader, CommandKind, ConnectParams, FragmentParams, ProtocolCommand,
    COMMAND_HEADER_SIZE, COMMAND_MASK,
};

/// One decoded command and the payload bytes that followed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedCommand<'a> {
    /// The command
    pub command: Command,
    /// Payload following the command, empty for control commands
    pub payload: &'a [u8],
}

/// Deserializes commands from network bytes.
pub struct CommandDecoder;

impl CommandDecoder {
    /// Decodes every command of a datagram body (the bytes after the header).
    pub fn decode_commands(data: &[u8]) -> Result<Vec<DecodedCommand<'_>>, DecodingErrorKind> {
        let mut commands = Vec::new();
        let mut position = 0;

        while position < data.len() {
            if position + COMMAND_HEADER_SIZE > data.len() {
                return Err(DecodingErrorKind::Truncated);
            }
            let command_byte = data[position];
            let kind = match CommandKind::from_command(command_byte) {
                Some(kind) if kind != CommandKind::None => kind,
                _ => return Err(DecodingErrorKind::UnknownCommand(command_byte & COMMAND_MASK)),
            };

            let end = position + kind.size();
            if end > data.len() {
                return Err(DecodingErrorKind::Truncated);
            }
            let command = Self::decode_command(&data[position..end])
                .map_err(|_| DecodingErrorKind::Truncated)?;

            let payload_end = end + command.body.data_length();
            if payload_end > data.len() {
                return Err(DecodingErrorKind::Truncated);
            }
            commands.push(DecodedCommand { command, payload: &data[end..payload_end] });
            position = payload_end;
        }

        Ok(commands)
    }

    /// Decodes one command from exactly its fixed-size bytes.
    pub fn decode_command(bytes: &[u8]) -> io::Result<Command> {
        let mut cursor = Cursor::new(bytes);
        let header = CommandHeader {
            command: cursor.read_u8()?,
            channel_id: cursor.read_u8()?,
            reliable_sequence_number: cursor.read_u16::<BigEndian>()?,
        };

        let body = match header.kind() {
            Some(CommandKind::Acknowledge) => ProtocolCommand::Acknowledge {
                received_reliable_sequence_number: cursor.read_u16::<BigEndian>()?,
                received_sent_time: cursor.read_u16::<BigEndian>()?,
            },
            Some(CommandKind::Connect) => {
                let params = Self::decode_connect_params(&mut cursor)?;
                ProtocolCommand::Connect { params, data: cursor.read_u32::<BigEndian>()? }
            }
            Some(CommandKind::VerifyConnect) => {
                ProtocolCommand::VerifyConnect(Self::decode_connect_params(&mut cursor)?)
            }
            Some(CommandKind::Disconnect) => {
                ProtocolCommand::Disconnect { data: cursor.read_u32::<BigEndian>()? }
            }
            Some(CommandKind::Ping) => ProtocolCommand::Ping,
            Some(CommandKind::SendReliable) => {
                ProtocolCommand::SendReliable { data_length: cursor.read_u16::<BigEndian>()? }
            }
            Some(CommandKind::SendUnreliable) => ProtocolCommand::SendUnreliable {
                unreliable_sequence_number: cursor.read_u16::<BigEndian>()?,
                data_length: cursor.read_u16::<BigEndian>()?,
            },
            Some(CommandKind::SendFragment) => {
                ProtocolCommand::SendFragment(Self::decode_fragment_params(&mut cursor)?)
            }
            Some(CommandKind::SendUnsequenced) => ProtocolCommand::SendUnsequenced {
                unsequenced_group: cursor.read_u16::<BigEndian>()?,
                data_length: cursor.read_u16::<BigEndian>()?,
            },
            Some(CommandKind::BandwidthLimit) => ProtocolCommand::BandwidthLimit {
                incoming_bandwidth: cursor.read_u32::<BigEndian>()?,
                outgoing_bandwidth: cursor.read_u32::<BigEndian>()?,
            },
            Some(CommandKind::ThrottleConfigure) => ProtocolCommand::ThrottleConfigure {
                packet_throttle_interval: cursor.read_u32::<BigEndian>()?,
                packet_throttle_acceleration: cursor.read_u32::<BigEndian>()?,
                packet_throttle_deceleration: cursor.read_u32::<BigEndian>()?,
            },
            Some(CommandKind::SendUnreliableFragment) => {
                ProtocolCommand::SendUnreliableFragment(Self::decode_fragment_params(&mut cursor)?)
            }
            Some(CommandKind::None) | None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Unknown command type: {}", header.command & COMMAND_MASK),
                ));
            }
        };

        Ok(Command { header, body })
    }

    fn decode_connect_params(cursor: &mut Cursor<&[u8]>) -> io::Result<ConnectParams> {
        Ok(ConnectParams {
            outgoing_peer_id: cursor.read_u16::<BigEndian>()?,
            incoming_session_id: cursor.read_u8()?,
            outgoing_session_id: cursor.read_u8()?,
            mtu: cursor.read_u32::<BigEndian>()?,
            window_size: cursor.read_u32::<BigEndian>()?,
            channel_count: cursor.read_u32::<BigEndian>()?,
            incoming_bandwidth: cursor.read_u32::<BigEndian>()?,
            outgoing_bandwidth: cursor.read_u32::<BigEndian>()?,
            packet_throttle_interval: cursor.read_u32::<BigEndian>()?,
            packet_throttle_acceleration: cursor.read_u32::<BigEndian>()?,
            packet_throttle_deceleration: cursor.read_u32::<BigEndian>()?,
            connect_id: cursor.read_u32::<BigEndian>()?,
        })
    }

    fn decode_fragment_params(cursor: &mut Cursor<&[u8]>) -> io::Result<FragmentParams> {
        Ok(FragmentParams {
            start_sequence_number: cursor.read_u16::<BigEndian>()?,
            data_length: cursor.read_u16::<BigEndian>()?,
            fragment_count: cursor.read_u32::<BigEndian>()?,
            fragment_number: cursor.read_u32::<BigEndian>()?,
            total_length: cursor.read_u32::<BigEndian>()?,
            fragment_offset: cursor.read_u32::<BigEndian>()?,
        })
    }
}
