//! Command encoding.
//!
//! Every command is written with its exact fixed size; payload bytes are appended
//! separately by the caller so a fragment can reference a slice of a larger packet.

use std::io;

use byteorder::{BigEndian, WriteBytesExt};

use crate::command::{Command, ConnectParams, FragmentParams, ProtocolCommand};

/// Serializes commands into bytes for transmission.
pub struct CommandEncoder;

impl CommandEncoder {
    /// Appends `command` to `buffer`, header first.
    pub fn encode_command_into(buffer: &mut Vec<u8>, command: &Command) -> io::Result<()> {
        buffer.write_u8(command.header.command)?;
        buffer.write_u8(command.header.channel_id)?;
        buffer.write_u16::<BigEndian>(command.header.reliable_sequence_number)?;

        match &command.body {
            ProtocolCommand::Acknowledge { received_reliable_sequence_number, received_sent_time } => {
                buffer.write_u16::<BigEndian>(*received_reliable_sequence_number)?;
                buffer.write_u16::<BigEndian>(*received_sent_time)?;
            }
            ProtocolCommand::Connect { params, data } => {
                Self::encode_connect_params(buffer, params)?;
                buffer.write_u32::<BigEndian>(*data)?;
            }
            ProtocolCommand::VerifyConnect(params) => {
                Self::encode_connect_params(buffer, params)?;
            }
            ProtocolCommand::Disconnect { data } => {
                buffer.write_u32::<BigEndian>(*data)?;
            }
            ProtocolCommand::Ping => {}
            ProtocolCommand::SendReliable { data_length } => {
                buffer.write_u16::<BigEndian>(*data_length)?;
            }
            ProtocolCommand::SendUnreliable { unreliable_sequence_number, data_length } => {
                buffer.write_u16::<BigEndian>(*unreliable_sequence_number)?;
                buffer.write_u16::<BigEndian>(*data_length)?;
            }
            ProtocolCommand::SendUnsequenced { unsequenced_group, data_length } => {
                buffer.write_u16::<BigEndian>(*unsequenced_group)?;
                buffer.write_u16::<BigEndian>(*data_length)?;
            }
            ProtocolCommand::SendFragment(fragment)
            | ProtocolCommand::SendUnreliableFragment(fragment) => {
                Self::encode_fragment_params(buffer, fragment)?;
            }
            ProtocolCommand::BandwidthLimit { incoming_bandwidth, outgoing_bandwidth } => {
                buffer.write_u32::<BigEndian>(*incoming_bandwidth)?;
                buffer.write_u32::<BigEndian>(*outgoing_bandwidth)?;
            }
            ProtocolCommand::ThrottleConfigure {
                packet_throttle_interval,
                packet_throttle_acceleration,
                packet_throttle_deceleration,
            } => {
                buffer.write_u32::<BigEndian>(*packet_throttle_interval)?;
                buffer.write_u32::<BigEndian>(*packet_throttle_acceleration)?;
                buffer.write_u32::<BigEndian>(*packet_throttle_deceleration)?;
            }
        }

        Ok(())
    }

    /// Encodes a single command into a fresh buffer.
    pub fn encode_command(command: &Command) -> io::Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(command.size());
        Self::encode_command_into(&mut buffer, command)?;
        Ok(buffer)
    }

    fn encode_connect_params(buffer: &mut Vec<u8>, params: &ConnectParams) -> io::Result<()> {
        buffer.write_u16::<BigEndian>(params.outgoing_peer_id)?;
        buffer.write_u8(params.incoming_session_id)?;
        buffer.write_u8(params.outgoing_session_id)?;
        buffer.write_u32::<BigEndian>(params.mtu)?;
        buffer.write_u32::<BigEndian>(params.window_size)?;
        buffer.write_u32::<BigEndian>(params.channel_count)?;
        buffer.write_u32::<BigEndian>(params.incoming_bandwidth)?;
        buffer.write_u32::<BigEndian>(params.outgoing_bandwidth)?;
        buffer.write_u32::<BigEndian>(params.packet_throttle_interval)?;
        buffer.write_u32::<BigEndian>(params.packet_throttle_acceleration)?;
        buffer.write_u32::<BigEndian>(params.packet_throttle_deceleration)?;
        buffer.write_u32::<BigEndian>(params.connect_id)?;
        Ok(())
    }

    fn encode_fragment_params(buffer: &mut Vec<u8>, fragment: &FragmentParams) -> io::Result<()> {
        buffer.write_u16::<BigEndian>(fragment.start_sequence_number)?;
        buffer.write_u16::<BigEndian>(fragment.data_length)?;
        buffer.write_u32::<BigEndian>(fragment.fragment_count)?;
        buffer.write_u32::<BigEndian>(fragment.fragment_number)?;
        buffer.write_u32::<BigEndian>(fragment.total_length)?;
        buffer.write_u32::<BigEndian>(fragment.fragment_offset)?;
        Ok(())
    }
}
