use tether_core::{
    constants::{MAX_FRAGMENT_COUNT, PEER_CHANNEL_ID},
    error::{ErrorKind, Result},
    ordered_queue::NodeId,
};
use tether_protocol::{
    command::{FLAG_ACKNOWLEDGE, FLAG_UNSEQUENCED},
    command_codec::CHECKSUM_SIZE,
    Command, FragmentParams, Packet, PacketFlags, ProtocolCommand,
};

use crate::{host_context::HostContext, peer_state::PeerState};

use super::{OutgoingCommand, Peer};

/// Bytes of an MTU taken by the datagram header and a fragment command.
const FRAGMENT_OVERHEAD: usize = 28;

impl Peer {
    /// Queues `packet` for delivery on `channel_id`.
    ///
    /// Packets longer than what fits in one datagram are split into fragments that share
    /// a start sequence number. Each queued command holds its own claim on the packet.
    pub fn send(&mut self, context: &HostContext, channel_id: u8, packet: &Packet) -> Result<()> {
        if self.state != PeerState::Connected {
            return Err(ErrorKind::NotConnected);
        }
        let channel_count = self.channels.len();
        if channel_id as usize >= channel_count {
            return Err(ErrorKind::ChannelOutOfRange { channel_id, channel_count });
        }
        if packet.len() > context.maximum_packet_size {
            return Err(ErrorKind::PacketTooLarge {
                size: packet.len(),
                maximum: context.maximum_packet_size,
            });
        }

        let mut fragment_length = self.mtu as usize - FRAGMENT_OVERHEAD;
        if context.checksum_enabled {
            fragment_length -= CHECKSUM_SIZE;
        }

        if packet.len() > fragment_length {
            return self.send_fragments(channel_id, packet, fragment_length);
        }

        let channel = &self.channels[channel_id as usize];
        let flags = packet.flags();
        let data_length = packet.len() as u16;
        let command = if !flags.contains(PacketFlags::RELIABLE)
            && flags.contains(PacketFlags::UNSEQUENCED)
        {
            Command::new(
                FLAG_UNSEQUENCED,
                channel_id,
                ProtocolCommand::SendUnsequenced { unsequenced_group: 0, data_length },
            )
        } else if flags.contains(PacketFlags::RELIABLE)
            || channel.outgoing_unreliable_sequence_number >= 0xFFFF
        {
            Command::new(FLAG_ACKNOWLEDGE, channel_id, ProtocolCommand::SendReliable { data_length })
        } else {
            Command::new(
                0,
                channel_id,
                ProtocolCommand::SendUnreliable { unreliable_sequence_number: 0, data_length },
            )
        };

        self.queue_outgoing_command(command, Some(packet), 0, data_length);
        Ok(())
    }

    fn send_fragments(&mut self, channel_id: u8, packet: &Packet, fragment_length: usize) -> Result<()> {
        let total_length = packet.len();
        let fragment_count = total_length.div_ceil(fragment_length) as u32;
        if fragment_count > MAX_FRAGMENT_COUNT {
            return Err(ErrorKind::TooManyFragments {
                count: fragment_count,
                maximum: MAX_FRAGMENT_COUNT,
            });
        }

        let channel = &self.channels[channel_id as usize];
        let unreliable = !packet.flags().contains(PacketFlags::RELIABLE)
            && packet.flags().contains(PacketFlags::UNRELIABLE_FRAGMENT)
            && channel.outgoing_unreliable_sequence_number < 0xFFFF;
        let start_sequence_number = if unreliable {
            channel.outgoing_unreliable_sequence_number.wrapping_add(1)
        } else {
            channel.outgoing_reliable_sequence_number.wrapping_add(1)
        };

        let mut fragment_offset = 0;
        let mut fragment_number = 0;
        while fragment_offset < total_length {
            let length = fragment_length.min(total_length - fragment_offset);
            let params = FragmentParams {
                start_sequence_number,
                data_length: length as u16,
                fragment_count,
                fragment_number,
                total_length: total_length as u32,
                fragment_offset: fragment_offset as u32,
            };
            let command = if unreliable {
                Command::new(0, channel_id, ProtocolCommand::SendUnreliableFragment(params))
            } else {
                Command::new(FLAG_ACKNOWLEDGE, channel_id, ProtocolCommand::SendFragment(params))
            };
            self.queue_outgoing_command(command, Some(packet), fragment_offset as u32, length as u16);

            fragment_number += 1;
            fragment_offset += length;
        }

        tracing::trace!(
            peer = self.index,
            channel_id,
            fragment_count,
            total_length,
            unreliable,
            "queued fragmented packet"
        );
        Ok(())
    }

    /// Wraps `command` into an outgoing command and queues it.
    pub(crate) fn queue_outgoing_command(
        &mut self,
        command: Command,
        packet: Option<&Packet>,
        fragment_offset: u32,
        fragment_length: u16,
    ) -> NodeId {
        let outgoing = OutgoingCommand::new(command, packet, fragment_offset, fragment_length);
        self.setup_outgoing_command(outgoing)
    }

    /// Assigns sequence numbers to `outgoing` and appends it to the outgoing queue.
    pub(crate) fn setup_outgoing_command(&mut self, mut outgoing: OutgoingCommand) -> NodeId {
        let header = outgoing.command.header;
        self.bandwidth.outgoing_data_total = self
            .bandwidth
            .outgoing_data_total
            .wrapping_add((outgoing.command.size() + outgoing.fragment_length as usize) as u32);

        if header.channel_id == PEER_CHANNEL_ID {
            self.outgoing_reliable_sequence_number = self.outgoing_reliable_sequence_number.wrapping_add(1);
            outgoing.reliable_sequence_number = self.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = 0;
        } else if header.is_acknowledged() {
            let channel = &mut self.channels[header.channel_id as usize];
            channel.outgoing_reliable_sequence_number =
                channel.outgoing_reliable_sequence_number.wrapping_add(1);
            channel.outgoing_unreliable_sequence_number = 0;
            outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = 0;
        } else if header.is_unsequenced() {
            self.unsequenced.next_outgoing_group();
            outgoing.reliable_sequence_number = 0;
            outgoing.unreliable_sequence_number = 0;
        } else {
            let channel = &mut self.channels[header.channel_id as usize];
            if outgoing.fragment_offset == 0 {
                channel.outgoing_unreliable_sequence_number =
                    channel.outgoing_unreliable_sequence_number.wrapping_add(1);
            }
            outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = channel.outgoing_unreliable_sequence_number;
        }

        outgoing.send_attempts = 0;
        outgoing.sent_time = 0;
        outgoing.round_trip_timeout = 0;
        outgoing.round_trip_timeout_limit = 0;
        outgoing.command.header.reliable_sequence_number = outgoing.reliable_sequence_number;
        match &mut outgoing.command.body {
            ProtocolCommand::SendUnreliable { unreliable_sequence_number, .. } => {
                *unreliable_sequence_number = outgoing.unreliable_sequence_number;
            }
            ProtocolCommand::SendUnsequenced { unsequenced_group, .. } => {
                *unsequenced_group = self.unsequenced.outgoing_group();
            }
            _ => {}
        }

        self.outgoing.push_back(self.outgoing_commands, outgoing)
    }
}

#[cfg(test)]
mod tests {
    use tether_protocol::{CommandKind, Packet, PacketFlags, ProtocolCommand};

    use crate::peer::test_support::{connected_peer, context};

    use super::*;

    #[test]
    fn test_small_reliable_send_queues_one_command() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 2);
        let before = peer.bandwidth.outgoing_data_total;

        let packet = Packet::reliable(vec![7; 10]);
        peer.send(&context, 1, &packet).unwrap();

        let commands: Vec<_> = peer.outgoing_commands().collect();
        assert_eq!(commands.len(), 1);
        let command = commands[0].command();
        assert_eq!(command.kind(), CommandKind::SendReliable);
        assert!(command.header.is_acknowledged());
        assert_eq!(command.header.channel_id, 1);
        assert_eq!(command.header.reliable_sequence_number, 1);
        assert_eq!(command.body, ProtocolCommand::SendReliable { data_length: 10 });
        assert_eq!(peer.bandwidth.outgoing_data_total - before, 16);
        assert_eq!(packet.reference_count(), 1);
    }

    #[test]
    fn test_large_send_is_fragmented() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        let payload: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        let packet = Packet::reliable(payload);
        peer.send(&context, 0, &packet).unwrap();

        let commands: Vec<_> = peer.outgoing_commands().collect();
        assert_eq!(commands.len(), 4);
        assert_eq!(packet.reference_count(), 4);

        let mut expected_offset = 0;
        for (number, outgoing) in commands.iter().enumerate() {
            let fragment = outgoing.command().body.fragment().copied().unwrap();
            assert_eq!(outgoing.command().kind(), CommandKind::SendFragment);
            assert_eq!(fragment.start_sequence_number, 1);
            assert_eq!(fragment.fragment_count, 4);
            assert_eq!(fragment.fragment_number, number as u32);
            assert_eq!(fragment.total_length, 5000);
            assert_eq!(fragment.fragment_offset, expected_offset);
            assert_eq!(outgoing.reliable_sequence_number(), number as u16 + 1);
            expected_offset += fragment.data_length as u32;
        }
        assert_eq!(expected_offset, 5000);
        assert_eq!(commands[0].fragment_length(), 1372);
        assert_eq!(commands[3].fragment_length(), 5000 - 3 * 1372);
    }

    #[test]
    fn test_checksum_shrinks_fragments() {
        let mut context = context();
        context.checksum_enabled = true;
        let mut peer = connected_peer(&mut context, 1);
        peer.send(&context, 0, &Packet::reliable(vec![0; 1370])).unwrap();
        assert_eq!(peer.outgoing_commands().count(), 2);
    }

    #[test]
    fn test_unreliable_fragments_share_one_unreliable_sequence() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        let packet = Packet::new(vec![1; 3000], PacketFlags::UNRELIABLE_FRAGMENT);
        peer.send(&context, 0, &packet).unwrap();

        let commands: Vec<_> = peer.outgoing_commands().collect();
        assert_eq!(commands.len(), 3);
        for outgoing in &commands {
            assert_eq!(outgoing.command().kind(), CommandKind::SendUnreliableFragment);
            assert_eq!(outgoing.unreliable_sequence_number(), 1);
            assert_eq!(outgoing.command().body.fragment().unwrap().start_sequence_number, 1);
        }
        assert_eq!(peer.channel(0).unwrap().outgoing_unreliable_sequence_number, 1);
        assert_eq!(peer.channel(0).unwrap().outgoing_reliable_sequence_number, 0);
    }

    #[test]
    fn test_unfragmented_kind_selection() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        peer.send(&context, 0, &Packet::unsequenced(vec![1])).unwrap();
        peer.send(&context, 0, &Packet::unreliable(vec![2])).unwrap();
        peer.send(&context, 0, &Packet::unreliable(vec![3])).unwrap();
        peer.send(&context, 0, &Packet::reliable(vec![4])).unwrap();
        peer.send(&context, 0, &Packet::unreliable(vec![5])).unwrap();

        let summary: Vec<_> = peer
            .outgoing_commands()
            .map(|outgoing| {
                (
                    outgoing.command().kind(),
                    outgoing.reliable_sequence_number(),
                    outgoing.unreliable_sequence_number(),
                )
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                (CommandKind::SendUnsequenced, 0, 0),
                (CommandKind::SendUnreliable, 0, 1),
                (CommandKind::SendUnreliable, 0, 2),
                (CommandKind::SendReliable, 1, 0),
                (CommandKind::SendUnreliable, 1, 1),
            ]
        );
        let first = peer.outgoing_commands().next().unwrap();
        assert!(first.command().header.is_unsequenced());
        assert_eq!(
            first.command().body,
            ProtocolCommand::SendUnsequenced { unsequenced_group: 1, data_length: 1 }
        );
    }

    #[test]
    fn test_saturated_unreliable_counter_forces_reliable() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        peer.channels[0].outgoing_unreliable_sequence_number = 0xFFFF;
        peer.send(&context, 0, &Packet::unreliable(vec![1])).unwrap();
        assert_eq!(peer.outgoing_commands().next().unwrap().command().kind(), CommandKind::SendReliable);
    }

    #[test]
    fn test_send_rejections() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 2);
        let packet = Packet::reliable(vec![0; 4]);

        assert!(matches!(
            peer.send(&context, 2, &packet),
            Err(ErrorKind::ChannelOutOfRange { channel_id: 2, channel_count: 2 })
        ));

        context.maximum_packet_size = 3;
        assert!(matches!(peer.send(&context, 0, &packet), Err(ErrorKind::PacketTooLarge { .. })));

        peer.state = PeerState::Disconnecting;
        assert!(matches!(peer.send(&context, 0, &packet), Err(ErrorKind::NotConnected)));
        assert_eq!(peer.outgoing_commands().count(), 0);
    }
}
