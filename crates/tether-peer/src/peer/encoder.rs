use tether_core::{
    constants::MAX_PACKET_COMMANDS,
    error::Result,
    ordered_queue::NodeId,
    time::{time_difference, time_greater_equal, time_less},
};
use tether_protocol::{
    command_codec::{header::MAX_HEADER_SIZE, CHECKSUM_SIZE},
    Command, CommandEncoder, CommandKind, ProtocolCommand,
};

use crate::{host_context::HostContext, peer_state::PeerState};

use super::Peer;

/// Commands packed for one datagram, waiting for the host to add the header and send it.
#[derive(Debug, Clone, Default)]
pub struct OutgoingDatagram {
    /// Encoded commands, each followed by its payload
    pub commands: Vec<u8>,
    /// Number of commands packed
    pub command_count: usize,
    /// Whether the header must carry the sent time (set when a reliable command is packed)
    pub needs_sent_time: bool,
    size: usize,
}

impl OutgoingDatagram {
    fn new(context: &HostContext, mtu: u32) -> Self {
        let mut size = MAX_HEADER_SIZE;
        if context.checksum_enabled {
            size += CHECKSUM_SIZE;
        }
        OutgoingDatagram {
            commands: Vec::with_capacity(mtu as usize),
            command_count: 0,
            needs_sent_time: false,
            size,
        }
    }

    /// Bytes the finished datagram occupies, header included.
    pub fn size(&self) -> usize {
        self.size
    }

    fn room(&self, mtu: u32) -> usize {
        (mtu as usize).saturating_sub(self.size)
    }

    fn is_full(&self) -> bool {
        self.command_count >= MAX_PACKET_COMMANDS
    }

    fn push(&mut self, command: &Command, payload: &[u8]) -> Result<()> {
        CommandEncoder::encode_command_into(&mut self.commands, command)?;
        self.commands.extend_from_slice(payload);
        self.size += command.size() + payload.len();
        self.command_count += 1;
        Ok(())
    }
}

impl Peer {
    /// Packs acknowledgements, retransmissions and queued commands into one datagram.
    ///
    /// Returns `None` when there is nothing to send, or when a timeout ended the
    /// connection. Commands that did not fit set [`continue_sending`](Self::continue_sending).
    /// Once the datagram has gone out the host must call
    /// [`complete_datagram`](Self::complete_datagram).
    pub fn prepare_datagram(
        &mut self,
        context: &mut HostContext,
        check_for_timeouts: bool,
    ) -> Result<Option<OutgoingDatagram>> {
        self.continue_sending = false;
        let mut datagram = OutgoingDatagram::new(context, self.mtu);
        let service_time = context.service_time;

        if !self.acknowledgements.is_empty(self.acknowledgement_queue) {
            self.send_acknowledgements(context, &mut datagram)?;
        }

        if check_for_timeouts
            && !self.outgoing.is_empty(self.sent_reliable_commands)
            && time_greater_equal(service_time, self.next_timeout)
            && self.check_timeouts(context)
        {
            return Ok(None);
        }

        let can_ping = if self.outgoing.is_empty(self.outgoing_commands) {
            true
        } else {
            self.check_outgoing_commands(context, &mut datagram)?
        };
        if can_ping
            && self.outgoing.is_empty(self.sent_reliable_commands)
            && time_difference(service_time, self.last_receive_time) >= self.ping_interval
            && datagram.room(self.mtu) >= CommandKind::Ping.size()
        {
            self.ping();
            self.check_outgoing_commands(context, &mut datagram)?;
        }

        if datagram.command_count == 0 {
            return Ok(None);
        }

        if self.statistics.update_packet_loss(service_time) {
            tracing::trace!(
                peer = self.index,
                packet_loss = self.statistics.packet_loss_rate(),
                round_trip_time = self.congestion.round_trip_time,
                "packet loss updated"
            );
        }

        tracing::trace!(
            peer = self.index,
            commands = datagram.command_count,
            size = datagram.size,
            "datagram prepared"
        );
        Ok(Some(datagram))
    }

    /// Finishes a datagram handed out by [`prepare_datagram`](Self::prepare_datagram).
    ///
    /// Releases the unreliable commands it carried; they are never retransmitted.
    pub fn complete_datagram(&mut self, context: &mut HostContext, sent_bytes: usize) {
        self.last_send_time = context.service_time;
        self.statistics.bytes_sent += sent_bytes as u64;

        if self.outgoing.is_empty(self.sent_unreliable_commands) {
            return;
        }
        while let Some(outgoing) = self.outgoing.pop_front(self.sent_unreliable_commands) {
            if let Some(packet) = outgoing.packet {
                packet.acknowledge();
            }
        }
        self.disconnect_if_drained(context);
    }

    fn disconnect_if_drained(&mut self, context: &mut HostContext) {
        if self.state == PeerState::DisconnectLater
            && self.outgoing.is_empty(self.outgoing_commands)
            && self.outgoing.is_empty(self.sent_reliable_commands)
            && self.outgoing.is_empty(self.sent_unreliable_commands)
        {
            let data = self.event_data;
            self.disconnect(context, data);
        }
    }

    fn send_acknowledgements(
        &mut self,
        context: &mut HostContext,
        datagram: &mut OutgoingDatagram,
    ) -> Result<()> {
        while let Some(node) = self.acknowledgements.front(self.acknowledgement_queue) {
            if datagram.is_full() || datagram.room(self.mtu) < CommandKind::Acknowledge.size() {
                self.continue_sending = true;
                break;
            }
            let Some(acknowledgement) = self.acknowledgements.remove(node) else {
                break;
            };

            let sequence_number = acknowledgement.header.reliable_sequence_number;
            let mut command = Command::new(
                0,
                acknowledgement.header.channel_id,
                ProtocolCommand::Acknowledge {
                    received_reliable_sequence_number: sequence_number,
                    received_sent_time: acknowledgement.sent_time,
                },
            );
            command.header.reliable_sequence_number = sequence_number;
            datagram.push(&command, &[])?;

            if acknowledgement.header.kind() == Some(CommandKind::Disconnect) {
                self.dispatch_state(context, PeerState::Zombie);
            }
        }
        Ok(())
    }

    /// Requeues reliable commands whose retransmission timeout expired.
    ///
    /// Returns true when the peer timed out altogether.
    fn check_timeouts(&mut self, context: &mut HostContext) -> bool {
        let service_time = context.service_time;
        let insert_position = self.outgoing.begin(self.outgoing_commands);
        let end = self.outgoing.end(self.sent_reliable_commands);
        let mut current = self.outgoing.begin(self.sent_reliable_commands);

        while current != end {
            let node = current;
            current = self.outgoing.next(current);
            let Some(outgoing) = self.outgoing.get_mut(node) else {
                continue;
            };

            if time_difference(service_time, outgoing.sent_time) < outgoing.round_trip_timeout {
                continue;
            }

            if self.earliest_timeout == 0 || time_less(outgoing.sent_time, self.earliest_timeout) {
                self.earliest_timeout = outgoing.sent_time;
            }
            if self.earliest_timeout != 0 {
                let waited = time_difference(service_time, self.earliest_timeout);
                if waited >= self.timeout_maximum
                    || (outgoing.round_trip_timeout >= outgoing.round_trip_timeout_limit
                        && waited >= self.timeout_minimum)
                {
                    tracing::debug!(peer = self.index, waited, "peer timed out");
                    self.notify_disconnect(context);
                    return true;
                }
            }

            if outgoing.packet.is_some() {
                self.reliable_data_in_transit =
                    self.reliable_data_in_transit.saturating_sub(outgoing.fragment_length as u32);
            }
            self.statistics.packets_lost += 1;
            outgoing.round_trip_timeout = outgoing.round_trip_timeout.saturating_mul(2);
            tracing::trace!(
                peer = self.index,
                sequence = outgoing.reliable_sequence_number,
                timeout = outgoing.round_trip_timeout,
                "retransmitting"
            );
            self.outgoing.move_node(insert_position, node);

            if current == self.outgoing.begin(self.sent_reliable_commands) {
                if let Some(front) = self.outgoing.get(current) {
                    self.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
                }
            }
        }
        false
    }

    /// Moves as many outgoing commands into `datagram` as fit.
    ///
    /// Returns false when a reliable command went out, which makes a keep-alive ping
    /// unnecessary.
    fn check_outgoing_commands(
        &mut self,
        context: &mut HostContext,
        datagram: &mut OutgoingDatagram,
    ) -> Result<bool> {
        let service_time = context.service_time;
        let mut window_exceeded = false;
        let mut window_wrap = false;
        let mut can_ping = true;

        let end = self.outgoing.end(self.outgoing_commands);
        let mut current = self.outgoing.begin(self.outgoing_commands);

        while current != end {
            let node = current;
            let Some(outgoing) = self.outgoing.get(node) else {
                break;
            };
            let header = outgoing.command.header;
            let acknowledged = header.is_acknowledged();
            let channel_index = header.channel_id as usize;
            let has_packet = outgoing.packet.is_some();

            if acknowledged {
                if let Some(channel) = self.channels.get(channel_index) {
                    if !window_wrap
                        && outgoing.send_attempts < 1
                        && channel.window_wraps(outgoing.reliable_sequence_number)
                    {
                        window_wrap = true;
                    }
                    if window_wrap {
                        current = self.outgoing.next(current);
                        continue;
                    }
                }
                if has_packet {
                    if !window_exceeded {
                        let window = self.congestion.throttled_window(self.window_size, self.mtu);
                        if self.reliable_data_in_transit + outgoing.fragment_length as u32 > window {
                            window_exceeded = true;
                        }
                    }
                    if window_exceeded {
                        current = self.outgoing.next(current);
                        continue;
                    }
                }
                can_ping = false;
            }

            let command_size = outgoing.command.size();
            let room = datagram.room(self.mtu);
            if datagram.is_full()
                || room < command_size
                || (has_packet && room < command_size + outgoing.fragment_length as usize)
            {
                self.continue_sending = true;
                break;
            }

            current = self.outgoing.next(current);

            if acknowledged {
                let sent_reliable_was_empty = self.outgoing.is_empty(self.sent_reliable_commands);
                let round_trip_timeout = self.congestion.round_trip_timeout();
                let timeout_limit = self.timeout_limit;
                let Some(outgoing) = self.outgoing.get_mut(node) else {
                    break;
                };
                if outgoing.send_attempts < 1 {
                    if let Some(channel) = self.channels.get_mut(channel_index) {
                        channel.occupy_window(outgoing.reliable_sequence_number);
                    }
                }
                outgoing.send_attempts += 1;
                if outgoing.round_trip_timeout == 0 {
                    outgoing.round_trip_timeout = round_trip_timeout;
                    outgoing.round_trip_timeout_limit = timeout_limit.saturating_mul(round_trip_timeout);
                }
                if sent_reliable_was_empty {
                    self.next_timeout = service_time.wrapping_add(outgoing.round_trip_timeout);
                }
                outgoing.sent_time = service_time;
                self.reliable_data_in_transit += outgoing.fragment_length as u32;
                datagram.needs_sent_time = true;

                let sent_end = self.outgoing.end(self.sent_reliable_commands);
                self.outgoing.move_node(sent_end, node);
                if let Some(outgoing) = self.outgoing.get(node) {
                    datagram.push(&outgoing.command, outgoing.payload())?;
                }
            } else {
                if has_packet
                    && outgoing.fragment_offset == 0
                    && self.congestion.should_drop_unreliable()
                {
                    current = self.drop_unreliable_run(node);
                    continue;
                }
                if has_packet {
                    let sent_end = self.outgoing.end(self.sent_unreliable_commands);
                    self.outgoing.move_node(sent_end, node);
                    if let Some(outgoing) = self.outgoing.get(node) {
                        datagram.push(&outgoing.command, outgoing.payload())?;
                    }
                } else if let Some(outgoing) = self.outgoing.remove(node) {
                    datagram.push(&outgoing.command, &[])?;
                }
            }
            self.statistics.packets_sent += 1;
        }

        self.disconnect_if_drained(context);
        Ok(can_ping)
    }

    /// Drops the throttled unreliable command at `node` together with the following
    /// fragments of the same packet. Returns the first command left in place.
    fn drop_unreliable_run(&mut self, node: NodeId) -> NodeId {
        let end = self.outgoing.end(self.outgoing_commands);
        let Some(first) = self.outgoing.get(node) else {
            return end;
        };
        let sequence = (first.reliable_sequence_number, first.unreliable_sequence_number);

        let mut current = node;
        while current != end {
            let next = self.outgoing.next(current);
            let same_packet = self.outgoing.get(current).is_some_and(|outgoing| {
                (outgoing.reliable_sequence_number, outgoing.unreliable_sequence_number) == sequence
            });
            if !same_packet {
                break;
            }
            self.outgoing.remove(current);
            current = next;
        }
        tracing::trace!(peer = self.index, sequence = sequence.1, "throttled unreliable packet");
        current
    }
}

#[cfg(test)]
mod tests {
    use tether_core::constants::PEER_CHANNEL_ID;
    use tether_protocol::{
        command::FLAG_ACKNOWLEDGE, CommandDecoder, CommandHeader, Packet, PacketFlags,
    };

    use crate::{
        peer::test_support::{connected_peer, context},
        DisconnectOutcome,
    };

    use super::*;

    fn kinds(datagram: &OutgoingDatagram) -> Vec<CommandKind> {
        CommandDecoder::decode_commands(&datagram.commands)
            .unwrap()
            .iter()
            .map(|decoded| decoded.command.kind())
            .collect()
    }

    fn header(kind_flags: u8, channel_id: u8, sequence: u16) -> CommandHeader {
        CommandHeader { command: kind_flags, channel_id, reliable_sequence_number: sequence }
    }

    #[test]
    fn test_reliable_send_moves_to_sent_queue() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        context.service_time = 1000;
        peer.last_receive_time = 1000;
        let packet = Packet::reliable(vec![3; 100]);
        peer.send(&context, 0, &packet).unwrap();

        let datagram = peer.prepare_datagram(&mut context, true).unwrap().unwrap();
        assert_eq!(kinds(&datagram), vec![CommandKind::SendReliable]);
        assert!(datagram.needs_sent_time);
        assert_eq!(datagram.size(), MAX_HEADER_SIZE + 6 + 100);

        let sent: Vec<_> = peer.sent_reliable_commands().collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].send_attempts(), 1);
        assert_eq!(sent[0].round_trip_timeout(), 500);
        assert_eq!(peer.reliable_data_in_transit(), 100);
        assert_eq!(peer.next_timeout, 1500);
        assert_eq!(peer.channel(0).unwrap().used_reliable_windows, 1);

        peer.complete_datagram(&mut context, datagram.size());
        assert_eq!(peer.last_send_time(), 1000);
        assert_eq!(packet.reference_count(), 1);
    }

    #[test]
    fn test_acknowledgements_go_first() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        context.service_time = 10;
        peer.last_receive_time = 10;
        peer.send(&context, 0, &Packet::unreliable(vec![1; 4])).unwrap();
        peer.queue_acknowledgement(header(FLAG_ACKNOWLEDGE | 6, 0, 1), 77);

        let datagram = peer.prepare_datagram(&mut context, true).unwrap().unwrap();
        let decoded = CommandDecoder::decode_commands(&datagram.commands).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(
            decoded[0].command.body,
            ProtocolCommand::Acknowledge { received_reliable_sequence_number: 1, received_sent_time: 77 }
        );
        assert_eq!(decoded[0].command.header.reliable_sequence_number, 1);
        assert_eq!(decoded[1].command.kind(), CommandKind::SendUnreliable);
        assert_eq!(decoded[1].payload, &[1; 4]);
        assert!(!datagram.needs_sent_time);
        assert_eq!(peer.pending_acknowledgements(), 0);
    }

    #[test]
    fn test_acknowledging_disconnect_ends_connection() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        peer.change_state(&mut context, PeerState::AcknowledgingDisconnect);
        peer.queue_acknowledgement(header(FLAG_ACKNOWLEDGE | 4, PEER_CHANNEL_ID, 1), 5);

        let datagram = peer.prepare_datagram(&mut context, true).unwrap().unwrap();
        assert_eq!(kinds(&datagram), vec![CommandKind::Acknowledge]);
        assert_eq!(peer.state(), PeerState::Zombie);
        assert!(peer.needs_dispatch());
    }

    #[test]
    fn test_datagram_respects_mtu() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        peer.last_receive_time = 1;
        for _ in 0..20 {
            peer.send(&context, 0, &Packet::reliable(vec![0; 100])).unwrap();
        }

        let datagram = peer.prepare_datagram(&mut context, true).unwrap().unwrap();
        assert_eq!(datagram.command_count, (1400 - MAX_HEADER_SIZE) / 106);
        assert!(datagram.size() <= 1400);
        assert!(peer.continue_sending());
        assert_eq!(peer.outgoing_commands().count(), 20 - datagram.command_count);
    }

    #[test]
    fn test_datagram_holds_at_most_32_commands() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        peer.last_receive_time = 1;
        for _ in 0..40 {
            peer.send(&context, 0, &Packet::unreliable(vec![0; 1])).unwrap();
        }

        let datagram = peer.prepare_datagram(&mut context, true).unwrap().unwrap();
        assert_eq!(datagram.command_count, MAX_PACKET_COMMANDS);
        assert!(peer.continue_sending());
        peer.complete_datagram(&mut context, datagram.size());

        let datagram = peer.prepare_datagram(&mut context, true).unwrap().unwrap();
        assert_eq!(datagram.command_count, 8);
        assert!(!peer.continue_sending());
    }

    #[test]
    fn test_throttle_window_holds_back_reliable_data() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        peer.last_receive_time = 1;
        peer.congestion.packet_throttle = 0;
        peer.send(&context, 0, &Packet::reliable(vec![0; 3000])).unwrap();

        let datagram = peer.prepare_datagram(&mut context, true).unwrap().unwrap();
        assert_eq!(datagram.command_count, 1);
        assert_eq!(datagram.size(), 1400);
        peer.complete_datagram(&mut context, datagram.size());

        // Only one MTU worth of reliable data may be in flight.
        assert!(peer.prepare_datagram(&mut context, true).unwrap().is_none());
        assert_eq!(peer.outgoing_commands().count(), 2);
    }

    #[test]
    fn test_throttle_drops_unreliable_packets() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        peer.last_receive_time = 1;
        peer.congestion.packet_throttle = 0;
        let packet = Packet::new(vec![0; 3000], PacketFlags::UNRELIABLE_FRAGMENT);
        peer.send(&context, 0, &packet).unwrap();
        assert_eq!(packet.reference_count(), 3);

        assert!(peer.prepare_datagram(&mut context, true).unwrap().is_none());
        assert_eq!(packet.reference_count(), 0);
        assert_eq!(peer.outgoing_commands().count(), 0);
    }

    #[test]
    fn test_expired_command_is_retransmitted_with_backoff() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        context.service_time = 1000;
        peer.last_receive_time = 1000;
        peer.send(&context, 0, &Packet::reliable(vec![0; 10])).unwrap();
        let datagram = peer.prepare_datagram(&mut context, true).unwrap().unwrap();
        peer.complete_datagram(&mut context, datagram.size());

        context.service_time = 1500;
        let datagram = peer.prepare_datagram(&mut context, true).unwrap().unwrap();
        assert_eq!(kinds(&datagram), vec![CommandKind::SendReliable]);
        let sent: Vec<_> = peer.sent_reliable_commands().collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].send_attempts(), 2);
        assert_eq!(sent[0].round_trip_timeout(), 1000);
        assert_eq!(peer.statistics.packets_lost, 1);
        assert_eq!(peer.reliable_data_in_transit(), 10);
        assert_eq!(peer.channel(0).unwrap().reliable_windows[0], 1);
    }

    #[test]
    fn test_unanswered_peer_times_out() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        peer.set_timeout(1, 100, 200);
        context.service_time = 1000;
        peer.last_receive_time = 1000;
        peer.send(&context, 0, &Packet::reliable(vec![0; 10])).unwrap();
        let datagram = peer.prepare_datagram(&mut context, true).unwrap().unwrap();
        peer.complete_datagram(&mut context, datagram.size());

        context.service_time = 1500;
        assert!(peer.prepare_datagram(&mut context, true).unwrap().is_none());
        assert_eq!(peer.state(), PeerState::Zombie);
        assert!(peer.needs_dispatch());
    }

    #[test]
    fn test_timeouts_skipped_when_not_checking() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        peer.set_timeout(1, 100, 200);
        context.service_time = 1000;
        peer.last_receive_time = 1000;
        peer.send(&context, 0, &Packet::reliable(vec![0; 10])).unwrap();
        let datagram = peer.prepare_datagram(&mut context, true).unwrap().unwrap();
        peer.complete_datagram(&mut context, datagram.size());

        context.service_time = 1500;
        assert!(peer.prepare_datagram(&mut context, false).unwrap().is_none());
        assert_eq!(peer.state(), PeerState::Connected);
    }

    #[test]
    fn test_idle_peer_is_pinged() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        context.service_time = 600;

        let datagram = peer.prepare_datagram(&mut context, true).unwrap().unwrap();
        assert_eq!(kinds(&datagram), vec![CommandKind::Ping]);
        assert_eq!(peer.sent_reliable_commands().count(), 1);

        // A ping is already in flight.
        assert!(peer.prepare_datagram(&mut context, true).unwrap().is_none());
    }

    #[test]
    fn test_disconnect_later_fires_once_unreliable_data_leaves() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        peer.last_receive_time = 1;
        peer.send(&context, 0, &Packet::unreliable(vec![0; 4])).unwrap();
        assert_eq!(peer.disconnect_later(&mut context, 8), DisconnectOutcome::Deferred);

        let datagram = peer.prepare_datagram(&mut context, true).unwrap().unwrap();
        assert_eq!(peer.state(), PeerState::DisconnectLater);
        peer.complete_datagram(&mut context, datagram.size());

        assert_eq!(peer.state(), PeerState::Disconnecting);
        let queued: Vec<_> = peer.outgoing_commands().map(|c| c.command().body).collect();
        assert_eq!(queued, vec![ProtocolCommand::Disconnect { data: 8 }]);
    }
}
