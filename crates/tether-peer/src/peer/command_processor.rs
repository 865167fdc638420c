use tether_core::{
    constants::{
        MAX_CHANNEL_COUNT, MAX_FRAGMENT_COUNT, MAX_MTU, MAX_WINDOW_SIZE, MIN_CHANNEL_COUNT, MIN_MTU,
        MIN_WINDOW_SIZE, PEER_CHANNEL_ID,
    },
    error::{ErrorKind, Result},
    time::{time_difference, time_less},
};
use tether_protocol::{
    Command, CommandHeader, CommandKind, ConnectParams, FragmentParams, PacketFlags,
    ProtocolCommand,
};

use crate::{bandwidth::negotiated_window_size, host_context::HostContext, peer_state::PeerState};

use super::{incoming::IncomingData, Acknowledgement, Peer, QueueOutcome};

impl Peer {
    /// Applies one received command to this peer.
    ///
    /// CONNECT is not handled here: it arrives before a peer exists and the host routes it.
    /// An error means the remaining commands of the datagram must be ignored.
    pub fn handle_command(
        &mut self,
        context: &mut HostContext,
        command: &Command,
        payload: &[u8],
    ) -> Result<()> {
        tracing::trace!(peer = self.index, kind = ?command.kind(), channel_id = command.header.channel_id, "handling command");
        match command.body {
            ProtocolCommand::Acknowledge { received_reliable_sequence_number, received_sent_time } => self
                .handle_acknowledge(
                    context,
                    command.header.channel_id,
                    received_reliable_sequence_number,
                    received_sent_time,
                ),
            ProtocolCommand::Connect { .. } => {
                Err(ErrorKind::ProtocolViolation("connect addressed to an existing peer"))
            }
            ProtocolCommand::VerifyConnect(params) => self.handle_verify_connect(context, &params),
            ProtocolCommand::Disconnect { data } => {
                self.handle_disconnect(context, command.header.is_acknowledged(), data);
                Ok(())
            }
            ProtocolCommand::Ping => self.require_connected(),
            ProtocolCommand::SendReliable { .. } => {
                self.handle_send(context, command, payload, PacketFlags::RELIABLE)
            }
            ProtocolCommand::SendUnreliable { .. } => {
                self.handle_send(context, command, payload, PacketFlags::empty())
            }
            ProtocolCommand::SendUnsequenced { unsequenced_group, .. } => {
                self.handle_send_unsequenced(context, command, payload, unsequenced_group)
            }
            ProtocolCommand::SendFragment(fragment) => {
                self.handle_send_fragment(context, command, &fragment, payload)
            }
            ProtocolCommand::SendUnreliableFragment(fragment) => {
                self.handle_send_unreliable_fragment(context, command, &fragment, payload)
            }
            ProtocolCommand::BandwidthLimit { incoming_bandwidth, outgoing_bandwidth } => {
                self.handle_bandwidth_limit(context, incoming_bandwidth, outgoing_bandwidth)
            }
            ProtocolCommand::ThrottleConfigure {
                packet_throttle_interval,
                packet_throttle_acceleration,
                packet_throttle_deceleration,
            } => {
                self.require_connected()?;
                self.congestion.configure(
                    packet_throttle_interval,
                    packet_throttle_acceleration,
                    packet_throttle_deceleration,
                );
                Ok(())
            }
        }
    }

    /// Queues the acknowledgement a received command asks for.
    ///
    /// Returns false when the command wants an acknowledgement but the datagram carried no
    /// sent time; the rest of that datagram must then be ignored.
    pub fn acknowledge_received(&mut self, command: &Command, sent_time: Option<u16>) -> bool {
        if !command.header.is_acknowledged() {
            return true;
        }
        let Some(sent_time) = sent_time else {
            return false;
        };
        match self.state {
            PeerState::Disconnecting
            | PeerState::AcknowledgingConnect
            | PeerState::Disconnected
            | PeerState::Zombie => {}
            PeerState::AcknowledgingDisconnect => {
                if command.kind() == CommandKind::Disconnect {
                    self.queue_acknowledgement(command.header, sent_time);
                }
            }
            _ => {
                self.queue_acknowledgement(command.header, sent_time);
            }
        }
        true
    }

    /// Queues an acknowledgement for `header`, unless its window is too far ahead.
    pub(crate) fn queue_acknowledgement(&mut self, header: CommandHeader, sent_time: u16) -> bool {
        if let Some(channel) = self.channels.get(header.channel_id as usize) {
            if channel.withholds_acknowledgement(header.reliable_sequence_number) {
                tracing::trace!(
                    peer = self.index,
                    channel_id = header.channel_id,
                    sequence = header.reliable_sequence_number,
                    "withholding acknowledgement"
                );
                return false;
            }
        }
        self.bandwidth.outgoing_data_total = self
            .bandwidth
            .outgoing_data_total
            .wrapping_add(CommandKind::Acknowledge.size() as u32);
        self.acknowledgements
            .push_back(self.acknowledgement_queue, Acknowledgement { sent_time, header });
        true
    }

    fn require_connected(&self) -> Result<()> {
        if self.state.is_connected() {
            Ok(())
        } else {
            Err(ErrorKind::ProtocolViolation("command requires a connected peer"))
        }
    }

    fn check_data_command(&self, context: &HostContext, channel_id: u8, length: usize) -> Result<()> {
        if channel_id as usize >= self.channels.len() || !self.state.is_connected() {
            return Err(ErrorKind::ProtocolViolation("data for an unknown channel or unconnected peer"));
        }
        if length > context.maximum_packet_size {
            return Err(ErrorKind::ProtocolViolation("data exceeds maximum packet size"));
        }
        Ok(())
    }

    fn handle_acknowledge(
        &mut self,
        context: &mut HostContext,
        channel_id: u8,
        sequence_number: u16,
        received_sent_time: u16,
    ) -> Result<()> {
        if matches!(self.state, PeerState::Disconnected | PeerState::Zombie) {
            return Ok(());
        }

        let service_time = context.service_time;
        let mut sent_time = received_sent_time as u32 | (service_time & 0xFFFF_0000);
        if (sent_time & 0x8000) > (service_time & 0x8000) {
            sent_time = sent_time.wrapping_sub(0x10000);
        }
        if time_less(service_time, sent_time) {
            return Ok(());
        }

        let round_trip_time = time_difference(service_time, sent_time).max(1);
        self.congestion.update_round_trip_time(round_trip_time, self.last_receive_time == 0);
        self.congestion.roll_epoch(service_time);
        self.last_receive_time = service_time.max(1);
        self.earliest_timeout = 0;

        let acknowledged = self.remove_sent_reliable_command(sequence_number, channel_id);

        match self.state {
            PeerState::AcknowledgingConnect => {
                if acknowledged != Some(CommandKind::VerifyConnect) {
                    return Err(ErrorKind::ProtocolViolation("expected acknowledgement of verify-connect"));
                }
                self.notify_connect(context);
            }
            PeerState::Disconnecting => {
                if acknowledged != Some(CommandKind::Disconnect) {
                    return Err(ErrorKind::ProtocolViolation("expected acknowledgement of disconnect"));
                }
                self.notify_disconnect(context);
            }
            PeerState::DisconnectLater => {
                if !self.has_outgoing_data() {
                    let data = self.event_data;
                    self.disconnect(context, data);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Removes the reliable command acknowledged by (`sequence_number`, `channel_id`).
    ///
    /// Returns the kind of the removed command, or `None` when nothing matched.
    pub(crate) fn remove_sent_reliable_command(
        &mut self,
        sequence_number: u16,
        channel_id: u8,
    ) -> Option<CommandKind> {
        let matches = |outgoing: &super::OutgoingCommand| {
            outgoing.reliable_sequence_number == sequence_number
                && outgoing.command.header.channel_id == channel_id
        };

        let mut was_sent = true;
        let mut found = self
            .outgoing
            .iter(self.sent_reliable_commands)
            .find(|(_, outgoing)| matches(outgoing))
            .map(|(node, _)| node);

        if found.is_none() {
            for (node, outgoing) in self.outgoing.iter(self.outgoing_commands) {
                if !outgoing.command.header.is_acknowledged() {
                    continue;
                }
                if outgoing.send_attempts < 1 {
                    return None;
                }
                if matches(outgoing) {
                    found = Some(node);
                    break;
                }
            }
            was_sent = false;
        }

        let outgoing = self.outgoing.remove(found?)?;
        if let Some(channel) = self.channels.get_mut(channel_id as usize) {
            channel.release_window(sequence_number);
        }
        if let Some(packet) = outgoing.packet {
            if was_sent {
                self.reliable_data_in_transit =
                    self.reliable_data_in_transit.saturating_sub(outgoing.fragment_length as u32);
            }
            packet.acknowledge();
        }

        if let Some(front) = self.outgoing.front(self.sent_reliable_commands) {
            if let Some(front) = self.outgoing.get(front) {
                self.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
            }
        }
        Some(outgoing.command.kind())
    }

    fn handle_verify_connect(&mut self, context: &mut HostContext, params: &ConnectParams) -> Result<()> {
        if self.state != PeerState::Connecting {
            return Ok(());
        }

        let channel_count = params.channel_count as usize;
        if !(MIN_CHANNEL_COUNT..=MAX_CHANNEL_COUNT).contains(&channel_count)
            || params.packet_throttle_interval != self.congestion.packet_throttle_interval
            || params.packet_throttle_acceleration != self.congestion.packet_throttle_acceleration
            || params.packet_throttle_deceleration != self.congestion.packet_throttle_deceleration
            || params.connect_id != self.connect_id
        {
            tracing::warn!(peer = self.index, "rejecting verify-connect with mismatched parameters");
            self.event_data = 0;
            self.dispatch_state(context, PeerState::Zombie);
            return Err(ErrorKind::ProtocolViolation("verify-connect does not match connect"));
        }

        self.remove_sent_reliable_command(1, PEER_CHANNEL_ID);
        self.truncate_channels(channel_count);

        self.outgoing_peer_id = params.outgoing_peer_id;
        self.incoming_session_id = params.incoming_session_id;
        self.outgoing_session_id = params.outgoing_session_id;
        self.mtu = self.mtu.min(params.mtu.clamp(MIN_MTU, MAX_MTU));
        self.window_size = self.window_size.min(params.window_size.clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE));
        self.bandwidth.incoming_bandwidth = params.incoming_bandwidth;
        self.bandwidth.outgoing_bandwidth = params.outgoing_bandwidth;

        self.notify_connect(context);
        Ok(())
    }

    fn handle_disconnect(&mut self, context: &mut HostContext, acknowledged: bool, data: u32) {
        if matches!(
            self.state,
            PeerState::Disconnected | PeerState::Zombie | PeerState::AcknowledgingDisconnect
        ) {
            return;
        }

        self.reset_queues(context);

        match self.state {
            PeerState::ConnectionSucceeded | PeerState::Disconnecting | PeerState::Connecting => {
                self.dispatch_state(context, PeerState::Zombie)
            }
            PeerState::Connected | PeerState::DisconnectLater => {
                if acknowledged {
                    self.change_state(context, PeerState::AcknowledgingDisconnect);
                } else {
                    self.dispatch_state(context, PeerState::Zombie);
                }
            }
            _ => {
                if self.state == PeerState::ConnectionPending {
                    context.recalculate_bandwidth_limits = true;
                }
                self.reset(context);
            }
        }

        if self.state != PeerState::Disconnected {
            self.event_data = data;
        }
        tracing::debug!(peer = self.index, state = ?self.state, "remote disconnected");
    }

    fn handle_bandwidth_limit(
        &mut self,
        context: &mut HostContext,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    ) -> Result<()> {
        self.require_connected()?;

        if self.bandwidth.incoming_bandwidth != 0 {
            context.bandwidth_limited_peers = context.bandwidth_limited_peers.saturating_sub(1);
        }
        self.bandwidth.incoming_bandwidth = incoming_bandwidth;
        self.bandwidth.outgoing_bandwidth = outgoing_bandwidth;
        if incoming_bandwidth != 0 {
            context.bandwidth_limited_peers += 1;
        }
        self.window_size = negotiated_window_size(incoming_bandwidth, context.outgoing_bandwidth);
        Ok(())
    }

    fn handle_send(
        &mut self,
        context: &mut HostContext,
        command: &Command,
        payload: &[u8],
        flags: PacketFlags,
    ) -> Result<()> {
        self.check_data_command(context, command.header.channel_id, payload.len())?;
        self.queue_incoming_command(context, command, IncomingData::Complete(payload), flags, 0)?;
        Ok(())
    }

    fn handle_send_unsequenced(
        &mut self,
        context: &mut HostContext,
        command: &Command,
        payload: &[u8],
        group: u16,
    ) -> Result<()> {
        self.check_data_command(context, command.header.channel_id, payload.len())?;
        let Some(index) = self.unsequenced.admit(group) else {
            return Ok(());
        };
        self.queue_incoming_command(
            context,
            command,
            IncomingData::Complete(payload),
            PacketFlags::UNSEQUENCED,
            0,
        )?;
        self.unsequenced.mark(index);
        Ok(())
    }

    fn validate_fragment(context: &HostContext, fragment: &FragmentParams) -> Result<()> {
        let total_length = fragment.total_length as usize;
        if fragment.fragment_count > MAX_FRAGMENT_COUNT
            || fragment.fragment_number >= fragment.fragment_count
            || total_length > context.maximum_packet_size
            || fragment.total_length < fragment.fragment_count
            || fragment.fragment_offset >= fragment.total_length
            || fragment.data_length as u32 > fragment.total_length - fragment.fragment_offset
        {
            return Err(ErrorKind::ProtocolViolation("inconsistent fragment"));
        }
        Ok(())
    }

    fn handle_send_fragment(
        &mut self,
        context: &mut HostContext,
        command: &Command,
        fragment: &FragmentParams,
        payload: &[u8],
    ) -> Result<()> {
        let channel_index = command.header.channel_id as usize;
        self.check_data_command(context, command.header.channel_id, payload.len())?;
        if payload.is_empty() {
            return Err(ErrorKind::ProtocolViolation("empty fragment"));
        }

        let channel = &self.channels[channel_index];
        let start_sequence_number = fragment.start_sequence_number;
        if !channel.accepts_incoming(start_sequence_number) {
            return Ok(());
        }
        Self::validate_fragment(context, fragment)?;

        let incoming_reliable = channel.incoming_reliable_sequence_number;
        let queue = channel.incoming_reliable_commands;
        let end = self.incoming.end(queue);
        let mut current = self.incoming.previous(end);
        let mut start_command = None;
        while current != end {
            let Some(incoming) = self.incoming.get(current) else {
                break;
            };
            if start_sequence_number >= incoming_reliable {
                if incoming.reliable_sequence_number < incoming_reliable {
                    current = self.incoming.previous(current);
                    continue;
                }
            } else if incoming.reliable_sequence_number >= incoming_reliable {
                break;
            }
            if incoming.reliable_sequence_number <= start_sequence_number {
                if incoming.reliable_sequence_number < start_sequence_number {
                    break;
                }
                if incoming.command.kind() != CommandKind::SendFragment
                    || fragment.total_length as usize != incoming.packet.len()
                    || fragment.fragment_count != incoming.fragment_count
                {
                    return Err(ErrorKind::ProtocolViolation("fragment does not match its packet"));
                }
                start_command = Some(current);
                break;
            }
            current = self.incoming.previous(current);
        }

        let start_command = match start_command {
            Some(node) => node,
            None => {
                let mut start = *command;
                start.header.reliable_sequence_number = start_sequence_number;
                match self.queue_incoming_command(
                    context,
                    &start,
                    IncomingData::Reassembly(fragment.total_length as usize),
                    PacketFlags::RELIABLE,
                    fragment.fragment_count,
                )? {
                    QueueOutcome::Queued(node) => node,
                    QueueOutcome::Discarded => return Ok(()),
                }
            }
        };

        if self.store_fragment(start_command, fragment, payload)? {
            self.dispatch_incoming_reliable_commands(context, channel_index, None);
        }
        Ok(())
    }

    fn handle_send_unreliable_fragment(
        &mut self,
        context: &mut HostContext,
        command: &Command,
        fragment: &FragmentParams,
        payload: &[u8],
    ) -> Result<()> {
        let channel_index = command.header.channel_id as usize;
        self.check_data_command(context, command.header.channel_id, payload.len())?;
        if payload.is_empty() {
            return Err(ErrorKind::ProtocolViolation("empty fragment"));
        }

        let channel = &self.channels[channel_index];
        let reliable_sequence_number = command.header.reliable_sequence_number;
        let start_sequence_number = fragment.start_sequence_number;
        if !channel.accepts_incoming(reliable_sequence_number) {
            return Ok(());
        }
        let incoming_reliable = channel.incoming_reliable_sequence_number;
        if reliable_sequence_number == incoming_reliable
            && start_sequence_number <= channel.incoming_unreliable_sequence_number
        {
            return Ok(());
        }
        Self::validate_fragment(context, fragment)?;

        let queue = channel.incoming_unreliable_commands;
        let end = self.incoming.end(queue);
        let mut current = self.incoming.previous(end);
        let mut start_command = None;
        while current != end {
            let Some(incoming) = self.incoming.get(current) else {
                break;
            };
            let previous = self.incoming.previous(current);
            if incoming.command.kind() == CommandKind::SendUnsequenced {
                current = previous;
                continue;
            }
            if reliable_sequence_number >= incoming_reliable {
                if incoming.reliable_sequence_number < incoming_reliable {
                    current = previous;
                    continue;
                }
            } else if incoming.reliable_sequence_number >= incoming_reliable {
                break;
            }
            if incoming.reliable_sequence_number < reliable_sequence_number {
                break;
            }
            if incoming.reliable_sequence_number > reliable_sequence_number {
                current = previous;
                continue;
            }
            if incoming.unreliable_sequence_number <= start_sequence_number {
                if incoming.unreliable_sequence_number < start_sequence_number {
                    break;
                }
                if incoming.command.kind() != CommandKind::SendUnreliableFragment
                    || fragment.total_length as usize != incoming.packet.len()
                    || fragment.fragment_count != incoming.fragment_count
                {
                    return Err(ErrorKind::ProtocolViolation("fragment does not match its packet"));
                }
                start_command = Some(current);
                break;
            }
            current = previous;
        }

        let start_command = match start_command {
            Some(node) => node,
            None => match self.queue_incoming_command(
                context,
                command,
                IncomingData::Reassembly(fragment.total_length as usize),
                PacketFlags::UNRELIABLE_FRAGMENT,
                fragment.fragment_count,
            )? {
                QueueOutcome::Queued(node) => node,
                QueueOutcome::Discarded => return Ok(()),
            },
        };

        if self.store_fragment(start_command, fragment, payload)? {
            self.dispatch_incoming_unreliable_commands(context, channel_index, None);
        }
        Ok(())
    }

    /// Copies one fragment into its reassembly buffer.
    ///
    /// Returns true when this fragment completed the packet. Repeated fragments are ignored.
    fn store_fragment(
        &mut self,
        node: tether_core::ordered_queue::NodeId,
        fragment: &FragmentParams,
        payload: &[u8],
    ) -> Result<bool> {
        let Some(incoming) = self.incoming.get_mut(node) else {
            return Ok(false);
        };
        let number = fragment.fragment_number as usize;
        let bit = 1u32 << (number % 32);
        if incoming.fragments[number / 32] & bit != 0 {
            return Ok(false);
        }

        incoming.fragments_remaining -= 1;
        incoming.fragments[number / 32] |= bit;

        let data = incoming
            .packet
            .data_mut()
            .ok_or(ErrorKind::ProtocolViolation("reassembly buffer is shared"))?;
        let offset = fragment.fragment_offset as usize;
        let length = payload.len().min(data.len() - offset);
        data[offset..offset + length].copy_from_slice(&payload[..length]);

        Ok(incoming.fragments_remaining == 0)
    }
}
