//! Connection lifecycle: state changes, resets, disconnects and the per-peer half of the
//! handshake.

use std::net::SocketAddr;

use tether_core::{
    constants::{
        MAX_MTU, MAX_PEER_ID, MAX_WINDOW_SIZE, MIN_MTU, MIN_WINDOW_SIZE, PEER_CHANNEL_ID,
        PEER_PING_INTERVAL, PEER_TIMEOUT_LIMIT, PEER_TIMEOUT_MAXIMUM, PEER_TIMEOUT_MINIMUM,
    },
    ordered_queue::{QueueArena, QueueId},
};
use tether_protocol::{
    command::{FLAG_ACKNOWLEDGE, FLAG_UNSEQUENCED},
    command_codec::header::{HEADER_SESSION_MASK, HEADER_SESSION_SHIFT},
    Command, ConnectParams, ProtocolCommand,
};

use crate::{
    bandwidth::{negotiated_window_size, window_size_for},
    channel::Channel,
    host_context::HostContext,
    peer_state::PeerState,
};

use super::Peer;

/// What the host must do after asking a peer to disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// The peer was already disconnecting or gone; nothing changed.
    Ignored,
    /// A reliable disconnect is queued; the peer waits for its acknowledgement.
    Disconnecting,
    /// The peer was never fully connected: flush the queued notice, then reset the peer.
    FlushAndReset,
    /// Reliable data is still queued; the disconnect goes out once it has drained.
    Deferred,
}

const SESSION_ID_MASK: u8 = (HEADER_SESSION_MASK >> HEADER_SESSION_SHIFT) as u8;

fn clear_queue<T>(arena: &mut QueueArena<T>, queue: QueueId) {
    while arena.pop_front(queue).is_some() {}
}

impl Peer {
    /// Returns the peer to the quiescent disconnected state with protocol defaults.
    ///
    /// Session IDs survive a reset so the next connection in this slot gets fresh ones.
    pub fn reset(&mut self, context: &mut HostContext) {
        self.on_disconnect(context);

        self.outgoing_peer_id = MAX_PEER_ID;
        self.connect_id = 0;
        self.state = PeerState::Disconnected;

        self.bandwidth.reset();
        self.statistics.reset();
        self.congestion.reset();

        self.last_send_time = 0;
        self.last_receive_time = 0;
        self.next_timeout = 0;
        self.earliest_timeout = 0;
        self.ping_interval = PEER_PING_INTERVAL;
        self.timeout_limit = PEER_TIMEOUT_LIMIT;
        self.timeout_minimum = PEER_TIMEOUT_MINIMUM;
        self.timeout_maximum = PEER_TIMEOUT_MAXIMUM;
        self.mtu = context.mtu;
        self.window_size = MAX_WINDOW_SIZE;
        self.reliable_data_in_transit = 0;
        self.outgoing_reliable_sequence_number = 0;
        self.unsequenced.reset();
        self.event_data = 0;
        self.total_waiting_data = 0;
        self.continue_sending = false;

        self.reset_queues(context);
    }

    /// Drops every queued command and every channel, releasing their packet claims.
    pub(crate) fn reset_queues(&mut self, context: &mut HostContext) {
        if let Some(node) = self.dispatch_node.take() {
            context.cancel_dispatch(node);
        }

        clear_queue(&mut self.acknowledgements, self.acknowledgement_queue);
        clear_queue(&mut self.outgoing, self.sent_reliable_commands);
        clear_queue(&mut self.outgoing, self.sent_unreliable_commands);
        clear_queue(&mut self.outgoing, self.outgoing_commands);
        clear_queue(&mut self.incoming, self.dispatched_commands);

        for channel in self.channels.drain(..) {
            self.incoming.remove_queue(channel.incoming_reliable_commands);
            self.incoming.remove_queue(channel.incoming_unreliable_commands);
        }
        self.total_waiting_data = 0;
    }

    /// Replaces the channels with `channel_count` fresh ones.
    pub(crate) fn open_channels(&mut self, channel_count: usize) {
        for channel in self.channels.drain(..) {
            self.incoming.remove_queue(channel.incoming_reliable_commands);
            self.incoming.remove_queue(channel.incoming_unreliable_commands);
        }
        let incoming = &mut self.incoming;
        self.channels = (0..channel_count).map(|_| Channel::new(incoming)).collect();
    }

    /// Drops channels beyond `channel_count`.
    pub(crate) fn truncate_channels(&mut self, channel_count: usize) {
        while self.channels.len() > channel_count {
            if let Some(channel) = self.channels.pop() {
                self.incoming.remove_queue(channel.incoming_reliable_commands);
                self.incoming.remove_queue(channel.incoming_unreliable_commands);
            }
        }
    }

    fn on_connect(&mut self, context: &mut HostContext) {
        if !self.state.is_connected() {
            if self.bandwidth.incoming_bandwidth != 0 {
                context.bandwidth_limited_peers += 1;
            }
            context.connected_peers += 1;
        }
    }

    fn on_disconnect(&mut self, context: &mut HostContext) {
        if self.state.is_connected() {
            if self.bandwidth.incoming_bandwidth != 0 {
                context.bandwidth_limited_peers = context.bandwidth_limited_peers.saturating_sub(1);
            }
            context.connected_peers = context.connected_peers.saturating_sub(1);
        }
    }

    /// Moves to `state`, keeping the host's connected-peer counters in step.
    pub fn change_state(&mut self, context: &mut HostContext, state: PeerState) {
        if state.is_connected() {
            self.on_connect(context);
        } else {
            self.on_disconnect(context);
        }
        if self.state != state {
            tracing::debug!(peer = self.index, from = ?self.state, to = ?state, "peer state changed");
        }
        self.state = state;
    }

    /// Moves to `state` and schedules the peer for event dispatch.
    pub(crate) fn dispatch_state(&mut self, context: &mut HostContext, state: PeerState) {
        self.change_state(context, state);
        self.schedule_dispatch(context);
    }

    /// Handshake completed: report the connection at the next dispatch.
    pub(crate) fn notify_connect(&mut self, context: &mut HostContext) {
        context.recalculate_bandwidth_limits = true;
        let state = if self.state == PeerState::Connecting {
            PeerState::ConnectionSucceeded
        } else {
            PeerState::ConnectionPending
        };
        self.dispatch_state(context, state);
    }

    /// Connection lost: report it at the next dispatch, or reset quietly when the
    /// application never saw it connect.
    pub(crate) fn notify_disconnect(&mut self, context: &mut HostContext) {
        if self.state.has_reached_pending() {
            context.recalculate_bandwidth_limits = true;
        }
        match self.state {
            PeerState::Disconnected | PeerState::AcknowledgingConnect | PeerState::ConnectionPending => {
                self.reset(context)
            }
            _ => self.dispatch_state(context, PeerState::Zombie),
        }
    }

    fn queue_disconnect(&mut self, flags: u8, data: u32) {
        let command = Command::new(flags, PEER_CHANNEL_ID, ProtocolCommand::Disconnect { data });
        self.queue_outgoing_command(command, None, 0, 0);
    }

    /// Starts a graceful disconnect.
    ///
    /// A connected peer sends a reliable notice and waits for its acknowledgement. A peer
    /// still in the handshake gets an unreliable notice; the host then flushes and resets it.
    pub fn disconnect(&mut self, context: &mut HostContext, data: u32) -> DisconnectOutcome {
        if matches!(
            self.state,
            PeerState::Disconnecting
                | PeerState::Disconnected
                | PeerState::AcknowledgingDisconnect
                | PeerState::Zombie
        ) {
            return DisconnectOutcome::Ignored;
        }

        self.reset_queues(context);
        let connected = self.state.is_connected();
        let flags = if connected { FLAG_ACKNOWLEDGE } else { FLAG_UNSEQUENCED };
        self.queue_disconnect(flags, data);

        if connected {
            self.on_disconnect(context);
            self.state = PeerState::Disconnecting;
            tracing::debug!(peer = self.index, "disconnecting");
            DisconnectOutcome::Disconnecting
        } else {
            DisconnectOutcome::FlushAndReset
        }
    }

    /// Queues the unreliable notice sent by an immediate disconnect.
    ///
    /// Returns true when a notice was queued and should be flushed before the peer is reset.
    pub fn queue_disconnect_notice(&mut self, context: &mut HostContext, data: u32) -> bool {
        if matches!(
            self.state,
            PeerState::Disconnected | PeerState::Zombie | PeerState::Disconnecting
        ) {
            return false;
        }
        self.reset_queues(context);
        self.queue_disconnect(FLAG_UNSEQUENCED, data);
        true
    }

    /// Disconnects once all queued outgoing data has been acknowledged.
    pub fn disconnect_later(&mut self, context: &mut HostContext, data: u32) -> DisconnectOutcome {
        if self.state.is_connected() && self.has_outgoing_data() {
            self.state = PeerState::DisconnectLater;
            self.event_data = data;
            tracing::debug!(peer = self.index, "disconnect deferred until outgoing data drains");
            DisconnectOutcome::Deferred
        } else {
            self.disconnect(context, data)
        }
    }

    /// Queues a keep-alive ping; ignored unless connected.
    pub fn ping(&mut self) {
        if self.state != PeerState::Connected {
            return;
        }
        let command = Command::new(FLAG_ACKNOWLEDGE, PEER_CHANNEL_ID, ProtocolCommand::Ping);
        self.queue_outgoing_command(command, None, 0, 0);
    }

    /// Sets the idle time after which a ping is sent. Zero restores the default.
    pub fn set_ping_interval(&mut self, ping_interval: u32) {
        self.ping_interval = if ping_interval != 0 { ping_interval } else { PEER_PING_INTERVAL };
    }

    /// Sets the timeout limit, minimum and maximum. Zero restores the default of each.
    pub fn set_timeout(&mut self, limit: u32, minimum: u32, maximum: u32) {
        self.timeout_limit = if limit != 0 { limit } else { PEER_TIMEOUT_LIMIT };
        self.timeout_minimum = if minimum != 0 { minimum } else { PEER_TIMEOUT_MINIMUM };
        self.timeout_maximum = if maximum != 0 { maximum } else { PEER_TIMEOUT_MAXIMUM };
    }

    /// Applies new throttle parameters locally and asks the remote side to use them too.
    pub fn throttle_configure(&mut self, interval: u32, acceleration: u32, deceleration: u32) {
        self.congestion.configure(interval, acceleration, deceleration);
        let command = Command::new(
            FLAG_ACKNOWLEDGE,
            PEER_CHANNEL_ID,
            ProtocolCommand::ThrottleConfigure {
                packet_throttle_interval: interval,
                packet_throttle_acceleration: acceleration,
                packet_throttle_deceleration: deceleration,
            },
        );
        self.queue_outgoing_command(command, None, 0, 0);
    }

    /// Announces the bandwidths the remote side should assume for this host.
    pub fn queue_bandwidth_limit(&mut self, incoming_bandwidth: u32, outgoing_bandwidth: u32) {
        let command = Command::new(
            FLAG_ACKNOWLEDGE,
            PEER_CHANNEL_ID,
            ProtocolCommand::BandwidthLimit { incoming_bandwidth, outgoing_bandwidth },
        );
        self.queue_outgoing_command(command, None, 0, 0);
    }

    fn connect_params(&self, context: &HostContext, window_size: u32) -> ConnectParams {
        ConnectParams {
            outgoing_peer_id: self.index as u16,
            incoming_session_id: self.incoming_session_id,
            outgoing_session_id: self.outgoing_session_id,
            mtu: self.mtu,
            window_size,
            channel_count: self.channels.len() as u32,
            incoming_bandwidth: context.incoming_bandwidth,
            outgoing_bandwidth: context.outgoing_bandwidth,
            packet_throttle_interval: self.congestion.packet_throttle_interval,
            packet_throttle_acceleration: self.congestion.packet_throttle_acceleration,
            packet_throttle_deceleration: self.congestion.packet_throttle_deceleration,
            connect_id: self.connect_id,
        }
    }

    /// Starts an outgoing connection from this (disconnected) slot by queueing CONNECT.
    pub fn begin_connect(
        &mut self,
        context: &mut HostContext,
        address: SocketAddr,
        channel_count: usize,
        connect_id: u32,
        data: u32,
    ) {
        self.open_channels(channel_count);
        self.state = PeerState::Connecting;
        self.address = Some(address);
        self.connect_id = connect_id;
        self.window_size = window_size_for(context.outgoing_bandwidth);

        let params = self.connect_params(context, self.window_size);
        let command = Command::new(FLAG_ACKNOWLEDGE, PEER_CHANNEL_ID, ProtocolCommand::Connect { params, data });
        self.queue_outgoing_command(command, None, 0, 0);
        tracing::debug!(peer = self.index, %address, connect_id, channel_count, "connecting");
    }

    /// Takes over this (disconnected) slot for an incoming CONNECT and queues VERIFY_CONNECT.
    ///
    /// `channel_count` must already be validated and clamped to the host's channel limit.
    pub fn accept_connect(
        &mut self,
        context: &mut HostContext,
        address: SocketAddr,
        params: &ConnectParams,
        channel_count: usize,
        data: u32,
    ) {
        self.open_channels(channel_count);
        self.state = PeerState::AcknowledgingConnect;
        self.connect_id = params.connect_id;
        self.address = Some(address);
        self.outgoing_peer_id = params.outgoing_peer_id;
        self.bandwidth.incoming_bandwidth = params.incoming_bandwidth;
        self.bandwidth.outgoing_bandwidth = params.outgoing_bandwidth;
        self.congestion.configure(
            params.packet_throttle_interval,
            params.packet_throttle_acceleration,
            params.packet_throttle_deceleration,
        );
        self.event_data = data;

        let mut incoming_session_id = if params.incoming_session_id == 0xFF {
            self.outgoing_session_id
        } else {
            params.incoming_session_id
        };
        incoming_session_id = incoming_session_id.wrapping_add(1) & SESSION_ID_MASK;
        if incoming_session_id == self.outgoing_session_id {
            incoming_session_id = incoming_session_id.wrapping_add(1) & SESSION_ID_MASK;
        }
        self.outgoing_session_id = incoming_session_id;

        let mut outgoing_session_id = if params.outgoing_session_id == 0xFF {
            self.incoming_session_id
        } else {
            params.outgoing_session_id
        };
        outgoing_session_id = outgoing_session_id.wrapping_add(1) & SESSION_ID_MASK;
        if outgoing_session_id == self.incoming_session_id {
            outgoing_session_id = outgoing_session_id.wrapping_add(1) & SESSION_ID_MASK;
        }
        self.incoming_session_id = outgoing_session_id;

        self.mtu = self.mtu.min(params.mtu.clamp(MIN_MTU, MAX_MTU));
        self.window_size =
            negotiated_window_size(context.outgoing_bandwidth, self.bandwidth.incoming_bandwidth);

        let reply_window = window_size_for(context.incoming_bandwidth)
            .min(params.window_size)
            .clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE);

        let mut reply = self.connect_params(context, reply_window);
        reply.incoming_session_id = incoming_session_id;
        reply.outgoing_session_id = outgoing_session_id;
        let command = Command::new(FLAG_ACKNOWLEDGE, PEER_CHANNEL_ID, ProtocolCommand::VerifyConnect(reply));
        self.queue_outgoing_command(command, None, 0, 0);
        tracing::debug!(peer = self.index, %address, connect_id = self.connect_id, channel_count, "accepting connection");
    }
}

#[cfg(test)]
mod tests {
    use tether_core::constants::{PEER_DEFAULT_ROUND_TRIP_TIME, PEER_PACKET_THROTTLE_SCALE};
    use tether_protocol::{CommandKind, Packet};

    use crate::peer::test_support::{address, connected_peer, context};

    use super::*;

    fn queued_kinds(peer: &Peer) -> Vec<(CommandKind, u8)> {
        peer.outgoing_commands()
            .map(|outgoing| (outgoing.command().kind(), outgoing.command().header.command & 0xF0))
            .collect()
    }

    #[test]
    fn test_new_peer_is_quiescent() {
        let mut context = context();
        let peer = Peer::new(3, &mut context);
        assert_eq!(peer.index(), 3);
        assert_eq!(peer.state(), PeerState::Disconnected);
        assert_eq!(peer.outgoing_peer_id(), MAX_PEER_ID);
        assert_eq!(peer.incoming_session_id(), 0xFF);
        assert_eq!(peer.round_trip_time(), PEER_DEFAULT_ROUND_TRIP_TIME);
        assert_eq!(peer.timeouts(), (32, 5000, 30000));
        assert_eq!(peer.mtu(), 1400);
        assert_eq!(context.connected_peers, 0);
    }

    #[test]
    fn test_connected_counters_follow_state() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        assert_eq!(context.connected_peers, 1);
        assert_eq!(context.bandwidth_limited_peers, 0);

        peer.change_state(&mut context, PeerState::DisconnectLater);
        assert_eq!(context.connected_peers, 1);

        peer.bandwidth.incoming_bandwidth = 1000;
        peer.change_state(&mut context, PeerState::Zombie);
        assert_eq!(context.connected_peers, 0);
        peer.change_state(&mut context, PeerState::Connected);
        assert_eq!(context.connected_peers, 1);
        assert_eq!(context.bandwidth_limited_peers, 1);

        peer.reset(&mut context);
        assert_eq!(context.connected_peers, 0);
        assert_eq!(context.bandwidth_limited_peers, 0);
    }

    #[test]
    fn test_reset_releases_queued_packets() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 2);
        let packet = Packet::reliable(vec![1; 3000]);
        peer.send(&context, 0, &packet).unwrap();
        assert_eq!(packet.reference_count(), 3);
        peer.congestion.round_trip_time = 20;

        peer.reset(&mut context);
        assert_eq!(packet.reference_count(), 0);
        assert_eq!(peer.channel_count(), 0);
        assert_eq!(peer.outgoing_commands().count(), 0);
        assert_eq!(peer.round_trip_time(), PEER_DEFAULT_ROUND_TRIP_TIME);
        assert_eq!(peer.packet_throttle(), 32);
        assert_eq!(peer.congestion.packet_throttle_limit, PEER_PACKET_THROTTLE_SCALE);
    }

    #[test]
    fn test_disconnect_connected_peer_waits_for_ack() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        peer.send(&context, 0, &Packet::reliable(vec![0; 4])).unwrap();

        assert_eq!(peer.disconnect(&mut context, 9), DisconnectOutcome::Disconnecting);
        assert_eq!(peer.state(), PeerState::Disconnecting);
        assert_eq!(context.connected_peers, 0);
        assert_eq!(peer.channel_count(), 0);
        assert_eq!(queued_kinds(&peer), vec![(CommandKind::Disconnect, FLAG_ACKNOWLEDGE)]);
        let command = peer.outgoing_commands().next().unwrap().command();
        assert_eq!(command.body, ProtocolCommand::Disconnect { data: 9 });

        assert_eq!(peer.disconnect(&mut context, 9), DisconnectOutcome::Ignored);
    }

    #[test]
    fn test_disconnect_during_handshake_needs_flush_and_reset() {
        let mut context = context();
        let mut peer = Peer::new(0, &mut context);
        peer.begin_connect(&mut context, address(), 2, 77, 0);

        assert_eq!(peer.disconnect(&mut context, 0), DisconnectOutcome::FlushAndReset);
        assert_eq!(peer.state(), PeerState::Connecting);
        assert_eq!(queued_kinds(&peer), vec![(CommandKind::Disconnect, FLAG_UNSEQUENCED)]);
    }

    #[test]
    fn test_disconnect_later_defers_while_data_queued() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        let packet = Packet::reliable(vec![5; 10]);
        peer.send(&context, 0, &packet).unwrap();

        assert_eq!(peer.disconnect_later(&mut context, 4), DisconnectOutcome::Deferred);
        assert_eq!(peer.state(), PeerState::DisconnectLater);
        assert_eq!(peer.event_data(), 4);
        assert_eq!(packet.reference_count(), 1);
        assert_eq!(context.connected_peers, 1);
    }

    #[test]
    fn test_disconnect_later_with_nothing_queued_disconnects() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        assert_eq!(peer.disconnect_later(&mut context, 0), DisconnectOutcome::Disconnecting);
        assert_eq!(peer.state(), PeerState::Disconnecting);
    }

    #[test]
    fn test_disconnect_notice() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        assert!(peer.queue_disconnect_notice(&mut context, 1));
        assert_eq!(queued_kinds(&peer), vec![(CommandKind::Disconnect, FLAG_UNSEQUENCED)]);

        peer.reset(&mut context);
        assert!(!peer.queue_disconnect_notice(&mut context, 1));
    }

    #[test]
    fn test_ping_only_when_connected() {
        let mut context = context();
        let mut peer = Peer::new(0, &mut context);
        peer.ping();
        assert_eq!(peer.outgoing_commands().count(), 0);

        let mut peer = connected_peer(&mut context, 1);
        peer.ping();
        assert_eq!(queued_kinds(&peer), vec![(CommandKind::Ping, FLAG_ACKNOWLEDGE)]);
        assert_eq!(peer.outgoing_commands().next().unwrap().reliable_sequence_number(), 1);
    }

    #[test]
    fn test_zero_restores_default_timeouts() {
        let mut context = context();
        let mut peer = Peer::new(0, &mut context);
        peer.set_timeout(8, 1000, 2000);
        assert_eq!(peer.timeouts(), (8, 1000, 2000));
        peer.set_timeout(0, 0, 0);
        assert_eq!(peer.timeouts(), (32, 5000, 30000));
        peer.set_ping_interval(100);
        assert_eq!(peer.ping_interval(), 100);
        peer.set_ping_interval(0);
        assert_eq!(peer.ping_interval(), PEER_PING_INTERVAL);
    }

    #[test]
    fn test_throttle_configure_applies_and_announces() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        peer.throttle_configure(1000, 4, 3);
        assert_eq!(peer.congestion.packet_throttle_interval, 1000);
        assert_eq!(queued_kinds(&peer), vec![(CommandKind::ThrottleConfigure, FLAG_ACKNOWLEDGE)]);
    }

    #[test]
    fn test_bandwidth_limit_is_reliable_on_peer_channel() {
        let mut context = context();
        let mut peer = connected_peer(&mut context, 1);
        peer.queue_bandwidth_limit(4096, 0);

        let outgoing = peer.outgoing_commands().next().unwrap();
        assert_eq!(outgoing.command().header.channel_id, PEER_CHANNEL_ID);
        assert_eq!(
            outgoing.command().body,
            ProtocolCommand::BandwidthLimit { incoming_bandwidth: 4096, outgoing_bandwidth: 0 }
        );
        assert_eq!(queued_kinds(&peer), vec![(CommandKind::BandwidthLimit, FLAG_ACKNOWLEDGE)]);
    }

    #[test]
    fn test_begin_connect_queues_connect() {
        let mut context = context();
        context.outgoing_bandwidth = 128 * 1024;
        let mut peer = Peer::new(5, &mut context);
        peer.begin_connect(&mut context, address(), 3, 0xABCD, 42);

        assert_eq!(peer.state(), PeerState::Connecting);
        assert_eq!(peer.channel_count(), 3);
        assert_eq!(peer.window_size(), 2 * MIN_WINDOW_SIZE);
        let command = peer.outgoing_commands().next().unwrap().command();
        match command.body {
            ProtocolCommand::Connect { params, data } => {
                assert_eq!(data, 42);
                assert_eq!(params.outgoing_peer_id, 5);
                assert_eq!(params.connect_id, 0xABCD);
                assert_eq!(params.channel_count, 3);
                assert_eq!(params.incoming_session_id, 0xFF);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(command.header.channel_id, PEER_CHANNEL_ID);
    }

    fn remote_params() -> ConnectParams {
        ConnectParams {
            outgoing_peer_id: 9,
            incoming_session_id: 0xFF,
            outgoing_session_id: 0xFF,
            mtu: 1200,
            window_size: MAX_WINDOW_SIZE,
            channel_count: 2,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            packet_throttle_interval: 5000,
            packet_throttle_acceleration: 2,
            packet_throttle_deceleration: 2,
            connect_id: 1234,
        }
    }

    #[test]
    fn test_accept_connect_negotiates_and_replies() {
        let mut context = context();
        let mut peer = Peer::new(1, &mut context);
        peer.accept_connect(&mut context, address(), &remote_params(), 2, 7);

        assert_eq!(peer.state(), PeerState::AcknowledgingConnect);
        assert_eq!(peer.outgoing_peer_id(), 9);
        assert_eq!(peer.mtu(), 1200);
        assert_eq!(peer.event_data(), 7);
        // 0xFF falls back to our own previous IDs, then advances within the 2-bit space.
        assert_eq!(peer.outgoing_session_id(), 0);
        assert_eq!(peer.incoming_session_id(), 0);

        let command = peer.outgoing_commands().next().unwrap().command();
        match command.body {
            ProtocolCommand::VerifyConnect(reply) => {
                assert_eq!(reply.outgoing_peer_id, 1);
                assert_eq!(reply.mtu, 1200);
                assert_eq!(reply.connect_id, 1234);
                assert_eq!(reply.incoming_session_id, 0);
                assert_eq!(reply.outgoing_session_id, 0);
                assert_eq!(reply.window_size, MAX_WINDOW_SIZE);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_session_ids_rotate_across_connections() {
        let mut context = context();
        let mut peer = Peer::new(1, &mut context);
        peer.accept_connect(&mut context, address(), &remote_params(), 2, 0);
        peer.reset(&mut context);

        let mut params = remote_params();
        params.incoming_session_id = 0;
        params.outgoing_session_id = 0;
        peer.accept_connect(&mut context, address(), &params, 2, 0);
        assert_eq!(peer.outgoing_session_id(), 1);
        assert_eq!(peer.incoming_session_id(), 1);
    }

    #[test]
    fn test_notify_disconnect_before_pending_resets_quietly() {
        let mut context = context();
        let mut peer = Peer::new(1, &mut context);
        peer.accept_connect(&mut context, address(), &remote_params(), 2, 0);
        peer.notify_disconnect(&mut context);
        assert_eq!(peer.state(), PeerState::Disconnected);
        assert!(!peer.needs_dispatch());
        assert!(!context.recalculate_bandwidth_limits);
    }

    #[test]
    fn test_notify_disconnect_while_connecting_reports() {
        let mut context = context();
        let mut peer = Peer::new(1, &mut context);
        peer.begin_connect(&mut context, address(), 1, 1, 0);
        peer.notify_disconnect(&mut context);
        assert_eq!(peer.state(), PeerState::Zombie);
        assert!(peer.needs_dispatch());
        assert_eq!(context.pop_dispatch(), Some(1));
    }

    #[test]
    fn test_notify_connect_picks_side() {
        let mut context = context();
        let mut client = Peer::new(0, &mut context);
        client.begin_connect(&mut context, address(), 1, 1, 0);
        client.notify_connect(&mut context);
        assert_eq!(client.state(), PeerState::ConnectionSucceeded);

        let mut server = Peer::new(1, &mut context);
        server.accept_connect(&mut context, address(), &remote_params(), 1, 0);
        server.notify_connect(&mut context);
        assert_eq!(server.state(), PeerState::ConnectionPending);
        assert!(context.recalculate_bandwidth_limits);
        assert_eq!(context.pop_dispatch(), Some(0));
        assert_eq!(context.pop_dispatch(), Some(1));
    }
}
