//! Remote peer: connection state machine and reliability engine.
//!
//! A [`Peer`] owns everything scoped to one connection: its channels, its command queues,
//! RTT and throttle estimation, and bandwidth accounting. Operations that touch host-wide
//! state take the [`HostContext`] explicitly.
//!
//! # Queues
//!
//! - outgoing: commands waiting to be packed into a datagram
//! - sent reliable: transmitted reliable commands awaiting acknowledgement
//! - sent unreliable: unreliable commands packed into the datagram being assembled
//! - dispatched: received packets ready for the application
//! - acknowledgements: acknowledgements waiting to be sent
//!
//! Outgoing commands move between the first three without being copied; they all live in
//! one arena. Incoming commands share a second arena between the per-channel queues and
//! the dispatched queue.

use std::net::SocketAddr;

use tether_core::{
    constants::{
        MAX_PEER_ID, MAX_WINDOW_SIZE, PEER_PING_INTERVAL, PEER_TIMEOUT_LIMIT, PEER_TIMEOUT_MAXIMUM,
        PEER_TIMEOUT_MINIMUM,
    },
    ordered_queue::{NodeId, QueueArena, QueueId},
};
use tether_protocol::{Command, CommandHeader, Packet, PacketRef};

use crate::{
    bandwidth::PeerBandwidth, channel::Channel, congestion::Congestion, host_context::HostContext,
    peer_state::PeerState, statistics::PeerStatistics, unsequenced::UnsequencedWindow,
};

mod command_processor;
mod encoder;
mod fragmenter;
mod incoming;
mod lifecycle;

pub use encoder::OutgoingDatagram;
pub use incoming::QueueOutcome;
pub use lifecycle::DisconnectOutcome;

/// A command queued for sending, or sent and awaiting acknowledgement.
#[derive(Debug)]
pub struct OutgoingCommand {
    pub(crate) command: Command,
    pub(crate) reliable_sequence_number: u16,
    pub(crate) unreliable_sequence_number: u16,
    pub(crate) sent_time: u32,
    pub(crate) round_trip_timeout: u32,
    pub(crate) round_trip_timeout_limit: u32,
    pub(crate) send_attempts: u32,
    pub(crate) fragment_offset: u32,
    pub(crate) fragment_length: u16,
    pub(crate) packet: Option<PacketRef>,
}

impl OutgoingCommand {
    pub(crate) fn new(
        command: Command,
        packet: Option<&Packet>,
        fragment_offset: u32,
        fragment_length: u16,
    ) -> Self {
        OutgoingCommand {
            command,
            reliable_sequence_number: 0,
            unreliable_sequence_number: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
            send_attempts: 0,
            fragment_offset,
            fragment_length,
            packet: packet.map(PacketRef::new),
        }
    }

    /// The protocol command, with sequence numbers filled in.
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Reliable sequence number assigned when queued.
    pub fn reliable_sequence_number(&self) -> u16 {
        self.reliable_sequence_number
    }

    /// Unreliable sequence number assigned when queued.
    pub fn unreliable_sequence_number(&self) -> u16 {
        self.unreliable_sequence_number
    }

    /// Times this command has been put on the wire.
    pub fn send_attempts(&self) -> u32 {
        self.send_attempts
    }

    /// Current retransmission timeout.
    pub fn round_trip_timeout(&self) -> u32 {
        self.round_trip_timeout
    }

    /// Offset of this command's slice into its packet.
    pub fn fragment_offset(&self) -> u32 {
        self.fragment_offset
    }

    /// Length of this command's slice of its packet.
    pub fn fragment_length(&self) -> u16 {
        self.fragment_length
    }

    /// Packet carried by this command, if any.
    pub fn packet(&self) -> Option<&Packet> {
        self.packet.as_ref().map(PacketRef::packet)
    }

    /// Bytes of payload that follow the command on the wire.
    pub(crate) fn payload(&self) -> &[u8] {
        match &self.packet {
            Some(packet) => {
                let start = self.fragment_offset as usize;
                let end = start + self.fragment_length as usize;
                packet.data().get(start..end).unwrap_or_default()
            }
            None => &[],
        }
    }
}

/// A received command waiting in a channel queue or in the dispatched queue.
#[derive(Debug)]
pub struct IncomingCommand {
    pub(crate) reliable_sequence_number: u16,
    pub(crate) unreliable_sequence_number: u16,
    pub(crate) command: Command,
    pub(crate) fragment_count: u32,
    pub(crate) fragments_remaining: u32,
    pub(crate) fragments: Vec<u32>,
    pub(crate) packet: PacketRef,
}

impl IncomingCommand {
    /// The received command.
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Fragments still missing; zero for complete packets.
    pub fn fragments_remaining(&self) -> u32 {
        self.fragments_remaining
    }

    /// The received (or reassembling) packet.
    pub fn packet(&self) -> &Packet {
        self.packet.packet()
    }
}

/// Acknowledgement waiting to be sent.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Acknowledgement {
    pub(crate) sent_time: u16,
    pub(crate) header: CommandHeader,
}

/// A remote peer.
#[derive(Debug)]
pub struct Peer {
    index: usize,
    pub(crate) outgoing_peer_id: u16,
    pub(crate) incoming_session_id: u8,
    pub(crate) outgoing_session_id: u8,
    pub(crate) connect_id: u32,
    pub(crate) address: Option<SocketAddr>,
    pub(crate) state: PeerState,
    pub(crate) channels: Vec<Channel>,

    /// Advertised bandwidths and byte totals
    pub bandwidth: PeerBandwidth,
    /// RTT estimation and packet throttle
    pub congestion: Congestion,
    /// Traffic counters and packet loss
    pub statistics: PeerStatistics,

    pub(crate) last_send_time: u32,
    pub(crate) last_receive_time: u32,
    pub(crate) next_timeout: u32,
    pub(crate) earliest_timeout: u32,
    pub(crate) ping_interval: u32,
    pub(crate) timeout_limit: u32,
    pub(crate) timeout_minimum: u32,
    pub(crate) timeout_maximum: u32,
    pub(crate) mtu: u32,
    pub(crate) window_size: u32,
    pub(crate) reliable_data_in_transit: u32,
    pub(crate) outgoing_reliable_sequence_number: u16,
    pub(crate) unsequenced: UnsequencedWindow,
    pub(crate) event_data: u32,
    pub(crate) total_waiting_data: usize,
    pub(crate) dispatch_node: Option<NodeId>,
    pub(crate) continue_sending: bool,

    pub(crate) outgoing: QueueArena<OutgoingCommand>,
    pub(crate) outgoing_commands: QueueId,
    pub(crate) sent_reliable_commands: QueueId,
    pub(crate) sent_unreliable_commands: QueueId,

    pub(crate) incoming: QueueArena<IncomingCommand>,
    pub(crate) dispatched_commands: QueueId,

    pub(crate) acknowledgements: QueueArena<Acknowledgement>,
    pub(crate) acknowledgement_queue: QueueId,
}

impl Peer {
    /// Creates the quiescent peer for slot `index` of a host's table.
    pub fn new(index: usize, context: &mut HostContext) -> Self {
        let mut outgoing = QueueArena::new();
        let outgoing_commands = outgoing.create_queue();
        let sent_reliable_commands = outgoing.create_queue();
        let sent_unreliable_commands = outgoing.create_queue();
        let mut incoming = QueueArena::new();
        let dispatched_commands = incoming.create_queue();
        let mut acknowledgements = QueueArena::new();
        let acknowledgement_queue = acknowledgements.create_queue();

        let mut peer = Peer {
            index,
            outgoing_peer_id: MAX_PEER_ID,
            incoming_session_id: 0xFF,
            outgoing_session_id: 0xFF,
            connect_id: 0,
            address: None,
            state: PeerState::Disconnected,
            channels: Vec::new(),
            bandwidth: PeerBandwidth::default(),
            congestion: Congestion::default(),
            statistics: PeerStatistics::default(),
            last_send_time: 0,
            last_receive_time: 0,
            next_timeout: 0,
            earliest_timeout: 0,
            ping_interval: PEER_PING_INTERVAL,
            timeout_limit: PEER_TIMEOUT_LIMIT,
            timeout_minimum: PEER_TIMEOUT_MINIMUM,
            timeout_maximum: PEER_TIMEOUT_MAXIMUM,
            mtu: context.mtu,
            window_size: MAX_WINDOW_SIZE,
            reliable_data_in_transit: 0,
            outgoing_reliable_sequence_number: 0,
            unsequenced: UnsequencedWindow::default(),
            event_data: 0,
            total_waiting_data: 0,
            dispatch_node: None,
            continue_sending: false,
            outgoing,
            outgoing_commands,
            sent_reliable_commands,
            sent_unreliable_commands,
            incoming,
            dispatched_commands,
            acknowledgements,
            acknowledgement_queue,
        };
        peer.reset(context);
        peer
    }

    /// Slot index in the host's table, which is also the peer ID the remote side uses.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current connection state.
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Remote address, once known.
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Peer ID assigned to us by the remote side.
    pub fn outgoing_peer_id(&self) -> u16 {
        self.outgoing_peer_id
    }

    /// Session ID expected on incoming datagrams.
    pub fn incoming_session_id(&self) -> u8 {
        self.incoming_session_id
    }

    /// Session ID stamped on outgoing datagrams.
    pub fn outgoing_session_id(&self) -> u8 {
        self.outgoing_session_id
    }

    /// Random ID identifying this connection attempt.
    pub fn connect_id(&self) -> u32 {
        self.connect_id
    }

    /// Negotiated MTU.
    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Negotiated reliable window size in bytes.
    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    /// Number of channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Channel state, if `channel_id` is in range.
    pub fn channel(&self, channel_id: u8) -> Option<&Channel> {
        self.channels.get(channel_id as usize)
    }

    /// Application data attached to the last connect or disconnect.
    pub fn event_data(&self) -> u32 {
        self.event_data
    }

    /// Bytes received but not yet taken by the application.
    pub fn total_waiting_data(&self) -> usize {
        self.total_waiting_data
    }

    /// Bytes of reliable data on the wire without acknowledgement.
    pub fn reliable_data_in_transit(&self) -> u32 {
        self.reliable_data_in_transit
    }

    /// Smoothed round-trip time in milliseconds.
    pub fn round_trip_time(&self) -> u32 {
        self.congestion.round_trip_time
    }

    /// Current packet throttle.
    pub fn packet_throttle(&self) -> u32 {
        self.congestion.packet_throttle
    }

    /// Interval between keep-alive pings.
    pub fn ping_interval(&self) -> u32 {
        self.ping_interval
    }

    /// Timeout limit, minimum and maximum.
    pub fn timeouts(&self) -> (u32, u32, u32) {
        (self.timeout_limit, self.timeout_minimum, self.timeout_maximum)
    }

    /// Service time of the last datagram sent to this peer.
    pub fn last_send_time(&self) -> u32 {
        self.last_send_time
    }

    /// Service time of the last acknowledgement received from this peer.
    pub fn last_receive_time(&self) -> u32 {
        self.last_receive_time
    }

    /// Commands waiting to be sent, front to back.
    pub fn outgoing_commands(&self) -> impl Iterator<Item = &OutgoingCommand> + '_ {
        self.outgoing.iter(self.outgoing_commands).map(|(_, command)| command)
    }

    /// Reliable commands sent and awaiting acknowledgement, oldest first.
    pub fn sent_reliable_commands(&self) -> impl Iterator<Item = &OutgoingCommand> + '_ {
        self.outgoing.iter(self.sent_reliable_commands).map(|(_, command)| command)
    }

    /// Number of acknowledgements waiting to be sent.
    pub fn pending_acknowledgements(&self) -> usize {
        self.acknowledgements.size(self.acknowledgement_queue)
    }

    /// Number of packets ready for [`receive`](Self::receive).
    pub fn dispatched_count(&self) -> usize {
        self.incoming.size(self.dispatched_commands)
    }

    /// True when anything is queued or in flight toward the peer.
    pub fn has_outgoing_data(&self) -> bool {
        !self.outgoing.is_empty(self.outgoing_commands)
            || !self.outgoing.is_empty(self.sent_reliable_commands)
    }

    /// True while the peer sits on the host's dispatch queue.
    pub fn needs_dispatch(&self) -> bool {
        self.dispatch_node.is_some()
    }

    /// Clears the dispatch flag after the host popped this peer off its dispatch queue.
    pub fn mark_dispatched(&mut self) {
        self.dispatch_node = None;
    }

    /// Whether the last datagram attempt left commands that did not fit.
    pub fn continue_sending(&self) -> bool {
        self.continue_sending
    }

    /// Records an authenticated datagram from this peer.
    pub fn record_datagram_received(&mut self, address: SocketAddr, length: usize) {
        self.address = Some(address);
        self.bandwidth.incoming_data_total =
            self.bandwidth.incoming_data_total.wrapping_add(length as u32);
        self.statistics.packets_received += 1;
        self.statistics.bytes_received += length as u64;
    }

    /// Puts the peer on the host's dispatch queue unless it is already there.
    pub fn schedule_dispatch(&mut self, context: &mut HostContext) {
        if self.dispatch_node.is_none() {
            self.dispatch_node = Some(context.enqueue_dispatch(self.index));
        }
    }
}
