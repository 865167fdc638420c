//! Event and command types exchanged between the host and the application.
//!
//! - `Event`: what a service tick reports (connections, disconnections, packets)
//! - `PeerHandle`: a generation-checked reference to a peer slot
//! - `HostCommand`: work queued through the host's command channel

use tether_protocol::Packet;

/// Reference to a peer slot that detects reuse of the slot.
///
/// The slot's generation advances every time a new connection takes it over, so a handle
/// kept past a disconnect stops resolving instead of reaching the next connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

impl PeerHandle {
    /// Slot index in the host's peer table.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Events reported by the host's service tick.
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection completed, initiated by either side.
    Connect {
        /// The connected peer
        peer: PeerHandle,
        /// Data the remote side attached to its connect request
        data: u32,
    },
    /// A connection ended by request or timeout. The slot has been reset.
    Disconnect {
        /// The peer that disconnected
        peer: PeerHandle,
        /// Data the remote side attached to its disconnect, 0 on timeout
        data: u32,
    },
    /// A packet arrived.
    Receive {
        /// Sender
        peer: PeerHandle,
        /// Channel the packet arrived on
        channel_id: u8,
        /// User data word, always 0 for received packets
        data: u32,
        /// The packet
        packet: Packet,
    },
}

impl Event {
    /// The peer the event concerns.
    pub fn peer(&self) -> PeerHandle {
        match self {
            Event::Connect { peer, .. }
            | Event::Disconnect { peer, .. }
            | Event::Receive { peer, .. } => *peer,
        }
    }
}

/// Work handed to the host through its command channel and applied by [`Host::pump`].
///
/// [`Host::pump`]: crate::Host::pump
#[derive(Debug, Clone)]
pub enum HostCommand {
    /// Queue a packet for one peer.
    Send {
        /// Destination
        peer: PeerHandle,
        /// Channel to send on
        channel_id: u8,
        /// The packet
        packet: Packet,
    },
    /// Queue a packet for every connected peer.
    Broadcast {
        /// Channel to send on
        channel_id: u8,
        /// The packet
        packet: Packet,
    },
    /// Start a graceful disconnect.
    Disconnect {
        /// Peer to disconnect
        peer: PeerHandle,
        /// Data delivered with the disconnect
        data: u32,
    },
}
