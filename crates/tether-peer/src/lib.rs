#![warn(missing_docs)]

//! tether-peer: per-connection state for the tether transport.
//!
//! A [`Peer`] is one remote endpoint: its channels, command queues, reliability engine and
//! congestion control. Peers never own a socket. The host drives them through
//! [`Peer::handle_command`] for inbound traffic and [`Peer::prepare_datagram`] for outbound
//! traffic, passing host-wide state as a [`HostContext`].

/// Per-peer bandwidth accounting and window sizing.
pub mod bandwidth;
/// Per-channel sequencing and reliable windows.
pub mod channel;
/// RTT estimation and the packet throttle.
pub mod congestion;
mod host_context;
mod peer;
mod peer_state;
/// Traffic counters and packet loss.
pub mod statistics;
/// Duplicate suppression for unsequenced commands.
pub mod unsequenced;

pub use channel::Channel;
pub use host_context::HostContext;
pub use peer::{
    DisconnectOutcome, IncomingCommand, OutgoingCommand, OutgoingDatagram, Peer, QueueOutcome,
};
pub use peer_state::PeerState;
