#![warn(missing_docs)]

//! tether-host: the peer table, service tick and UDP transport.

/// Host-wide bandwidth throttle.
mod bandwidth_throttle;
/// Event, handle and command types.
pub mod event_types;
/// The host and its service tick.
pub mod host;
/// UDP transport and the socket-binding constructors.
pub mod socket;
/// Time utilities for the host.
pub mod time;

pub use event_types::{Event, HostCommand, PeerHandle};
pub use host::{Host, HostStatistics};
pub use socket::UdpTransport;
pub use time::{Clock, SystemClock};
