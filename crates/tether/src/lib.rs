#![warn(missing_docs)]

//! Tether: a small public API facade for the workspace.
//!
//! This crate re-exports the types most applications need to run a reliable UDP host:
//!
//! - Host, handles and events (`Host`, `PeerHandle`, `Event`)
//! - Application packets (`Packet`, `PacketFlags`)
//! - Configuration and errors (`Config`, `ErrorKind`)
//!
//! Example
//! ```no_run
//! use std::time::Duration;
//! use tether::{Event, Host, Packet};
//!
//! let mut server = Host::bind("127.0.0.1:9000").unwrap();
//! let mut client = Host::bind_any().unwrap();
//! let peer = client.connect(server.local_addr().unwrap(), 2, 0).unwrap();
//!
//! loop {
//!     if let Some(Event::Connect { .. }) = client.service(Duration::from_millis(10)).unwrap() {
//!         client.send(peer, 0, &Packet::reliable(b"hello".to_vec())).unwrap();
//!     }
//!     if let Some(Event::Receive { packet, .. }) = server.service(Duration::from_millis(10)).unwrap() {
//!         assert_eq!(packet.data(), b"hello");
//!         break;
//!     }
//! }
//! ```

// Core config and errors
pub use tether_core::{
    config::{CompressionAlgorithm, Config},
    error::{ErrorKind, Result},
    interceptor::{InterceptAction, Interceptor},
};
// Host: peer table, service tick and events
pub use tether_host::{Clock, Event, Host, HostCommand, HostStatistics, PeerHandle, SystemClock, UdpTransport};
// Peer state exposed through `Host::peer`
pub use tether_peer::{Peer, PeerState};
// Protocol: application packets
pub use tether_protocol::{Packet, PacketFlags};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        CompressionAlgorithm, Config, ErrorKind, Event, Host, HostCommand, Packet, PacketFlags,
        PeerHandle, PeerState,
    };
}
