//! Transport abstraction for pluggable I/O.

use std::{io::Result, net::SocketAddr};

/// Unreliable datagram channel the host drives.
///
/// The host only ever calls these from its service tick. A non-blocking implementation
/// returns `io::ErrorKind::WouldBlock` from `receive_packet` when nothing is queued, which
/// ends the receive phase of the tick.
pub trait Socket {
    /// Sends one datagram, returning the number of bytes written.
    fn send_packet(&mut self, addr: &SocketAddr, payload: &[u8]) -> Result<usize>;

    /// Receives one datagram into `buffer`.
    fn receive_packet<'a>(&mut self, buffer: &'a mut [u8]) -> Result<(&'a [u8], SocketAddr)>;

    /// Returns the address this socket is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Returns whether socket operates in blocking or non-blocking mode.
    fn is_blocking_mode(&self) -> bool;
}
