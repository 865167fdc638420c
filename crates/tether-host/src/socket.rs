use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket},
    sync::Arc,
};

use socket2::Socket as Socket2;
use tether_core::{config::Config, error::Result, transport::Socket as TransportSocket};

use crate::{
    host::Host,
    time::{Clock, SystemClock},
};

/// Applies socket options from configuration to a UdpSocket.
fn apply_socket_options(socket: &UdpSocket, config: &Config) -> io::Result<()> {
    let socket2 = Socket2::from(socket.try_clone()?);

    if let Some(size) = config.socket_recv_buffer_size {
        socket2.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.socket_send_buffer_size {
        socket2.set_send_buffer_size(size)?;
    }
    if config.socket_broadcast {
        socket.set_broadcast(true)?;
    }

    Ok(())
}

/// UDP socket the host sends and receives datagrams on.
#[derive(Debug)]
pub struct UdpTransport {
    is_blocking_mode: bool,
    socket: UdpSocket,
}

impl UdpTransport {
    /// Wraps `socket`, applying the buffer, broadcast and blocking options of `config`.
    pub fn new(socket: UdpSocket, config: &Config) -> Result<Self> {
        apply_socket_options(&socket, config)?;
        socket.set_nonblocking(!config.blocking_mode)?;
        Ok(UdpTransport { is_blocking_mode: config.blocking_mode, socket })
    }
}

impl TransportSocket for UdpTransport {
    fn send_packet(&mut self, addr: &SocketAddr, payload: &[u8]) -> io::Result<usize> {
        self.socket.send_to(payload, addr)
    }

    fn receive_packet<'a>(&mut self, buffer: &'a mut [u8]) -> io::Result<(&'a [u8], SocketAddr)> {
        self.socket.recv_from(buffer).map(move |(recv_len, address)| (&buffer[..recv_len], address))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn is_blocking_mode(&self) -> bool {
        self.is_blocking_mode
    }
}

impl Host<UdpTransport> {
    /// Creates a new Host bound to the specified address with default configuration.
    pub fn bind<A: ToSocketAddrs>(addresses: A) -> Result<Self> {
        Self::bind_with_config(addresses, Config::default())
    }

    /// Creates a new Host bound to any available port on localhost with default configuration.
    pub fn bind_any() -> Result<Self> {
        Self::bind_any_with_config(Config::default())
    }

    /// Creates a new Host bound to any available port on localhost with the specified configuration.
    pub fn bind_any_with_config(config: Config) -> Result<Self> {
        let address = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        Self::bind_with_config(address, config)
    }

    /// Creates a new Host bound to the specified address with custom configuration.
    pub fn bind_with_config<A: ToSocketAddrs>(addresses: A, config: Config) -> Result<Self> {
        Self::bind_with_config_and_clock(addresses, config, Arc::new(SystemClock))
    }

    /// Creates a new Host bound to the specified address with a custom clock.
    pub fn bind_with_config_and_clock<A: ToSocketAddrs>(
        addresses: A,
        config: Config,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addresses)?;
        let transport = UdpTransport::new(socket, &config)?;
        Host::with_socket_and_clock(transport, config, clock)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn transport(config: &Config) -> UdpTransport {
        UdpTransport::new(UdpSocket::bind("127.0.0.1:0").unwrap(), config).unwrap()
    }

    #[test]
    fn test_socket_options_applied() {
        let config = Config {
            socket_recv_buffer_size: Some(128 * 1024),
            socket_send_buffer_size: Some(64 * 1024),
            socket_broadcast: true,
            ..Config::default()
        };
        let transport = transport(&config);
        assert!(!transport.is_blocking_mode());
        assert!(transport.socket.broadcast().unwrap());
    }

    #[test]
    fn test_socket_options_none_uses_defaults() {
        let config = Config {
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
            socket_broadcast: false,
            ..Config::default()
        };
        let transport = transport(&config);
        assert!(!transport.socket.broadcast().unwrap());
    }

    #[test]
    fn test_nonblocking_receive_would_block() {
        let mut transport = transport(&Config::default());
        let mut buffer = [0u8; 64];
        let err = transport.receive_packet(&mut buffer).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_datagram_round_trip() {
        let config = Config::default();
        let mut sender = transport(&config);
        let mut receiver = transport(&Config { blocking_mode: true, ..config });
        receiver.socket.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let destination = receiver.local_addr().unwrap();

        assert_eq!(sender.send_packet(&destination, &[1, 2, 3]).unwrap(), 3);
        let mut buffer = [0u8; 64];
        let (payload, from) = receiver.receive_packet(&mut buffer).unwrap();
        assert_eq!(payload, &[1, 2, 3]);
        assert_eq!(from, sender.local_addr().unwrap());
    }

    #[test]
    fn test_bind_any_reports_local_address() {
        let host = Host::bind_any().unwrap();
        assert!(host.local_addr().unwrap().ip().is_loopback());
    }
}
