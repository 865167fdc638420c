use std::default::Default;

use crate::{
    constants::{
        HOST_DEFAULT_MAXIMUM_PACKET_SIZE, HOST_DEFAULT_MAXIMUM_WAITING_DATA, HOST_DEFAULT_MTU,
        HOST_RECEIVE_BUFFER_SIZE, HOST_SEND_BUFFER_SIZE, MAX_CHANNEL_COUNT, MAX_MTU, MAX_PEER_ID,
        MIN_CHANNEL_COUNT, MIN_MTU,
    },
    error::{ErrorKind, Result},
};

/// Compression algorithm applied to the command block of outgoing datagrams.
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// Zlib compression (balanced speed/ratio)
    Zlib,
    /// LZ4 compression (fast, lower ratio)
    Lz4,
}

#[derive(Clone, Debug)]
/// Configuration options recognized at host creation.
pub struct Config {
    /// Make the underlying UDP socket block when true, otherwise non-blocking.
    pub blocking_mode: bool,
    /// Number of peer slots in the host's table (1..=4095).
    pub peer_count: usize,
    /// Maximum channels a peer may open (clamped to 1..=255, 0 means the maximum).
    pub channel_limit: usize,
    /// Incoming bandwidth in bytes/sec (0 = unlimited).
    pub incoming_bandwidth: u32,
    /// Outgoing bandwidth in bytes/sec (0 = unlimited).
    pub outgoing_bandwidth: u32,
    /// MTU used for new peers, negotiated down during the handshake.
    pub mtu: u32,
    /// Largest application packet accepted for sending or reassembly.
    pub maximum_packet_size: usize,
    /// Largest amount of received data a peer may hold before the application drains it.
    pub maximum_waiting_data: usize,
    /// Connections allowed from a single IP address.
    pub duplicate_peers: usize,
    /// Protect datagrams with a CRC32 checksum slot in the header (default: false).
    pub use_checksums: bool,
    /// Compression algorithm to use (default: None).
    pub compression: CompressionAlgorithm,
    /// Socket receive buffer size in bytes (None = use system default).
    /// Corresponds to SO_RCVBUF socket option.
    pub socket_recv_buffer_size: Option<usize>,
    /// Socket send buffer size in bytes (None = use system default).
    /// Corresponds to SO_SNDBUF socket option.
    pub socket_send_buffer_size: Option<usize>,
    /// Enable broadcast mode.
    /// Corresponds to SO_BROADCAST socket option.
    pub socket_broadcast: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            blocking_mode: false,
            peer_count: 32,
            channel_limit: MAX_CHANNEL_COUNT,
            incoming_bandwidth: 0, // Unlimited
            outgoing_bandwidth: 0, // Unlimited
            mtu: HOST_DEFAULT_MTU,
            maximum_packet_size: HOST_DEFAULT_MAXIMUM_PACKET_SIZE,
            maximum_waiting_data: HOST_DEFAULT_MAXIMUM_WAITING_DATA,
            duplicate_peers: MAX_PEER_ID as usize,
            use_checksums: false,
            compression: CompressionAlgorithm::None,
            socket_recv_buffer_size: Some(HOST_RECEIVE_BUFFER_SIZE),
            socket_send_buffer_size: Some(HOST_SEND_BUFFER_SIZE),
            socket_broadcast: true,
        }
    }
}

impl Config {
    /// Checks the configuration and returns a copy with the channel limit clamped.
    pub fn validate(&self) -> Result<Config> {
        if self.peer_count == 0 || self.peer_count > MAX_PEER_ID as usize {
            return Err(ErrorKind::InvalidConfig(format!(
                "peer count {} outside 1..={}",
                self.peer_count, MAX_PEER_ID
            )));
        }
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(ErrorKind::InvalidConfig(format!(
                "mtu {} outside {}..={}",
                self.mtu, MIN_MTU, MAX_MTU
            )));
        }

        let mut config = self.clone();
        config.channel_limit = clamp_channel_limit(self.channel_limit);
        Ok(config)
    }
}

/// Clamps a requested channel count into the protocol range; 0 selects the maximum.
pub fn clamp_channel_limit(channel_limit: usize) -> usize {
    if channel_limit == 0 || channel_limit > MAX_CHANNEL_COUNT {
        MAX_CHANNEL_COUNT
    } else {
        channel_limit.max(MIN_CHANNEL_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default().validate().unwrap();
        assert_eq!(config.mtu, 1400);
        assert_eq!(config.channel_limit, 255);
        assert_eq!(config.maximum_packet_size, 32 * 1024 * 1024);
    }

    #[test]
    fn test_peer_count_above_max_peer_id_rejected() {
        let config = Config { peer_count: 4096, ..Config::default() };
        assert!(matches!(config.validate(), Err(ErrorKind::InvalidConfig(_))));

        let config = Config { peer_count: 4095, ..Config::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mtu_out_of_range_rejected() {
        let config = Config { mtu: 575, ..Config::default() };
        assert!(config.validate().is_err());
        let config = Config { mtu: 4097, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_channel_limit_clamping() {
        assert_eq!(clamp_channel_limit(0), 255);
        assert_eq!(clamp_channel_limit(300), 255);
        assert_eq!(clamp_channel_limit(1), 1);
        assert_eq!(clamp_channel_limit(12), 12);
    }
}
