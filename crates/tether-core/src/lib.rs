#![warn(missing_docs)]

//! tether-core: foundational types and utilities.
//!
//! This crate provides the minimal set of core utilities shared across all layers:
//! - Configuration types
//! - Error handling
//! - Protocol and peer default constants
//! - The arena-backed ordered queue used by every command queue
//! - Wrapping service-time arithmetic
//!
//! Protocol-specific logic lives in specialized crates:
//! - `tether-protocol`: wire commands, codec, checksum, compression, packets
//! - `tether-peer`: channels, the peer state machine and reliability engine
//! - `tether-host`: peer table, service tick, bandwidth throttle, transport

/// Protocol constants shared across layers.
pub mod constants {
    /// Smallest MTU a peer may negotiate.
    pub const MIN_MTU: u32 = 576;
    /// Largest MTU a peer may negotiate.
    pub const MAX_MTU: u32 = 4096;
    /// Maximum number of commands packed into one datagram.
    pub const MAX_PACKET_COMMANDS: usize = 32;
    /// Smallest reliable window size in bytes.
    pub const MIN_WINDOW_SIZE: u32 = 4096;
    /// Largest reliable window size in bytes.
    pub const MAX_WINDOW_SIZE: u32 = 65536;
    /// Minimum channels per peer.
    pub const MIN_CHANNEL_COUNT: usize = 1;
    /// Maximum channels per peer.
    pub const MAX_CHANNEL_COUNT: usize = 255;
    /// Peer ID reserved for "no peer assigned yet". Also bounds the peer table.
    pub const MAX_PEER_ID: u16 = 0xFFF;
    /// Largest fragment count a single packet may be split into.
    pub const MAX_FRAGMENT_COUNT: u32 = 1024 * 1024;
    /// Channel ID used by peer-scoped control commands.
    pub const PEER_CHANNEL_ID: u8 = 0xFF;

    /// Default socket receive buffer size.
    pub const HOST_RECEIVE_BUFFER_SIZE: usize = 256 * 1024;
    /// Default socket send buffer size.
    pub const HOST_SEND_BUFFER_SIZE: usize = 256 * 1024;
    /// Interval between bandwidth throttle recomputations, in milliseconds.
    pub const HOST_BANDWIDTH_THROTTLE_INTERVAL: u32 = 1000;
    /// Default MTU for new hosts.
    pub const HOST_DEFAULT_MTU: u32 = 1400;
    /// Default maximum application packet size.
    pub const HOST_DEFAULT_MAXIMUM_PACKET_SIZE: usize = 32 * 1024 * 1024;
    /// Default maximum data a peer may buffer while waiting for the application.
    pub const HOST_DEFAULT_MAXIMUM_WAITING_DATA: usize = 32 * 1024 * 1024;

    /// Round-trip time assumed before any sample arrives, in milliseconds.
    pub const PEER_DEFAULT_ROUND_TRIP_TIME: u32 = 500;
    /// Initial packet throttle.
    pub const PEER_DEFAULT_PACKET_THROTTLE: u32 = 32;
    /// Full scale of the packet throttle.
    pub const PEER_PACKET_THROTTLE_SCALE: u32 = 32;
    /// Step added to the throttle counter for every unreliable packet.
    pub const PEER_PACKET_THROTTLE_COUNTER: u32 = 7;
    /// Default throttle acceleration.
    pub const PEER_PACKET_THROTTLE_ACCELERATION: u32 = 2;
    /// Default throttle deceleration.
    pub const PEER_PACKET_THROTTLE_DECELERATION: u32 = 2;
    /// Default throttle measurement interval, in milliseconds.
    pub const PEER_PACKET_THROTTLE_INTERVAL: u32 = 5000;
    /// Fixed-point scale of packet loss.
    pub const PEER_PACKET_LOSS_SCALE: u32 = 1 << 16;
    /// Interval between packet loss recomputations, in milliseconds.
    pub const PEER_PACKET_LOSS_INTERVAL: u32 = 10000;
    /// Bandwidth divisor used when deriving window sizes.
    pub const PEER_WINDOW_SIZE_SCALE: u32 = 64 * 1024;
    /// Default timeout limit (multiplier of the initial round-trip timeout).
    pub const PEER_TIMEOUT_LIMIT: u32 = 32;
    /// Default minimum timeout, in milliseconds.
    pub const PEER_TIMEOUT_MINIMUM: u32 = 5000;
    /// Default maximum timeout, in milliseconds.
    pub const PEER_TIMEOUT_MAXIMUM: u32 = 30000;
    /// Default idle time before a ping is sent, in milliseconds.
    pub const PEER_PING_INTERVAL: u32 = 500;
    /// Number of unsequenced windows.
    pub const PEER_UNSEQUENCED_WINDOWS: u32 = 64;
    /// Width of one unsequenced window.
    pub const PEER_UNSEQUENCED_WINDOW_SIZE: u32 = 1024;
    /// Unsequenced windows accepted ahead of the current one.
    pub const PEER_FREE_UNSEQUENCED_WINDOWS: u32 = 32;
    /// Number of reliable windows in the 16-bit sequence space.
    pub const PEER_RELIABLE_WINDOWS: u16 = 16;
    /// Width of one reliable window.
    pub const PEER_RELIABLE_WINDOW_SIZE: u16 = 0x1000;
    /// Reliable windows that may be in flight at once.
    pub const PEER_FREE_RELIABLE_WINDOWS: u16 = 8;
}

/// Configuration options for the host and its peers.
pub mod config;
/// Error types and results.
pub mod error;
/// Packet interception for custom processing.
pub mod interceptor;
/// Arena-backed ordered queues with stable handles.
pub mod ordered_queue;
/// Wrapping millisecond service-time arithmetic.
pub mod time;
/// Transport abstraction for pluggable I/O.
pub mod transport;
