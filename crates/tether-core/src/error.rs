//! Error types shared by every layer.

use std::io;

use thiserror::Error;

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Everything that can go wrong when talking to the transport.
///
/// Rejections leave the peer or host untouched. Protocol violations are only
/// reported to logs by the service tick and never surface here.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// The peer is not in a state that accepts the operation.
    #[error("peer is not connected")]
    NotConnected,
    /// Channel index is outside the peer's channel count.
    #[error("channel {channel_id} out of range, peer has {channel_count} channels")]
    ChannelOutOfRange {
        /// Requested channel.
        channel_id: u8,
        /// Channels the peer has.
        channel_count: usize,
    },
    /// Payload exceeds the host's maximum packet size.
    #[error("packet of {size} bytes exceeds maximum packet size of {maximum} bytes")]
    PacketTooLarge {
        /// Payload length.
        size: usize,
        /// Configured maximum.
        maximum: usize,
    },
    /// Payload would need more fragments than the protocol allows.
    #[error("packet needs {count} fragments, maximum is {maximum}")]
    TooManyFragments {
        /// Fragments required.
        count: u32,
        /// Protocol maximum.
        maximum: u32,
    },
    /// Every peer slot is in use.
    #[error("no free peer slot available")]
    NoAvailablePeers,
    /// A peer handle refers to a slot that has since been reused.
    #[error("peer handle is stale or out of range")]
    InvalidPeer,
    /// The peer holds more undelivered data than allowed.
    #[error("peer exceeded its waiting data limit")]
    WaitingDataExceeded,
    /// Incoming command could not be applied to the peer.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// Datagram could not be decoded.
    #[error("could not decode datagram: {0}")]
    DecodingError(#[from] DecodingErrorKind),
    /// Host configuration is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Wrapper around std io::Error.
    #[error("io error: {0}")]
    IOError(#[from] io::Error),
}

/// Reasons a datagram fails to decode.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodingErrorKind {
    /// Datagram is shorter than its header.
    #[error("datagram shorter than its header")]
    HeaderTooShort,
    /// Command kind is zero or outside the command set.
    #[error("unknown command kind {0}")]
    UnknownCommand(u8),
    /// A command or its payload runs past the end of the datagram.
    #[error("command truncated")]
    Truncated,
    /// Checksum did not match.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// Compressed block could not be expanded.
    #[error("decompression failed")]
    Decompression,
}
