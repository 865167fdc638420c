//! Per-peer bandwidth accounting.
//!
//! Tracks the bandwidth each side advertised and the bytes moved since the host's last
//! bandwidth throttle pass. The throttle itself runs host-wide; see `tether-host`.

use tether_core::constants::{MAX_WINDOW_SIZE, MIN_WINDOW_SIZE, PEER_WINDOW_SIZE_SCALE};

/// Bandwidth state of one peer.
#[derive(Debug, Clone, Default)]
pub struct PeerBandwidth {
    /// Bytes/sec the remote side is willing to receive (0 = unlimited)
    pub incoming_bandwidth: u32,
    /// Bytes/sec the remote side may send (0 = unlimited)
    pub outgoing_bandwidth: u32,
    /// Service time of the last incoming throttle pass
    pub incoming_bandwidth_throttle_epoch: u32,
    /// Service time of the last outgoing throttle pass
    pub outgoing_bandwidth_throttle_epoch: u32,
    /// Bytes received since the last throttle pass
    pub incoming_data_total: u32,
    /// Bytes queued for sending since the last throttle pass
    pub outgoing_data_total: u32,
}

impl PeerBandwidth {
    /// Clears the advertised limits and the byte totals.
    pub fn reset(&mut self) {
        *self = PeerBandwidth::default();
    }
}

/// Derives a reliable window size from a bandwidth, clamped to the protocol range.
///
/// A bandwidth of 0 means unlimited and yields the largest window.
pub fn window_size_for(bandwidth: u32) -> u32 {
    if bandwidth == 0 {
        MAX_WINDOW_SIZE
    } else {
        ((bandwidth / PEER_WINDOW_SIZE_SCALE) * MIN_WINDOW_SIZE).clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE)
    }
}

/// Window size for a bandwidth-limit or connect exchange, using the smaller of the two
/// bandwidths when both are limited.
pub fn negotiated_window_size(local: u32, remote: u32) -> u32 {
    match (local, remote) {
        (0, 0) => MAX_WINDOW_SIZE,
        (0, bandwidth) | (bandwidth, 0) => window_size_for(bandwidth),
        (local, remote) => window_size_for(local.min(remote)),
    }
}
