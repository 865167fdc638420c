//! Peer traffic counters and packet loss estimation.
//!
//! Packet loss is kept as a fixed-point fraction scaled by [`PEER_PACKET_LOSS_SCALE`]
//! and recomputed once per [`PEER_PACKET_LOSS_INTERVAL`] from the packets sent and lost
//! during that interval.

use tether_core::constants::{PEER_PACKET_LOSS_INTERVAL, PEER_PACKET_LOSS_SCALE};

/// Statistics for a peer connection.
#[derive(Debug, Clone, Default)]
pub struct PeerStatistics {
    /// Commands sent during the current loss interval
    pub packets_sent: u32,
    /// Reliable commands that timed out during the current loss interval
    pub packets_lost: u32,
    /// Smoothed packet loss, scaled by `PEER_PACKET_LOSS_SCALE`
    pub packet_loss: u32,
    /// Smoothed mean deviation of the packet loss
    pub packet_loss_variance: u32,
    /// Service time of the last loss recomputation
    pub packet_loss_epoch: u32,
    /// Datagrams received from this peer
    pub packets_received: u64,
    /// Bytes received from this peer, protocol overhead included
    pub bytes_received: u64,
    /// Bytes sent to this peer, protocol overhead included
    pub bytes_sent: u64,
}

impl PeerStatistics {
    /// Recomputes packet loss when the loss interval has elapsed.
    ///
    /// Returns true when a recomputation happened. The first call only starts the interval.
    pub fn update_packet_loss(&mut self, service_time: u32) -> bool {
        if self.packet_loss_epoch == 0 {
            self.packet_loss_epoch = service_time;
            return false;
        }
        if service_time.wrapping_sub(self.packet_loss_epoch) < PEER_PACKET_LOSS_INTERVAL
            || self.packets_sent == 0
        {
            return false;
        }

        let loss =
            (self.packets_lost as u64 * PEER_PACKET_LOSS_SCALE as u64 / self.packets_sent as u64) as u32;
        self.packet_loss_variance =
            (self.packet_loss_variance * 3 + self.packet_loss.abs_diff(loss)) / 4;
        self.packet_loss = (self.packet_loss * 7 + loss) / 8;

        self.packet_loss_epoch = service_time;
        self.packets_sent = 0;
        self.packets_lost = 0;
        true
    }

    /// Smoothed packet loss rate (0.0 to 1.0).
    pub fn packet_loss_rate(&self) -> f32 {
        self.packet_loss as f32 / PEER_PACKET_LOSS_SCALE as f32
    }

    /// Resets all statistics counters.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
