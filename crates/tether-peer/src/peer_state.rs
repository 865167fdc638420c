/// Peer connection state machine.
///
/// Tracks the lifecycle of a peer from the first connect attempt through the
/// steady state to teardown. A slot whose peer has been reset is `Disconnected`
/// and free for the next connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum PeerState {
    /// Slot is free
    #[default]
    Disconnected,

    /// Client: sent CONNECT, waiting for VERIFY_CONNECT
    Connecting,

    /// Server: received CONNECT, sent VERIFY_CONNECT, waiting for its acknowledgement
    AcknowledgingConnect,

    /// Server: handshake finished, connect event not yet delivered
    ConnectionPending,

    /// Client: handshake finished, connect event not yet delivered
    ConnectionSucceeded,

    /// Handshake complete and reported to the application
    Connected,

    /// Disconnect requested; waiting for queued reliable data to drain first
    DisconnectLater,

    /// Disconnect command sent, waiting for its acknowledgement
    Disconnecting,

    /// Remote asked to disconnect, our acknowledgement is still queued
    AcknowledgingDisconnect,

    /// Connection is over, disconnect event not yet delivered
    Zombie,
}

impl PeerState {
    /// Returns true for the states counted in the host's connected-peer total.
    pub fn is_connected(&self) -> bool {
        matches!(self, PeerState::Connected | PeerState::DisconnectLater)
    }

    /// Returns true while the handshake is still running.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            PeerState::Connecting
                | PeerState::AcknowledgingConnect
                | PeerState::ConnectionPending
                | PeerState::ConnectionSucceeded
        )
    }

    /// Returns true when the slot holds no live connection traffic.
    pub fn is_idle(&self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::Zombie)
    }

    /// Returns true once the peer has reached the handshake's pending stage or later.
    pub(crate) fn has_reached_pending(&self) -> bool {
        !matches!(
            self,
            PeerState::Disconnected | PeerState::Connecting | PeerState::AcknowledgingConnect
        )
    }
}
