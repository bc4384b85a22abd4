/// Peer connection state machine.
///
/// Tracks the lifecycle of a peer connection from initial contact through
/// active communication to graceful shutdown. Variants are declared in
/// lifecycle order; some transitions compare states by that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PeerState {
    /// No connection; the peer holds no queued commands
    #[default]
    Disconnected,

    /// Initiator: sent Connect, waiting for VerifyConnect
    Connecting,

    /// Acceptor: received Connect, sent VerifyConnect, waiting for its acknowledgement
    AcknowledgingConnect,

    /// Acceptor: handshake complete, connect event not yet delivered
    ConnectionPending,

    /// Initiator: handshake complete, connect event not yet delivered
    ConnectionSucceeded,

    /// Both sides have completed the handshake
    Connected,

    /// Waiting for queued commands to drain before disconnecting
    DisconnectLater,

    /// Disconnect sent, waiting for its acknowledgement
    Disconnecting,

    /// Remote disconnect received, acknowledgement not yet sent
    AcknowledgingDisconnect,

    /// Connection is dead; waiting for the disconnect event to be drained
    Zombie,
}

impl PeerState {
    /// Returns true if the connection is established and carries application data.
    pub fn is_connected(&self) -> bool {
        matches!(self, PeerState::Connected | PeerState::DisconnectLater)
    }

    /// Returns true while the handshake is in progress.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            PeerState::Connecting
                | PeerState::AcknowledgingConnect
                | PeerState::ConnectionPending
                | PeerState::ConnectionSucceeded
        )
    }

    /// Returns true if the peer is tearing down or already gone.
    pub fn is_disconnecting(&self) -> bool {
        matches!(
            self,
            PeerState::Disconnecting | PeerState::AcknowledgingDisconnect | PeerState::Zombie
        )
    }

    /// Returns true in states where no command may be queued.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::Zombie)
    }
}
