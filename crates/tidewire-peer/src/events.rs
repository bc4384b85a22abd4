//! Connection events surfaced to the host.

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The local application disconnected and the remote acknowledged it.
    Local,
    /// The remote peer sent a Disconnect.
    Remote,
    /// Reliable commands went unacknowledged past the configured limits.
    Timeout,
    /// The remote peer answered the handshake with inconsistent parameters.
    ProtocolViolation,
}

/// Lifecycle events drained with [`Peer::poll_event`](crate::Peer::poll_event).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// The handshake completed.
    Connect {
        /// Application data carried by the Connect command.
        data: u32,
    },
    /// The connection ended; the peer has been reset to `Disconnected`.
    Disconnect {
        /// Application data carried by the Disconnect command, if any.
        data: u32,
        /// Why the connection ended.
        reason: DisconnectReason,
    },
}
