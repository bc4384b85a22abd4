//! Peer connection statistics tracking.
//!
//! Lifetime counters for one connection. Smoothed RTT and packet loss live
//! in the congestion state; these are plain totals for diagnostics.

/// Lifetime counters for a peer connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStatistics {
    /// Datagrams sent to this peer
    pub packets_sent: u64,
    /// Datagrams received from this peer
    pub packets_received: u64,
    /// Reliable commands that timed out
    pub packets_lost: u64,
    /// Bytes sent to this peer, headers included
    pub bytes_sent: u64,
    /// Bytes received from this peer, headers included
    pub bytes_received: u64,
    /// Commands dropped as malformed, unexpected or out of window
    pub dropped_commands: u64,
    /// Reliable commands sent again after their timeout passed
    pub retransmissions: u64,
}

impl PeerStatistics {
    /// Resets all statistics counters.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
