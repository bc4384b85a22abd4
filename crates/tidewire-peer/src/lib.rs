#![warn(missing_docs)]

//! tidewire-peer: the per-peer reliability state machine.
//!
//! A [`Peer`] is one end of a connection. The host feeds it received
//! datagrams with [`Peer::handle_datagram`], asks it for outgoing datagrams
//! with [`Peer::flush`], and drains delivered packets and lifecycle events
//! with [`Peer::receive`] and [`Peer::poll_event`]. The peer never touches a
//! socket or reads a clock; the caller passes the service time in.

/// Per-channel sequencing and ordered delivery.
pub mod channel;
/// Records held in the peer's command queues.
pub mod command_queue;
/// Connection events.
pub mod events;
pub mod flow_control;
/// Fragment reassembly.
pub mod fragment_buffer;
mod peer;
mod peer_state;
/// Connection counters.
pub mod statistics;
/// Duplicate detection for unsequenced packets.
pub mod unsequenced;

pub use channel::Channel;
pub use events::{DisconnectReason, PeerEvent};
pub use peer::Peer;
pub use peer_state::PeerState;
pub use statistics::PeerStatistics;
