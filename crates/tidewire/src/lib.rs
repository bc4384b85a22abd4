#![warn(missing_docs)]

//! Tidewire: a small public API facade for the workspace.
//!
//! This crate re-exports the types needed to drive reliable datagram
//! connections:
//!
//! - The peer state machine and its events (`Peer`, `PeerEvent`, ...)
//! - Packets and delivery flags (`Packet`, `PacketFlags`)
//! - Configuration, errors and the datagram sink (`Config`, `ErrorKind`, `DatagramSink`)
//!
//! Sockets, peer tables and clocks belong to the host. A peer only consumes
//! received datagrams and produces datagrams to send.
//!
//! Example
//! ```
//! use tidewire::prelude::*;
//!
//! let config = Config::default();
//! let mut client = Peer::new(1, &config);
//! let mut server = Peer::new(2, &config);
//! client.connect(1, 0).unwrap();
//!
//! fn exchange(from: &mut Peer, to: &mut Peer, now: u32) {
//!     let mut datagrams: Vec<Vec<u8>> = Vec::new();
//!     from.flush(now, &mut datagrams).unwrap();
//!     for datagram in &datagrams {
//!         to.handle_datagram(datagram, now).unwrap();
//!     }
//! }
//!
//! let mut now = 1000;
//! let mut events = Vec::new();
//! for _ in 0..10 {
//!     now += 10;
//!     exchange(&mut client, &mut server, now);
//!     exchange(&mut server, &mut client, now);
//!     for peer in [&mut client, &mut server] {
//!         events.extend(std::iter::from_fn(|| peer.poll_event()));
//!     }
//! }
//!
//! assert_eq!(client.state(), PeerState::Connected);
//! assert_eq!(server.state(), PeerState::Connected);
//! assert_eq!(events.len(), 2);
//! ```

// Core configuration, errors and host seams
pub use tidewire_core::{
    config::{Config, RetransmitBackoff},
    error::{ErrorKind, Result},
    time::{Clock, ManualClock, SystemClock},
    transport::DatagramSink,
};
// Per-peer state machine
pub use tidewire_peer::{Channel, DisconnectReason, Peer, PeerEvent, PeerState, PeerStatistics};
// Packets and delivery flags
pub use tidewire_protocol::packet::{Packet, PacketFlags};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        Config, DatagramSink, DisconnectReason, ErrorKind, Packet, PacketFlags, Peer, PeerEvent, PeerState,
    };
}
