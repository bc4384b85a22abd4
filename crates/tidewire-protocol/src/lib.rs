#![warn(missing_docs)]

//! tidewire-protocol: packets, wire commands and protocol arithmetic.
//!
//! Nothing in this crate holds per-connection queues; it provides the
//! building blocks the peer state machine drives:
//! - [`Packet`]: shared application payload with delivery flags
//! - [`command`]: the wire command model
//! - [`command_codec`]: big-endian encoding, datagram header, CRC32 trailer
//! - [`sequence`]: wrap-aware sequence comparisons and reliable windows
//! - [`congestion`]: RTT estimation, packet throttle and loss tracking

/// Protocol command types.
pub mod command;
/// Command serialization and deserialization.
pub mod command_codec;
/// Congestion control and RTT tracking.
pub mod congestion;
/// Packet types and structures.
pub mod packet;
/// Sequence number arithmetic.
pub mod sequence;

pub use command::{Command, CommandHeader, ConnectParameters, FragmentBody, ProtocolCommand};
pub use congestion::CongestionControl;
pub use packet::{Packet, PacketFlags, PacketObserver, SequenceNumber};
