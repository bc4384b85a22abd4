#![warn(missing_docs)]

//! tidewire-core: foundational types shared by every layer.
//!
//! This crate provides the minimal set of utilities the protocol and peer
//! crates build on:
//! - Configuration types
//! - Error handling
//! - Protocol constants
//! - Wrap-aware millisecond time helpers
//! - Shared byte slices and the datagram sink abstraction
//!
//! Protocol logic lives in specialized crates:
//! - `tidewire-protocol`: packets, wire commands, codec, sequence math, congestion control
//! - `tidewire-peer`: the per-peer state machine, channels and command queues

/// Protocol constants shared across layers.
pub mod constants {
    /// Number of sequence numbers covered by one reliable window.
    pub const RELIABLE_WINDOW_SIZE: u16 = 0x1000;
    /// Number of reliable windows in the 16-bit sequence space.
    pub const RELIABLE_WINDOWS: u16 = 16;
    /// Number of windows ahead of the current one that may hold in-flight commands.
    pub const FREE_RELIABLE_WINDOWS: u16 = 8;
    /// Number of groups tracked by the unsequenced bitmap.
    pub const UNSEQUENCED_WINDOW_SIZE: u32 = 1024;
    /// Number of unsequenced windows accepted ahead of the current base.
    pub const UNSEQUENCED_WINDOWS: u32 = 64;

    /// Smallest MTU a peer may negotiate.
    pub const MINIMUM_MTU: u32 = 576;
    /// Largest MTU a peer may negotiate.
    pub const MAXIMUM_MTU: u32 = 4096;
    /// MTU used when nothing else is configured.
    ///
    /// Leaves room for IPv6 + UDP headers inside a 1500 byte ethernet frame
    /// with some slack for tunnels.
    pub const DEFAULT_MTU: u32 = 1400;
    /// Smallest reliable flow-control window, in bytes.
    pub const MINIMUM_WINDOW_SIZE: u32 = 4096;
    /// Largest reliable flow-control window, in bytes.
    pub const MAXIMUM_WINDOW_SIZE: u32 = 65536;
    /// Bandwidth (bytes/sec) that maps to one minimum window when negotiating.
    pub const WINDOW_SIZE_SCALE: u32 = 64 * 1024;
    /// Fewest channels a connection may carry.
    pub const MINIMUM_CHANNEL_COUNT: usize = 1;
    /// Most channels a connection may carry.
    pub const MAXIMUM_CHANNEL_COUNT: usize = 255;
    /// Upper bound on the number of fragments in one group.
    pub const MAXIMUM_FRAGMENT_COUNT: u32 = 1024 * 1024;
    /// Upper bound on commands aggregated into one datagram.
    pub const MAXIMUM_PACKET_COMMANDS: usize = 32;
    /// Largest peer id representable in the datagram header.
    pub const MAXIMUM_PEER_ID: u16 = 0x0FFF;
    /// Channel id used by peer-level commands (connect, ping, disconnect...).
    pub const PEER_CHANNEL_ID: u8 = 0xFF;

    /// Round-trip time assumed before the first sample arrives, in ms.
    pub const DEFAULT_ROUND_TRIP_TIME: u32 = 500;
    /// Idle time after which a keep-alive ping is sent, in ms.
    pub const PING_INTERVAL: u32 = 500;
    /// Multiplier bounding how far a command timeout may back off.
    pub const TIMEOUT_LIMIT: u32 = 32;
    /// Minimum age of the oldest unacknowledged send before a backed-off timeout disconnects.
    pub const TIMEOUT_MINIMUM: u32 = 5000;
    /// Age of the oldest unacknowledged send that always disconnects.
    pub const TIMEOUT_MAXIMUM: u32 = 30000;

    /// Fixed-point scale of the packet throttle.
    pub const PACKET_THROTTLE_SCALE: u32 = 32;
    /// Throttle increase when RTT improves.
    pub const PACKET_THROTTLE_ACCELERATION: u32 = 2;
    /// Throttle decrease when RTT degrades.
    pub const PACKET_THROTTLE_DECELERATION: u32 = 2;
    /// Interval between throttle epochs, in ms.
    pub const PACKET_THROTTLE_INTERVAL: u32 = 5000;
    /// Step of the unreliable throttle counter.
    pub const PACKET_THROTTLE_COUNTER: u32 = 7;
    /// Interval over which packet loss is measured, in ms.
    pub const PACKET_LOSS_INTERVAL: u32 = 10000;
    /// Fixed-point scale of the packet loss ratio.
    pub const PACKET_LOSS_SCALE: u32 = 1 << 16;

    /// Default upper bound on a single application packet, in bytes.
    pub const DEFAULT_MAXIMUM_PACKET_SIZE: usize = 32 * 1024 * 1024;
    /// Default upper bound on data waiting for the application, in bytes.
    pub const DEFAULT_MAXIMUM_WAITING_DATA: usize = 32 * 1024 * 1024;
    /// Default payload size of one fragment.
    pub const FRAGMENT_SIZE_DEFAULT: u16 = 1024;
}

/// Configuration options for the protocol.
pub mod config;
/// Error types and results.
pub mod error;
/// Shared, reference-counted byte slices with zero-copy slicing.
pub mod shared;
/// Wrap-aware millisecond time arithmetic and clocks.
pub mod time;
/// Outbound datagram abstraction.
pub mod transport;
