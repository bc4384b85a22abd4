//! Window-based flow control for reliable data transmission.
//!
//! The window is the number of bytes of reliable payload that may be sent
//! and not yet acknowledged. It is negotiated during the handshake from the
//! two sides' advertised bandwidths, renegotiated whenever a BandwidthLimit
//! arrives, and scaled down at send time by the packet throttle.
//!
//! # Window negotiation
//!
//! Bandwidths are in bytes per second, 0 meaning unlimited. Every
//! [`WINDOW_SIZE_SCALE`] bytes per second of the limiting bandwidth buys one
//! [`MINIMUM_WINDOW_SIZE`] of window:
//!
//! - both unlimited: the maximum window;
//! - one unlimited: scaled from the other;
//! - both limited: scaled from the smaller.
//!
//! The result is always clamped to
//! [`MINIMUM_WINDOW_SIZE`]..=[`MAXIMUM_WINDOW_SIZE`].
//!
//! # Example
//!
//! ```
//! use tidewire_peer::flow_control::{negotiate_window_size, FlowControl};
//!
//! let mut flow_control = FlowControl::new(65536);
//! flow_control.set_window_size(negotiate_window_size(0, 128 * 1024));
//! assert_eq!(flow_control.window_size(), 8192);
//!
//! // Nothing in flight: even a throttled-to-zero window lets one MTU through
//! assert!(!flow_control.window_exceeded(1000, 0, 1400));
//! flow_control.record_reliable_data_sent(1000);
//! assert!(flow_control.window_exceeded(1000, 0, 1400));
//! ```

use tidewire_core::constants::{MAXIMUM_WINDOW_SIZE, MINIMUM_WINDOW_SIZE, WINDOW_SIZE_SCALE};

/// Window size for two advertised bandwidths (bytes/sec, 0 = unlimited).
pub fn negotiate_window_size(local_bandwidth: u32, remote_bandwidth: u32) -> u32 {
    let window = match (local_bandwidth, remote_bandwidth) {
        (0, 0) => MAXIMUM_WINDOW_SIZE,
        (0, bandwidth) | (bandwidth, 0) => scale_bandwidth(bandwidth),
        (a, b) => scale_bandwidth(a.min(b)),
    };
    clamp_window_size(window)
}

/// Window size a bandwidth alone allows, or `unlimited` when it is 0.
pub fn window_size_for_bandwidth(bandwidth: u32, unlimited: u32) -> u32 {
    if bandwidth == 0 {
        clamp_window_size(unlimited)
    } else {
        clamp_window_size(scale_bandwidth(bandwidth))
    }
}

/// Clamps to the window sizes the protocol allows.
pub fn clamp_window_size(window_size: u32) -> u32 {
    window_size.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE)
}

fn scale_bandwidth(bandwidth: u32) -> u32 {
    (bandwidth / WINDOW_SIZE_SCALE).saturating_mul(MINIMUM_WINDOW_SIZE)
}

/// Window-based flow control state for one peer.
#[derive(Debug, Clone)]
pub struct FlowControl {
    /// Negotiated window size in bytes
    window_size: u32,
    /// Reliable payload bytes sent and not yet acknowledged
    reliable_data_in_transit: u32,
}

impl FlowControl {
    /// Creates flow control with the given window, clamped to protocol bounds.
    pub fn new(window_size: u32) -> Self {
        Self { window_size: clamp_window_size(window_size), reliable_data_in_transit: 0 }
    }

    /// Returns the negotiated window size in bytes.
    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    /// Returns the reliable payload currently in transit, in bytes.
    pub fn reliable_data_in_transit(&self) -> u32 {
        self.reliable_data_in_transit
    }

    /// Replaces the window size, clamped to protocol bounds.
    pub fn set_window_size(&mut self, window_size: u32) {
        self.window_size = clamp_window_size(window_size);
    }

    /// Records reliable payload put on the wire.
    pub fn record_reliable_data_sent(&mut self, data_size: u32) {
        self.reliable_data_in_transit = self.reliable_data_in_transit.saturating_add(data_size);
    }

    /// Records reliable payload acknowledged or timed out.
    pub fn record_reliable_data_acked(&mut self, data_size: u32) {
        self.reliable_data_in_transit = self.reliable_data_in_transit.saturating_sub(data_size);
    }

    /// True if sending `length` more bytes would overflow the window.
    ///
    /// `throttled_window` is the window scaled by the packet throttle; at
    /// least one `mtu` worth of data is always allowed in flight.
    pub fn window_exceeded(&self, length: u32, throttled_window: u32, mtu: u32) -> bool {
        self.reliable_data_in_transit.saturating_add(length) > throttled_window.max(mtu)
    }

    /// Forgets everything in transit.
    pub fn reset(&mut self, window_size: u32) {
        *self = Self::new(window_size);
    }
}
