use std::default::Default;

use crate::{
    constants::{
        DEFAULT_MAXIMUM_PACKET_SIZE, DEFAULT_MAXIMUM_WAITING_DATA, DEFAULT_MTU,
        DEFAULT_ROUND_TRIP_TIME, FRAGMENT_SIZE_DEFAULT, MAXIMUM_CHANNEL_COUNT, MAXIMUM_MTU,
        MAXIMUM_WINDOW_SIZE, MINIMUM_CHANNEL_COUNT, MINIMUM_MTU, MINIMUM_WINDOW_SIZE,
        PACKET_LOSS_INTERVAL, PACKET_THROTTLE_ACCELERATION, PACKET_THROTTLE_DECELERATION,
        PACKET_THROTTLE_INTERVAL, PACKET_THROTTLE_SCALE, PING_INTERVAL, TIMEOUT_LIMIT,
        TIMEOUT_MAXIMUM, TIMEOUT_MINIMUM,
    },
    error::{ErrorKind, Result},
};

/// How the retransmission timeout of a reliable command grows between attempts.
#[derive(Clone, Debug, Copy, PartialEq, Eq, Default)]
pub enum RetransmitBackoff {
    /// Each retransmission doubles the previous timeout.
    #[default]
    Doubling,
    /// Each retransmission adds the freshly derived RTT timeout to the previous one.
    Additive,
    /// Each retransmission re-derives the timeout from the current RTT estimate.
    Fixed,
}

#[derive(Clone, Debug)]
/// Configuration options to tune protocol behavior.
pub struct Config {
    /// Maximum transmission unit proposed during the handshake (576-4096).
    pub mtu: u32,
    /// Upper bound on the payload carried by one fragment.
    /// The effective size is also capped by the negotiated MTU.
    pub fragment_size: u16,
    /// Number of channels requested or accepted per connection (1-255).
    pub channel_count: usize,
    /// Incoming bandwidth in bytes/sec advertised to the remote peer (0 = unlimited).
    pub incoming_bandwidth: u32,
    /// Outgoing bandwidth in bytes/sec advertised to the remote peer (0 = unlimited).
    pub outgoing_bandwidth: u32,
    /// Max size of a single application packet, including every fragment.
    pub max_packet_size: usize,
    /// Maximum received data (bytes) waiting for the application before new data is refused.
    pub max_waiting_data: usize,
    /// Reliable flow-control window proposed during the handshake, in bytes.
    pub window_size: u32,
    /// Idle time in ms after which a keep-alive ping is queued.
    pub ping_interval: u32,
    /// Multiplier bounding how far a command timeout may back off.
    pub timeout_limit: u32,
    /// Minimum age in ms of the oldest unacknowledged send before a backed-off timeout disconnects.
    pub timeout_minimum: u32,
    /// Age in ms of the oldest unacknowledged send that always disconnects.
    pub timeout_maximum: u32,
    /// Maximum number of transmissions of one reliable command (0 = bounded by time only).
    pub max_send_attempts: u32,
    /// RTT estimate in ms used before the first acknowledgment arrives.
    pub default_round_trip_time: u32,
    /// Lower clamp for a command's retransmission timeout, in ms.
    pub min_retransmit_timeout: u32,
    /// Upper clamp for a command's retransmission timeout, in ms.
    pub max_retransmit_timeout: u32,
    /// Growth of the retransmission timeout between attempts.
    pub retransmit_backoff: RetransmitBackoff,
    /// Throttle scale (maximum throttle value, typically 32).
    pub throttle_scale: u32,
    /// Throttle acceleration (rate of improvement when RTT drops).
    pub throttle_acceleration: u32,
    /// Throttle deceleration (rate of degradation when RTT rises).
    pub throttle_deceleration: u32,
    /// Interval for throttle epochs in milliseconds.
    pub throttle_interval: u32,
    /// Interval over which packet loss is measured, in milliseconds.
    pub packet_loss_interval: u32,
    /// Append a CRC32 checksum to every datagram and verify it on receipt (default: false).
    pub use_checksums: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            fragment_size: FRAGMENT_SIZE_DEFAULT,
            channel_count: 1, // Single channel like most simple uses
            incoming_bandwidth: 0, // Unlimited
            outgoing_bandwidth: 0, // Unlimited
            max_packet_size: DEFAULT_MAXIMUM_PACKET_SIZE,
            max_waiting_data: DEFAULT_MAXIMUM_WAITING_DATA,
            window_size: MAXIMUM_WINDOW_SIZE,
            ping_interval: PING_INTERVAL,
            timeout_limit: TIMEOUT_LIMIT,
            timeout_minimum: TIMEOUT_MINIMUM,
            timeout_maximum: TIMEOUT_MAXIMUM,
            max_send_attempts: 0,
            default_round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            min_retransmit_timeout: 0,
            max_retransmit_timeout: TIMEOUT_MAXIMUM,
            retransmit_backoff: RetransmitBackoff::Doubling,
            throttle_scale: PACKET_THROTTLE_SCALE,
            throttle_acceleration: PACKET_THROTTLE_ACCELERATION,
            throttle_deceleration: PACKET_THROTTLE_DECELERATION,
            throttle_interval: PACKET_THROTTLE_INTERVAL,
            packet_loss_interval: PACKET_LOSS_INTERVAL,
            use_checksums: false,
        }
    }
}

impl Config {
    /// Checks every field against the bounds the wire protocol can express.
    pub fn validate(&self) -> Result<()> {
        if !(MINIMUM_MTU..=MAXIMUM_MTU).contains(&self.mtu) {
            return Err(ErrorKind::InvalidConfig(format!(
                "mtu {} outside {}..={}",
                self.mtu, MINIMUM_MTU, MAXIMUM_MTU
            )));
        }
        if self.fragment_size == 0 {
            return Err(ErrorKind::InvalidConfig("fragment_size must be non-zero".into()));
        }
        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&self.channel_count) {
            return Err(ErrorKind::InvalidConfig(format!(
                "channel_count {} outside {}..={}",
                self.channel_count, MINIMUM_CHANNEL_COUNT, MAXIMUM_CHANNEL_COUNT
            )));
        }
        if !(MINIMUM_WINDOW_SIZE..=MAXIMUM_WINDOW_SIZE).contains(&self.window_size) {
            return Err(ErrorKind::InvalidConfig(format!(
                "window_size {} outside {}..={}",
                self.window_size, MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE
            )));
        }
        if self.throttle_scale == 0 {
            return Err(ErrorKind::InvalidConfig("throttle_scale must be non-zero".into()));
        }
        if self.min_retransmit_timeout > self.max_retransmit_timeout {
            return Err(ErrorKind::InvalidConfig(format!(
                "min_retransmit_timeout {} exceeds max_retransmit_timeout {}",
                self.min_retransmit_timeout, self.max_retransmit_timeout
            )));
        }
        Ok(())
    }
}
