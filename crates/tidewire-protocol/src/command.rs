//! Protocol command types.
//!
//! Everything a peer says on the wire is a command: connecting, sending
//! data, acknowledging, pinging, disconnecting. Each command starts with a
//! fixed [`CommandHeader`] and is followed by a body whose layout depends on
//! the command number. Several commands are aggregated into one datagram.

use tidewire_core::shared::SharedBytes;

/// Command numbers as they appear in the low nibble of the first header byte.
pub mod number {
    /// Acknowledges a reliable command.
    pub const ACKNOWLEDGE: u8 = 1;
    /// Opens a connection.
    pub const CONNECT: u8 = 2;
    /// Answers a connect with the negotiated parameters.
    pub const VERIFY_CONNECT: u8 = 3;
    /// Closes a connection.
    pub const DISCONNECT: u8 = 4;
    /// Keep-alive that also yields an RTT sample.
    pub const PING: u8 = 5;
    /// Reliable payload.
    pub const SEND_RELIABLE: u8 = 6;
    /// Unreliable, sequenced payload.
    pub const SEND_UNRELIABLE: u8 = 7;
    /// One fragment of a reliable payload.
    pub const SEND_FRAGMENT: u8 = 8;
    /// Unsequenced payload.
    pub const SEND_UNSEQUENCED: u8 = 9;
    /// Bandwidth announcement.
    pub const BANDWIDTH_LIMIT: u8 = 10;
    /// Throttle parameter announcement.
    pub const THROTTLE_CONFIGURE: u8 = 11;
    /// One fragment of an unreliable payload.
    pub const SEND_UNRELIABLE_FRAGMENT: u8 = 12;
    /// Mask selecting the command number from the first header byte.
    pub const MASK: u8 = 0x0F;
}

/// First header byte flag: the receiver must acknowledge this command.
pub const FLAG_ACKNOWLEDGE: u8 = 1 << 7;
/// First header byte flag: the command is unsequenced.
pub const FLAG_UNSEQUENCED: u8 = 1 << 6;

/// Size of the command header on the wire.
pub const COMMAND_HEADER_SIZE: usize = 4;

/// Wire size of a command (header plus fixed body), excluding any payload.
///
/// Returns 0 for numbers the protocol does not define.
pub fn command_size(command_number: u8) -> usize {
    match command_number & number::MASK {
        number::ACKNOWLEDGE => 8,
        number::CONNECT => 48,
        number::VERIFY_CONNECT => 44,
        number::DISCONNECT => 8,
        number::PING => 4,
        number::SEND_RELIABLE => 6,
        number::SEND_UNRELIABLE => 8,
        number::SEND_FRAGMENT => 24,
        number::SEND_UNSEQUENCED => 8,
        number::BANDWIDTH_LIMIT => 12,
        number::THROTTLE_CONFIGURE => 16,
        number::SEND_UNRELIABLE_FRAGMENT => 24,
        _ => 0,
    }
}

/// Header shared by every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandHeader {
    /// The sender expects an acknowledgement.
    pub acknowledge: bool,
    /// The command carries no reliable ordering.
    pub unsequenced: bool,
    /// Channel the command belongs to; 0xFF for peer-level commands.
    pub channel_id: u8,
    /// Reliable sequence number on the channel.
    pub reliable_sequence_number: u16,
}

/// Parameters exchanged by Connect and VerifyConnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectParameters {
    /// Sender's local peer id, used by the receiver to address replies.
    pub outgoing_peer_id: u16,
    /// Session id the sender expects on incoming datagrams.
    pub incoming_session_id: u8,
    /// Session id the sender stamps on outgoing datagrams.
    pub outgoing_session_id: u8,
    /// Proposed maximum transmission unit.
    pub mtu: u32,
    /// Proposed reliable window size in bytes.
    pub window_size: u32,
    /// Number of channels.
    pub channel_count: u32,
    /// Sender's incoming bandwidth in bytes/sec (0 = unlimited).
    pub incoming_bandwidth: u32,
    /// Sender's outgoing bandwidth in bytes/sec (0 = unlimited).
    pub outgoing_bandwidth: u32,
    /// Throttle epoch length in ms.
    pub packet_throttle_interval: u32,
    /// Throttle acceleration.
    pub packet_throttle_acceleration: u32,
    /// Throttle deceleration.
    pub packet_throttle_deceleration: u32,
    /// Random id chosen by the initiator and echoed back.
    pub connect_id: u32,
}

/// Fields of SendFragment and SendUnreliableFragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentBody {
    /// Sequence number of the first fragment of the group.
    pub start_sequence_number: u16,
    /// Number of fragments in the group.
    pub fragment_count: u32,
    /// Index of this fragment.
    pub fragment_number: u32,
    /// Length of the reassembled packet.
    pub total_length: u32,
    /// Byte offset of this fragment within the packet.
    pub fragment_offset: u32,
    /// Fragment payload.
    pub data: SharedBytes,
}

/// Command bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolCommand {
    /// Acknowledges the reliable command with the given sequence number.
    Acknowledge {
        /// Sequence number being acknowledged.
        received_reliable_sequence_number: u16,
        /// Low 16 bits of the acknowledged datagram's sent time.
        received_sent_time: u16,
    },
    /// Connection request.
    Connect {
        /// Proposed parameters.
        parameters: ConnectParameters,
        /// Application data delivered with the connect event.
        data: u32,
    },
    /// Connection answer carrying the negotiated parameters.
    VerifyConnect(ConnectParameters),
    /// Disconnection notice.
    Disconnect {
        /// Application data delivered with the disconnect event.
        data: u32,
    },
    /// Keep-alive.
    Ping,
    /// Reliable payload.
    SendReliable {
        /// Payload.
        data: SharedBytes,
    },
    /// Unreliable, sequenced payload.
    SendUnreliable {
        /// Unreliable sequence number on the channel.
        unreliable_sequence_number: u16,
        /// Payload.
        data: SharedBytes,
    },
    /// Fragment of a reliable payload.
    SendFragment(FragmentBody),
    /// Unsequenced payload.
    SendUnsequenced {
        /// Unsequenced group used for duplicate detection.
        unsequenced_group: u16,
        /// Payload.
        data: SharedBytes,
    },
    /// Bandwidth announcement.
    BandwidthLimit {
        /// Incoming bandwidth in bytes/sec (0 = unlimited).
        incoming_bandwidth: u32,
        /// Outgoing bandwidth in bytes/sec (0 = unlimited).
        outgoing_bandwidth: u32,
    },
    /// Throttle parameter announcement.
    ThrottleConfigure {
        /// Throttle epoch length in ms.
        packet_throttle_interval: u32,
        /// Throttle acceleration.
        packet_throttle_acceleration: u32,
        /// Throttle deceleration.
        packet_throttle_deceleration: u32,
    },
    /// Fragment of an unreliable payload.
    SendUnreliableFragment(FragmentBody),
}

impl ProtocolCommand {
    /// Returns the command number used on the wire.
    pub fn command_number(&self) -> u8 {
        match self {
            ProtocolCommand::Acknowledge { .. } => number::ACKNOWLEDGE,
            ProtocolCommand::Connect { .. } => number::CONNECT,
            ProtocolCommand::VerifyConnect(_) => number::VERIFY_CONNECT,
            ProtocolCommand::Disconnect { .. } => number::DISCONNECT,
            ProtocolCommand::Ping => number::PING,
            ProtocolCommand::SendReliable { .. } => number::SEND_RELIABLE,
            ProtocolCommand::SendUnreliable { .. } => number::SEND_UNRELIABLE,
            ProtocolCommand::SendFragment(_) => number::SEND_FRAGMENT,
            ProtocolCommand::SendUnsequenced { .. } => number::SEND_UNSEQUENCED,
            ProtocolCommand::BandwidthLimit { .. } => number::BANDWIDTH_LIMIT,
            ProtocolCommand::ThrottleConfigure { .. } => number::THROTTLE_CONFIGURE,
            ProtocolCommand::SendUnreliableFragment(_) => number::SEND_UNRELIABLE_FRAGMENT,
        }
    }

    /// Returns the payload carried by data commands.
    pub fn payload(&self) -> Option<&SharedBytes> {
        match self {
            ProtocolCommand::SendReliable { data }
            | ProtocolCommand::SendUnreliable { data, .. }
            | ProtocolCommand::SendUnsequenced { data, .. } => Some(data),
            ProtocolCommand::SendFragment(fragment)
            | ProtocolCommand::SendUnreliableFragment(fragment) => Some(&fragment.data),
            _ => None,
        }
    }

    /// Returns the number of bytes this command occupies on the wire.
    pub fn wire_size(&self) -> usize {
        command_size(self.command_number()) + self.payload().map_or(0, |data| data.len())
    }
}

/// A header plus body, as carried in a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Shared header fields.
    pub header: CommandHeader,
    /// Command-specific body.
    pub body: ProtocolCommand,
}

impl Command {
    /// Creates a command.
    pub fn new(header: CommandHeader, body: ProtocolCommand) -> Self {
        Self { header, body }
    }

    /// Returns the first header byte: command number plus flags.
    pub fn command_byte(&self) -> u8 {
        let mut byte = self.body.command_number();
        if self.header.acknowledge {
            byte |= FLAG_ACKNOWLEDGE;
        }
        if self.header.unsequenced {
            byte |= FLAG_UNSEQUENCED;
        }
        byte
    }

    /// Returns the number of bytes this command occupies on the wire.
    pub fn wire_size(&self) -> usize {
        self.body.wire_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_numbers() {
        let cmd = ProtocolCommand::SendReliable { data: SharedBytes::from_vec(vec![1, 2, 3]) };
        assert_eq!(cmd.command_number(), number::SEND_RELIABLE);
        assert_eq!(cmd.wire_size(), 6 + 3);
        assert_eq!(ProtocolCommand::Ping.wire_size(), COMMAND_HEADER_SIZE);
    }

    #[test]
    fn test_command_byte_carries_flags() {
        let command = Command::new(
            CommandHeader { acknowledge: true, unsequenced: false, channel_id: 0xFF, reliable_sequence_number: 1 },
            ProtocolCommand::Disconnect { data: 0 },
        );
        assert_eq!(command.command_byte(), number::DISCONNECT | FLAG_ACKNOWLEDGE);
        assert_eq!(command.command_byte() & number::MASK, number::DISCONNECT);
    }

    #[test]
    fn test_unknown_command_size_is_zero() {
        assert_eq!(command_size(0), 0);
        assert_eq!(command_size(13), 0);
        assert_eq!(command_size(number::CONNECT | FLAG_ACKNOWLEDGE), 48);
    }
}
