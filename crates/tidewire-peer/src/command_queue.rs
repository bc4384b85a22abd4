//! Records held in a peer's command queues.
//!
//! A peer keeps its queues as `VecDeque`s owning these records:
//! - outgoing reliable and unreliable commands waiting for a flush;
//! - reliable commands sent and waiting for an acknowledgement;
//! - acknowledgements waiting to be sent;
//! - received commands held back by a channel until they can be delivered;
//! - packets ready for the application.
//!
//! Application payloads are [`Packet`]s, so a command and its retransmission
//! share one buffer.

use tidewire_protocol::{
    command::{number, Command},
    packet::{Packet, PacketFlags},
};

use crate::fragment_buffer::FragmentBuffer;

/// A command queued for transmission.
#[derive(Debug, Clone)]
pub struct OutgoingCommand {
    /// The command as it goes on the wire; data commands carry a view into `packet`.
    pub command: Command,
    /// Payload owner, for data commands.
    pub packet: Option<Packet>,
    /// Offset of this command's payload within the packet.
    pub fragment_offset: u32,
    /// Length of this command's payload.
    pub fragment_length: u16,
    /// Reliable sequence number this command was stamped with.
    pub reliable_sequence_number: u16,
    /// Unreliable sequence number this command was stamped with.
    pub unreliable_sequence_number: u16,
    /// Number of times the command was put on the wire.
    pub send_attempts: u32,
    /// Service time of the latest transmission.
    pub sent_time: u32,
    /// Time to wait for an acknowledgement before sending again, in ms.
    pub round_trip_timeout: u32,
    /// Timeout beyond which the command no longer backs off.
    pub round_trip_timeout_limit: u32,
}

impl OutgoingCommand {
    /// Wraps a command that has not been stamped with sequence numbers yet.
    pub fn new(command: Command, packet: Option<Packet>, fragment_offset: u32, fragment_length: u16) -> Self {
        Self {
            command,
            packet,
            fragment_offset,
            fragment_length,
            reliable_sequence_number: 0,
            unreliable_sequence_number: 0,
            send_attempts: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
        }
    }

    /// Wire command number.
    pub fn command_number(&self) -> u8 {
        self.command.body.command_number()
    }

    /// True if the receiver must acknowledge this command.
    pub fn is_acknowledged(&self) -> bool {
        self.command.header.acknowledge
    }

    /// Bytes this command occupies in a datagram.
    pub fn wire_size(&self) -> usize {
        self.command.wire_size()
    }
}

/// An acknowledgement waiting to be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    /// Channel of the acknowledged command.
    pub channel_id: u8,
    /// Reliable sequence number of the acknowledged command.
    pub reliable_sequence_number: u16,
    /// Command number of the acknowledged command.
    pub command_number: u8,
    /// Sent time stamped on the datagram that carried the command.
    pub sent_time: u16,
}

/// Payload of a received command.
#[derive(Debug, Clone)]
pub enum IncomingPayload {
    /// Ready for delivery.
    Complete(Packet),
    /// A fragment group still being reassembled.
    Reassembling(FragmentBuffer),
}

/// A received command held by a channel until its turn comes.
#[derive(Debug, Clone)]
pub struct IncomingCommand {
    /// Wire command number.
    pub command_number: u8,
    /// Reliable sequence number (group start for fragments).
    pub reliable_sequence_number: u16,
    /// Unreliable sequence number (group start for unreliable fragments).
    pub unreliable_sequence_number: u16,
    /// Fragments in the group, 0 for unfragmented commands.
    pub fragment_count: u32,
    /// Flags given to the delivered packet.
    pub flags: PacketFlags,
    /// Received or reassembling data.
    pub payload: IncomingPayload,
}

impl IncomingCommand {
    /// A command whose payload arrived in one piece.
    pub fn complete(
        command_number: u8,
        reliable_sequence_number: u16,
        unreliable_sequence_number: u16,
        packet: Packet,
    ) -> Self {
        Self {
            command_number,
            reliable_sequence_number,
            unreliable_sequence_number,
            fragment_count: 0,
            flags: packet.flags(),
            payload: IncomingPayload::Complete(packet),
        }
    }

    /// The head of a fragment group with an empty reassembly buffer.
    pub fn fragmented(
        command_number: u8,
        reliable_sequence_number: u16,
        unreliable_sequence_number: u16,
        total_length: usize,
        fragment_count: u32,
    ) -> Self {
        let flags = if command_number == number::SEND_FRAGMENT {
            PacketFlags::RELIABLE
        } else {
            PacketFlags::UNRELIABLE_FRAGMENT
        };
        Self {
            command_number,
            reliable_sequence_number,
            unreliable_sequence_number,
            fragment_count,
            flags,
            payload: IncomingPayload::Reassembling(FragmentBuffer::new(total_length, fragment_count)),
        }
    }

    /// True once the payload can be delivered.
    pub fn is_complete(&self) -> bool {
        matches!(self.payload, IncomingPayload::Complete(_))
    }

    /// Length of the packet this command delivers.
    pub fn payload_length(&self) -> usize {
        match &self.payload {
            IncomingPayload::Complete(packet) => packet.len(),
            IncomingPayload::Reassembling(buffer) => buffer.total_length(),
        }
    }

    /// Bytes this command counts against the waiting-data limit: the
    /// payload plus any reassembly bookkeeping.
    pub fn waiting_size(&self) -> usize {
        match &self.payload {
            IncomingPayload::Complete(packet) => packet.len(),
            IncomingPayload::Reassembling(buffer) => buffer.total_length() + buffer.bitmap_size(),
        }
    }

    /// Turns a finished reassembly buffer into a packet and returns the
    /// waiting-data bytes this freed. No-op returning 0 otherwise.
    pub fn finish_reassembly(&mut self) -> usize {
        let IncomingPayload::Reassembling(buffer) = &mut self.payload else {
            return 0;
        };
        if !buffer.is_complete() {
            return 0;
        }
        let buffer = std::mem::replace(buffer, FragmentBuffer::new(0, 0));
        let released = buffer.bitmap_size();
        self.payload = IncomingPayload::Complete(Packet::new(buffer.into_bytes(), self.flags));
        released
    }

    /// Returns the packet if the command is complete.
    pub fn into_packet(self) -> Option<Packet> {
        match self.payload {
            IncomingPayload::Complete(packet) => Some(packet),
            IncomingPayload::Reassembling(_) => None,
        }
    }
}

/// A packet ready for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchedPacket {
    /// Channel the packet arrived on.
    pub channel_id: u8,
    /// The packet.
    pub packet: Packet,
}

#[cfg(test)]
mod tests {
    use tidewire_protocol::command::{CommandHeader, ProtocolCommand};

    use super::*;

    #[test]
    fn test_reassembly_completes_into_packet() {
        let mut command = IncomingCommand::fragmented(number::SEND_FRAGMENT, 4, 0, 6, 2);
        assert!(!command.is_complete());
        assert_eq!(command.payload_length(), 6);
        assert_eq!(command.waiting_size(), 6 + 4);

        if let IncomingPayload::Reassembling(buffer) = &mut command.payload {
            buffer.insert(0, 0, &[1, 2, 3]);
        }
        assert_eq!(command.finish_reassembly(), 0);
        assert!(!command.is_complete());

        if let IncomingPayload::Reassembling(buffer) = &mut command.payload {
            buffer.insert(1, 3, &[4, 5, 6]);
        }
        assert_eq!(command.finish_reassembly(), 4);
        assert!(command.is_complete());
        assert_eq!(command.waiting_size(), 6);

        let packet = command.into_packet().unwrap();
        assert_eq!(packet.payload(), &[1, 2, 3, 4, 5, 6]);
        assert!(packet.flags().is_reliable());
    }

    #[test]
    fn test_unreliable_fragment_flags() {
        let command = IncomingCommand::fragmented(number::SEND_UNRELIABLE_FRAGMENT, 0, 1, 10, 2);
        assert!(command.flags.contains(PacketFlags::UNRELIABLE_FRAGMENT));
    }

    #[test]
    fn test_outgoing_command_shares_packet() {
        let packet = Packet::reliable(vec![0u8; 16]);
        let command = Command::new(
            CommandHeader { acknowledge: true, ..Default::default() },
            ProtocolCommand::SendReliable { data: packet.shared_payload().clone() },
        );
        let outgoing = OutgoingCommand::new(command, Some(packet.clone()), 0, 16);
        assert!(outgoing.is_acknowledged());
        assert_eq!(outgoing.command_number(), number::SEND_RELIABLE);
        assert_eq!(outgoing.wire_size(), 6 + 16);
        assert_eq!(packet.ref_count(), 2);
    }
}
