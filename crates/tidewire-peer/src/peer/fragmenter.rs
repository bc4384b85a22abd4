use tidewire_core::{
    constants::{MAXIMUM_FRAGMENT_COUNT, PEER_CHANNEL_ID},
    error::{ErrorKind, Result},
};
use tidewire_protocol::{
    command::{Command, CommandHeader, FragmentBody, ProtocolCommand},
    packet::{Packet, PacketFlags},
};

use crate::{command_queue::OutgoingCommand, peer::Peer, peer_state::PeerState};

impl Peer {
    /// Queues a packet on a channel.
    ///
    /// Packets longer than one fragment are split into a fragment group;
    /// every fragment shares the packet's buffer. Reliable packets and
    /// fragment groups are acknowledged. On error nothing is queued.
    pub fn send(&mut self, channel_id: u8, packet: Packet) -> Result<()> {
        if self.state != PeerState::Connected {
            return Err(ErrorKind::NotConnected);
        }
        let Some(channel) = self.channels.get(usize::from(channel_id)) else {
            return Err(ErrorKind::InvalidChannel(channel_id));
        };
        if packet.len() > self.config.max_packet_size {
            return Err(ErrorKind::PayloadTooLarge { size: packet.len(), max: self.config.max_packet_size });
        }

        let flags = packet.flags();
        let fragment_length = self.fragment_length();
        if packet.len() > fragment_length {
            let fragment_count = packet.len().div_ceil(fragment_length);
            if fragment_count > MAXIMUM_FRAGMENT_COUNT as usize {
                return Err(ErrorKind::FragmentCountExceeded);
            }

            let unreliable = flags.contains(PacketFlags::UNRELIABLE_FRAGMENT)
                && !flags.is_reliable()
                && channel.outgoing_unreliable_sequence_number() < 0xFFFF;
            let start_sequence_number = if unreliable {
                channel.outgoing_unreliable_sequence_number().wrapping_add(1)
            } else {
                channel.outgoing_reliable_sequence_number().wrapping_add(1)
            };

            let mut fragments = Vec::with_capacity(fragment_count);
            for (fragment_number, fragment_offset) in (0..packet.len()).step_by(fragment_length).enumerate() {
                let length = fragment_length.min(packet.len() - fragment_offset);
                let data = packet
                    .shared_payload()
                    .slice(fragment_offset, length)
                    .ok_or(ErrorKind::PayloadTooLarge { size: packet.len(), max: self.config.max_packet_size })?;
                let fragment = FragmentBody {
                    start_sequence_number,
                    fragment_count: fragment_count as u32,
                    fragment_number: fragment_number as u32,
                    total_length: packet.len() as u32,
                    fragment_offset: fragment_offset as u32,
                    data,
                };
                let header = CommandHeader { acknowledge: !unreliable, channel_id, ..Default::default() };
                let body = if unreliable {
                    ProtocolCommand::SendUnreliableFragment(fragment)
                } else {
                    ProtocolCommand::SendFragment(fragment)
                };
                fragments.push(OutgoingCommand::new(
                    Command::new(header, body),
                    Some(packet.clone()),
                    fragment_offset as u32,
                    length as u16,
                ));
            }

            tracing::trace!(
                "channel {}: {} bytes in {} {} fragments starting at {}",
                channel_id,
                packet.len(),
                fragment_count,
                if unreliable { "unreliable" } else { "reliable" },
                start_sequence_number
            );
            for fragment in fragments {
                self.setup_outgoing_command(fragment);
            }
            return Ok(());
        }

        let data = packet.shared_payload().clone();
        let (header, body) = if flags.is_unsequenced() {
            (
                CommandHeader { unsequenced: true, channel_id, ..Default::default() },
                ProtocolCommand::SendUnsequenced { unsequenced_group: 0, data },
            )
        } else if flags.is_reliable() || channel.outgoing_unreliable_sequence_number() >= 0xFFFF {
            (CommandHeader { acknowledge: true, channel_id, ..Default::default() }, ProtocolCommand::SendReliable { data })
        } else {
            (
                CommandHeader { channel_id, ..Default::default() },
                ProtocolCommand::SendUnreliable { unreliable_sequence_number: 0, data },
            )
        };
        let length = packet.len() as u16;
        self.setup_outgoing_command(OutgoingCommand::new(Command::new(header, body), Some(packet), 0, length));
        Ok(())
    }

    /// Largest payload one fragment carries: the MTU, or less if the
    /// configured fragment size is smaller.
    pub(super) fn fragment_length(&self) -> usize {
        (self.mtu as usize).min(usize::from(self.config.fragment_size)).max(1)
    }

    /// Stamps sequence numbers on a command and appends it to its queue.
    ///
    /// Peer-channel commands count on the peer's own counter; acknowledged
    /// commands take the channel's next reliable number; unsequenced ones
    /// the next group; everything else the next unreliable number, shared
    /// by all fragments of a group.
    pub(super) fn setup_outgoing_command(&mut self, mut outgoing: OutgoingCommand) {
        let channel_id = outgoing.command.header.channel_id;
        let acknowledge = outgoing.command.header.acknowledge;
        let mut unsequenced_group = None;

        if channel_id == PEER_CHANNEL_ID {
            self.outgoing_reliable_sequence_number = self.outgoing_reliable_sequence_number.wrapping_add(1);
            outgoing.reliable_sequence_number = self.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = 0;
        } else if let Some(channel) = self.channels.get_mut(usize::from(channel_id)) {
            if acknowledge {
                outgoing.reliable_sequence_number = channel.next_reliable_sequence_number();
                outgoing.unreliable_sequence_number = 0;
            } else if outgoing.command.header.unsequenced {
                unsequenced_group = Some(self.unsequenced.next_outgoing_group());
                outgoing.reliable_sequence_number = 0;
                outgoing.unreliable_sequence_number = 0;
            } else {
                if outgoing.fragment_offset == 0 {
                    channel.next_unreliable_sequence_number();
                }
                outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number();
                outgoing.unreliable_sequence_number = channel.outgoing_unreliable_sequence_number();
            }
        }

        outgoing.command.header.reliable_sequence_number = outgoing.reliable_sequence_number;
        match &mut outgoing.command.body {
            ProtocolCommand::SendUnreliable { unreliable_sequence_number, .. } => {
                *unreliable_sequence_number = outgoing.unreliable_sequence_number;
            }
            ProtocolCommand::SendUnsequenced { unsequenced_group: group, .. } => {
                *group = unsequenced_group.unwrap_or_default();
            }
            _ => {}
        }

        if acknowledge {
            self.outgoing_reliable_commands.push_back(outgoing);
        } else {
            self.outgoing_unreliable_commands.push_back(outgoing);
        }
    }
}
