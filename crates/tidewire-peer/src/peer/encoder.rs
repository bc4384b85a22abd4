use tidewire_core::{
    config::RetransmitBackoff,
    constants::{MAXIMUM_PACKET_COMMANDS, MAXIMUM_PEER_ID},
    error::Result,
    time::{time_difference, time_greater_equal, time_less},
    transport::DatagramSink,
};
use tidewire_protocol::{
    command::{command_size, number, Command, CommandHeader, ProtocolCommand},
    command_codec::{append_checksum_in_place, CommandEncoder, DatagramHeader, CHECKSUM_SIZE, MAXIMUM_HEADER_SIZE},
};

use crate::{command_queue::OutgoingCommand, events::DisconnectReason, peer::Peer, peer_state::PeerState};

/// Commands collected for one datagram.
struct DatagramBuilder {
    body: Vec<u8>,
    command_count: usize,
    /// Header, checksum and command bytes so far
    size: usize,
    /// Largest datagram allowed on the wire
    limit: usize,
    /// A reliable command is aboard, so the header carries the sent time
    has_sent_time: bool,
    /// Something was left behind for lack of space
    continue_sending: bool,
}

impl DatagramBuilder {
    fn new(overhead: usize, limit: usize) -> Self {
        Self {
            body: Vec::new(),
            command_count: 0,
            size: overhead,
            limit,
            has_sent_time: false,
            continue_sending: false,
        }
    }

    fn fits(&self, wire_size: usize) -> bool {
        self.command_count < MAXIMUM_PACKET_COMMANDS && self.size + wire_size <= self.limit
    }

    fn push(&mut self, command: &Command) -> Result<()> {
        CommandEncoder::encode_command_into(&mut self.body, command)?;
        self.command_count += 1;
        self.size += command.wire_size();
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.command_count == 0
    }
}

impl Peer {
    /// Writes every datagram the peer has to send right now into `sink`.
    ///
    /// Sends queued acknowledgements, retransmits timed-out reliable
    /// commands, sends new reliable commands the window allows, pings an
    /// idle connection and sends unreliable commands the throttle lets
    /// through. May end the connection with a timeout; the disconnect event
    /// is then waiting in [`poll_event`](Self::poll_event).
    pub fn flush<S: DatagramSink + ?Sized>(&mut self, now: u32, sink: &mut S) -> Result<()> {
        loop {
            if self.state.is_terminal() {
                return Ok(());
            }

            let mut datagram = DatagramBuilder::new(self.datagram_overhead(), self.datagram_limit());
            if !self.acknowledgements.is_empty() {
                self.send_acknowledgements(&mut datagram)?;
            }

            if !self.sent_reliable_commands.is_empty()
                && time_greater_equal(now, self.next_timeout)
                && self.check_timeouts(now)
            {
                return Ok(());
            }

            let can_ping = if self.outgoing_reliable_commands.is_empty() {
                true
            } else {
                self.send_reliable_outgoing_commands(&mut datagram, now)?
            };
            if can_ping
                && self.state == PeerState::Connected
                && self.sent_reliable_commands.is_empty()
                && time_difference(now, self.last_receive_time) >= self.config.ping_interval
                && datagram.fits(command_size(number::PING))
            {
                self.ping();
                self.send_reliable_outgoing_commands(&mut datagram, now)?;
            }

            if !self.outgoing_unreliable_commands.is_empty() {
                self.send_unreliable_outgoing_commands(&mut datagram)?;
            }

            if self.state == PeerState::DisconnectLater && !self.has_pending_commands() {
                let data = self.event_data;
                self.begin_disconnect(data);
            }

            if datagram.is_empty() {
                return Ok(());
            }

            self.congestion.update_packet_loss(now);
            let continue_sending = datagram.continue_sending;
            self.transmit(datagram, now, sink)?;
            self.sent_unreliable_commands.clear();

            if !continue_sending {
                return Ok(());
            }
        }
    }

    fn datagram_overhead(&self) -> usize {
        MAXIMUM_HEADER_SIZE + if self.config.use_checksums { CHECKSUM_SIZE } else { 0 }
    }

    /// The MTU bounds payload bytes. Datagram header, checksum and one
    /// fragment command header travel on top of it, so a full-size fragment
    /// fills exactly one datagram.
    fn datagram_limit(&self) -> usize {
        self.mtu as usize + self.datagram_overhead() + command_size(number::SEND_FRAGMENT)
    }

    fn send_acknowledgements(&mut self, datagram: &mut DatagramBuilder) -> Result<()> {
        let ack_size = command_size(number::ACKNOWLEDGE);
        while let Some(acknowledgement) = self.acknowledgements.front().copied() {
            if !datagram.fits(ack_size) {
                datagram.continue_sending = true;
                break;
            }
            self.acknowledgements.pop_front();

            let command = Command::new(
                CommandHeader {
                    channel_id: acknowledgement.channel_id,
                    reliable_sequence_number: acknowledgement.reliable_sequence_number,
                    ..Default::default()
                },
                ProtocolCommand::Acknowledge {
                    received_reliable_sequence_number: acknowledgement.reliable_sequence_number,
                    received_sent_time: acknowledgement.sent_time,
                },
            );
            datagram.push(&command)?;

            if acknowledgement.command_number == number::DISCONNECT {
                self.dispatch_state(PeerState::Zombie);
            }
        }
        Ok(())
    }

    /// Sends reliable commands in queue order. Returns false if a command
    /// went out or is waiting only for datagram space, meaning no ping is needed.
    fn send_reliable_outgoing_commands(&mut self, datagram: &mut DatagramBuilder, now: u32) -> Result<bool> {
        let throttled_window = self.congestion.throttled_window(self.flow_control.window_size());
        let mut can_ping = true;
        let mut window_wrap = false;
        let mut window_exceeded = false;
        let mut index = 0;

        while index < self.outgoing_reliable_commands.len() {
            let command = &self.outgoing_reliable_commands[index];
            let channel_id = command.command.header.channel_id;

            if let Some(channel) = self.channels.get(usize::from(channel_id)) {
                if !window_wrap
                    && command.send_attempts < 1
                    && channel.reliable_window_blocked(command.reliable_sequence_number)
                {
                    window_wrap = true;
                }
                if window_wrap {
                    index += 1;
                    continue;
                }
            }

            if command.packet.is_some() {
                if !window_exceeded
                    && self.flow_control.window_exceeded(
                        u32::from(command.fragment_length),
                        throttled_window,
                        self.mtu,
                    )
                {
                    window_exceeded = true;
                }
                if window_exceeded {
                    index += 1;
                    continue;
                }
            }

            can_ping = false;
            if !datagram.fits(command.wire_size()) {
                datagram.continue_sending = true;
                break;
            }
            let Some(mut command) = self.outgoing_reliable_commands.remove(index) else { break };

            if command.send_attempts < 1 {
                if let Some(channel) = self.channels.get_mut(usize::from(channel_id)) {
                    channel.mark_reliable_window_used(command.reliable_sequence_number);
                }
            }
            command.send_attempts += 1;
            if command.round_trip_timeout == 0 {
                command.round_trip_timeout = self.clamp_retransmit_timeout(self.congestion.retransmit_timeout());
                command.round_trip_timeout_limit =
                    self.config.timeout_limit.saturating_mul(command.round_trip_timeout);
            }
            if self.sent_reliable_commands.is_empty() {
                self.next_timeout = now.wrapping_add(command.round_trip_timeout);
            }
            command.sent_time = now;

            datagram.push(&command.command)?;
            datagram.has_sent_time = true;
            if command.packet.is_some() {
                self.flow_control.record_reliable_data_sent(u32::from(command.fragment_length));
            }
            self.congestion.record_sent();
            self.sent_reliable_commands.push_back(command);
        }
        Ok(can_ping)
    }

    fn send_unreliable_outgoing_commands(&mut self, datagram: &mut DatagramBuilder) -> Result<()> {
        while let Some(command) = self.outgoing_unreliable_commands.front() {
            if !datagram.fits(command.wire_size()) {
                datagram.continue_sending = true;
                break;
            }

            if command.packet.is_some() && command.fragment_offset == 0 && self.congestion.should_drop_unreliable() {
                let reliable_sequence_number = command.reliable_sequence_number;
                let unreliable_sequence_number = command.unreliable_sequence_number;
                self.outgoing_unreliable_commands.pop_front();
                // The rest of the fragment group goes with it
                while let Some(next) = self.outgoing_unreliable_commands.front() {
                    if next.fragment_offset == 0
                        || next.reliable_sequence_number != reliable_sequence_number
                        || next.unreliable_sequence_number != unreliable_sequence_number
                    {
                        break;
                    }
                    self.outgoing_unreliable_commands.pop_front();
                }
                continue;
            }

            let Some(command) = self.outgoing_unreliable_commands.pop_front() else { break };
            datagram.push(&command.command)?;
            if command.packet.is_some() {
                self.sent_unreliable_commands.push_back(command);
            }
        }
        Ok(())
    }

    /// Moves reliable commands whose timeout passed back to the outgoing queue.
    ///
    /// Returns true if the connection timed out instead.
    fn check_timeouts(&mut self, now: u32) -> bool {
        let mut timed_out: Vec<OutgoingCommand> = Vec::new();
        let mut index = 0;

        while index < self.sent_reliable_commands.len() {
            let command = &self.sent_reliable_commands[index];
            if time_difference(now, command.sent_time) < command.round_trip_timeout {
                index += 1;
                continue;
            }

            if self.earliest_timeout == 0 || time_less(command.sent_time, self.earliest_timeout) {
                self.earliest_timeout = command.sent_time;
            }
            let waited = time_difference(now, self.earliest_timeout);
            if self.earliest_timeout != 0
                && (waited >= self.config.timeout_maximum
                    || (command.round_trip_timeout >= command.round_trip_timeout_limit
                        && waited >= self.config.timeout_minimum)
                    || (self.config.max_send_attempts > 0
                        && command.send_attempts >= self.config.max_send_attempts))
            {
                tracing::warn!(
                    "peer {} timed out after {} ms and {} attempts",
                    self.incoming_peer_id,
                    waited,
                    command.send_attempts
                );
                self.notify_disconnect(DisconnectReason::Timeout);
                return true;
            }

            let Some(mut command) = self.sent_reliable_commands.remove(index) else { break };
            if command.packet.is_some() {
                self.flow_control.record_reliable_data_acked(u32::from(command.fragment_length));
            }
            self.congestion.record_loss();
            self.statistics.packets_lost += 1;
            self.statistics.retransmissions += 1;

            self.back_off(&mut command);
            tracing::trace!(
                "retransmitting command {} seq {} on channel {}, next timeout {} ms",
                command.command_number(),
                command.reliable_sequence_number,
                command.command.header.channel_id,
                command.round_trip_timeout
            );
            timed_out.push(command);

            if index == 0 {
                if let Some(front) = self.sent_reliable_commands.front() {
                    self.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
                }
            }
        }

        // Retransmissions go out before anything new, in their original order
        for command in timed_out.into_iter().rev() {
            self.outgoing_reliable_commands.push_front(command);
        }
        false
    }

    fn back_off(&self, command: &mut OutgoingCommand) {
        let derived = self.congestion.retransmit_timeout();
        let timeout = match self.config.retransmit_backoff {
            RetransmitBackoff::Doubling => command.round_trip_timeout.saturating_mul(2),
            RetransmitBackoff::Additive => command.round_trip_timeout.saturating_add(derived),
            RetransmitBackoff::Fixed => derived,
        };
        command.round_trip_timeout = self.clamp_retransmit_timeout(timeout);
        if self.config.retransmit_backoff == RetransmitBackoff::Fixed {
            command.round_trip_timeout_limit = self.config.timeout_limit.saturating_mul(command.round_trip_timeout);
        }
    }

    fn clamp_retransmit_timeout(&self, timeout: u32) -> u32 {
        timeout.clamp(self.config.min_retransmit_timeout, self.config.max_retransmit_timeout).max(1)
    }

    fn transmit<S: DatagramSink + ?Sized>(&mut self, datagram: DatagramBuilder, now: u32, sink: &mut S) -> Result<()> {
        let session_id = if self.outgoing_peer_id < MAXIMUM_PEER_ID { self.outgoing_session_id } else { 0 };
        let header = DatagramHeader {
            peer_id: self.outgoing_peer_id,
            session_id,
            sent_time: datagram.has_sent_time.then_some(now as u16),
        };

        let mut bytes = Vec::with_capacity(header.size() + datagram.body.len() + CHECKSUM_SIZE);
        header.encode_into(&mut bytes)?;
        bytes.extend_from_slice(&datagram.body);
        if self.config.use_checksums {
            append_checksum_in_place(&mut bytes);
        }

        self.last_send_time = now;
        self.statistics.packets_sent += 1;
        self.statistics.bytes_sent += bytes.len() as u64;
        tracing::trace!(
            "peer {} sending {} commands in {} bytes",
            self.incoming_peer_id,
            datagram.command_count,
            bytes.len()
        );
        sink.send_datagram(&bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_respects_mtu_and_command_limit() {
        let mut datagram = DatagramBuilder::new(4, 576);
        assert!(datagram.fits(572));
        assert!(!datagram.fits(573));

        let ping = Command::new(CommandHeader::default(), ProtocolCommand::Ping);
        for _ in 0..MAXIMUM_PACKET_COMMANDS {
            datagram.push(&ping).unwrap();
        }
        assert!(!datagram.fits(4));
        assert_eq!(datagram.size, 4 + 4 * MAXIMUM_PACKET_COMMANDS);
    }

    #[test]
    fn test_full_fragment_fills_one_datagram() {
        use tidewire_core::config::Config;

        let peer = Peer::new(0, &Config { mtu: 1024, ..Default::default() });
        assert_eq!(peer.datagram_limit(), 1024 + MAXIMUM_HEADER_SIZE + command_size(number::SEND_FRAGMENT));

        let peer = Peer::new(0, &Config { mtu: 1024, use_checksums: true, ..Default::default() });
        let datagram = DatagramBuilder::new(peer.datagram_overhead(), peer.datagram_limit());
        assert!(datagram.fits(command_size(number::SEND_FRAGMENT) + 1024));
        assert!(!datagram.fits(command_size(number::SEND_FRAGMENT) + 1025));
    }
}
