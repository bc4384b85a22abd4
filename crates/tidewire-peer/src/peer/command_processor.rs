//! Incoming datagrams: header validation and per-command handlers.

use tidewire_core::{
    constants::{
        FREE_RELIABLE_WINDOWS, MAXIMUM_CHANNEL_COUNT, MAXIMUM_MTU, MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE,
        MINIMUM_CHANNEL_COUNT, MINIMUM_MTU, PEER_CHANNEL_ID, RELIABLE_WINDOWS,
    },
    error::{ErrorKind, Result},
    shared::SharedBytes,
    time::{time_difference, time_less},
};
use tidewire_protocol::{
    command::{number, Command, CommandHeader, ConnectParameters, FragmentBody, ProtocolCommand},
    command_codec::{
        header::{HEADER_SESSION_MASK, HEADER_SESSION_SHIFT},
        validate_checksum, CommandReader, DatagramHeader,
    },
    packet::{Packet, PacketFlags},
    sequence::{reliable_window, sequence_greater_than},
};

use crate::{
    channel::{Channel, Slot},
    command_queue::{Acknowledgement, DispatchedPacket, IncomingCommand, IncomingPayload, OutgoingCommand},
    events::DisconnectReason,
    flow_control::{clamp_window_size, negotiate_window_size, window_size_for_bandwidth},
    fragment_buffer::fragment_is_valid,
    peer::Peer,
    peer_state::PeerState,
};

/// What the datagram loop does after a handler returned successfully.
enum Flow {
    Continue,
    /// Ignore the rest of the datagram without counting it as dropped.
    Stop,
}

/// Derives a session id from the one proposed, skipping the one in use.
fn next_session_id(proposed: u8, current: u8) -> u8 {
    let mask = (HEADER_SESSION_MASK >> HEADER_SESSION_SHIFT) as u8;
    let mut session_id = proposed.wrapping_add(1) & mask;
    if session_id == current {
        session_id = session_id.wrapping_add(1) & mask;
    }
    session_id
}

impl Peer {
    /// Processes one received datagram.
    ///
    /// Commands run in wire order; the first malformed or rejected command
    /// ends processing of the datagram and is counted in
    /// [`dropped_commands`](crate::PeerStatistics::dropped_commands).
    /// Returns an error only if the header or checksum is bad; datagrams
    /// addressed to another peer or session are ignored.
    pub fn handle_datagram(&mut self, datagram: &[u8], now: u32) -> Result<()> {
        let length = if self.config.use_checksums { validate_checksum(datagram)? } else { datagram.len() };
        let (header, header_size) = DatagramHeader::decode(&datagram[..length])?;

        let addressed = header.peer_id != MAXIMUM_PEER_ID;
        if addressed {
            if header.peer_id != self.incoming_peer_id || self.state.is_terminal() {
                tracing::trace!("ignoring datagram for peer {} in state {:?}", header.peer_id, self.state);
                return Ok(());
            }
            if self.outgoing_peer_id < MAXIMUM_PEER_ID && header.session_id != self.incoming_session_id {
                tracing::trace!("ignoring datagram from stale session {}", header.session_id);
                return Ok(());
            }
        }

        self.statistics.packets_received += 1;
        self.statistics.bytes_received += datagram.len() as u64;

        let body = SharedBytes::copy_from_slice(&datagram[header_size..length]);
        let mut addressed = addressed;
        for command in CommandReader::new(body) {
            let command = match command {
                Ok(command) => command,
                Err(error) => {
                    tracing::debug!("malformed command from peer {}: {}", self.incoming_peer_id, error);
                    self.statistics.dropped_commands += 1;
                    break;
                }
            };
            let command_number = command.body.command_number();
            if !addressed && command_number != number::CONNECT {
                self.statistics.dropped_commands += 1;
                break;
            }
            addressed = true;

            let header_fields = command.header;
            match self.handle_command(command, now) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(error) => {
                    tracing::debug!(
                        "dropping command {} on channel {}: {}",
                        command_number,
                        header_fields.channel_id,
                        error
                    );
                    self.statistics.dropped_commands += 1;
                    break;
                }
            }

            if header_fields.acknowledge {
                if let Some(sent_time) = header.sent_time {
                    self.acknowledge_received(&header_fields, command_number, sent_time);
                }
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, command: Command, now: u32) -> Result<Flow> {
        let Command { header, body } = command;
        match body {
            ProtocolCommand::Acknowledge { received_reliable_sequence_number, received_sent_time } => {
                self.handle_acknowledge(&header, received_reliable_sequence_number, received_sent_time, now)?
            }
            ProtocolCommand::Connect { parameters, data } => return self.handle_connect(parameters, data),
            ProtocolCommand::VerifyConnect(parameters) => self.handle_verify_connect(parameters)?,
            ProtocolCommand::Disconnect { data } => self.handle_disconnect(&header, data),
            ProtocolCommand::Ping => self.require_connected("ping")?,
            ProtocolCommand::SendReliable { data } => self.handle_send_reliable(&header, data)?,
            ProtocolCommand::SendUnreliable { unreliable_sequence_number, data } => {
                self.handle_send_unreliable(&header, unreliable_sequence_number, data)?
            }
            ProtocolCommand::SendUnsequenced { unsequenced_group, data } => {
                self.handle_send_unsequenced(&header, unsequenced_group, data)?
            }
            ProtocolCommand::SendFragment(fragment) => self.handle_send_fragment(&header, fragment)?,
            ProtocolCommand::SendUnreliableFragment(fragment) => {
                self.handle_send_unreliable_fragment(&header, fragment)?
            }
            ProtocolCommand::BandwidthLimit { incoming_bandwidth, outgoing_bandwidth } => {
                self.require_connected("bandwidth limit")?;
                self.incoming_bandwidth = incoming_bandwidth;
                self.outgoing_bandwidth = outgoing_bandwidth;
                self.flow_control
                    .set_window_size(negotiate_window_size(incoming_bandwidth, self.config.outgoing_bandwidth));
            }
            ProtocolCommand::ThrottleConfigure {
                packet_throttle_interval,
                packet_throttle_acceleration,
                packet_throttle_deceleration,
            } => {
                self.require_connected("throttle configure")?;
                self.congestion.configure_throttle(
                    packet_throttle_interval,
                    packet_throttle_acceleration,
                    packet_throttle_deceleration,
                );
            }
        }
        Ok(Flow::Continue)
    }

    fn require_connected(&self, what: &'static str) -> Result<()> {
        if self.state.is_connected() {
            Ok(())
        } else {
            Err(ErrorKind::UnexpectedCommand(what))
        }
    }

    /// Validates the channel of a data command and returns its index.
    fn data_channel(&self, header: &CommandHeader) -> Result<usize> {
        let index = usize::from(header.channel_id);
        if index >= self.channels.len() {
            return Err(ErrorKind::InvalidChannel(header.channel_id));
        }
        self.require_connected("data before connect")?;
        Ok(index)
    }

    /// Queues an acknowledgement for a command that asked for one.
    fn acknowledge_received(&mut self, header: &CommandHeader, command_number: u8, sent_time: u16) {
        match self.state {
            PeerState::Disconnecting
            | PeerState::AcknowledgingConnect
            | PeerState::Disconnected
            | PeerState::Zombie => return,
            PeerState::AcknowledgingDisconnect if command_number != number::DISCONNECT => return,
            _ => {}
        }

        if let Some(channel) = self.channels.get(usize::from(header.channel_id)) {
            // Never acknowledge into the windows the sender must keep free
            let current = reliable_window(channel.incoming_reliable_sequence_number());
            let mut window = reliable_window(header.reliable_sequence_number);
            if header.reliable_sequence_number < channel.incoming_reliable_sequence_number() {
                window += RELIABLE_WINDOWS;
            }
            if window >= current + FREE_RELIABLE_WINDOWS - 1 && window <= current + FREE_RELIABLE_WINDOWS {
                return;
            }
        }

        self.acknowledgements.push_back(Acknowledgement {
            channel_id: header.channel_id,
            reliable_sequence_number: header.reliable_sequence_number,
            command_number,
            sent_time,
        });
    }

    fn handle_acknowledge(
        &mut self,
        header: &CommandHeader,
        received_reliable_sequence_number: u16,
        received_sent_time: u16,
        now: u32,
    ) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }

        // Rebuild the full sent time from its low 16 bits
        let mut sent_time = u32::from(received_sent_time) | (now & 0xFFFF_0000);
        if (sent_time & 0x8000) > (now & 0x8000) {
            sent_time = sent_time.wrapping_sub(0x10000);
        }
        if time_less(now, sent_time) {
            return Ok(());
        }

        let round_trip_time = time_difference(now, sent_time).max(1);
        self.congestion.record_round_trip(round_trip_time, now);
        self.last_receive_time = now;
        self.earliest_timeout = 0;

        let acknowledged = self.remove_sent_reliable_command(received_reliable_sequence_number, header.channel_id);
        if acknowledged.is_none() && self.never_sent(header.channel_id, received_reliable_sequence_number) {
            tracing::warn!(
                "peer {}: acknowledgement for unsent sequence {} on channel {}",
                self.incoming_peer_id,
                received_reliable_sequence_number,
                header.channel_id
            );
            self.notify_disconnect(DisconnectReason::ProtocolViolation);
            return Err(ErrorKind::UnexpectedCommand("acknowledgement of a command never sent"));
        }
        match (self.state, acknowledged) {
            (PeerState::AcknowledgingConnect, Some(number::VERIFY_CONNECT)) => self.notify_connect(),
            (PeerState::Disconnecting, Some(number::DISCONNECT)) => {
                self.notify_disconnect(DisconnectReason::Local)
            }
            (PeerState::AcknowledgingConnect | PeerState::Disconnecting, Some(command_number)) => {
                tracing::warn!(
                    "peer {}: acknowledgement of command {} in state {:?}",
                    self.incoming_peer_id,
                    command_number,
                    self.state
                );
                self.notify_disconnect(DisconnectReason::ProtocolViolation);
                return Err(ErrorKind::UnexpectedCommand("acknowledgement of an unexpected command"));
            }
            (PeerState::DisconnectLater, _) => {
                if !self.has_pending_commands() {
                    let data = self.event_data;
                    self.begin_disconnect(data);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// True if `reliable_sequence_number` is ahead of the last number handed
    /// out on the channel. Channels closed by a reset count as unknown, not
    /// as violations.
    fn never_sent(&self, channel_id: u8, reliable_sequence_number: u16) -> bool {
        let last_assigned = if channel_id == PEER_CHANNEL_ID {
            self.outgoing_reliable_sequence_number
        } else {
            match self.channels.get(usize::from(channel_id)) {
                Some(channel) => channel.outgoing_reliable_sequence_number(),
                None => return !self.channels.is_empty(),
            }
        };
        sequence_greater_than(reliable_sequence_number, last_assigned)
    }

    /// Removes an acknowledged reliable command and returns its command number.
    ///
    /// Commands that timed out and wait for retransmission are found too.
    pub(super) fn remove_sent_reliable_command(&mut self, reliable_sequence_number: u16, channel_id: u8) -> Option<u8> {
        let is_acknowledged = |command: &OutgoingCommand| {
            command.reliable_sequence_number == reliable_sequence_number
                && command.command.header.channel_id == channel_id
        };

        let (command, was_sent) = match self.sent_reliable_commands.iter().position(is_acknowledged) {
            Some(index) => (self.sent_reliable_commands.remove(index)?, true),
            None => {
                let index = self
                    .outgoing_reliable_commands
                    .iter()
                    .take_while(|command| command.send_attempts > 0)
                    .position(is_acknowledged)?;
                (self.outgoing_reliable_commands.remove(index)?, false)
            }
        };

        if let Some(channel) = self.channels.get_mut(usize::from(channel_id)) {
            channel.release_reliable_window(reliable_sequence_number);
        }
        if was_sent && command.packet.is_some() {
            self.flow_control.record_reliable_data_acked(u32::from(command.fragment_length));
        }
        if let Some(front) = self.sent_reliable_commands.front() {
            self.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
        }
        Some(command.command_number())
    }

    /// Accepts a connection request. Returns `Stop` for a retransmitted Connect
    /// of the handshake already in progress.
    fn handle_connect(&mut self, parameters: ConnectParameters, data: u32) -> Result<Flow> {
        if self.state != PeerState::Disconnected {
            if parameters.connect_id == self.connect_id {
                return Ok(Flow::Stop);
            }
            return Err(ErrorKind::UnexpectedCommand("connect on an active peer"));
        }

        let requested_channels = parameters.channel_count as usize;
        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&requested_channels) {
            return Err(ErrorKind::UnexpectedCommand("connect with invalid channel count"));
        }
        let channel_count = requested_channels.min(self.config.channel_count);

        self.channels = (0..channel_count).map(|_| Channel::new()).collect();
        self.connect_id = parameters.connect_id;
        self.outgoing_peer_id = parameters.outgoing_peer_id & MAXIMUM_PEER_ID;
        self.incoming_bandwidth = parameters.incoming_bandwidth;
        self.outgoing_bandwidth = parameters.outgoing_bandwidth;
        self.congestion.configure_throttle(
            parameters.packet_throttle_interval,
            parameters.packet_throttle_acceleration,
            parameters.packet_throttle_deceleration,
        );
        self.event_data = data;

        let proposed_outgoing = if parameters.incoming_session_id == 0xFF {
            self.outgoing_session_id
        } else {
            parameters.incoming_session_id
        };
        let outgoing_session_id = next_session_id(proposed_outgoing, self.outgoing_session_id);
        self.outgoing_session_id = outgoing_session_id;

        let proposed_incoming = if parameters.outgoing_session_id == 0xFF {
            self.incoming_session_id
        } else {
            parameters.outgoing_session_id
        };
        let incoming_session_id = next_session_id(proposed_incoming, self.incoming_session_id);
        self.incoming_session_id = incoming_session_id;

        self.mtu = parameters.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU).min(self.config.mtu);
        self.flow_control
            .set_window_size(negotiate_window_size(self.config.incoming_bandwidth, parameters.outgoing_bandwidth));
        let verify_window_size = clamp_window_size(
            window_size_for_bandwidth(self.config.incoming_bandwidth, MAXIMUM_WINDOW_SIZE)
                .min(parameters.window_size),
        );

        self.change_state(PeerState::AcknowledgingConnect);
        tracing::debug!(
            "accepting connect {:#010x} from peer {} with {} channels",
            self.connect_id,
            self.outgoing_peer_id,
            channel_count
        );

        let verify = ConnectParameters {
            outgoing_peer_id: self.incoming_peer_id,
            incoming_session_id: outgoing_session_id,
            outgoing_session_id: incoming_session_id,
            mtu: self.mtu,
            window_size: verify_window_size,
            channel_count: channel_count as u32,
            incoming_bandwidth: self.config.incoming_bandwidth,
            outgoing_bandwidth: self.config.outgoing_bandwidth,
            packet_throttle_interval: parameters.packet_throttle_interval,
            packet_throttle_acceleration: parameters.packet_throttle_acceleration,
            packet_throttle_deceleration: parameters.packet_throttle_deceleration,
            connect_id: self.connect_id,
        };
        self.queue_peer_command(true, ProtocolCommand::VerifyConnect(verify));
        Ok(Flow::Continue)
    }

    fn handle_verify_connect(&mut self, parameters: ConnectParameters) -> Result<()> {
        if self.state != PeerState::Connecting {
            return Ok(());
        }

        let channel_count = parameters.channel_count as usize;
        let throttle = (
            parameters.packet_throttle_interval,
            parameters.packet_throttle_acceleration,
            parameters.packet_throttle_deceleration,
        );
        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count)
            || throttle != self.congestion.throttle_parameters()
            || parameters.connect_id != self.connect_id
        {
            tracing::warn!("verify connect from peer {} does not match the request", parameters.outgoing_peer_id);
            self.event_data = 0;
            self.disconnect_reason = DisconnectReason::ProtocolViolation;
            self.dispatch_state(PeerState::Zombie);
            return Err(ErrorKind::UnexpectedCommand("verify connect does not match the request"));
        }

        self.remove_sent_reliable_command(1, PEER_CHANNEL_ID);
        self.channels.truncate(channel_count);
        self.outgoing_peer_id = parameters.outgoing_peer_id & MAXIMUM_PEER_ID;
        self.incoming_session_id = parameters.incoming_session_id;
        self.outgoing_session_id = parameters.outgoing_session_id;
        self.mtu = self.mtu.min(parameters.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU));
        self.flow_control
            .set_window_size(self.flow_control.window_size().min(clamp_window_size(parameters.window_size)));
        self.incoming_bandwidth = parameters.incoming_bandwidth;
        self.outgoing_bandwidth = parameters.outgoing_bandwidth;

        tracing::debug!("connection {:#010x} verified, mtu {}", self.connect_id, self.mtu);
        self.notify_connect();
        Ok(())
    }

    fn handle_disconnect(&mut self, header: &CommandHeader, data: u32) {
        if matches!(
            self.state,
            PeerState::Disconnected | PeerState::Zombie | PeerState::AcknowledgingDisconnect
        ) {
            return;
        }

        self.reset_queues();
        match self.state {
            PeerState::ConnectionSucceeded | PeerState::Disconnecting | PeerState::Connecting => {
                self.dispatch_state(PeerState::Zombie)
            }
            PeerState::Connected | PeerState::DisconnectLater => {
                if header.acknowledge {
                    self.change_state(PeerState::AcknowledgingDisconnect);
                } else {
                    self.dispatch_state(PeerState::Zombie);
                }
            }
            _ => self.reset(),
        }

        if self.state != PeerState::Disconnected {
            self.event_data = data;
            self.disconnect_reason = DisconnectReason::Remote;
        }
    }

    fn handle_send_reliable(&mut self, header: &CommandHeader, data: SharedBytes) -> Result<()> {
        let channel_index = self.data_channel(header)?;
        let command = IncomingCommand::complete(
            number::SEND_RELIABLE,
            header.reliable_sequence_number,
            0,
            Packet::new(data, PacketFlags::RELIABLE),
        );
        if self.queue_incoming_command(channel_index, command)?.is_some() {
            self.dispatch_reliable(channel_index);
        }
        Ok(())
    }

    fn handle_send_unreliable(
        &mut self,
        header: &CommandHeader,
        unreliable_sequence_number: u16,
        data: SharedBytes,
    ) -> Result<()> {
        let channel_index = self.data_channel(header)?;
        let command = IncomingCommand::complete(
            number::SEND_UNRELIABLE,
            header.reliable_sequence_number,
            unreliable_sequence_number,
            Packet::new(data, PacketFlags::NONE),
        );
        if self.queue_incoming_command(channel_index, command)?.is_some() {
            self.dispatch_unreliable(channel_index);
        }
        Ok(())
    }

    fn handle_send_unsequenced(
        &mut self,
        header: &CommandHeader,
        unsequenced_group: u16,
        data: SharedBytes,
    ) -> Result<()> {
        self.data_channel(header)?;
        if self.state == PeerState::DisconnectLater {
            self.statistics.dropped_commands += 1;
            return Ok(());
        }
        let Some(index) = self.unsequenced.admit(unsequenced_group) else {
            tracing::trace!("duplicate unsequenced group {}", unsequenced_group);
            self.statistics.dropped_commands += 1;
            return Ok(());
        };
        if self.total_waiting_data >= self.config.max_waiting_data {
            return Err(ErrorKind::WaitingDataExceeded);
        }

        self.total_waiting_data += data.len();
        self.dispatched_commands.push_back(DispatchedPacket {
            channel_id: header.channel_id,
            packet: Packet::new(data, PacketFlags::UNSEQUENCED),
        });
        self.unsequenced.mark_received(index);
        Ok(())
    }

    fn handle_send_fragment(&mut self, header: &CommandHeader, fragment: FragmentBody) -> Result<()> {
        let channel_index = self.data_channel(header)?;
        let start = fragment.start_sequence_number;
        if !self.channels[channel_index].accepts_reliable_window(start) {
            self.statistics.dropped_commands += 1;
            return Ok(());
        }
        if !fragment_is_valid(&fragment, self.config.max_packet_size) {
            tracing::warn!(
                "rejecting fragment {}/{} of {} bytes at offset {}",
                fragment.fragment_number,
                fragment.fragment_count,
                fragment.total_length,
                fragment.fragment_offset
            );
            return Err(ErrorKind::UnexpectedCommand("invalid fragment"));
        }

        let index = match self.channels[channel_index].find_reliable(start) {
            Slot::Occupied(index) => index,
            Slot::Vacant(_) => {
                let group = IncomingCommand::fragmented(
                    number::SEND_FRAGMENT,
                    start,
                    0,
                    fragment.total_length as usize,
                    fragment.fragment_count,
                );
                self.queue_incoming_command(channel_index, group)?
                    .ok_or(ErrorKind::UnexpectedCommand("fragment group outside the window"))?
            }
        };

        let channel = &mut self.channels[channel_index];
        let group = channel.reliable_mut(index).ok_or(ErrorKind::UnexpectedCommand("missing fragment group"))?;
        let Some(released) = store_fragment(group, number::SEND_FRAGMENT, &fragment)? else {
            return Ok(());
        };
        self.total_waiting_data = self.total_waiting_data.saturating_sub(released);
        self.dispatch_reliable(channel_index);
        Ok(())
    }

    fn handle_send_unreliable_fragment(&mut self, header: &CommandHeader, fragment: FragmentBody) -> Result<()> {
        let channel_index = self.data_channel(header)?;
        let reliable_sequence_number = header.reliable_sequence_number;
        let start = fragment.start_sequence_number;
        let channel = &self.channels[channel_index];
        if !channel.accepts_reliable_window(reliable_sequence_number)
            || (reliable_sequence_number == channel.incoming_reliable_sequence_number()
                && start <= channel.incoming_unreliable_sequence_number())
        {
            self.statistics.dropped_commands += 1;
            return Ok(());
        }
        if !fragment_is_valid(&fragment, self.config.max_packet_size) {
            return Err(ErrorKind::UnexpectedCommand("invalid fragment"));
        }

        let index = match channel.find_unreliable(reliable_sequence_number, start) {
            Slot::Occupied(index) => index,
            Slot::Vacant(_) => {
                let group = IncomingCommand::fragmented(
                    number::SEND_UNRELIABLE_FRAGMENT,
                    reliable_sequence_number,
                    start,
                    fragment.total_length as usize,
                    fragment.fragment_count,
                );
                self.queue_incoming_command(channel_index, group)?
                    .ok_or(ErrorKind::UnexpectedCommand("fragment group outside the window"))?
            }
        };

        let channel = &mut self.channels[channel_index];
        let group =
            channel.unreliable_mut(index).ok_or(ErrorKind::UnexpectedCommand("missing fragment group"))?;
        let Some(released) = store_fragment(group, number::SEND_UNRELIABLE_FRAGMENT, &fragment)? else {
            return Ok(());
        };
        self.total_waiting_data = self.total_waiting_data.saturating_sub(released);
        self.dispatch_unreliable(channel_index);
        Ok(())
    }

    /// Files a received command with its channel.
    ///
    /// Returns its index in the channel's list, or `None` when it was
    /// discarded as a duplicate, stale or out-of-window command. Discarding
    /// the head of a fragment group is an error.
    fn queue_incoming_command(&mut self, channel_index: usize, command: IncomingCommand) -> Result<Option<usize>> {
        let channel = &self.channels[channel_index];
        let reliable = matches!(command.command_number, number::SEND_RELIABLE | number::SEND_FRAGMENT);

        let slot = if self.state == PeerState::DisconnectLater
            || !channel.accepts_reliable_window(command.reliable_sequence_number)
        {
            None
        } else if reliable {
            if command.reliable_sequence_number == channel.incoming_reliable_sequence_number() {
                None
            } else {
                Some(channel.find_reliable(command.reliable_sequence_number))
            }
        } else if command.reliable_sequence_number == channel.incoming_reliable_sequence_number()
            && command.unreliable_sequence_number <= channel.incoming_unreliable_sequence_number()
        {
            None
        } else {
            Some(channel.find_unreliable(command.reliable_sequence_number, command.unreliable_sequence_number))
        };

        let index = match slot {
            Some(Slot::Vacant(index)) => index,
            Some(Slot::Occupied(_)) | None => {
                if command.fragment_count > 0 {
                    return Err(ErrorKind::UnexpectedCommand("fragment group discarded"));
                }
                tracing::trace!(
                    "discarding command {} with sequence {}/{}",
                    command.command_number,
                    command.reliable_sequence_number,
                    command.unreliable_sequence_number
                );
                self.statistics.dropped_commands += 1;
                return Ok(None);
            }
        };

        if self.total_waiting_data >= self.config.max_waiting_data {
            tracing::warn!(
                "peer {}: {} bytes waiting for the application, refusing more",
                self.incoming_peer_id,
                self.total_waiting_data
            );
            return Err(ErrorKind::WaitingDataExceeded);
        }
        self.total_waiting_data += command.waiting_size();

        let channel = &mut self.channels[channel_index];
        if reliable {
            channel.insert_reliable(index, command);
        } else {
            channel.insert_unreliable(index, command);
        }
        Ok(Some(index))
    }

    fn dispatch_reliable(&mut self, channel_index: usize) {
        let released =
            self.channels[channel_index].dispatch_reliable(channel_index as u8, &mut self.dispatched_commands);
        self.total_waiting_data = self.total_waiting_data.saturating_sub(released);
    }

    fn dispatch_unreliable(&mut self, channel_index: usize) {
        let released =
            self.channels[channel_index].dispatch_unreliable(channel_index as u8, &mut self.dispatched_commands);
        self.total_waiting_data = self.total_waiting_data.saturating_sub(released);
    }
}

/// Copies a fragment into its group.
///
/// Returns the waiting-data bytes freed if this completed the group.
fn store_fragment(group: &mut IncomingCommand, command_number: u8, fragment: &FragmentBody) -> Result<Option<usize>> {
    if group.command_number != command_number
        || group.fragment_count != fragment.fragment_count
        || group.payload_length() != fragment.total_length as usize
    {
        return Err(ErrorKind::UnexpectedCommand("fragment does not match its group"));
    }
    let IncomingPayload::Reassembling(buffer) = &mut group.payload else {
        // Already complete and waiting for its turn
        return Ok(None);
    };
    if !buffer.insert(fragment.fragment_number, fragment.fragment_offset as usize, &fragment.data) {
        return Ok(None);
    }
    if !buffer.is_complete() {
        return Ok(None);
    }
    Ok(Some(group.finish_reassembly()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_rotation_skips_current() {
        assert_eq!(next_session_id(0xFF, 0xFF), 0);
        assert_eq!(next_session_id(1, 0xFF), 2);
        assert_eq!(next_session_id(1, 2), 3);
        assert_eq!(next_session_id(3, 0), 1);
    }
}
