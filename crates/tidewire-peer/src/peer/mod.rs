use std::collections::VecDeque;

use rand::Rng;
use tidewire_core::{
    config::Config,
    constants::{
        MAXIMUM_CHANNEL_COUNT, MAXIMUM_MTU, MAXIMUM_PEER_ID, MINIMUM_CHANNEL_COUNT, MINIMUM_MTU,
        PEER_CHANNEL_ID,
    },
    error::{ErrorKind, Result},
    transport::DatagramSink,
};
use tidewire_protocol::{
    command::{Command, CommandHeader, ConnectParameters, ProtocolCommand},
    packet::Packet,
    CongestionControl,
};

use crate::{
    channel::Channel,
    command_queue::{Acknowledgement, DispatchedPacket, OutgoingCommand},
    events::{DisconnectReason, PeerEvent},
    flow_control::{negotiate_window_size, window_size_for_bandwidth, FlowControl},
    peer_state::PeerState,
    statistics::PeerStatistics,
    unsequenced::UnsequencedState,
};

mod command_processor;
mod encoder;
mod fragmenter;

/// Session ids before the first handshake; the acceptor derives fresh ones from them.
const UNSET_SESSION_ID: u8 = 0xFF;

/// One end of a connection.
///
/// Owns the channels, every command queue, flow and congestion control for a
/// single remote peer. All methods take the service time in milliseconds;
/// time 0 is reserved to mean "never".
pub struct Peer {
    config: Config,
    state: PeerState,

    /// Id the remote stamps on datagrams addressed to us
    incoming_peer_id: u16,
    /// Id we stamp on datagrams addressed to the remote (MAXIMUM_PEER_ID until verified)
    outgoing_peer_id: u16,
    incoming_session_id: u8,
    outgoing_session_id: u8,
    connect_id: u32,
    mtu: u32,

    /// Remote's advertised incoming bandwidth
    incoming_bandwidth: u32,
    /// Remote's advertised outgoing bandwidth
    outgoing_bandwidth: u32,

    channels: Vec<Channel>,
    /// Sequence counter for commands on the peer channel (0xFF)
    outgoing_reliable_sequence_number: u16,
    unsequenced: UnsequencedState,

    acknowledgements: VecDeque<Acknowledgement>,
    outgoing_reliable_commands: VecDeque<OutgoingCommand>,
    outgoing_unreliable_commands: VecDeque<OutgoingCommand>,
    sent_reliable_commands: VecDeque<OutgoingCommand>,
    /// Unreliable commands in the datagram being assembled
    sent_unreliable_commands: VecDeque<OutgoingCommand>,
    dispatched_commands: VecDeque<DispatchedPacket>,
    /// Received bytes held by channels or waiting in `dispatched_commands`
    total_waiting_data: usize,

    flow_control: FlowControl,
    congestion: CongestionControl,
    statistics: PeerStatistics,

    last_send_time: u32,
    last_receive_time: u32,
    next_timeout: u32,
    earliest_timeout: u32,

    event_data: u32,
    disconnect_reason: DisconnectReason,
    needs_dispatch: bool,
}

impl Peer {
    /// Creates a disconnected peer.
    ///
    /// `incoming_peer_id` is the id the remote will put in the headers of
    /// datagrams addressed to this peer.
    pub fn new(incoming_peer_id: u16, config: &Config) -> Peer {
        Peer {
            config: config.clone(),
            state: PeerState::Disconnected,
            incoming_peer_id: incoming_peer_id & MAXIMUM_PEER_ID,
            outgoing_peer_id: MAXIMUM_PEER_ID,
            incoming_session_id: UNSET_SESSION_ID,
            outgoing_session_id: UNSET_SESSION_ID,
            connect_id: 0,
            mtu: config.mtu,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            channels: Vec::new(),
            outgoing_reliable_sequence_number: 0,
            unsequenced: UnsequencedState::new(),
            acknowledgements: VecDeque::new(),
            outgoing_reliable_commands: VecDeque::new(),
            outgoing_unreliable_commands: VecDeque::new(),
            sent_reliable_commands: VecDeque::new(),
            sent_unreliable_commands: VecDeque::new(),
            dispatched_commands: VecDeque::new(),
            total_waiting_data: 0,
            flow_control: FlowControl::new(config.window_size),
            congestion: CongestionControl::new(config),
            statistics: PeerStatistics::default(),
            last_send_time: 0,
            last_receive_time: 0,
            next_timeout: 0,
            earliest_timeout: 0,
            event_data: 0,
            disconnect_reason: DisconnectReason::Local,
            needs_dispatch: false,
        }
    }

    /// Returns the current connection state.
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Returns the id the remote addresses this peer with.
    pub fn incoming_peer_id(&self) -> u16 {
        self.incoming_peer_id
    }

    /// Returns the id this peer addresses the remote with.
    pub fn outgoing_peer_id(&self) -> u16 {
        self.outgoing_peer_id
    }

    /// Returns the handshake's connect id.
    pub fn connect_id(&self) -> u32 {
        self.connect_id
    }

    /// Returns the negotiated MTU.
    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Returns the number of open channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Returns a channel by id.
    pub fn channel(&self, channel_id: u8) -> Option<&Channel> {
        self.channels.get(usize::from(channel_id))
    }

    /// Returns the negotiated reliable window in bytes.
    pub fn window_size(&self) -> u32 {
        self.flow_control.window_size()
    }

    /// Returns reliable payload bytes sent and not yet acknowledged.
    pub fn reliable_data_in_transit(&self) -> u32 {
        self.flow_control.reliable_data_in_transit()
    }

    /// Returns the bandwidths the remote advertised, `(incoming, outgoing)`.
    pub fn remote_bandwidth(&self) -> (u32, u32) {
        (self.incoming_bandwidth, self.outgoing_bandwidth)
    }

    /// Returns the smoothed round-trip time in ms.
    pub fn round_trip_time(&self) -> u32 {
        self.congestion.round_trip_time()
    }

    /// Returns RTT, throttle and loss state.
    pub fn congestion(&self) -> &CongestionControl {
        &self.congestion
    }

    /// Returns the connection counters.
    pub fn statistics(&self) -> &PeerStatistics {
        &self.statistics
    }

    /// Returns received bytes not yet handed to the application.
    pub fn total_waiting_data(&self) -> usize {
        self.total_waiting_data
    }

    /// Returns the service time of the last datagram sent.
    pub fn last_send_time(&self) -> u32 {
        self.last_send_time
    }

    /// Returns the service time of the last acknowledgement received.
    pub fn last_receive_time(&self) -> u32 {
        self.last_receive_time
    }

    /// Returns the number of reliable commands waiting for an acknowledgement.
    pub fn reliable_commands_in_flight(&self) -> usize {
        self.sent_reliable_commands.len()
    }

    /// True while any command is queued or unacknowledged.
    pub fn has_pending_commands(&self) -> bool {
        !self.outgoing_reliable_commands.is_empty()
            || !self.outgoing_unreliable_commands.is_empty()
            || !self.sent_reliable_commands.is_empty()
    }

    /// Starts a connection as the initiating side.
    ///
    /// Queues a Connect on the peer channel; it goes out on the next
    /// [`flush`](Self::flush). `data` is delivered to the remote with its
    /// connect event.
    pub fn connect(&mut self, channel_count: usize, data: u32) -> Result<()> {
        if self.state != PeerState::Disconnected {
            return Err(ErrorKind::UnexpectedCommand("connect on a peer that is not disconnected"));
        }
        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count) {
            return Err(ErrorKind::InvalidConfig(format!(
                "channel count {} outside {}..={}",
                channel_count, MINIMUM_CHANNEL_COUNT, MAXIMUM_CHANNEL_COUNT
            )));
        }
        self.config.validate()?;

        let mut rng = rand::rng();
        self.connect_id = rng.random();
        self.channels = (0..channel_count).map(|_| Channel::new()).collect();
        self.mtu = self.config.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);
        self.flow_control
            .set_window_size(window_size_for_bandwidth(self.config.outgoing_bandwidth, self.config.window_size));
        self.event_data = data;

        let (interval, acceleration, deceleration) = self.congestion.throttle_parameters();
        let parameters = ConnectParameters {
            outgoing_peer_id: self.incoming_peer_id,
            incoming_session_id: self.incoming_session_id,
            outgoing_session_id: self.outgoing_session_id,
            mtu: self.mtu,
            window_size: self.flow_control.window_size(),
            channel_count: channel_count as u32,
            incoming_bandwidth: self.config.incoming_bandwidth,
            outgoing_bandwidth: self.config.outgoing_bandwidth,
            packet_throttle_interval: interval,
            packet_throttle_acceleration: acceleration,
            packet_throttle_deceleration: deceleration,
            connect_id: self.connect_id,
        };
        self.change_state(PeerState::Connecting);
        self.queue_peer_command(true, ProtocolCommand::Connect { parameters, data });
        tracing::debug!("connecting peer {} with connect id {:#010x}", self.incoming_peer_id, self.connect_id);
        Ok(())
    }

    /// Returns the next delivered packet and its channel.
    pub fn receive(&mut self) -> Option<(u8, Packet)> {
        let DispatchedPacket { channel_id, packet } = self.dispatched_commands.pop_front()?;
        self.total_waiting_data = self.total_waiting_data.saturating_sub(packet.len());
        Some((channel_id, packet))
    }

    /// Returns the pending lifecycle event, if any.
    ///
    /// A connect event moves the peer to `Connected`; a disconnect event
    /// resets it to `Disconnected`.
    pub fn poll_event(&mut self) -> Option<PeerEvent> {
        if !self.needs_dispatch {
            return None;
        }
        self.needs_dispatch = false;

        match self.state {
            PeerState::ConnectionPending | PeerState::ConnectionSucceeded => {
                self.change_state(PeerState::Connected);
                Some(PeerEvent::Connect { data: self.event_data })
            }
            PeerState::Zombie => {
                let event = PeerEvent::Disconnect { data: self.event_data, reason: self.disconnect_reason };
                self.reset();
                Some(event)
            }
            _ => None,
        }
    }

    /// Queues a keep-alive. Only connected peers ping.
    pub fn ping(&mut self) {
        if self.state != PeerState::Connected {
            return;
        }
        self.queue_peer_command(true, ProtocolCommand::Ping);
    }

    /// Adopts new throttle parameters and announces them to the remote.
    pub fn throttle_configure(&mut self, interval: u32, acceleration: u32, deceleration: u32) {
        self.congestion.configure_throttle(interval, acceleration, deceleration);
        if self.state.is_connected() {
            self.queue_peer_command(
                true,
                ProtocolCommand::ThrottleConfigure {
                    packet_throttle_interval: interval,
                    packet_throttle_acceleration: acceleration,
                    packet_throttle_deceleration: deceleration,
                },
            );
        }
    }

    /// Changes the bandwidths this side advertises and announces them to the remote.
    pub fn bandwidth_limit(&mut self, incoming_bandwidth: u32, outgoing_bandwidth: u32) {
        self.config.incoming_bandwidth = incoming_bandwidth;
        self.config.outgoing_bandwidth = outgoing_bandwidth;
        if !self.state.is_connected() {
            return;
        }
        self.flow_control.set_window_size(negotiate_window_size(self.incoming_bandwidth, outgoing_bandwidth));
        self.queue_peer_command(true, ProtocolCommand::BandwidthLimit { incoming_bandwidth, outgoing_bandwidth });
    }

    /// Starts a graceful disconnect.
    ///
    /// A connected peer queues an acknowledged Disconnect and waits in
    /// `Disconnecting`; the disconnect event follows its acknowledgement.
    /// Any other peer sends one unsequenced Disconnect and resets at once.
    pub fn disconnect<S: DatagramSink + ?Sized>(&mut self, data: u32, now: u32, sink: &mut S) -> Result<()> {
        if matches!(
            self.state,
            PeerState::Disconnecting
                | PeerState::Disconnected
                | PeerState::AcknowledgingDisconnect
                | PeerState::Zombie
        ) {
            return Ok(());
        }
        if self.begin_disconnect(data) {
            return Ok(());
        }
        let result = self.flush(now, sink);
        self.reset();
        result
    }

    /// Drops every queue, sends one unsequenced Disconnect and resets.
    ///
    /// No disconnect event is generated.
    pub fn disconnect_now<S: DatagramSink + ?Sized>(&mut self, data: u32, now: u32, sink: &mut S) -> Result<()> {
        if self.state == PeerState::Disconnected {
            return Ok(());
        }
        let mut result = Ok(());
        if self.state != PeerState::Zombie && self.state != PeerState::Disconnecting {
            self.reset_queues();
            self.queue_peer_command(false, ProtocolCommand::Disconnect { data });
            result = self.flush(now, sink);
        }
        self.reset();
        result
    }

    /// Disconnects once every queued command has been sent and acknowledged.
    pub fn disconnect_later<S: DatagramSink + ?Sized>(&mut self, data: u32, now: u32, sink: &mut S) -> Result<()> {
        if self.state.is_connected() && self.has_pending_commands() {
            self.change_state(PeerState::DisconnectLater);
            self.event_data = data;
            return Ok(());
        }
        self.disconnect(data, now, sink)
    }

    /// Forgets the connection without telling the remote.
    ///
    /// Session ids survive so the next handshake picks different ones.
    pub fn reset(&mut self) {
        self.reset_queues();
        self.change_state(PeerState::Disconnected);
        self.outgoing_peer_id = MAXIMUM_PEER_ID;
        self.connect_id = 0;
        self.mtu = self.config.mtu;
        self.incoming_bandwidth = 0;
        self.outgoing_bandwidth = 0;
        self.outgoing_reliable_sequence_number = 0;
        self.unsequenced.reset();
        self.flow_control.reset(self.config.window_size);
        self.congestion = CongestionControl::new(&self.config);
        self.last_send_time = 0;
        self.last_receive_time = 0;
        self.next_timeout = 0;
        self.earliest_timeout = 0;
        self.event_data = 0;
        self.disconnect_reason = DisconnectReason::Local;
        self.total_waiting_data = 0;
        self.statistics.reset();
    }

    /// Drops every queued, sent, held and delivered command and closes the channels.
    fn reset_queues(&mut self) {
        self.needs_dispatch = false;
        self.acknowledgements.clear();
        self.outgoing_reliable_commands.clear();
        self.outgoing_unreliable_commands.clear();
        self.sent_reliable_commands.clear();
        self.sent_unreliable_commands.clear();
        let dispatched: usize = self.dispatched_commands.drain(..).map(|dispatched| dispatched.packet.len()).sum();
        let held: usize = self.channels.iter_mut().map(Channel::clear_incoming).sum();
        self.total_waiting_data = self.total_waiting_data.saturating_sub(dispatched + held);
        self.channels.clear();
    }

    /// Queues the Disconnect for `disconnect`. Returns true if the peer now
    /// waits for its acknowledgement.
    fn begin_disconnect(&mut self, data: u32) -> bool {
        let graceful = self.state.is_connected();
        self.reset_queues();
        self.queue_peer_command(graceful, ProtocolCommand::Disconnect { data });
        if graceful {
            self.change_state(PeerState::Disconnecting);
        }
        graceful
    }

    /// Queues a command on the peer channel, acknowledged or unsequenced.
    fn queue_peer_command(&mut self, acknowledge: bool, body: ProtocolCommand) {
        let header = CommandHeader {
            acknowledge,
            unsequenced: !acknowledge,
            channel_id: PEER_CHANNEL_ID,
            reliable_sequence_number: 0,
        };
        self.setup_outgoing_command(OutgoingCommand::new(Command::new(header, body), None, 0, 0));
    }

    fn change_state(&mut self, state: PeerState) {
        if self.state != state {
            tracing::debug!("peer {}: {:?} -> {:?}", self.incoming_peer_id, self.state, state);
        }
        self.state = state;
    }

    /// Changes state and marks an event as pending for `poll_event`.
    fn dispatch_state(&mut self, state: PeerState) {
        self.change_state(state);
        self.needs_dispatch = true;
    }

    fn notify_connect(&mut self) {
        let state = if self.state == PeerState::Connecting {
            PeerState::ConnectionSucceeded
        } else {
            PeerState::ConnectionPending
        };
        self.dispatch_state(state);
    }

    /// Ends the connection. Peers that never reached the application are reset silently.
    fn notify_disconnect(&mut self, reason: DisconnectReason) {
        if self.state != PeerState::Connecting && self.state < PeerState::ConnectionSucceeded {
            self.reset();
            return;
        }
        self.event_data = 0;
        self.disconnect_reason = reason;
        self.dispatch_state(PeerState::Zombie);
    }
}

#[cfg(test)]
mod tests {
    use tidewire_core::shared::SharedBytes;
    use tidewire_protocol::{
        command::number,
        command_codec::{CommandReader, DatagramHeader},
    };

    use super::*;

    fn commands_in(datagram: &[u8]) -> Vec<Command> {
        let (_, size) = DatagramHeader::decode(datagram).unwrap();
        CommandReader::new(SharedBytes::copy_from_slice(&datagram[size..])).map(|c| c.unwrap()).collect()
    }

    #[test]
    fn test_new_peer_is_disconnected() {
        let mut peer = Peer::new(3, &Config::default());
        assert_eq!(peer.state(), PeerState::Disconnected);
        assert_eq!(peer.outgoing_peer_id(), MAXIMUM_PEER_ID);
        assert_eq!(peer.channel_count(), 0);
        assert!(peer.poll_event().is_none());
        assert!(peer.receive().is_none());
    }

    #[test]
    fn test_send_requires_connection() {
        let mut peer = Peer::new(0, &Config::default());
        let result = peer.send(0, Packet::reliable(vec![1, 2, 3]));
        assert!(matches!(result, Err(ErrorKind::NotConnected)));
        assert!(!peer.has_pending_commands());
    }

    #[test]
    fn test_connect_queues_connect_command() {
        let mut peer = Peer::new(7, &Config::default());
        peer.connect(2, 42).unwrap();
        assert_eq!(peer.state(), PeerState::Connecting);
        assert_eq!(peer.channel_count(), 2);

        let mut sink: Vec<Vec<u8>> = Vec::new();
        peer.flush(1000, &mut sink).unwrap();
        assert_eq!(sink.len(), 1);

        let (header, _) = DatagramHeader::decode(&sink[0]).unwrap();
        assert_eq!(header.peer_id, MAXIMUM_PEER_ID);
        assert!(header.sent_time.is_some());

        let commands = commands_in(&sink[0]);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].body.command_number(), number::CONNECT);
        assert!(commands[0].header.acknowledge);
        assert_eq!(commands[0].header.channel_id, PEER_CHANNEL_ID);
        assert_eq!(commands[0].header.reliable_sequence_number, 1);
        match &commands[0].body {
            ProtocolCommand::Connect { parameters, data } => {
                assert_eq!(*data, 42);
                assert_eq!(parameters.outgoing_peer_id, 7);
                assert_eq!(parameters.channel_count, 2);
                assert_eq!(parameters.connect_id, peer.connect_id());
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(peer.reliable_commands_in_flight(), 1);
    }

    #[test]
    fn test_connect_twice_fails() {
        let mut peer = Peer::new(0, &Config::default());
        peer.connect(1, 0).unwrap();
        assert!(peer.connect(1, 0).is_err());
        assert!(matches!(peer.connect(0, 0), Err(ErrorKind::UnexpectedCommand(_))));
    }

    #[test]
    fn test_invalid_channel_count() {
        let mut peer = Peer::new(0, &Config::default());
        assert!(matches!(peer.connect(0, 0), Err(ErrorKind::InvalidConfig(_))));
        assert!(matches!(peer.connect(256, 0), Err(ErrorKind::InvalidConfig(_))));
        assert_eq!(peer.state(), PeerState::Disconnected);
    }

    #[test]
    fn test_disconnect_while_connecting_resets() {
        let mut peer = Peer::new(0, &Config::default());
        peer.connect(1, 0).unwrap();

        let mut sink: Vec<Vec<u8>> = Vec::new();
        peer.disconnect(9, 1000, &mut sink).unwrap();
        assert_eq!(peer.state(), PeerState::Disconnected);
        assert!(peer.poll_event().is_none());

        // The Connect was dropped; only the unsequenced Disconnect went out
        assert_eq!(sink.len(), 1);
        let commands = commands_in(&sink[0]);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].body, ProtocolCommand::Disconnect { data: 9 });
        assert!(commands[0].header.unsequenced);
        assert!(!commands[0].header.acknowledge);
    }

    #[test]
    fn test_disconnect_now_on_disconnected_peer_is_noop() {
        let mut peer = Peer::new(0, &Config::default());
        let mut sink: Vec<Vec<u8>> = Vec::new();
        peer.disconnect_now(0, 1000, &mut sink).unwrap();
        assert!(sink.is_empty());
        assert_eq!(peer.state(), PeerState::Disconnected);
    }

    #[test]
    fn test_ping_only_when_connected() {
        let mut peer = Peer::new(0, &Config::default());
        peer.ping();
        assert!(!peer.has_pending_commands());
    }
}
