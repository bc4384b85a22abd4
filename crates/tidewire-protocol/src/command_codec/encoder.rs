//! Command encoding.
//!
//! Serializes commands into the big-endian layout the decoder expects. The
//! encoder only appends to a caller-owned buffer so a whole datagram is
//! assembled without intermediate allocations.

use std::io::{self, Write};

use byteorder::{BigEndian, WriteBytesExt};

use crate::command::{Command, ConnectParameters, FragmentBody, ProtocolCommand};

/// Serializes commands into bytes for transmission.
pub struct CommandEncoder;

impl CommandEncoder {
    /// Encodes a single command into the provided buffer (appends bytes).
    pub fn encode_command_into(buffer: &mut Vec<u8>, command: &Command) -> io::Result<()> {
        buffer.write_u8(command.command_byte())?;
        buffer.write_u8(command.header.channel_id)?;
        buffer.write_u16::<BigEndian>(command.header.reliable_sequence_number)?;

        match &command.body {
            ProtocolCommand::Acknowledge { received_reliable_sequence_number, received_sent_time } => {
                buffer.write_u16::<BigEndian>(*received_reliable_sequence_number)?;
                buffer.write_u16::<BigEndian>(*received_sent_time)?;
            }
            ProtocolCommand::Connect { parameters, data } => {
                write_connect_parameters(buffer, parameters)?;
                buffer.write_u32::<BigEndian>(*data)?;
            }
            ProtocolCommand::VerifyConnect(parameters) => {
                write_connect_parameters(buffer, parameters)?;
            }
            ProtocolCommand::Disconnect { data } => {
                buffer.write_u32::<BigEndian>(*data)?;
            }
            ProtocolCommand::Ping => {}
            ProtocolCommand::SendReliable { data } => {
                buffer.write_u16::<BigEndian>(data_length(data)?)?;
                buffer.write_all(data)?;
            }
            ProtocolCommand::SendUnreliable { unreliable_sequence_number, data } => {
                buffer.write_u16::<BigEndian>(*unreliable_sequence_number)?;
                buffer.write_u16::<BigEndian>(data_length(data)?)?;
                buffer.write_all(data)?;
            }
            ProtocolCommand::SendUnsequenced { unsequenced_group, data } => {
                buffer.write_u16::<BigEndian>(*unsequenced_group)?;
                buffer.write_u16::<BigEndian>(data_length(data)?)?;
                buffer.write_all(data)?;
            }
            ProtocolCommand::SendFragment(fragment)
            | ProtocolCommand::SendUnreliableFragment(fragment) => {
                write_fragment(buffer, fragment)?;
            }
            ProtocolCommand::BandwidthLimit { incoming_bandwidth, outgoing_bandwidth } => {
                buffer.write_u32::<BigEndian>(*incoming_bandwidth)?;
                buffer.write_u32::<BigEndian>(*outgoing_bandwidth)?;
            }
            ProtocolCommand::ThrottleConfigure {
                packet_throttle_interval,
                packet_throttle_acceleration,
                packet_throttle_deceleration,
            } => {
                buffer.write_u32::<BigEndian>(*packet_throttle_interval)?;
                buffer.write_u32::<BigEndian>(*packet_throttle_acceleration)?;
                buffer.write_u32::<BigEndian>(*packet_throttle_deceleration)?;
            }
        }

        Ok(())
    }

    /// Encodes a single command into a fresh buffer.
    pub fn encode_command(command: &Command) -> io::Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(command.wire_size());
        Self::encode_command_into(&mut buffer, command)?;
        Ok(buffer)
    }
}

fn data_length(data: &[u8]) -> io::Result<u16> {
    u16::try_from(data.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "payload does not fit a 16-bit length")
    })
}

fn write_connect_parameters(buffer: &mut Vec<u8>, parameters: &ConnectParameters) -> io::Result<()> {
    buffer.write_u16::<BigEndian>(parameters.outgoing_peer_id)?;
    buffer.write_u8(parameters.incoming_session_id)?;
    buffer.write_u8(parameters.outgoing_session_id)?;
    buffer.write_u32::<BigEndian>(parameters.mtu)?;
    buffer.write_u32::<BigEndian>(parameters.window_size)?;
    buffer.write_u32::<BigEndian>(parameters.channel_count)?;
    buffer.write_u32::<BigEndian>(parameters.incoming_bandwidth)?;
    buffer.write_u32::<BigEndian>(parameters.outgoing_bandwidth)?;
    buffer.write_u32::<BigEndian>(parameters.packet_throttle_interval)?;
    buffer.write_u32::<BigEndian>(parameters.packet_throttle_acceleration)?;
    buffer.write_u32::<BigEndian>(parameters.packet_throttle_deceleration)?;
    buffer.write_u32::<BigEndian>(parameters.connect_id)?;
    Ok(())
}

fn write_fragment(buffer: &mut Vec<u8>, fragment: &FragmentBody) -> io::Result<()> {
    buffer.write_u16::<BigEndian>(fragment.start_sequence_number)?;
    buffer.write_u16::<BigEndian>(data_length(&fragment.data)?)?;
    buffer.write_u32::<BigEndian>(fragment.fragment_count)?;
    buffer.write_u32::<BigEndian>(fragment.fragment_number)?;
    buffer.write_u32::<BigEndian>(fragment.total_length)?;
    buffer.write_u32::<BigEndian>(fragment.fragment_offset)?;
    buffer.write_all(&fragment.data)?;
    Ok(())
}
