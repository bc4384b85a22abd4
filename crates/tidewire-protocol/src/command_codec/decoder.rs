//! Command decoding.
//!
//! A datagram body is walked command by command with [`CommandReader`].
//! Payloads are zero-copy views into the received datagram. The reader
//! stops at the first malformed command: everything after it in the same
//! datagram is unreachable because command boundaries can no longer be
//! trusted.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use tidewire_core::{
    error::{DecodingErrorKind, Result},
    shared::SharedBytes,
};

use crate::command::{
    command_size, number, Command, CommandHeader, ConnectParameters, FragmentBody,
    ProtocolCommand, COMMAND_HEADER_SIZE, FLAG_ACKNOWLEDGE, FLAG_UNSEQUENCED,
};

/// Deserializes commands from network bytes.
pub struct CommandDecoder;

impl CommandDecoder {
    /// Decodes the command starting at `offset`.
    ///
    /// Returns the command and the number of bytes it occupied.
    pub fn decode_command(buffer: &SharedBytes, offset: usize) -> Result<(Command, usize)> {
        let bytes = buffer.get(offset..).ok_or(DecodingErrorKind::Truncated)?;
        if bytes.len() < COMMAND_HEADER_SIZE {
            return Err(DecodingErrorKind::Truncated.into());
        }

        let command_byte = bytes[0];
        let command_number = command_byte & number::MASK;
        let size = command_size(command_number);
        if size == 0 {
            return Err(DecodingErrorKind::UnknownCommand(command_number).into());
        }
        if bytes.len() < size {
            return Err(DecodingErrorKind::Truncated.into());
        }

        let mut cursor = Cursor::new(&bytes[..size]);
        let header = read_header(&mut cursor)?;
        let fixed = offset + size;

        let (body, payload_length) = match command_number {
            number::ACKNOWLEDGE => (
                ProtocolCommand::Acknowledge {
                    received_reliable_sequence_number: read_u16(&mut cursor)?,
                    received_sent_time: read_u16(&mut cursor)?,
                },
                0,
            ),
            number::CONNECT => {
                let parameters = read_connect_parameters(&mut cursor)?;
                let data = read_u32(&mut cursor)?;
                (ProtocolCommand::Connect { parameters, data }, 0)
            }
            number::VERIFY_CONNECT => {
                (ProtocolCommand::VerifyConnect(read_connect_parameters(&mut cursor)?), 0)
            }
            number::DISCONNECT => (ProtocolCommand::Disconnect { data: read_u32(&mut cursor)? }, 0),
            number::PING => (ProtocolCommand::Ping, 0),
            number::SEND_RELIABLE => {
                let length = read_u16(&mut cursor)? as usize;
                let data = payload(buffer, fixed, length)?;
                (ProtocolCommand::SendReliable { data }, length)
            }
            number::SEND_UNRELIABLE => {
                let unreliable_sequence_number = read_u16(&mut cursor)?;
                let length = read_u16(&mut cursor)? as usize;
                let data = payload(buffer, fixed, length)?;
                (ProtocolCommand::SendUnreliable { unreliable_sequence_number, data }, length)
            }
            number::SEND_UNSEQUENCED => {
                let unsequenced_group = read_u16(&mut cursor)?;
                let length = read_u16(&mut cursor)? as usize;
                let data = payload(buffer, fixed, length)?;
                (ProtocolCommand::SendUnsequenced { unsequenced_group, data }, length)
            }
            number::SEND_FRAGMENT => {
                let fragment = read_fragment(&mut cursor, buffer, fixed)?;
                let length = fragment.data.len();
                (ProtocolCommand::SendFragment(fragment), length)
            }
            number::SEND_UNRELIABLE_FRAGMENT => {
                let fragment = read_fragment(&mut cursor, buffer, fixed)?;
                let length = fragment.data.len();
                (ProtocolCommand::SendUnreliableFragment(fragment), length)
            }
            number::BANDWIDTH_LIMIT => (
                ProtocolCommand::BandwidthLimit {
                    incoming_bandwidth: read_u32(&mut cursor)?,
                    outgoing_bandwidth: read_u32(&mut cursor)?,
                },
                0,
            ),
            number::THROTTLE_CONFIGURE => (
                ProtocolCommand::ThrottleConfigure {
                    packet_throttle_interval: read_u32(&mut cursor)?,
                    packet_throttle_acceleration: read_u32(&mut cursor)?,
                    packet_throttle_deceleration: read_u32(&mut cursor)?,
                },
                0,
            ),
            other => return Err(DecodingErrorKind::UnknownCommand(other).into()),
        };

        Ok((Command { header, body }, size + payload_length))
    }
}

/// Iterator over the commands of one datagram body.
///
/// Yields `Err` at most once; after an error the reader is exhausted.
#[derive(Debug)]
pub struct CommandReader {
    buffer: SharedBytes,
    position: usize,
    failed: bool,
}

impl CommandReader {
    /// Creates a reader over `buffer`, which must start at the first command.
    pub fn new(buffer: SharedBytes) -> Self {
        Self { buffer, position: 0, failed: false }
    }

    /// Returns the number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }
}

impl Iterator for CommandReader {
    type Item = Result<Command>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.position >= self.buffer.len() {
            return None;
        }
        match CommandDecoder::decode_command(&self.buffer, self.position) {
            Ok((command, consumed)) => {
                self.position += consumed;
                Some(Ok(command))
            }
            Err(error) => {
                self.failed = true;
                Some(Err(error))
            }
        }
    }
}

impl std::iter::FusedIterator for CommandReader {}

fn read_header(cursor: &mut Cursor<&[u8]>) -> Result<CommandHeader> {
    let command_byte = read_u8(cursor)?;
    Ok(CommandHeader {
        acknowledge: command_byte & FLAG_ACKNOWLEDGE != 0,
        unsequenced: command_byte & FLAG_UNSEQUENCED != 0,
        channel_id: read_u8(cursor)?,
        reliable_sequence_number: read_u16(cursor)?,
    })
}

fn read_connect_parameters(cursor: &mut Cursor<&[u8]>) -> Result<ConnectParameters> {
    Ok(ConnectParameters {
        outgoing_peer_id: read_u16(cursor)?,
        incoming_session_id: read_u8(cursor)?,
        outgoing_session_id: read_u8(cursor)?,
        mtu: read_u32(cursor)?,
        window_size: read_u32(cursor)?,
        channel_count: read_u32(cursor)?,
        incoming_bandwidth: read_u32(cursor)?,
        outgoing_bandwidth: read_u32(cursor)?,
        packet_throttle_interval: read_u32(cursor)?,
        packet_throttle_acceleration: read_u32(cursor)?,
        packet_throttle_deceleration: read_u32(cursor)?,
        connect_id: read_u32(cursor)?,
    })
}

fn read_fragment(
    cursor: &mut Cursor<&[u8]>,
    buffer: &SharedBytes,
    payload_offset: usize,
) -> Result<FragmentBody> {
    let start_sequence_number = read_u16(cursor)?;
    let length = read_u16(cursor)? as usize;
    Ok(FragmentBody {
        start_sequence_number,
        fragment_count: read_u32(cursor)?,
        fragment_number: read_u32(cursor)?,
        total_length: read_u32(cursor)?,
        fragment_offset: read_u32(cursor)?,
        data: payload(buffer, payload_offset, length)?,
    })
}

fn payload(buffer: &SharedBytes, offset: usize, length: usize) -> Result<SharedBytes> {
    Ok(buffer.slice(offset, length).ok_or(DecodingErrorKind::LengthMismatch)?)
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    Ok(cursor.read_u8().map_err(|_| DecodingErrorKind::Truncated)?)
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    Ok(cursor.read_u16::<BigEndian>().map_err(|_| DecodingErrorKind::Truncated)?)
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    Ok(cursor.read_u32::<BigEndian>().map_err(|_| DecodingErrorKind::Truncated)?)
}
