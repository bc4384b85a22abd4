//! Datagram header.
//!
//! Every datagram starts with a 16-bit word holding the destination peer id
//! in its low 12 bits, the session id in bits 12-13 and flags in the top
//! bits. When the sent-time flag is set a 16-bit timestamp follows; the
//! receiver echoes it in acknowledgements to sample round-trip time.

use std::io;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use tidewire_core::{
    constants::MAXIMUM_PEER_ID,
    error::{DecodingErrorKind, ErrorKind, Result},
};

/// Header flag: a 16-bit sent time follows the peer id.
pub const HEADER_FLAG_SENT_TIME: u16 = 1 << 15;
/// Header flag: the commands are compressed.
pub const HEADER_FLAG_COMPRESSED: u16 = 1 << 14;
/// Mask of the session id bits.
pub const HEADER_SESSION_MASK: u16 = 3 << 12;
/// Shift of the session id bits.
pub const HEADER_SESSION_SHIFT: u16 = 12;
/// Largest header on the wire.
pub const MAXIMUM_HEADER_SIZE: usize = 4;

/// Parsed datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    /// Peer id the datagram is addressed to (0x0FFF before one is assigned).
    pub peer_id: u16,
    /// Two-bit session id.
    pub session_id: u8,
    /// Low 16 bits of the sender's clock, present on datagrams carrying
    /// commands that need acknowledgement.
    pub sent_time: Option<u16>,
}

impl DatagramHeader {
    /// Number of bytes this header occupies.
    pub fn size(&self) -> usize {
        if self.sent_time.is_some() {
            4
        } else {
            2
        }
    }

    /// Appends the header to `buffer`.
    pub fn encode_into(&self, buffer: &mut Vec<u8>) -> io::Result<()> {
        let mut word = (self.peer_id & MAXIMUM_PEER_ID)
            | ((u16::from(self.session_id) << HEADER_SESSION_SHIFT) & HEADER_SESSION_MASK);
        if self.sent_time.is_some() {
            word |= HEADER_FLAG_SENT_TIME;
        }
        buffer.write_u16::<BigEndian>(word)?;
        if let Some(sent_time) = self.sent_time {
            buffer.write_u16::<BigEndian>(sent_time)?;
        }
        Ok(())
    }

    /// Parses a header from the start of `bytes`.
    ///
    /// Returns the header and its size. Compressed datagrams are rejected.
    pub fn decode(bytes: &[u8]) -> Result<(DatagramHeader, usize)> {
        if bytes.len() < 2 {
            return Err(ErrorKind::CouldNotReadHeader(format!(
                "datagram of {} bytes is shorter than a header",
                bytes.len()
            )));
        }
        let word = BigEndian::read_u16(bytes);
        if word & HEADER_FLAG_COMPRESSED != 0 {
            return Err(DecodingErrorKind::InvalidHeader.into());
        }
        let session_id = ((word & HEADER_SESSION_MASK) >> HEADER_SESSION_SHIFT) as u8;
        let peer_id = word & MAXIMUM_PEER_ID;

        if word & HEADER_FLAG_SENT_TIME == 0 {
            return Ok((DatagramHeader { peer_id, session_id, sent_time: None }, 2));
        }
        if bytes.len() < 4 {
            return Err(ErrorKind::CouldNotReadHeader("missing sent time".into()));
        }
        let sent_time = BigEndian::read_u16(&bytes[2..4]);
        Ok((DatagramHeader { peer_id, session_id, sent_time: Some(sent_time) }, 4))
    }
}
