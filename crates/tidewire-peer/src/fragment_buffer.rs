//! Fragment reassembly.
//!
//! A packet too large for one datagram travels as a fragment group. Every
//! fragment carries the group's start sequence number, the fragment count,
//! its own index, the total length and its byte offset, so the receiver can
//! place it without waiting for its predecessors.
//!
//! # Fragment Lifecycle
//!
//! 1. The first fragment of an unseen group allocates a [`FragmentBuffer`]
//!    sized from the total length, after [`fragment_is_valid`] bounded it by
//!    the configured maximum packet size.
//! 2. Each fragment copies its payload to its offset and sets one bit in a
//!    presence bitmap. Duplicates find the bit already set and are ignored.
//! 3. The group is complete exactly when every bit is set; the buffer is
//!    then turned into a packet and dispatched once.
//!
//! Partial groups are owned by the channel that queued them and disappear
//! with it on reset.

use tidewire_core::constants::MAXIMUM_FRAGMENT_COUNT;
use tidewire_protocol::command::FragmentBody;

/// Checks the header fields of a fragment against each other and against
/// the largest packet this peer accepts.
pub fn fragment_is_valid(fragment: &FragmentBody, max_packet_size: usize) -> bool {
    let total_length = fragment.total_length as usize;
    let offset = fragment.fragment_offset as usize;
    let length = fragment.data.len();

    fragment.fragment_count > 0
        && fragment.fragment_count <= MAXIMUM_FRAGMENT_COUNT
        && fragment.fragment_number < fragment.fragment_count
        && fragment.fragment_count as usize <= total_length
        && total_length <= max_packet_size
        && offset < total_length
        && length <= total_length - offset
}

/// Reassembly state of one fragment group.
#[derive(Debug, Clone)]
pub struct FragmentBuffer {
    data: Vec<u8>,
    received: Vec<u32>,
    fragment_count: u32,
    fragments_remaining: u32,
}

impl FragmentBuffer {
    /// Allocates a zeroed buffer for a group of `fragment_count` fragments.
    pub fn new(total_length: usize, fragment_count: u32) -> Self {
        let words = (fragment_count as usize).div_ceil(32);
        Self {
            data: vec![0; total_length],
            received: vec![0; words],
            fragment_count,
            fragments_remaining: fragment_count,
        }
    }

    /// Number of fragments in the group.
    pub fn fragment_count(&self) -> u32 {
        self.fragment_count
    }

    /// Length of the reassembled packet.
    pub fn total_length(&self) -> usize {
        self.data.len()
    }

    /// Bytes held by the presence bitmap.
    pub fn bitmap_size(&self) -> usize {
        self.received.len() * std::mem::size_of::<u32>()
    }

    /// Fragments still missing.
    pub fn fragments_remaining(&self) -> u32 {
        self.fragments_remaining
    }

    /// True once every fragment has been copied in.
    pub fn is_complete(&self) -> bool {
        self.fragments_remaining == 0
    }

    /// True if `fragment_number` has already been received.
    pub fn contains(&self, fragment_number: u32) -> bool {
        let word = (fragment_number / 32) as usize;
        self.received.get(word).is_some_and(|bits| bits & (1 << (fragment_number % 32)) != 0)
    }

    /// Copies one fragment into place.
    ///
    /// Returns false, changing nothing, if the fragment was already received
    /// or lies outside the group. Payload bytes past the end of the buffer
    /// are cut off.
    pub fn insert(&mut self, fragment_number: u32, offset: usize, bytes: &[u8]) -> bool {
        if fragment_number >= self.fragment_count || self.contains(fragment_number) {
            return false;
        }
        if offset >= self.data.len() && !bytes.is_empty() {
            return false;
        }

        self.received[(fragment_number / 32) as usize] |= 1 << (fragment_number % 32);
        self.fragments_remaining -= 1;

        let length = bytes.len().min(self.data.len().saturating_sub(offset));
        self.data[offset..offset + length].copy_from_slice(&bytes[..length]);
        true
    }

    /// Consumes the buffer and returns the reassembled bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}
