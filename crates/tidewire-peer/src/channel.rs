//! Per-channel sequencing and delivery.
//!
//! A `Channel` owns four counters and the commands held back for ordering:
//!
//! - **Outgoing**: each reliable command takes the next reliable sequence
//!   number and restarts the unreliable counter; unreliable commands take
//!   the next unreliable number under the current reliable one. Reliable
//!   windows in flight are counted so a sender never reuses a window the
//!   receiver may still be holding commands for.
//! - **Incoming reliable**: commands are kept sorted by sequence number
//!   (read relative to the last delivered one, so wraparound sorts
//!   correctly) and delivered when they are exactly next.
//! - **Incoming unreliable**: commands are keyed by the reliable number they
//!   follow and their own unreliable number. They are delivered as soon as
//!   their reliable predecessor was delivered; gaps never block them.

use std::collections::VecDeque;

use tidewire_core::constants::{FREE_RELIABLE_WINDOWS, RELIABLE_WINDOWS, RELIABLE_WINDOW_SIZE};
use tidewire_protocol::sequence::{reliable_window, reliable_window_accepts, unwrap_after};

use crate::command_queue::{DispatchedPacket, IncomingCommand};

/// Position of a sequence number in one of the incoming lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// A command with the same sequence numbers is held at this index.
    Occupied(usize),
    /// No such command; inserting at this index keeps the list sorted.
    Vacant(usize),
}

/// Sequencing state of one channel.
#[derive(Debug, Clone, Default)]
pub struct Channel {
    outgoing_reliable_sequence_number: u16,
    outgoing_unreliable_sequence_number: u16,
    /// One bit per reliable window with commands in flight
    used_reliable_windows: u16,
    /// Commands in flight per reliable window
    reliable_windows: [u16; RELIABLE_WINDOWS as usize],
    /// Last reliable sequence number delivered
    incoming_reliable_sequence_number: u16,
    /// Last unreliable sequence number delivered under the current reliable one
    incoming_unreliable_sequence_number: u16,
    incoming_reliable_commands: VecDeque<IncomingCommand>,
    incoming_unreliable_commands: VecDeque<IncomingCommand>,
}

impl Channel {
    /// Creates a channel with every counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last reliable sequence number handed out.
    pub fn outgoing_reliable_sequence_number(&self) -> u16 {
        self.outgoing_reliable_sequence_number
    }

    /// Last unreliable sequence number handed out.
    pub fn outgoing_unreliable_sequence_number(&self) -> u16 {
        self.outgoing_unreliable_sequence_number
    }

    /// Last reliable sequence number delivered.
    pub fn incoming_reliable_sequence_number(&self) -> u16 {
        self.incoming_reliable_sequence_number
    }

    /// Last unreliable sequence number delivered.
    pub fn incoming_unreliable_sequence_number(&self) -> u16 {
        self.incoming_unreliable_sequence_number
    }

    /// Stamps a reliable command. Restarts the unreliable counter.
    pub fn next_reliable_sequence_number(&mut self) -> u16 {
        self.outgoing_reliable_sequence_number = self.outgoing_reliable_sequence_number.wrapping_add(1);
        self.outgoing_unreliable_sequence_number = 0;
        self.outgoing_reliable_sequence_number
    }

    /// Stamps an unreliable command.
    pub fn next_unreliable_sequence_number(&mut self) -> u16 {
        self.outgoing_unreliable_sequence_number = self.outgoing_unreliable_sequence_number.wrapping_add(1);
        self.outgoing_unreliable_sequence_number
    }

    /// True if a command opening the window that starts at `sequence` must
    /// wait, because the window before it is full or windows the receiver
    /// could confuse with it still have commands in flight.
    pub fn reliable_window_blocked(&self, sequence: u16) -> bool {
        if sequence % RELIABLE_WINDOW_SIZE != 0 {
            return false;
        }
        let window = reliable_window(sequence);
        let previous = (window + RELIABLE_WINDOWS - 1) % RELIABLE_WINDOWS;
        let guard = ((1u32 << (FREE_RELIABLE_WINDOWS + 2)) - 1) as u16;

        self.reliable_windows[previous as usize] >= RELIABLE_WINDOW_SIZE
            || self.used_reliable_windows & guard.rotate_left(u32::from(window)) != 0
    }

    /// Counts a first transmission in its reliable window.
    pub fn mark_reliable_window_used(&mut self, sequence: u16) {
        let window = reliable_window(sequence);
        self.used_reliable_windows |= 1 << window;
        self.reliable_windows[window as usize] += 1;
    }

    /// Removes an acknowledged command from its reliable window.
    pub fn release_reliable_window(&mut self, sequence: u16) {
        let window = reliable_window(sequence);
        let count = &mut self.reliable_windows[window as usize];
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.used_reliable_windows &= !(1 << window);
        }
    }

    /// True if `sequence` falls into a reliable window this channel buffers.
    pub fn accepts_reliable_window(&self, sequence: u16) -> bool {
        reliable_window_accepts(self.incoming_reliable_sequence_number, sequence)
    }

    fn reliable_key(&self, sequence: u16) -> u32 {
        unwrap_after(self.incoming_reliable_sequence_number, sequence)
    }

    /// Locates a reliable command by sequence number.
    pub fn find_reliable(&self, sequence: u16) -> Slot {
        let key = self.reliable_key(sequence);
        match self
            .incoming_reliable_commands
            .binary_search_by_key(&key, |command| self.reliable_key(command.reliable_sequence_number))
        {
            Ok(index) => Slot::Occupied(index),
            Err(index) => Slot::Vacant(index),
        }
    }

    /// Locates an unreliable command by its reliable and unreliable numbers.
    pub fn find_unreliable(&self, reliable_sequence_number: u16, unreliable_sequence_number: u16) -> Slot {
        let key = (self.reliable_key(reliable_sequence_number), unreliable_sequence_number);
        match self.incoming_unreliable_commands.binary_search_by_key(&key, |command| {
            (self.reliable_key(command.reliable_sequence_number), command.unreliable_sequence_number)
        }) {
            Ok(index) => Slot::Occupied(index),
            Err(index) => Slot::Vacant(index),
        }
    }

    /// Inserts a reliable command at a position returned by [`find_reliable`](Self::find_reliable).
    pub fn insert_reliable(&mut self, index: usize, command: IncomingCommand) {
        self.incoming_reliable_commands.insert(index, command);
    }

    /// Inserts an unreliable command at a position returned by [`find_unreliable`](Self::find_unreliable).
    pub fn insert_unreliable(&mut self, index: usize, command: IncomingCommand) {
        self.incoming_unreliable_commands.insert(index, command);
    }

    /// Held reliable command at `index`.
    pub fn reliable_mut(&mut self, index: usize) -> Option<&mut IncomingCommand> {
        self.incoming_reliable_commands.get_mut(index)
    }

    /// Held unreliable command at `index`.
    pub fn unreliable_mut(&mut self, index: usize) -> Option<&mut IncomingCommand> {
        self.incoming_unreliable_commands.get_mut(index)
    }

    /// Number of commands held back for ordering.
    pub fn held_commands(&self) -> usize {
        self.incoming_reliable_commands.len() + self.incoming_unreliable_commands.len()
    }

    /// Delivers every complete reliable command that is exactly next, then
    /// the unreliable commands that were waiting for them.
    ///
    /// Returns the bytes of waiting data released by dropped commands.
    pub fn dispatch_reliable(&mut self, channel_id: u8, dispatched: &mut VecDeque<DispatchedPacket>) -> usize {
        let mut delivered = false;
        while let Some(front) = self.incoming_reliable_commands.front() {
            let next = self.incoming_reliable_sequence_number.wrapping_add(1);
            if !front.is_complete() || front.reliable_sequence_number != next {
                break;
            }
            let Some(command) = self.incoming_reliable_commands.pop_front() else { break };

            self.incoming_reliable_sequence_number = command.reliable_sequence_number;
            if command.fragment_count > 0 {
                // Every fragment of the group consumed one sequence number
                self.incoming_reliable_sequence_number = self
                    .incoming_reliable_sequence_number
                    .wrapping_add((command.fragment_count - 1) as u16);
            }
            if let Some(packet) = command.into_packet() {
                dispatched.push_back(DispatchedPacket { channel_id, packet });
            }
            delivered = true;
        }

        if !delivered {
            return 0;
        }
        self.incoming_unreliable_sequence_number = 0;
        self.dispatch_unreliable(channel_id, dispatched)
    }

    /// Delivers complete unreliable commands that follow the last delivered
    /// reliable command.
    ///
    /// Commands following an older reliable command are dropped, as are
    /// incomplete fragment groups overtaken by a newer delivery. Commands
    /// following a reliable command not delivered yet stay queued.
    /// Returns the bytes of waiting data released by dropped commands.
    pub fn dispatch_unreliable(&mut self, channel_id: u8, dispatched: &mut VecDeque<DispatchedPacket>) -> usize {
        let mut released = 0;
        let mut pending: Vec<IncomingCommand> = Vec::new();
        let mut kept = VecDeque::new();

        while let Some(command) = self.incoming_unreliable_commands.pop_front() {
            if command.reliable_sequence_number == self.incoming_reliable_sequence_number {
                if command.is_complete() {
                    self.incoming_unreliable_sequence_number = command.unreliable_sequence_number;
                    released += pending.drain(..).map(|stale| stale.waiting_size()).sum::<usize>();
                    if let Some(packet) = command.into_packet() {
                        dispatched.push_back(DispatchedPacket { channel_id, packet });
                    }
                } else {
                    pending.push(command);
                }
            } else if self.accepts_reliable_window(command.reliable_sequence_number) {
                kept.push_back(command);
                break;
            } else {
                released += command.waiting_size();
            }
        }

        let rest = std::mem::take(&mut self.incoming_unreliable_commands);
        self.incoming_unreliable_commands = pending.into_iter().collect();
        self.incoming_unreliable_commands.extend(kept);
        self.incoming_unreliable_commands.extend(rest);
        released
    }

    /// Drops every held command and returns the waiting data they held.
    pub fn clear_incoming(&mut self) -> usize {
        self.incoming_reliable_commands
            .drain(..)
            .chain(self.incoming_unreliable_commands.drain(..))
            .map(|command| command.waiting_size())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use tidewire_protocol::{command::number, packet::Packet};

    use super::*;

    fn reliable(sequence: u16, byte: u8) -> IncomingCommand {
        IncomingCommand::complete(number::SEND_RELIABLE, sequence, 0, Packet::reliable(vec![byte]))
    }

    fn unreliable(reliable: u16, sequence: u16, byte: u8) -> IncomingCommand {
        IncomingCommand::complete(number::SEND_UNRELIABLE, reliable, sequence, Packet::unreliable(vec![byte]))
    }

    fn queue_reliable(channel: &mut Channel, command: IncomingCommand) -> bool {
        match channel.find_reliable(command.reliable_sequence_number) {
            Slot::Vacant(index) => {
                channel.insert_reliable(index, command);
                true
            }
            Slot::Occupied(_) => false,
        }
    }

    fn queue_unreliable(channel: &mut Channel, command: IncomingCommand) {
        if let Slot::Vacant(index) =
            channel.find_unreliable(command.reliable_sequence_number, command.unreliable_sequence_number)
        {
            channel.insert_unreliable(index, command);
        }
    }

    fn bytes(dispatched: &VecDeque<DispatchedPacket>) -> Vec<u8> {
        dispatched.iter().map(|d| d.packet.payload()[0]).collect()
    }

    #[test]
    fn test_outgoing_counters() {
        let mut channel = Channel::new();
        assert_eq!(channel.next_unreliable_sequence_number(), 1);
        assert_eq!(channel.next_unreliable_sequence_number(), 2);
        assert_eq!(channel.next_reliable_sequence_number(), 1);
        assert_eq!(channel.outgoing_unreliable_sequence_number(), 0);
        assert_eq!(channel.next_unreliable_sequence_number(), 1);
    }

    #[test]
    fn test_reliable_delivery_waits_for_gap() {
        let mut channel = Channel::new();
        let mut dispatched = VecDeque::new();

        assert!(queue_reliable(&mut channel, reliable(3, 3)));
        assert!(queue_reliable(&mut channel, reliable(2, 2)));
        channel.dispatch_reliable(0, &mut dispatched);
        assert!(dispatched.is_empty());

        assert!(queue_reliable(&mut channel, reliable(1, 1)));
        assert!(!queue_reliable(&mut channel, reliable(2, 2)));
        channel.dispatch_reliable(0, &mut dispatched);
        assert_eq!(bytes(&dispatched), vec![1, 2, 3]);
        assert_eq!(channel.incoming_reliable_sequence_number(), 3);
        assert_eq!(channel.held_commands(), 0);
    }

    #[test]
    fn test_reliable_ordering_across_wrap() {
        let mut channel = Channel::new();
        let mut dispatched = VecDeque::new();
        channel.incoming_reliable_sequence_number = 65533;

        for sequence in [1u16, 65535, 0, 65534] {
            assert!(queue_reliable(&mut channel, reliable(sequence, sequence as u8)));
        }
        channel.dispatch_reliable(0, &mut dispatched);
        assert_eq!(bytes(&dispatched), vec![254, 255, 0, 1]);
        assert_eq!(channel.incoming_reliable_sequence_number(), 1);
    }

    #[test]
    fn test_fragment_group_advances_by_count() {
        let mut channel = Channel::new();
        let mut dispatched = VecDeque::new();
        let mut group = IncomingCommand::fragmented(number::SEND_FRAGMENT, 1, 0, 2, 2);
        if let crate::command_queue::IncomingPayload::Reassembling(buffer) = &mut group.payload {
            buffer.insert(0, 0, &[7]);
            buffer.insert(1, 1, &[8]);
        }
        group.finish_reassembly();
        assert!(queue_reliable(&mut channel, group));
        assert!(queue_reliable(&mut channel, reliable(3, 9)));

        channel.dispatch_reliable(0, &mut dispatched);
        assert_eq!(dispatched.len(), 2);
        assert_eq!(channel.incoming_reliable_sequence_number(), 3);
    }

    #[test]
    fn test_unreliable_gaps_do_not_block() {
        let mut channel = Channel::new();
        let mut dispatched = VecDeque::new();
        for sequence in [1u16, 3, 5] {
            queue_unreliable(&mut channel, unreliable(0, sequence, sequence as u8));
            channel.dispatch_unreliable(0, &mut dispatched);
        }
        assert_eq!(bytes(&dispatched), vec![1, 3, 5]);
        assert_eq!(channel.incoming_unreliable_sequence_number(), 5);
    }

    #[test]
    fn test_unreliable_waits_for_reliable_predecessor() {
        let mut channel = Channel::new();
        let mut dispatched = VecDeque::new();

        queue_unreliable(&mut channel, unreliable(1, 1, 10));
        channel.dispatch_unreliable(0, &mut dispatched);
        assert!(dispatched.is_empty());
        assert_eq!(channel.held_commands(), 1);

        assert!(queue_reliable(&mut channel, reliable(1, 1)));
        channel.dispatch_reliable(0, &mut dispatched);
        assert_eq!(bytes(&dispatched), vec![1, 10]);
    }

    #[test]
    fn test_incomplete_unreliable_group_dropped_when_overtaken() {
        let mut channel = Channel::new();
        let mut dispatched = VecDeque::new();

        queue_unreliable(
            &mut channel,
            IncomingCommand::fragmented(number::SEND_UNRELIABLE_FRAGMENT, 0, 1, 100, 4),
        );
        assert_eq!(channel.dispatch_unreliable(0, &mut dispatched), 0);
        assert_eq!(channel.held_commands(), 1);

        queue_unreliable(&mut channel, unreliable(0, 2, 2));
        assert_eq!(channel.dispatch_unreliable(0, &mut dispatched), 100);
        assert_eq!(bytes(&dispatched), vec![2]);
        assert_eq!(channel.held_commands(), 0);
    }

    #[test]
    fn test_window_accounting() {
        let mut channel = Channel::new();
        channel.mark_reliable_window_used(5);
        channel.mark_reliable_window_used(6);
        // Window 0 is in flight, so window 0x1000 * 15 would alias with it
        assert!(!channel.reliable_window_blocked(0x1000));
        assert!(channel.reliable_window_blocked(0xF000));
        assert!(!channel.reliable_window_blocked(0xF001));

        channel.release_reliable_window(5);
        channel.release_reliable_window(6);
        assert!(!channel.reliable_window_blocked(0xF000));
    }
}
