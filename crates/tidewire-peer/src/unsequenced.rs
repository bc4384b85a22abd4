//! Unsequenced packet duplicate detection using a sliding window.
//!
//! Unsequenced packets carry a 16-bit group number instead of a sequence
//! number. The receiver remembers which groups of the current 1024-group
//! window it has seen in a bitmap:
//! - a group inside the current window is a duplicate if its bit is set;
//! - a group in any other window moves the window there and clears the
//!   bitmap, so a stale group can only be delivered once its old window
//!   has been left behind.
//!
//! Group numbers wrap at 65536; groups numerically below the window base
//! are read as having wrapped.

use tidewire_core::constants::{UNSEQUENCED_WINDOWS, UNSEQUENCED_WINDOW_SIZE};

const WINDOW_WORDS: usize = (UNSEQUENCED_WINDOW_SIZE / 32) as usize;

/// State for tracking unsequenced groups in both directions.
#[derive(Debug, Clone)]
pub struct UnsequencedState {
    /// Base group of the receive window
    incoming_unsequenced_group: u16,
    /// One bit per group of the receive window
    unsequenced_window: [u32; WINDOW_WORDS],
    /// Last group number handed out for sending
    outgoing_unsequenced_group: u16,
}

impl Default for UnsequencedState {
    fn default() -> Self {
        Self::new()
    }
}

impl UnsequencedState {
    /// Creates a new unsequenced state with an empty window.
    pub fn new() -> Self {
        Self {
            incoming_unsequenced_group: 0,
            unsequenced_window: [0; WINDOW_WORDS],
            outgoing_unsequenced_group: 0,
        }
    }

    /// Advances and returns the outgoing group number. The first group sent is 1.
    pub fn next_outgoing_group(&mut self) -> u16 {
        self.outgoing_unsequenced_group = self.outgoing_unsequenced_group.wrapping_add(1);
        self.outgoing_unsequenced_group
    }

    /// Returns the current incoming window base.
    pub fn incoming_group(&self) -> u16 {
        self.incoming_unsequenced_group
    }

    /// Decides whether a received group is new.
    ///
    /// Returns the bitmap index to pass to [`mark_received`](Self::mark_received)
    /// once the packet was accepted, or `None` for duplicates and groups
    /// outside the window. May move the window.
    pub fn admit(&mut self, group: u16) -> Option<usize> {
        let index = u32::from(group) % UNSEQUENCED_WINDOW_SIZE;
        let base = u32::from(self.incoming_unsequenced_group);

        let mut unwrapped = u32::from(group);
        if unwrapped < base {
            unwrapped += 0x10000;
        }
        if unwrapped >= base + UNSEQUENCED_WINDOWS * UNSEQUENCED_WINDOW_SIZE {
            return None;
        }

        let window_start = (u32::from(group) - index) as u16;
        if window_start != self.incoming_unsequenced_group {
            self.incoming_unsequenced_group = window_start;
            self.unsequenced_window = [0; WINDOW_WORDS];
        } else if self.is_marked(index as usize) {
            return None;
        }

        Some(index as usize)
    }

    /// Records the group at `index` as received.
    pub fn mark_received(&mut self, index: usize) {
        self.unsequenced_window[index / 32] |= 1 << (index % 32);
    }

    fn is_marked(&self, index: usize) -> bool {
        self.unsequenced_window[index / 32] & (1 << (index % 32)) != 0
    }

    /// Clears both directions.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receive(state: &mut UnsequencedState, group: u16) -> bool {
        match state.admit(group) {
            Some(index) => {
                state.mark_received(index);
                true
            }
            None => false,
        }
    }

    #[test]
    fn test_outgoing_groups_start_at_one() {
        let mut state = UnsequencedState::new();
        assert_eq!(state.next_outgoing_group(), 1);
        assert_eq!(state.next_outgoing_group(), 2);
    }

    #[test]
    fn test_duplicate_detection() {
        let mut state = UnsequencedState::new();
        assert!(receive(&mut state, 5));
        assert!(!receive(&mut state, 5));
        assert!(receive(&mut state, 3));
    }

    #[test]
    fn test_unmarked_admission_is_not_remembered() {
        let mut state = UnsequencedState::new();
        assert!(state.admit(5).is_some());
        assert!(state.admit(5).is_some());
    }

    #[test]
    fn test_later_window_resets_bitmap() {
        let mut state = UnsequencedState::new();
        assert!(receive(&mut state, 10));
        assert!(receive(&mut state, 1024 + 10));
        assert_eq!(state.incoming_group(), 1024);
        assert!(receive(&mut state, 1024 + 20));
        assert!(!receive(&mut state, 1024 + 10));
    }

    #[test]
    fn test_wraparound() {
        let mut state = UnsequencedState::new();
        assert!(receive(&mut state, 65535));
        assert_eq!(state.incoming_group(), 64512);
        assert!(receive(&mut state, 2));
        assert_eq!(state.incoming_group(), 0);
        assert!(!receive(&mut state, 2));
    }
}
