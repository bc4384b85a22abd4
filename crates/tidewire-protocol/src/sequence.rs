//! 16-bit sequence number arithmetic.
//!
//! Sequence numbers wrap from 65535 to 0. Comparisons treat the number
//! space as a circle: `a` is newer than `b` when it lies less than half the
//! space ahead. Reliable sequence numbers are also grouped into 16 windows
//! of 4096 numbers; a receiver only accepts commands that fall into the
//! current window or the next few.

use tidewire_core::constants::{FREE_RELIABLE_WINDOWS, RELIABLE_WINDOWS, RELIABLE_WINDOW_SIZE};

use crate::packet::SequenceNumber;

/// Compares sequence numbers with wrapping arithmetic.
pub fn sequence_greater_than(s1: SequenceNumber, s2: SequenceNumber) -> bool {
    ((s1 > s2) && (s1 - s2 <= 32768)) || ((s1 < s2) && (s2 - s1 > 32768))
}

/// Index of the reliable window containing `sequence`.
pub fn reliable_window(sequence: SequenceNumber) -> u16 {
    sequence / RELIABLE_WINDOW_SIZE
}

/// Lifts `sequence` above `base` into a 17-bit space so that every number
/// received after `base` wrapped compares greater than it.
pub fn unwrap_after(base: SequenceNumber, sequence: SequenceNumber) -> u32 {
    if sequence < base {
        u32::from(sequence) + 0x10000
    } else {
        u32::from(sequence)
    }
}

/// Returns true when a reliable `sequence` lies in a window the receiver
/// will buffer, given the last sequence number it delivered.
///
/// Numbers behind the current window, or more than the free windows ahead
/// of it, are stale or forged and must be dropped.
pub fn reliable_window_accepts(last_delivered: SequenceNumber, sequence: SequenceNumber) -> bool {
    let mut window = u32::from(reliable_window(sequence));
    let current = u32::from(reliable_window(last_delivered));
    if sequence < last_delivered {
        window += u32::from(RELIABLE_WINDOWS);
    }
    window >= current && window < current + u32::from(FREE_RELIABLE_WINDOWS) - 1
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_greater_than_across_wrap() {
        assert!(sequence_greater_than(1, 0));
        assert!(sequence_greater_than(0, 65535));
        assert!(sequence_greater_than(5, 65530));
        assert!(!sequence_greater_than(65535, 0));
        assert!(!sequence_greater_than(65530, 5));
        assert!(!sequence_greater_than(7, 7));
    }

    #[test]
    fn test_unwrap_after() {
        assert_eq!(unwrap_after(10, 12), 12);
        assert_eq!(unwrap_after(65530, 3), 0x10003);
        assert!(unwrap_after(65530, 3) > unwrap_after(65530, 65535));
    }

    #[test]
    fn test_reliable_window_accepts() {
        assert!(reliable_window_accepts(0, 1));
        assert!(reliable_window_accepts(0, 0x1000 * 6));
        assert!(!reliable_window_accepts(0, 0x1000 * 7));
        // Wrapped numbers belong to the windows after the last one
        assert!(reliable_window_accepts(0xF800, 0x0010));
        // Old numbers in an earlier window are stale
        assert!(!reliable_window_accepts(0x3000, 0x2FFF));
    }

    proptest! {
        #[test]
        fn prop_successor_is_greater(s in any::<u16>(), step in 1u16..32768) {
            let next = s.wrapping_add(step);
            prop_assert!(sequence_greater_than(next, s));
            prop_assert!(!sequence_greater_than(s, next));
        }

        #[test]
        fn prop_comparison_is_antisymmetric(a in any::<u16>(), b in any::<u16>()) {
            prop_assume!(a != b && a.wrapping_sub(b) != 32768);
            prop_assert_ne!(sequence_greater_than(a, b), sequence_greater_than(b, a));
        }

        #[test]
        fn prop_next_sequence_always_accepted(last in any::<u16>()) {
            prop_assert!(reliable_window_accepts(last, last.wrapping_add(1)));
        }
    }
}
