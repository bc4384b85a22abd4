//! Application packets.
//!
//! A [`Packet`] is an immutable byte buffer plus delivery flags. Cloning a
//! packet shares it: every queued command that still has to (re)transmit the
//! packet holds a clone, and the bytes are released when the last clone goes
//! away. A [`PacketObserver`] watches a packet without keeping it alive.

use std::{
    fmt,
    ops::{BitOr, BitOrAssign},
    sync::{Arc, Weak},
};

use tidewire_core::shared::SharedBytes;

/// 16-bit sequence number type used by the protocol.
pub type SequenceNumber = u16;

/// Delivery flags attached to a packet.
#[derive(Copy, Clone, PartialEq, Eq, Default, Hash)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Unreliable, sequenced delivery.
    pub const NONE: PacketFlags = PacketFlags(0);
    /// Delivered exactly once and in order, retransmitted until acknowledged.
    pub const RELIABLE: PacketFlags = PacketFlags(1 << 0);
    /// Delivered without sequencing; duplicates are still filtered.
    pub const UNSEQUENCED: PacketFlags = PacketFlags(1 << 1);
    /// The payload was handed over without copying.
    pub const NO_ALLOCATE: PacketFlags = PacketFlags(1 << 2);
    /// Oversized unreliable packets are fragmented unreliably instead of being upgraded to reliable.
    pub const UNRELIABLE_FRAGMENT: PacketFlags = PacketFlags(1 << 3);

    /// Returns the raw bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Builds flags from raw bits, discarding unknown ones.
    pub fn from_bits_truncate(bits: u8) -> Self {
        PacketFlags(bits & 0x0F)
    }

    /// Returns true if every flag in `other` is set.
    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if the reliable flag is set.
    pub fn is_reliable(self) -> bool {
        self.contains(Self::RELIABLE)
    }

    /// Returns true if the packet is unsequenced and not reliable.
    pub fn is_unsequenced(self) -> bool {
        !self.is_reliable() && self.contains(Self::UNSEQUENCED)
    }
}

impl BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PacketFlags {
    fn bitor_assign(&mut self, rhs: PacketFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::RELIABLE) {
            names.push("RELIABLE");
        }
        if self.contains(Self::UNSEQUENCED) {
            names.push("UNSEQUENCED");
        }
        if self.contains(Self::NO_ALLOCATE) {
            names.push("NO_ALLOCATE");
        }
        if self.contains(Self::UNRELIABLE_FRAGMENT) {
            names.push("UNRELIABLE_FRAGMENT");
        }
        if names.is_empty() {
            return write!(f, "PacketFlags(NONE)");
        }
        write!(f, "PacketFlags({})", names.join(" | "))
    }
}

#[derive(Debug)]
struct PacketInner {
    data: SharedBytes,
    flags: PacketFlags,
}

/// Immutable, shared application payload.
#[derive(Clone)]
pub struct Packet {
    inner: Arc<PacketInner>,
}

impl Packet {
    /// Creates a packet, copying nothing if `data` is already shared.
    pub fn new(data: impl Into<SharedBytes>, flags: PacketFlags) -> Packet {
        Packet { inner: Arc::new(PacketInner { data: data.into(), flags }) }
    }

    /// Creates a reliable packet.
    pub fn reliable(data: impl Into<SharedBytes>) -> Packet {
        Self::new(data, PacketFlags::RELIABLE)
    }

    /// Creates an unreliable, sequenced packet.
    pub fn unreliable(data: impl Into<SharedBytes>) -> Packet {
        Self::new(data, PacketFlags::NONE)
    }

    /// Creates an unsequenced packet.
    pub fn unsequenced(data: impl Into<SharedBytes>) -> Packet {
        Self::new(data, PacketFlags::UNSEQUENCED)
    }

    /// Wraps caller-owned bytes without copying them.
    pub fn borrowed(data: Arc<[u8]>, flags: PacketFlags) -> Packet {
        Self::new(SharedBytes::from_arc(data), flags | PacketFlags::NO_ALLOCATE)
    }

    /// Returns the payload.
    pub fn payload(&self) -> &[u8] {
        self.inner.data.as_slice()
    }

    /// Returns the payload as a shared view.
    pub fn shared_payload(&self) -> &SharedBytes {
        &self.inner.data
    }

    /// Returns the payload length in bytes.
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// Returns the delivery flags.
    pub fn flags(&self) -> PacketFlags {
        self.inner.flags
    }

    /// Returns the number of live handles to this packet.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Creates an observer that does not extend the packet's lifetime.
    pub fn downgrade(&self) -> PacketObserver {
        PacketObserver { inner: Arc::downgrade(&self.inner) }
    }

    /// Returns true if both handles refer to the same packet.
    pub fn ptr_eq(&self, other: &Packet) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.flags() == other.flags() && self.payload() == other.payload()
    }
}

impl Eq for Packet {}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("flags", &self.flags())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Non-owning handle used for diagnostics.
#[derive(Clone, Debug)]
pub struct PacketObserver {
    inner: Weak<PacketInner>,
}

impl PacketObserver {
    /// Returns true while some queue or the application still holds the packet.
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    /// Returns the number of live handles to the observed packet.
    pub fn ref_count(&self) -> usize {
        self.inner.strong_count()
    }

    /// Recovers a handle if the packet is still alive.
    pub fn upgrade(&self) -> Option<Packet> {
        self.inner.upgrade().map(|inner| Packet { inner })
    }
}
