//! Packet and Message Id Handling
//!
//! Packet ids are tracked as 64-bit counters inside the process and travel as
//! their low 32 bits. A received 32-bit id is widened to the 64-bit value
//! closest to a reference id, which gives serial-number semantics across the
//! 32-bit wrap. Ids whose low 32 bits are zero are never allocated, because a
//! zero on the wire means "empty ack field".
//!
//! Message ids are plain 32-bit serial numbers compared with wraparound
//! arithmetic, also skipping zero (a response addressed to message 0 is
//! unsolicited).

use std::fmt;

const WIRE_SPAN: u64 = 1 << 32;
const HALF_SPAN: u64 = 1 << 31;

/// Identifier of one transmitted datagram
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct PacketId(u64);

impl PacketId {
    /// Id of the first datagram a connection sends
    pub const FIRST: PacketId = PacketId(1);

    /// "No packet" marker; never allocated
    pub const NONE: PacketId = PacketId(0);

    /// Create a packet id from its full 64-bit value
    #[inline]
    pub const fn new(value: u64) -> Self {
        PacketId(value)
    }

    /// Get the full 64-bit value
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The value carried on the wire
    #[inline]
    pub fn wire(self) -> u32 {
        self.0 as u32
    }

    /// Get the next allocatable id
    pub fn next(self) -> Self {
        let mut next = self.0.wrapping_add(1);
        if next as u32 == 0 {
            next = next.wrapping_add(1);
        }
        PacketId(next)
    }

    /// Widen a 32-bit wire id to the 64-bit id nearest to `reference`
    pub fn from_wire(raw: u32, reference: PacketId) -> Self {
        let epoch = reference.0 & !(WIRE_SPAN - 1);
        let candidate = epoch | u64::from(raw);

        let widened = if candidate > reference.0 && candidate - reference.0 > HALF_SPAN {
            candidate.checked_sub(WIRE_SPAN).unwrap_or(candidate)
        } else if candidate < reference.0 && reference.0 - candidate > HALF_SPAN {
            candidate.checked_add(WIRE_SPAN).unwrap_or(candidate)
        } else {
            candidate
        };

        PacketId(widened)
    }

    /// Offset of this id from `base`, if it is not before it
    #[inline]
    pub fn offset_from(self, base: PacketId) -> Option<u64> {
        self.0.checked_sub(base.0)
    }

    /// Id `offset` positions after this one
    #[inline]
    pub fn advance(self, offset: u64) -> Self {
        PacketId(self.0.saturating_add(offset))
    }
}

impl fmt::Debug for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketId({})", self.0)
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one logical request or response
///
/// Stable across retransmissions of the same item under different packet ids.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct MessageId(u32);

impl MessageId {
    /// "Not a response to anything"
    pub const NONE: MessageId = MessageId(0);

    #[inline]
    pub const fn new(value: u32) -> Self {
        MessageId(value)
    }

    #[inline]
    pub fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Get the next id, skipping zero on wrap
    pub fn next(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => MessageId(1),
            n => MessageId(n),
        }
    }

    /// Signed distance from this id to `other`, accounting for wraparound
    ///
    /// Positive values mean `other` is ahead of `self`.
    #[inline]
    pub fn distance_to(self, other: MessageId) -> i32 {
        other.0.wrapping_sub(self.0) as i32
    }

    /// True if this id is more than `window` positions behind `other`
    #[inline]
    pub fn is_older_than(self, other: MessageId, window: u32) -> bool {
        let distance = self.distance_to(other);
        distance > 0 && distance as u32 > window
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_id_skips_zero_wire_value() {
        let id = PacketId::new(u64::from(u32::MAX));
        let next = id.next();
        assert_eq!(next.as_u64(), WIRE_SPAN + 1);
        assert_eq!(next.wire(), 1);
    }

    #[test]
    fn test_packet_id_from_wire_same_epoch() {
        let reference = PacketId::new(1000);
        assert_eq!(PacketId::from_wire(990, reference), PacketId::new(990));
        assert_eq!(PacketId::from_wire(1010, reference), PacketId::new(1010));
    }

    #[test]
    fn test_packet_id_from_wire_across_wrap() {
        // Reference just past the wrap, remote still acking the old epoch
        let reference = PacketId::new(WIRE_SPAN + 5);
        let widened = PacketId::from_wire(u32::MAX - 2, reference);
        assert_eq!(widened.as_u64(), WIRE_SPAN - 3);

        // Reference just before the wrap, remote already in the new epoch
        let reference = PacketId::new(WIRE_SPAN - 3);
        let widened = PacketId::from_wire(4, reference);
        assert_eq!(widened.as_u64(), WIRE_SPAN + 4);
    }

    #[test]
    fn test_packet_id_from_wire_low_reference() {
        // Nothing to borrow from below epoch 0
        let reference = PacketId::new(3);
        let widened = PacketId::from_wire(u32::MAX, reference);
        assert_eq!(widened.as_u64(), u64::from(u32::MAX));
    }

    #[test]
    fn test_message_id_wraps_past_zero() {
        let id = MessageId::new(u32::MAX);
        assert_eq!(id.next(), MessageId::new(1));
    }

    #[test]
    fn test_message_id_distance() {
        let a = MessageId::new(u32::MAX - 1);
        let b = MessageId::new(3);
        assert_eq!(a.distance_to(b), 5);
        assert_eq!(b.distance_to(a), -5);
        assert!(a.is_older_than(b, 4));
        assert!(!a.is_older_than(b, 5));
        assert!(!b.is_older_than(a, 1));
    }
}
