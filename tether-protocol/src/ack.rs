//! Ack Field
//!
//! Compact bitfield saying which remote packet ids have been received. Bit
//! `i % 8` of byte `i / 8` stands for packet `first + i`. A field whose first
//! id is zero is empty and carries no further bytes on the wire.

use crate::packet::{read_u32, read_u8, PacketError};
use crate::sequence::PacketId;
use bytes::BufMut;
use std::collections::BTreeMap;

/// Number of packet ids one ack field covers by default
pub const DEFAULT_ACK_COUNT: usize = 32;

/// Largest count expressible with the one-byte length prefix
pub const MAX_ACK_COUNT: usize = u8::MAX as usize * 8;

/// Receive state of one remote packet id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReceivedState {
    /// Known gap; never acked
    NotReceived,
    /// Received, not yet reported back
    Received,
    /// Reported in an ack field whose carrying packet is not yet confirmed
    AckSent,
    /// The remote knows we have it; the entry is about to be pruned
    AckConfirmed,
}

impl ReceivedState {
    /// True for every state an ack field reports
    #[inline]
    pub fn is_received(self) -> bool {
        self != ReceivedState::NotReceived
    }
}

/// Remote packet id → receive state, ordered by id
pub type ReceivedPackets = BTreeMap<PacketId, ReceivedState>;

/// Acknowledgement bitfield
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AckField {
    first: u32,
    bits: Vec<u8>,
}

impl AckField {
    /// A field acknowledging nothing
    pub fn empty() -> Self {
        AckField::default()
    }

    /// Build the smallest field covering every received id in
    /// `[base, base + max_count)`
    ///
    /// If no received id falls in that window the result is empty.
    pub fn new(base: PacketId, max_count: usize, received: &ReceivedPackets) -> Self {
        let max_count = max_count.min(MAX_ACK_COUNT) as u64;
        if base.wire() == 0 || max_count == 0 {
            return AckField::empty();
        }

        let mut bits: Vec<u8> = Vec::new();

        for (&id, &state) in received.range(base..) {
            if !state.is_received() {
                continue;
            }

            let index = match id.offset_from(base) {
                Some(index) if index < max_count => index as usize,
                _ => break,
            };

            let byte = index / 8;
            if bits.len() <= byte {
                bits.resize(byte + 1, 0);
            }
            bits[byte] |= 1 << (index % 8);
        }

        if bits.is_empty() {
            return AckField::empty();
        }

        AckField {
            first: base.wire(),
            bits,
        }
    }

    /// Assemble a field from raw parts
    pub fn from_parts(first: u32, bits: Vec<u8>) -> Self {
        if first == 0 {
            return AckField::empty();
        }
        AckField { first, bits }
    }

    /// First packet id covered, 0 when empty
    #[inline]
    pub fn first_packet_id(&self) -> u32 {
        self.first
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first == 0
    }

    /// Raw bit bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Is packet `first + index` acknowledged; false when out of range
    pub fn is_ack_set(&self, index: usize) -> bool {
        match self.bits.get(index / 8) {
            Some(byte) => byte & (1 << (index % 8)) != 0,
            None => false,
        }
    }

    /// Offsets (from the first id) of every set bit
    pub fn acked_offsets(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.bits.len() * 8).filter(move |&index| self.is_ack_set(index))
    }

    /// Wire ids of every acknowledged packet
    pub fn acked_wire_ids(&self) -> impl Iterator<Item = u32> + '_ {
        let first = self.first;
        self.acked_offsets()
            .map(move |offset| first.wrapping_add(offset as u32))
            .filter(|&id| id != 0)
    }

    /// Size of the encoded field in bytes
    pub fn encoded_len(&self) -> usize {
        if self.is_empty() {
            4
        } else {
            4 + 1 + self.bits.len()
        }
    }

    /// Write the field
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.first);
        if self.is_empty() {
            return;
        }

        debug_assert!(self.bits.len() <= u8::MAX as usize);
        buf.put_u8(self.bits.len() as u8);
        buf.put_slice(&self.bits);
    }

    /// Read a field, advancing `buf`
    pub fn decode(buf: &mut &[u8]) -> Result<Self, PacketError> {
        let first = read_u32(buf)?;
        if first == 0 {
            return Ok(AckField::empty());
        }

        let count = read_u8(buf)? as usize;
        if buf.len() < count {
            return Err(PacketError::Truncated {
                needed: count,
                remaining: buf.len(),
            });
        }

        let (bits, rest) = buf.split_at(count);
        *buf = rest;

        Ok(AckField {
            first,
            bits: bits.to_vec(),
        })
    }
}
