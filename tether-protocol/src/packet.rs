//! Wire Codec
//!
//! Stateless framing of datagrams. All integers are little-endian.
//!
//! ```text
//! normal:   u16 magic (0x4C6E) | u32 packet id | ack field | u8 count | count × message
//! message:  u8 class | u32 message id | u16 type | payload
//! ack-only: u16 magic (0x4C61) | u8 count | count × u32 packet id
//! ```
//!
//! Decoding reports what it finds to a [`PacketVisitor`]. A malformed
//! datagram yields a [`PacketError`]; nothing in here panics on untrusted
//! input.

use crate::ack::AckField;
use crate::message::{Message, MessageClass, Request, Response};
use crate::sequence::MessageId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Magic of a normal packet ("Ln")
pub const NORMAL_MAGIC: u16 = 0x4C6E;

/// Magic of an ack-only packet
pub const ACK_ONLY_MAGIC: u16 = 0x4C61;

/// Size of the normal packet header up to the ack field
pub const HEADER_SIZE: usize = 2 + 4;

/// Size of a message header (class, id, type)
pub const MESSAGE_HEADER_SIZE: usize = 1 + 4 + 2;

/// Most messages one packet can carry
pub const MAX_MESSAGES_PER_PACKET: usize = u8::MAX as usize;

/// Most ids one ack-only packet can carry
pub const MAX_ACK_ONLY_IDS: usize = u8::MAX as usize;

/// Largest datagram the receive path reads
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Packet decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Datagram truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Bad packet magic: {0:#06x}")]
    BadMagic(u16),

    #[error("Unknown message class: {0:#04x}")]
    UnknownMessageClass(u8),

    #[error("Unknown request type: {0}")]
    UnknownRequestType(u16),

    #[error("Unknown response type: {0}")]
    UnknownResponseType(u16),

    #[error("Invalid encryption mode: {0}")]
    InvalidEncryptionMode(u8),

    #[error("String is not valid UTF-8")]
    InvalidString,

    #[error("Too many messages for one packet: {0}")]
    TooManyMessages(usize),

    #[error("Too many acks for one packet: {0}")]
    TooManyAcks(usize),
}

/// Whether decoding should carry on after a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeFlow {
    Continue,
    Stop,
}

/// Header of one message inside a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub class: MessageClass,
    pub id: MessageId,
    pub type_value: u16,
}

impl MessageHeader {
    /// Decode the payload this header introduces
    pub fn decode_message(&self, payload: &mut &[u8]) -> Result<Message, PacketError> {
        Ok(match self.class {
            MessageClass::Request => {
                Message::Request(Request::decode_payload(self.type_value, payload)?)
            }
            MessageClass::Response => {
                Message::Response(Response::decode_payload(self.type_value, payload)?)
            }
        })
    }
}

/// Receiver of decode events
///
/// Callbacks fire in wire order: the ack field, then the packet id, then
/// each message. Ack-only packets produce one `on_single_ack` per id.
pub trait PacketVisitor {
    fn on_ack_field(&mut self, _acks: &AckField) -> DecodeFlow {
        DecodeFlow::Continue
    }

    fn on_single_ack(&mut self, _packet_id: u32) {}

    fn on_packet_id(&mut self, _packet_id: u32) -> DecodeFlow {
        DecodeFlow::Continue
    }

    /// Called once per message; the payload is still unread in `payload`
    /// and must be consumed before returning.
    fn on_message(
        &mut self,
        header: MessageHeader,
        payload: &mut &[u8],
    ) -> Result<DecodeFlow, PacketError>;
}

/// Encode one message frame: class, id, type, payload
pub fn encode_message(id: MessageId, message: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + 16);
    buf.put_u8(message.class().as_u8());
    buf.put_u32_le(id.as_raw());
    buf.put_u16_le(message.type_value());
    message.encode_payload(&mut buf);
    buf.freeze()
}

/// Encode a normal packet around already-framed messages
pub fn encode_packet(
    packet_id: u32,
    acks: &AckField,
    frames: &[&[u8]],
) -> Result<Bytes, PacketError> {
    if frames.len() > MAX_MESSAGES_PER_PACKET {
        return Err(PacketError::TooManyMessages(frames.len()));
    }

    let body: usize = frames.iter().map(|f| f.len()).sum();
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + acks.encoded_len() + 1 + body);

    buf.put_u16_le(NORMAL_MAGIC);
    buf.put_u32_le(packet_id);
    acks.encode(&mut buf);
    buf.put_u8(frames.len() as u8);
    for frame in frames {
        buf.put_slice(frame);
    }

    Ok(buf.freeze())
}

/// Encode an ack-only packet
pub fn encode_ack_only(packet_ids: &[u32]) -> Result<Bytes, PacketError> {
    if packet_ids.len() > MAX_ACK_ONLY_IDS {
        return Err(PacketError::TooManyAcks(packet_ids.len()));
    }

    let mut buf = BytesMut::with_capacity(2 + 1 + packet_ids.len() * 4);
    buf.put_u16_le(ACK_ONLY_MAGIC);
    buf.put_u8(packet_ids.len() as u8);
    for id in packet_ids {
        buf.put_u32_le(*id);
    }

    Ok(buf.freeze())
}

/// Decode one datagram, reporting its contents to `visitor`
///
/// Returns early without error when the visitor asks to stop. Callbacks
/// that already ran are not undone when a later part turns out malformed.
pub fn decode<V: PacketVisitor + ?Sized>(
    datagram: &[u8],
    visitor: &mut V,
) -> Result<(), PacketError> {
    let mut buf = datagram;

    match read_u16(&mut buf)? {
        NORMAL_MAGIC => {
            let packet_id = read_u32(&mut buf)?;
            let acks = AckField::decode(&mut buf)?;
            let count = read_u8(&mut buf)?;

            if visitor.on_ack_field(&acks) == DecodeFlow::Stop {
                return Ok(());
            }
            if visitor.on_packet_id(packet_id) == DecodeFlow::Stop {
                return Ok(());
            }

            for _ in 0..count {
                let raw_class = read_u8(&mut buf)?;
                let class = MessageClass::from_u8(raw_class)
                    .ok_or(PacketError::UnknownMessageClass(raw_class))?;
                let id = MessageId::new(read_u32(&mut buf)?);
                let type_value = read_u16(&mut buf)?;

                let header = MessageHeader {
                    class,
                    id,
                    type_value,
                };
                if visitor.on_message(header, &mut buf)? == DecodeFlow::Stop {
                    return Ok(());
                }
            }

            if !buf.is_empty() {
                tracing::trace!("Ignoring {} trailing bytes after messages", buf.len());
            }
            Ok(())
        }
        ACK_ONLY_MAGIC => {
            let count = read_u8(&mut buf)? as usize;
            ensure(&buf, count * 4)?;
            for _ in 0..count {
                visitor.on_single_ack(buf.get_u32_le());
            }
            Ok(())
        }
        other => Err(PacketError::BadMagic(other)),
    }
}

#[inline]
fn ensure(buf: &&[u8], needed: usize) -> Result<(), PacketError> {
    if buf.len() < needed {
        Err(PacketError::Truncated {
            needed,
            remaining: buf.len(),
        })
    } else {
        Ok(())
    }
}

pub(crate) fn read_u8(buf: &mut &[u8]) -> Result<u8, PacketError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn read_u16(buf: &mut &[u8]) -> Result<u16, PacketError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16_le())
}

pub(crate) fn read_u32(buf: &mut &[u8]) -> Result<u32, PacketError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub(crate) fn read_i32(buf: &mut &[u8]) -> Result<i32, PacketError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32_le())
}

pub(crate) fn read_u64(buf: &mut &[u8]) -> Result<u64, PacketError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64_le())
}

/// u16 length followed by UTF-8 bytes
pub(crate) fn read_string(buf: &mut &[u8]) -> Result<String, PacketError> {
    let len = read_u16(buf)? as usize;
    ensure(buf, len)?;
    let (raw, rest) = buf.split_at(len);
    *buf = rest;
    String::from_utf8(raw.to_vec()).map_err(|_| PacketError::InvalidString)
}

/// u32 length followed by raw bytes
pub(crate) fn read_bytes(buf: &mut &[u8]) -> Result<Bytes, PacketError> {
    let len = read_u32(buf)? as usize;
    ensure(buf, len)?;
    let (raw, rest) = buf.split_at(len);
    *buf = rest;
    Ok(Bytes::copy_from_slice(raw))
}
