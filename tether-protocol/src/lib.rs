//! Tether Protocol Core Implementation
//!
//! This crate implements the reliable-UDP message protocol: packet and
//! message wire formats, acknowledgement bitfields, delivery tracking with
//! per-message guarantees, and the per-peer connection state machine with
//! its Connect / Security / Authenticate handshake.

pub mod ack;
pub mod config;
pub mod connection;
pub mod message;
pub mod packet;
pub mod ping;
pub mod sent;
pub mod sequence;

pub use ack::{AckField, ReceivedState};
pub use config::ConnectionConfig;
pub use connection::{
    Connection, ConnectionError, ConnectionId, ConnectionState, ConnectionStats, Credentials,
    MessageHandler, Restriction, Side, Transport,
};
pub use message::{
    EncryptionMode, Message, Request, RequestKind, Response, ResponseBody, ResponseKind,
};
pub use packet::{PacketError, PacketVisitor};
pub use ping::PingFailure;
pub use sent::{Completion, Guarantee, SentItem};
pub use sequence::{MessageId, PacketId};
