//! Tether - reliable messaging over UDP
//!
//! High-level API: a [`NetworkHandler`] owns one UDP socket and every
//! connection multiplexed over it, and a [`TaskQueue`] runs slow work off
//! the receive thread.

pub mod registry;
pub mod tasks;

pub use tether_io as io;
pub use tether_protocol as protocol;

pub use registry::{resolve_address, NetworkConfig, NetworkError, NetworkHandler, NetworkRole};
pub use tasks::TaskQueue;

// Re-export commonly used types
pub use protocol::{
    Connection, ConnectionConfig, ConnectionId, ConnectionState, Guarantee, MessageHandler,
    MessageId, Request, Response, ResponseBody, SentItem,
};
