//! Tether I/O and Platform Abstraction
//!
//! This crate provides the UDP socket wrapper and the clock sources used by
//! the connection layer, so tests can drive time by hand.

pub mod socket;
pub mod time;

pub use socket::{DatagramSocket, SocketError};
pub use time::{Clock, ManualClock, SystemClock, Timer};
