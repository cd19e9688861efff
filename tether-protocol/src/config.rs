//! Connection timing and policy settings

use crate::ack::DEFAULT_ACK_COUNT;
use crate::message::EncryptionMode;
use std::time::Duration;

/// Per-connection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Send a critical keep-alive after this long without sending anything
    pub keepalive_interval: Duration,
    /// The connection dies after `keepalive_interval × timeout_factor` of silence
    pub timeout_factor: f64,
    /// Flush pending acks after this long without sending anything
    pub ack_flush_interval: Duration,
    /// A transmission is presumed lost after this long without an ack
    pub packet_lost_after: Duration,
    /// ...or once the remote confirmed a packet this many ids past it
    pub packet_lost_after_newer: u64,
    /// Transmissions of a critical item before the connection is closed
    pub critical_max_tries: u32,
    /// Transmissions of a resend-once item before it fails
    pub resend_once_max_tries: u32,
    /// Packet ids covered by one piggy-backed ack field
    pub ack_count: usize,
    /// Pending acks at or above which a keep-alive is sent instead of an
    /// ack-only packet
    pub ack_only_max: usize,
    /// Write every ack-only packet twice
    pub double_send_ack_only: bool,
    /// Recent packet and message ids remembered for duplicate suppression
    pub duplicate_window: usize,
    /// Probes sent before a punch-through falls back to a normal connect
    pub punchthrough_probes: u32,
    /// Spacing of punch-through probes
    pub punchthrough_interval: Duration,
    /// How long a confirmed request still accepts its response
    pub response_retention: Duration,
    /// Encryption mode requested (initiator) or announced (acceptor)
    pub encryption: EncryptionMode,
    /// Name sent in the authenticate request
    pub user_name: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            keepalive_interval: Duration::from_secs(120),
            timeout_factor: 1.5,
            ack_flush_interval: Duration::from_millis(200),
            packet_lost_after: Duration::from_millis(1000),
            packet_lost_after_newer: 4,
            critical_max_tries: 3,
            resend_once_max_tries: 2,
            ack_count: DEFAULT_ACK_COUNT,
            ack_only_max: DEFAULT_ACK_COUNT * 2,
            double_send_ack_only: true,
            duplicate_window: 40,
            punchthrough_probes: 10,
            punchthrough_interval: Duration::from_millis(100),
            response_retention: Duration::from_secs(30),
            encryption: EncryptionMode::None,
            user_name: "player".to_string(),
        }
    }
}

impl ConnectionConfig {
    /// Silence after which the connection is considered dead
    pub fn timeout(&self) -> Duration {
        self.keepalive_interval.mul_f64(self.timeout_factor.max(1.0))
    }
}
