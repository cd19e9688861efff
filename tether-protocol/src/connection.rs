//! Connection State Machine
//!
//! One [`Connection`] owns the relationship with one remote peer: the
//! Connect / Security / Authenticate handshake, packet numbering, duplicate
//! suppression, acknowledgements, the resend policy and dispatch of decoded
//! messages to the application's [`MessageHandler`].
//!
//! All mutable state sits behind one per-connection mutex. Completion
//! callbacks and handler calls run after that mutex is released, on the
//! thread that triggered them, so they are free to call back into the
//! connection.

use crate::ack::{AckField, ReceivedPackets, ReceivedState};
use crate::config::ConnectionConfig;
use crate::message::{
    Message, Request, RequestKind, Response, ResponseBody, CONNECT_CHECK_VALUE,
};
use crate::packet::{
    self, DecodeFlow, MessageHeader, PacketError, PacketVisitor, MAX_ACK_ONLY_IDS,
};
use crate::ping::{PingFailure, PingRound};
use crate::sent::{Guarantee, Outstanding, SentItem, SentLedger};
use crate::sequence::{MessageId, PacketId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tether_io::{Clock, Timer};
use thiserror::Error;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Just created, nothing heard from the peer yet
    NothingReceived,
    /// At least one packet received; handshake under way
    Initial,
    /// `Connect` exchanged
    Connected,
    /// Encryption mode agreed
    Secured,
    /// Handshake complete; application traffic flows
    Authenticated,
    /// Terminal; nothing is processed any more
    Closed,
    /// Sending NAT punch-through probes before connecting
    Punchthrough,
}

/// Which end opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Sent the `Connect` request and drives the handshake
    Initiator,
    /// Accepted an unknown peer and answers the handshake
    Acceptor,
}

/// Narrowing of which inbound requests a connection accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Restriction {
    #[default]
    None,
    /// Only a remote-console access request may open this connection
    ReceiveRemoteConsole,
}

impl Restriction {
    /// The single request kind let through, if restricted
    pub fn allowed_request(self) -> Option<RequestKind> {
        match self {
            Restriction::None => None,
            Restriction::ReceiveRemoteConsole => Some(RequestKind::RemoteConsoleAccess),
        }
    }
}

/// Stable handle of a connection inside its registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u32);

impl ConnectionId {
    pub const fn new(value: u32) -> Self {
        ConnectionId(value)
    }

    pub fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// User id issued to the peer of connection `id`
///
/// Ids past `i32::MAX` wrap back to 1 so the issued id stays positive.
fn user_id_for(id: ConnectionId) -> i32 {
    let folded = match id.as_raw() {
        0 => 0,
        raw => (raw - 1) % i32::MAX as u32 + 1,
    };
    i32::try_from(folded).unwrap_or(i32::MAX)
}

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection is closed")]
    Closed,

    #[error("Encode error: {0}")]
    Encode(#[from] PacketError),
}

/// Connection statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Total datagrams sent
    pub packets_sent: u64,
    /// Total datagrams received
    pub packets_received: u64,
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Messages retransmitted under a fresh packet id
    pub resends: u64,
    /// Datagrams whose messages were skipped as already seen
    pub duplicates_dropped: u64,
    /// Sent items finalized as failed
    pub items_failed: u64,
    /// Datagrams that failed to decode
    pub malformed_dropped: u64,
}

/// Identity assigned by the accepting side during authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: i32,
    pub token: u64,
}

/// Outbound side of a connection, provided by its owner
pub trait Transport: Send + Sync {
    /// Write one datagram to `target`
    fn send_datagram(&self, target: SocketAddr, datagram: &[u8]) -> io::Result<()>;

    /// Ask the owner to tear the connection down on its next update
    fn request_close(&self, connection: ConnectionId);
}

/// Application callbacks for decoded messages
///
/// Called synchronously on the thread that received the datagram; long work
/// belongs on a task queue.
pub trait MessageHandler: Send + Sync {
    /// A request from an authenticated peer
    fn handle_request(&self, connection: &Arc<Connection>, id: MessageId, request: Request);

    /// A response that answers none of our outstanding requests
    fn handle_response_only(&self, connection: &Arc<Connection>, response: Response);

    /// Decide whether a request may lift the connection's restriction
    fn accept_restricted_request(
        &self,
        _connection: &Arc<Connection>,
        _id: MessageId,
        _request: &Request,
    ) -> bool {
        false
    }
}

/// Ack field sent inside one of our packets
#[derive(Debug)]
struct AckGroup {
    packet_id: PacketId,
    sent_at: Instant,
    ids: Vec<PacketId>,
}

#[derive(Debug)]
struct Punchthrough {
    remaining: u32,
    timer: Timer,
}

struct Inner {
    state: ConnectionState,
    restriction: Restriction,
    last_packet_id: PacketId,
    last_message_id: MessageId,
    received: ReceivedPackets,
    highest_remote: Option<PacketId>,
    recent_packets: VecDeque<PacketId>,
    recent_messages: VecDeque<MessageId>,
    last_confirmed: PacketId,
    ledger: SentLedger,
    ack_groups: Vec<AckGroup>,
    front_acks: bool,
    last_received: Instant,
    last_sent: Instant,
    punch: Option<Punchthrough>,
    credentials: Option<Credentials>,
    close_sent: bool,
    released: bool,
    stats: ConnectionStats,
}

impl Inner {
    fn new(now: Instant) -> Self {
        Inner {
            state: ConnectionState::NothingReceived,
            restriction: Restriction::None,
            last_packet_id: PacketId::NONE,
            last_message_id: MessageId::NONE,
            received: ReceivedPackets::new(),
            highest_remote: None,
            recent_packets: VecDeque::new(),
            recent_messages: VecDeque::new(),
            last_confirmed: PacketId::NONE,
            ledger: SentLedger::new(),
            ack_groups: Vec::new(),
            front_acks: false,
            last_received: now,
            last_sent: now,
            punch: None,
            credentials: None,
            close_sent: false,
            released: false,
            stats: ConnectionStats::default(),
        }
    }

    fn allocate_packet_id(&mut self) -> PacketId {
        self.last_packet_id = self.last_packet_id.next();
        self.last_packet_id
    }

    fn allocate_message_id(&mut self) -> MessageId {
        self.last_message_id = self.last_message_id.next();
        self.last_message_id
    }

    /// Check `id` against recently received packets, remembering it if new
    fn is_duplicate_packet(&mut self, id: PacketId, window: usize) -> bool {
        if let Some(oldest) = self.recent_packets.front() {
            if id.as_u64().saturating_add(2 * window as u64) < oldest.as_u64() {
                tracing::warn!("Received very old packet {}, ignoring it", id);
                return true;
            }
        }

        if self.recent_packets.contains(&id) {
            return true;
        }

        self.recent_packets.push_back(id);
        if self.recent_packets.len() > window {
            self.recent_packets.pop_front();
        }
        false
    }

    /// Check `id` against recently received messages, remembering it if new
    fn is_duplicate_message(&mut self, id: MessageId, window: usize) -> bool {
        if let Some(&oldest) = self.recent_messages.front() {
            if id.is_older_than(oldest, 2 * window as u32) {
                tracing::warn!("Received very old message {}, ignoring it", id);
                return true;
            }
        }

        if self.recent_messages.contains(&id) {
            return true;
        }

        self.recent_messages.push_back(id);
        if self.recent_messages.len() > window {
            self.recent_messages.pop_front();
        }
        false
    }
}

enum Dispatch {
    Request(MessageId, Request),
    Restricted(MessageId, Request),
    ResponseOnly(Response),
}

/// Work deferred until the connection lock is released
#[derive(Default)]
struct Effects {
    completed: Vec<Arc<SentItem>>,
    dispatch: Vec<Dispatch>,
}

/// A reliable-UDP connection to one peer
pub struct Connection {
    id: ConnectionId,
    remote: SocketAddr,
    side: Side,
    config: ConnectionConfig,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
    inner: Mutex<Inner>,
}

impl Connection {
    /// Create a connection; nothing is sent until [`init`](Self::init) or
    /// the first received datagram
    pub fn new(
        id: ConnectionId,
        remote: SocketAddr,
        side: Side,
        config: ConnectionConfig,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
    ) -> Arc<Self> {
        let now = clock.now();
        Arc::new(Connection {
            id,
            remote,
            side,
            config,
            clock,
            transport,
            handler,
            inner: Mutex::new(Inner::new(now)),
        })
    }

    /// Start the connection; the initiating side sends its `Connect` request
    pub fn init(&self) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }

        let now = self.clock.now();
        inner.last_sent = now;
        inner.last_received = now;

        if self.side == Side::Initiator {
            tracing::info!("Opening connection to {}", self.remote);
            self.send_locked(&mut inner, Request::Connect.into(), Guarantee::Critical, false)?;
        }
        Ok(())
    }

    /// Send punch-through probes before connecting
    ///
    /// Only valid before any traffic; the `Connect` request follows the last
    /// probe.
    pub fn start_punchthrough(&self) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::Closed => return Err(ConnectionError::Closed),
            ConnectionState::NothingReceived => {}
            state => {
                tracing::warn!(
                    "Not starting punch-through to {} in state {:?}",
                    self.remote,
                    state
                );
                return Ok(());
            }
        }

        let now = self.clock.now();
        tracing::info!(
            "Starting punch-through to {} ({} probes)",
            self.remote,
            self.config.punchthrough_probes
        );
        inner.state = ConnectionState::Punchthrough;
        inner.last_sent = now;
        inner.last_received = now;
        inner.punch = Some(Punchthrough {
            remaining: self.config.punchthrough_probes,
            timer: Timer::expired_at(self.config.punchthrough_interval, now),
        });
        Ok(())
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// True until the connection closes
    pub fn is_valid_for_send(&self) -> bool {
        self.state() != ConnectionState::Closed
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().released
    }

    /// `ip:port` of the peer
    pub fn address_string(&self) -> String {
        self.remote.to_string()
    }

    pub fn restriction(&self) -> Restriction {
        self.inner.lock().restriction
    }

    pub fn set_restriction(&self, restriction: Restriction) {
        self.inner.lock().restriction = restriction;
    }

    /// Identity agreed during authentication
    pub fn credentials(&self) -> Option<Credentials> {
        self.inner.lock().credentials
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.lock().stats.clone()
    }

    /// Items still waiting for an ack
    pub fn outstanding_count(&self) -> usize {
        self.inner.lock().ledger.len()
    }

    /// Remote packets received but not yet confirmed as acked
    pub fn pending_ack_count(&self) -> usize {
        self.inner.lock().received.len()
    }

    /// Queue a request for delivery
    pub fn send_request(
        &self,
        request: Request,
        guarantee: Guarantee,
    ) -> Result<Arc<SentItem>, ConnectionError> {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        self.send_locked(&mut inner, request.into(), guarantee, false)
    }

    /// Queue a response for delivery
    pub fn send_response(
        &self,
        response: Response,
        guarantee: Guarantee,
    ) -> Result<Arc<SentItem>, ConnectionError> {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        self.send_locked(&mut inner, response.into(), guarantee, false)
    }

    /// Retransmit an item right away instead of waiting for loss detection
    ///
    /// Items without a delivery guarantee are never resent.
    pub fn resend_now(&self, item: &SentItem) {
        if item.guarantee() == Guarantee::None {
            tracing::error!(
                "Resend requested for message {} which has no delivery guarantee",
                item.message_id()
            );
            return;
        }

        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Closed {
            return;
        }

        let frame = match inner.ledger.find_by_message(item.message_id()) {
            Some(entry) => entry.frame.clone(),
            None => {
                tracing::error!(
                    "Resend requested for message {} which is not in flight to {}",
                    item.message_id(),
                    self.remote
                );
                return;
            }
        };

        let now = self.clock.now();
        match self.transmit(&mut inner, &frame, now) {
            Ok(packet_id) => {
                inner.stats.resends += 1;
                if let Some(entry) = inner.ledger.find_by_message_mut(item.message_id()) {
                    entry.packet_id = packet_id;
                    entry.started = now;
                    entry.attempt += 1;
                }
            }
            Err(e) => tracing::error!("Failed to resend message {}: {}", item.message_id(), e),
        }
    }

    /// Measure ping with `count` timed echo requests
    ///
    /// `on_success` receives the ping in milliseconds and the number of
    /// lost echoes; `on_failure` fires when more than `allowed_failures`
    /// echoes are lost or the connection is closed.
    pub fn calculate_ping<S, F>(
        &self,
        count: usize,
        allowed_failures: u32,
        on_success: S,
        on_failure: F,
    ) where
        S: FnOnce(u32, u32) + Send + 'static,
        F: FnOnce(PingFailure, u32) + Send + 'static,
    {
        let count = if count == 0 {
            tracing::warn!("Ping requested with zero echoes, sending one");
            1
        } else {
            count
        };

        if count >= 100 {
            tracing::warn!("Sending {} ping echoes to {}", count, self.remote);
        }

        if !self.is_valid_for_send() {
            on_failure(PingFailure::ConnectionClosed, 0);
            return;
        }

        let round = Arc::new(PingRound::new(
            count,
            allowed_failures,
            Box::new(on_success),
            Box::new(on_failure),
        ));

        for _ in 0..count {
            let sent = {
                let mut inner = self.inner.lock();
                if inner.state == ConnectionState::Closed {
                    Err(ConnectionError::Closed)
                } else {
                    self.send_locked(&mut inner, Request::Echo.into(), Guarantee::Critical, true)
                }
            };

            match sent {
                Ok(item) => {
                    let round = Arc::clone(&round);
                    item.on_complete(move |ok, item| {
                        round.record(if ok { item.round_trip() } else { None })
                    });
                }
                Err(_) => round.record(None),
            }
        }
    }

    /// Close locally: notify the peer, fail every pending item and ask the
    /// owner to remove this connection
    pub fn close(&self) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            tracing::info!("Closing connection to {}", self.remote);
            self.close_locked(&mut inner, &mut effects);
        }
        Self::run_completions(effects.completed);
    }

    /// Final teardown by the owner
    ///
    /// Sends the close notice if none was sent yet and fails everything
    /// still pending.
    pub fn release(&self) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.released {
                return;
            }
            tracing::info!("Disconnecting from {}", self.remote);
            self.send_close_notice(&mut inner);
            inner.state = ConnectionState::Closed;
            inner.released = true;
            self.fail_all(&mut inner, &mut effects);
        }
        Self::run_completions(effects.completed);
    }

    /// Process one datagram received from the peer
    pub fn handle_datagram(self: &Arc<Self>, datagram: &[u8]) {
        let mut effects = Effects::default();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.state == ConnectionState::Closed {
                tracing::trace!("Dropping datagram for closed connection to {}", self.remote);
                return;
            }

            inner.stats.packets_received += 1;
            inner.stats.bytes_received += datagram.len() as u64;

            let mut receive = Receive {
                conn: &**self,
                inner: &mut *inner,
                effects: &mut effects,
                now: self.clock.now(),
                duplicate: false,
            };

            if let Err(e) = packet::decode(datagram, &mut receive) {
                inner.stats.malformed_dropped += 1;
                tracing::error!("Dropping malformed datagram from {}: {}", self.remote, e);
            }
        }
        self.apply(effects);
    }

    /// Periodic update: timeouts, resends, keep-alives and ack flushing
    pub fn update(&self) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Closed {
                let now = self.clock.now();
                self.tick_locked(&mut inner, &mut effects, now);
            }
        }
        Self::run_completions(effects.completed);
    }

    fn tick_locked(&self, inner: &mut Inner, effects: &mut Effects, now: Instant) {
        if inner.state == ConnectionState::Punchthrough {
            self.punchthrough_tick(inner, now);
            return;
        }

        let silent = now.saturating_duration_since(inner.last_received);
        if silent > self.config.timeout() {
            tracing::warn!(
                "Timing out connection to {} after {:?} of silence",
                self.remote,
                silent
            );
            self.close_locked(inner, effects);
            return;
        }

        if !self.handle_timeouts(inner, effects, now) {
            return;
        }

        self.expire_ack_groups(inner, now);
        inner
            .ledger
            .prune_awaiting(now, self.config.response_retention);

        if now.saturating_duration_since(inner.last_sent) > self.config.keepalive_interval {
            tracing::debug!("Sending keep-alive to {}", self.remote);
            let keepalive = Response::unsolicited(ResponseBody::Keepalive);
            if let Err(e) = self.send_locked(inner, keepalive.into(), Guarantee::Critical, false) {
                tracing::error!("Failed to send keep-alive to {}: {}", self.remote, e);
            }
            return;
        }

        self.flush_acks(inner, now);
    }

    /// Apply the guarantee policy to every presumably lost item
    ///
    /// Returns false if a critical loss closed the connection.
    fn handle_timeouts(&self, inner: &mut Inner, effects: &mut Effects, now: Instant) -> bool {
        let entries = inner.ledger.take_entries();
        let mut kept = Vec::with_capacity(entries.len());
        let mut entries = entries.into_iter();

        while let Some(mut entry) = entries.next() {
            if entry.item.is_finalized() {
                continue;
            }

            let lost = now.saturating_duration_since(entry.started) > self.config.packet_lost_after
                || inner.last_confirmed.as_u64()
                    > entry
                        .packet_id
                        .as_u64()
                        .saturating_add(self.config.packet_lost_after_newer);
            if !lost {
                kept.push(entry);
                continue;
            }

            let resend = match entry.item.guarantee() {
                Guarantee::None => false,
                Guarantee::ResendOnce => {
                    entry.attempt += 1;
                    entry.attempt <= self.config.resend_once_max_tries
                }
                Guarantee::Critical => {
                    entry.attempt += 1;
                    if entry.attempt > self.config.critical_max_tries {
                        tracing::error!(
                            "Lost critical message {} to {} too many times, closing",
                            entry.item.message_id(),
                            self.remote
                        );
                        self.fail_item(inner, effects, entry.item);
                        kept.extend(entries.by_ref());
                        inner.ledger.restore(kept);
                        self.close_locked(inner, effects);
                        return false;
                    }
                    true
                }
            };

            if !resend {
                tracing::debug!(
                    "Message {} to {} lost (packet {}, attempt {})",
                    entry.item.message_id(),
                    self.remote,
                    entry.packet_id,
                    entry.attempt
                );
                self.fail_item(inner, effects, entry.item);
                continue;
            }

            match self.transmit(inner, &entry.frame, now) {
                Ok(packet_id) => {
                    tracing::trace!(
                        "Resending message {} to {} in packet {} (attempt {})",
                        entry.item.message_id(),
                        self.remote,
                        packet_id,
                        entry.attempt
                    );
                    entry.packet_id = packet_id;
                    entry.started = now;
                    inner.stats.resends += 1;
                    kept.push(entry);
                }
                Err(e) => {
                    tracing::error!("Failed to resend message {}: {}", entry.item.message_id(), e);
                    self.fail_item(inner, effects, entry.item);
                }
            }
        }

        inner.ledger.restore(kept);
        true
    }

    /// Forget ack fields whose carrying packet is presumed lost, so their
    /// ids get reported again
    fn expire_ack_groups(&self, inner: &mut Inner, now: Instant) {
        let last_confirmed = inner.last_confirmed.as_u64();
        let (expired, live): (Vec<AckGroup>, Vec<AckGroup>) =
            std::mem::take(&mut inner.ack_groups)
                .into_iter()
                .partition(|group| {
                    now.saturating_duration_since(group.sent_at) > self.config.packet_lost_after
                        || last_confirmed
                            > group
                                .packet_id
                                .as_u64()
                                .saturating_add(self.config.packet_lost_after_newer)
                });
        inner.ack_groups = live;

        for group in expired {
            for id in group.ids {
                if let Some(state) = inner.received.get_mut(&id) {
                    if *state == ReceivedState::AckSent {
                        *state = ReceivedState::Received;
                    }
                }
            }
        }
    }

    /// Send pending acks if nothing else went out recently
    fn flush_acks(&self, inner: &mut Inner, now: Instant) {
        if now.saturating_duration_since(inner.last_sent) <= self.config.ack_flush_interval {
            return;
        }

        let limit = self.config.ack_only_max.min(MAX_ACK_ONLY_IDS);
        let pending: Vec<PacketId> = inner
            .received
            .iter()
            .filter(|(_, state)| **state == ReceivedState::Received)
            .map(|(id, _)| *id)
            .take(limit)
            .collect();

        if pending.is_empty() {
            return;
        }

        if pending.len() < limit {
            let wire: Vec<u32> = pending.iter().map(|id| id.wire()).collect();
            match packet::encode_ack_only(&wire) {
                Ok(datagram) => {
                    tracing::trace!(
                        "Sending ack-only packet with {} acks to {}",
                        wire.len(),
                        self.remote
                    );
                    self.write(inner, &datagram, now);
                    if self.config.double_send_ack_only {
                        self.write(inner, &datagram, now);
                    }
                    // Ack-only packets are never confirmed; the peer resends
                    // under a fresh id if both copies get lost.
                    for id in pending {
                        inner.received.remove(&id);
                    }
                }
                Err(e) => tracing::error!("Failed to encode ack-only packet: {}", e),
            }
        } else {
            // Too many for one ack-only packet; a normal packet carries a field
            let keepalive = Response::unsolicited(ResponseBody::Keepalive);
            if let Err(e) = self.send_locked(inner, keepalive.into(), Guarantee::None, false) {
                tracing::error!("Failed to send ack-bearing keep-alive: {}", e);
            }
        }
    }

    fn punchthrough_tick(&self, inner: &mut Inner, now: Instant) {
        let remaining = match inner.punch.as_mut() {
            Some(punch) => {
                if !punch.timer.try_fire(now) {
                    return;
                }
                let send_probe = punch.remaining > 0;
                punch.remaining = punch.remaining.saturating_sub(1);
                if send_probe {
                    match packet::encode_ack_only(&[]) {
                        Ok(probe) => {
                            tracing::trace!("Sending punch-through probe to {}", self.remote);
                            self.write(inner, &probe, now);
                        }
                        Err(e) => tracing::error!("Failed to encode probe: {}", e),
                    }
                }
                inner.punch.as_ref().map_or(0, |p| p.remaining)
            }
            None => 0,
        };

        if remaining > 0 {
            return;
        }

        tracing::info!("Punch-through to {} finished, connecting", self.remote);
        inner.punch = None;
        inner.state = ConnectionState::Initial;
        inner.last_received = now;
        if let Err(e) = self.send_locked(inner, Request::Connect.into(), Guarantee::Critical, false)
        {
            tracing::error!("Failed to send connect request to {}: {}", self.remote, e);
        }
    }

    fn send_locked(
        &self,
        inner: &mut Inner,
        message: Message,
        guarantee: Guarantee,
        timed: bool,
    ) -> Result<Arc<SentItem>, ConnectionError> {
        let id = inner.allocate_message_id();
        let frame = packet::encode_message(id, &message);
        let is_request = matches!(message, Message::Request(_));

        let item = Arc::new(SentItem::new(id, guarantee, is_request));
        if timed {
            item.set_as_timed();
        }

        let now = self.clock.now();
        let packet_id = self.transmit(inner, &frame, now)?;
        tracing::trace!(
            "Sent {} (message {}) in packet {} to {}",
            message.label(),
            id,
            packet_id,
            self.remote
        );

        inner
            .ledger
            .record(Outstanding::new(Arc::clone(&item), packet_id, now, frame));
        Ok(item)
    }

    /// Frame one message into a fresh packet with current acks and send it
    fn transmit(&self, inner: &mut Inner, frame: &[u8], now: Instant) -> Result<PacketId, PacketError> {
        let packet_id = inner.allocate_packet_id();
        let acks = self.acks_to_send(inner, packet_id, now);
        let datagram = packet::encode_packet(packet_id.wire(), &acks, &[frame])?;
        self.write(inner, &datagram, now);
        Ok(packet_id)
    }

    fn write(&self, inner: &mut Inner, datagram: &[u8], now: Instant) {
        inner.last_sent = now;
        inner.stats.packets_sent += 1;
        inner.stats.bytes_sent += datagram.len() as u64;

        if let Err(e) = self.transport.send_datagram(self.remote, datagram) {
            tracing::warn!("Failed to send datagram to {}: {}", self.remote, e);
        }
    }

    /// Build the ack field for the packet about to be sent as `packet_id`
    ///
    /// Alternates between starting at the oldest pending id and at the
    /// oldest of the newest `ack_count` pending ids, so a long backlog is
    /// worked from both ends.
    fn acks_to_send(&self, inner: &mut Inner, packet_id: PacketId, now: Instant) -> AckField {
        if inner.received.is_empty() {
            return AckField::empty();
        }

        inner.front_acks = !inner.front_acks;

        let mut pending = inner
            .received
            .iter()
            .filter(|(_, state)| **state == ReceivedState::Received)
            .map(|(id, _)| *id);
        let first = if inner.front_acks {
            pending.next()
        } else {
            pending.rev().take(self.config.ack_count).last()
        };

        let Some(first) = first else {
            return AckField::empty();
        };

        let acks = AckField::new(first, self.config.ack_count, &inner.received);
        if acks.is_empty() {
            return acks;
        }

        let ids: Vec<PacketId> = acks
            .acked_offsets()
            .map(|offset| first.advance(offset as u64))
            .collect();
        for id in &ids {
            if let Some(state) = inner.received.get_mut(id) {
                if *state == ReceivedState::Received {
                    *state = ReceivedState::AckSent;
                }
            }
        }

        inner.ack_groups.push(AckGroup {
            packet_id,
            sent_at: now,
            ids,
        });
        acks
    }

    /// The peer confirmed receiving our packet `id`
    fn handle_remote_ack(&self, inner: &mut Inner, effects: &mut Effects, id: PacketId, now: Instant) {
        if id == PacketId::NONE || id > inner.last_packet_id {
            tracing::debug!("Ignoring ack for unsent packet {} from {}", id, self.remote);
            return;
        }

        if id > inner.last_confirmed {
            inner.last_confirmed = id;
        }

        if let Some(entry) = inner.ledger.take_by_packet(id) {
            let round_trip = now.saturating_duration_since(entry.started);
            if entry.item.finalize(true, Some(round_trip)) {
                effects.completed.push(Arc::clone(&entry.item));
            }
            if entry.item.is_request() {
                inner.ledger.await_response(entry.item, now);
            }
        }

        if let Some(pos) = inner.ack_groups.iter().position(|g| g.packet_id == id) {
            let group = inner.ack_groups.remove(pos);
            for acked in group.ids {
                inner.received.remove(&acked);
            }
        }
    }

    fn on_request(&self, inner: &mut Inner, effects: &mut Effects, id: MessageId, request: Request) {
        match &request {
            Request::Connect => {
                tracing::debug!("Connect request from {}", self.remote);
                self.reply(
                    inner,
                    id,
                    ResponseBody::Connect {
                        check_value: CONNECT_CHECK_VALUE,
                    },
                    Guarantee::ResendOnce,
                );
                return;
            }
            Request::Security { encryption } => {
                if !matches!(
                    inner.state,
                    ConnectionState::Initial | ConnectionState::Connected
                ) {
                    tracing::debug!(
                        "Ignoring security request from {} in state {:?}",
                        self.remote,
                        inner.state
                    );
                    return;
                }

                if *encryption != self.config.encryption {
                    tracing::warn!(
                        "{} asked for encryption {:?}, announcing {:?}",
                        self.remote,
                        encryption,
                        self.config.encryption
                    );
                }

                self.reply(
                    inner,
                    id,
                    ResponseBody::Security {
                        encryption: self.config.encryption,
                    },
                    Guarantee::Critical,
                );
                inner.state = ConnectionState::Secured;
                tracing::debug!("Connection to {} secured", self.remote);
                return;
            }
            Request::Authenticate { user_name } => {
                if self.side == Side::Initiator {
                    tracing::error!(
                        "Initiating side received an authenticate request from {}",
                        self.remote
                    );
                    return;
                }
                if inner.state != ConnectionState::Secured {
                    tracing::debug!(
                        "Ignoring authenticate request from {} in state {:?}",
                        self.remote,
                        inner.state
                    );
                    return;
                }

                let credentials = Credentials {
                    user_id: user_id_for(self.id),
                    token: rand::random(),
                };
                inner.state = ConnectionState::Authenticated;
                inner.credentials = Some(credentials);
                tracing::info!(
                    "Authenticate request from {} accepted (user \"{}\", id {})",
                    self.remote,
                    user_name,
                    credentials.user_id
                );

                self.reply(
                    inner,
                    id,
                    ResponseBody::Authenticate {
                        user_id: credentials.user_id,
                        token: credentials.token,
                    },
                    Guarantee::Critical,
                );
                return;
            }
            _ => {}
        }

        if inner.state != ConnectionState::Authenticated {
            tracing::warn!(
                "Connection to {} not yet open, ignoring {:?} request",
                self.remote,
                request.kind()
            );
            return;
        }

        if let Request::Echo = request {
            self.reply(inner, id, ResponseBody::None, Guarantee::None);
            return;
        }

        match inner.restriction.allowed_request() {
            None => effects.dispatch.push(Dispatch::Request(id, request)),
            Some(kind) if kind == request.kind() => {
                effects.dispatch.push(Dispatch::Restricted(id, request))
            }
            Some(_) => self.restrict_fail(inner, effects, &format!("{:?} request", request.kind())),
        }
    }

    fn on_response(&self, inner: &mut Inner, effects: &mut Effects, response: Response) {
        let mut matched = false;

        if !response.response_to.is_none() {
            if let Some(entry) = inner.ledger.take_request(response.response_to) {
                let round_trip = self.clock.now().saturating_duration_since(entry.started);
                entry.item.attach_response(response.clone());
                if entry.item.finalize(true, Some(round_trip)) {
                    effects.completed.push(entry.item);
                }
                matched = true;
            } else if let Some(item) = inner.ledger.take_awaiting(response.response_to) {
                item.attach_response(response.clone());
                matched = true;
            } else {
                tracing::warn!(
                    "Received {:?} response from {} to message {}, but no such request is pending",
                    response.kind(),
                    self.remote,
                    response.response_to
                );
            }
        }

        match &response.body {
            ResponseBody::CloseConnection => {
                tracing::info!("{} closed the connection", self.remote);
                inner.state = ConnectionState::Closed;
                self.fail_all(inner, effects);
                self.transport.request_close(self.id);
                return;
            }
            ResponseBody::Connect { check_value } => {
                if *check_value != CONNECT_CHECK_VALUE {
                    tracing::error!(
                        "Connect response from {} has invalid check value {}, ignoring it",
                        self.remote,
                        check_value
                    );
                    return;
                }

                if matches!(
                    inner.state,
                    ConnectionState::NothingReceived | ConnectionState::Initial
                ) {
                    inner.state = ConnectionState::Connected;
                    tracing::debug!("Connected to {}", self.remote);

                    if self.side == Side::Initiator {
                        let security = Request::Security {
                            encryption: self.config.encryption,
                        };
                        self.send_handshake(inner, security);
                    }
                }
                return;
            }
            ResponseBody::Security { encryption } => {
                if inner.state != ConnectionState::Connected {
                    return;
                }

                if *encryption != self.config.encryption {
                    tracing::error!(
                        "Security mismatch with {}: requested {:?}, peer announced {:?}; disconnecting",
                        self.remote,
                        self.config.encryption,
                        encryption
                    );
                    self.close_locked(inner, effects);
                    return;
                }

                inner.state = ConnectionState::Secured;
                tracing::debug!("Connection to {} secured", self.remote);

                if self.side == Side::Initiator {
                    let authenticate = Request::Authenticate {
                        user_name: self.config.user_name.clone(),
                    };
                    self.send_handshake(inner, authenticate);
                }
                return;
            }
            ResponseBody::Authenticate { user_id, token } => {
                if inner.state != ConnectionState::Secured {
                    return;
                }

                inner.state = ConnectionState::Authenticated;
                inner.credentials = Some(Credentials {
                    user_id: *user_id,
                    token: *token,
                });
                tracing::info!(
                    "Authenticated with {} (user id {})",
                    self.remote,
                    user_id
                );
                return;
            }
            _ => {}
        }

        if inner.state != ConnectionState::Authenticated {
            if !response.body.is_empty_kind() {
                tracing::warn!(
                    "Connection to {} not yet open, ignoring {:?} response",
                    self.remote,
                    response.kind()
                );
            }
            return;
        }

        if response.body.is_empty_kind() {
            return;
        }

        if inner.restriction != Restriction::None {
            self.restrict_fail(inner, effects, &format!("{:?} response", response.kind()));
            return;
        }

        if !matched {
            effects.dispatch.push(Dispatch::ResponseOnly(response));
        }
    }

    fn reply(&self, inner: &mut Inner, to: MessageId, body: ResponseBody, guarantee: Guarantee) {
        let response = Response::to(to, body);
        if let Err(e) = self.send_locked(inner, response.into(), guarantee, false) {
            tracing::error!("Failed to reply to message {} from {}: {}", to, self.remote, e);
        }
    }

    fn send_handshake(&self, inner: &mut Inner, request: Request) {
        let kind = request.kind();
        if let Err(e) = self.send_locked(inner, request.into(), Guarantee::Critical, false) {
            tracing::error!("Failed to send {:?} request to {}: {}", kind, self.remote, e);
        }
    }

    fn restrict_fail(&self, inner: &mut Inner, effects: &mut Effects, what: &str) {
        tracing::error!(
            "Received a non-valid {} from {} in restricted mode {:?}",
            what,
            self.remote,
            inner.restriction
        );
        self.close_locked(inner, effects);
    }

    fn send_close_notice(&self, inner: &mut Inner) {
        if inner.close_sent {
            return;
        }
        inner.close_sent = true;

        let id = inner.allocate_message_id();
        let notice = Message::Response(Response::unsolicited(ResponseBody::CloseConnection));
        let frame = packet::encode_message(id, &notice);
        let now = self.clock.now();
        if let Err(e) = self.transmit(inner, &frame, now) {
            tracing::error!("Failed to send close notice to {}: {}", self.remote, e);
        }
    }

    fn close_locked(&self, inner: &mut Inner, effects: &mut Effects) {
        if inner.state == ConnectionState::Closed {
            return;
        }
        self.send_close_notice(inner);
        inner.state = ConnectionState::Closed;
        self.fail_all(inner, effects);
        self.transport.request_close(self.id);
    }

    fn fail_item(&self, inner: &mut Inner, effects: &mut Effects, item: Arc<SentItem>) {
        if item.finalize(false, None) {
            inner.stats.items_failed += 1;
            effects.completed.push(item);
        }
    }

    fn fail_all(&self, inner: &mut Inner, effects: &mut Effects) {
        for item in inner.ledger.drain_all() {
            self.fail_item(inner, effects, item);
        }
        inner.ack_groups.clear();
        inner.punch = None;
    }

    fn run_completions(completed: Vec<Arc<SentItem>>) {
        for item in completed {
            item.run_callback();
        }
    }

    fn apply(self: &Arc<Self>, effects: Effects) {
        Self::run_completions(effects.completed);

        for dispatch in effects.dispatch {
            match dispatch {
                Dispatch::Request(id, request) => self.handler.handle_request(self, id, request),
                Dispatch::ResponseOnly(response) => {
                    self.handler.handle_response_only(self, response)
                }
                Dispatch::Restricted(id, request) => {
                    if self.handler.accept_restricted_request(self, id, &request) {
                        tracing::info!(
                            "Restricted connection to {} opened by {:?} request",
                            self.remote,
                            request.kind()
                        );
                        self.inner.lock().restriction = Restriction::None;
                    } else {
                        tracing::error!(
                            "Refused {:?} request from {} on restricted connection",
                            request.kind(),
                            self.remote
                        );
                        self.close();
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("side", &self.side)
            .finish()
    }
}

/// Decode visitor applying one datagram to a locked connection
struct Receive<'a> {
    conn: &'a Connection,
    inner: &'a mut Inner,
    effects: &'a mut Effects,
    now: Instant,
    duplicate: bool,
}

impl PacketVisitor for Receive<'_> {
    fn on_ack_field(&mut self, acks: &AckField) -> DecodeFlow {
        let reference = self.inner.last_packet_id;
        for wire in acks.acked_wire_ids() {
            let id = PacketId::from_wire(wire, reference);
            self.conn
                .handle_remote_ack(self.inner, self.effects, id, self.now);
        }
        DecodeFlow::Continue
    }

    fn on_single_ack(&mut self, packet_id: u32) {
        self.inner.last_received = self.now;
        let id = PacketId::from_wire(packet_id, self.inner.last_packet_id);
        self.conn
            .handle_remote_ack(self.inner, self.effects, id, self.now);
    }

    fn on_packet_id(&mut self, packet_id: u32) -> DecodeFlow {
        let reference = self
            .inner
            .highest_remote
            .unwrap_or(PacketId::new(u64::from(packet_id)));
        let id = PacketId::from_wire(packet_id, reference);

        self.inner.last_received = self.now;
        if self.inner.state == ConnectionState::NothingReceived {
            self.inner.state = ConnectionState::Initial;
        }

        if self
            .inner
            .is_duplicate_packet(id, self.conn.config.duplicate_window)
        {
            self.duplicate = true;
            self.inner.stats.duplicates_dropped += 1;
            tracing::debug!("Duplicate packet {} from {}", id, self.conn.remote);
            return DecodeFlow::Continue;
        }

        self.inner
            .received
            .entry(id)
            .or_insert(ReceivedState::Received);
        if self.inner.highest_remote.map_or(true, |highest| id > highest) {
            self.inner.highest_remote = Some(id);
        }
        DecodeFlow::Continue
    }

    fn on_message(
        &mut self,
        header: MessageHeader,
        payload: &mut &[u8],
    ) -> Result<DecodeFlow, PacketError> {
        let message = header.decode_message(payload)?;

        if self.duplicate {
            return Ok(DecodeFlow::Continue);
        }

        if self
            .inner
            .is_duplicate_message(header.id, self.conn.config.duplicate_window)
        {
            tracing::trace!(
                "Already received message {} from {}",
                header.id,
                self.conn.remote
            );
            return Ok(DecodeFlow::Continue);
        }

        tracing::trace!(
            "Received {} (message {}) from {}",
            message.label(),
            header.id,
            self.conn.remote
        );

        match message {
            Message::Request(request) => {
                self.conn
                    .on_request(self.inner, self.effects, header.id, request)
            }
            Message::Response(response) => {
                self.conn.on_response(self.inner, self.effects, response)
            }
        }

        if self.inner.state == ConnectionState::Closed {
            Ok(DecodeFlow::Stop)
        } else {
            Ok(DecodeFlow::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EncryptionMode, ResponseKind};
    use crate::sent::Completion;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tether_io::ManualClock;

    #[derive(Default)]
    struct CaptureTransport {
        sent: Mutex<Vec<Vec<u8>>>,
        close_requests: Mutex<Vec<ConnectionId>>,
    }

    impl CaptureTransport {
        fn take(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl Transport for CaptureTransport {
        fn send_datagram(&self, _target: SocketAddr, datagram: &[u8]) -> io::Result<()> {
            self.sent.lock().push(datagram.to_vec());
            Ok(())
        }

        fn request_close(&self, connection: ConnectionId) {
            self.close_requests.lock().push(connection);
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        requests: Mutex<Vec<(MessageId, Request)>>,
        responses: Mutex<Vec<Response>>,
        accept_restricted: bool,
    }

    impl MessageHandler for RecordingHandler {
        fn handle_request(&self, _connection: &Arc<Connection>, id: MessageId, request: Request) {
            self.requests.lock().push((id, request));
        }

        fn handle_response_only(&self, _connection: &Arc<Connection>, response: Response) {
            self.responses.lock().push(response);
        }

        fn accept_restricted_request(
            &self,
            _connection: &Arc<Connection>,
            _id: MessageId,
            _request: &Request,
        ) -> bool {
            self.accept_restricted
        }
    }

    struct Peer {
        conn: Arc<Connection>,
        transport: Arc<CaptureTransport>,
        handler: Arc<RecordingHandler>,
    }

    fn peer(
        id: u32,
        side: Side,
        config: ConnectionConfig,
        clock: &Arc<ManualClock>,
        handler: RecordingHandler,
    ) -> Peer {
        let transport = Arc::new(CaptureTransport::default());
        let handler = Arc::new(handler);
        let remote: SocketAddr = format!("127.0.0.1:{}", 4000 + id).parse().unwrap();
        let conn = Connection::new(
            ConnectionId::new(id),
            remote,
            side,
            config,
            Arc::clone(clock) as Arc<dyn Clock>,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&handler) as Arc<dyn MessageHandler>,
        );
        Peer {
            conn,
            transport,
            handler,
        }
    }

    /// Deliver everything in flight between `a` and `b` until both go quiet
    fn pump(a: &Peer, b: &Peer) {
        for _ in 0..100 {
            let from_a = a.transport.take();
            let from_b = b.transport.take();
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            for datagram in from_a {
                b.conn.handle_datagram(&datagram);
            }
            for datagram in from_b {
                a.conn.handle_datagram(&datagram);
            }
        }
        panic!("peers never went quiet");
    }

    fn handshake_pair(
        client_config: ConnectionConfig,
        server_config: ConnectionConfig,
        server_handler: RecordingHandler,
    ) -> (Arc<ManualClock>, Peer, Peer) {
        let clock = Arc::new(ManualClock::new());
        let client = peer(1, Side::Initiator, client_config, &clock, RecordingHandler::default());
        let server = peer(2, Side::Acceptor, server_config, &clock, server_handler);
        client.conn.init().unwrap();
        server.conn.init().unwrap();
        pump(&client, &server);
        (clock, client, server)
    }

    /// Message ids of every `kind` request inside the given datagrams
    fn requests_of(datagrams: &[Vec<u8>], kind: RequestKind) -> Vec<MessageId> {
        struct Find(RequestKind, Vec<MessageId>);
        impl PacketVisitor for Find {
            fn on_message(
                &mut self,
                header: MessageHeader,
                payload: &mut &[u8],
            ) -> Result<DecodeFlow, PacketError> {
                if let Message::Request(request) = header.decode_message(payload)? {
                    if request.kind() == self.0 {
                        self.1.push(header.id);
                    }
                }
                Ok(DecodeFlow::Continue)
            }
        }

        let mut find = Find(kind, Vec::new());
        for datagram in datagrams {
            packet::decode(datagram, &mut find).unwrap();
        }
        find.1
    }

    #[test]
    fn test_connect_packet_header_bytes() {
        let clock = Arc::new(ManualClock::new());
        let client = peer(1, Side::Initiator, ConnectionConfig::default(), &clock, RecordingHandler::default());
        client.conn.init().unwrap();

        let sent = client.transport.take();
        assert_eq!(sent.len(), 1);
        let bytes = &sent[0];
        assert_eq!(&bytes[0..2], &[0x6E, 0x4C]);
        assert_eq!(&bytes[2..6], &[1, 0, 0, 0]);
        assert_eq!(&bytes[6..10], &[0, 0, 0, 0]);
        assert_eq!(bytes[10], 1);
    }

    #[test]
    fn test_acceptor_init_sends_nothing() {
        let clock = Arc::new(ManualClock::new());
        let server = peer(2, Side::Acceptor, ConnectionConfig::default(), &clock, RecordingHandler::default());
        server.conn.init().unwrap();
        assert!(server.transport.take().is_empty());
        assert_eq!(server.conn.state(), ConnectionState::NothingReceived);
    }

    #[test]
    fn test_handshake_completes() {
        let (_clock, client, server) = handshake_pair(
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            RecordingHandler::default(),
        );

        assert_eq!(client.conn.state(), ConnectionState::Authenticated);
        assert_eq!(server.conn.state(), ConnectionState::Authenticated);
        assert_eq!(client.conn.credentials(), server.conn.credentials());
        assert_eq!(client.conn.credentials().unwrap().user_id, 2);
        assert_eq!(client.conn.outstanding_count(), 0);
    }

    #[test]
    fn test_user_id_wraps_positive() {
        assert_eq!(user_id_for(ConnectionId::new(2)), 2);
        assert_eq!(user_id_for(ConnectionId::new(i32::MAX as u32)), i32::MAX);
        assert_eq!(user_id_for(ConnectionId::new(i32::MAX as u32 + 1)), 1);
        assert_eq!(user_id_for(ConnectionId::new(u32::MAX)), 1);
    }

    #[test]
    fn test_ack_only_flush_confirms_last_response() {
        let (clock, client, server) = handshake_pair(
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            RecordingHandler::default(),
        );
        // The authenticate response is the only thing not yet acked
        assert_eq!(server.conn.outstanding_count(), 1);

        clock.advance(Duration::from_millis(250));
        client.conn.update();
        let sent = client.transport.take();
        assert_eq!(sent.len(), 2, "ack-only packets are written twice");
        assert_eq!(sent[0], sent[1]);
        assert_eq!(&sent[0][0..2], &[0x61, 0x4C]);
        assert_eq!(client.conn.pending_ack_count(), 0);

        server.conn.handle_datagram(&sent[0]);
        assert_eq!(server.conn.outstanding_count(), 0);
    }

    #[test]
    fn test_duplicate_datagram_dispatched_once() {
        let (_clock, client, server) = handshake_pair(
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            RecordingHandler::default(),
        );

        client
            .conn
            .send_request(Request::Custom(Bytes::from_static(b"hi")), Guarantee::ResendOnce)
            .unwrap();
        let sent = client.transport.take();
        assert_eq!(sent.len(), 1);

        server.conn.handle_datagram(&sent[0]);
        server.conn.handle_datagram(&sent[0]);

        assert_eq!(server.handler.requests.lock().len(), 1);
        assert_eq!(server.conn.stats().duplicates_dropped, 1);
    }

    #[test]
    fn test_resent_message_not_redispatched() {
        let (clock, client, server) = handshake_pair(
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            RecordingHandler::default(),
        );

        client
            .conn
            .send_request(Request::Custom(Bytes::from_static(b"x")), Guarantee::Critical)
            .unwrap();
        let first = client.transport.take();
        server.conn.handle_datagram(&first[0]);
        server.transport.take();

        // The ack never arrives, so the client resends under a new packet id
        clock.advance(Duration::from_millis(1001));
        client.conn.update();
        let resent = client.transport.take();
        assert_eq!(requests_of(&resent, RequestKind::Custom).len(), 1);
        assert_ne!(resent[0][2..6], first[0][2..6]);

        server.conn.handle_datagram(&resent[0]);
        assert_eq!(server.handler.requests.lock().len(), 1);
    }

    #[test]
    fn test_critical_loss_closes_connection() {
        let clock = Arc::new(ManualClock::new());
        let client = peer(1, Side::Initiator, ConnectionConfig::default(), &clock, RecordingHandler::default());
        client.conn.init().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let item = client
            .conn
            .send_request(Request::Custom(Bytes::from_static(b"c")), Guarantee::Critical)
            .unwrap();
        let (c, f) = (Arc::clone(&calls), Arc::clone(&failed));
        item.on_complete(move |ok, _| {
            c.fetch_add(1, Ordering::SeqCst);
            if !ok {
                f.fetch_add(1, Ordering::SeqCst);
            }
        });

        let mut sent = client.transport.take();
        for _ in 0..5 {
            clock.advance(Duration::from_millis(1001));
            client.conn.update();
            sent.extend(client.transport.take());
        }

        assert_eq!(requests_of(&sent, RequestKind::Custom).len(), 3);
        assert_eq!(client.conn.state(), ConnectionState::Closed);
        assert_eq!(item.status(), Completion::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert_eq!(*client.transport.close_requests.lock(), vec![ConnectionId::new(1)]);
    }

    #[test]
    fn test_resend_once_fails_without_closing() {
        let clock = Arc::new(ManualClock::new());
        let conn = peer(1, Side::Acceptor, ConnectionConfig::default(), &clock, RecordingHandler::default());

        let item = conn
            .conn
            .send_request(Request::Custom(Bytes::from_static(b"r")), Guarantee::ResendOnce)
            .unwrap();

        let mut sent = conn.transport.take();
        for _ in 0..3 {
            clock.advance(Duration::from_millis(1001));
            conn.conn.update();
            sent.extend(conn.transport.take());
        }

        assert_eq!(requests_of(&sent, RequestKind::Custom).len(), 2);
        assert_eq!(item.status(), Completion::Failed);
        assert_ne!(conn.conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_none_guarantee_is_never_resent() {
        let clock = Arc::new(ManualClock::new());
        let conn = peer(1, Side::Acceptor, ConnectionConfig::default(), &clock, RecordingHandler::default());

        let item = conn
            .conn
            .send_request(Request::Custom(Bytes::new()), Guarantee::None)
            .unwrap();
        conn.transport.take();

        conn.conn.resend_now(&item);
        assert!(conn.transport.take().is_empty());

        clock.advance(Duration::from_millis(1001));
        conn.conn.update();
        assert!(conn.transport.take().is_empty());
        assert_eq!(item.status(), Completion::Failed);
    }

    #[test]
    fn test_resend_now_uses_fresh_packet_id() {
        let clock = Arc::new(ManualClock::new());
        let conn = peer(1, Side::Acceptor, ConnectionConfig::default(), &clock, RecordingHandler::default());

        let item = conn
            .conn
            .send_request(Request::Custom(Bytes::new()), Guarantee::Critical)
            .unwrap();
        let first = conn.transport.take();

        conn.conn.resend_now(&item);
        let second = conn.transport.take();
        assert_eq!(second.len(), 1);
        assert_eq!(&second[0][2..6], &[2, 0, 0, 0]);
        assert_eq!(first[0][11..], second[0][11..]);
        assert_eq!(conn.conn.stats().resends, 1);
    }

    #[test]
    fn test_security_mismatch_closes_both_sides() {
        let server_config = ConnectionConfig {
            encryption: EncryptionMode::Standard,
            ..ConnectionConfig::default()
        };
        let (_clock, client, server) = handshake_pair(
            ConnectionConfig::default(),
            server_config,
            RecordingHandler::default(),
        );

        assert_eq!(client.conn.state(), ConnectionState::Closed);
        assert_eq!(server.conn.state(), ConnectionState::Closed);
        assert_eq!(server.transport.close_requests.lock().len(), 1);
    }

    #[test]
    fn test_request_before_authentication_dropped() {
        let clock = Arc::new(ManualClock::new());
        let server = peer(2, Side::Acceptor, ConnectionConfig::default(), &clock, RecordingHandler::default());

        let frame = packet::encode_message(
            MessageId::new(1),
            &Message::Request(Request::Custom(Bytes::from_static(b"early"))),
        );
        let datagram = packet::encode_packet(1, &AckField::empty(), &[&frame[..]]).unwrap();
        server.conn.handle_datagram(&datagram);

        assert!(server.handler.requests.lock().is_empty());
        assert_eq!(server.conn.state(), ConnectionState::Initial);
    }

    #[test]
    fn test_custom_request_reaches_handler_and_response_matches() {
        let (_clock, client, server) = handshake_pair(
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            RecordingHandler::default(),
        );

        let item = client
            .conn
            .send_request(Request::Custom(Bytes::from_static(b"q")), Guarantee::Critical)
            .unwrap();
        pump(&client, &server);

        let (id, request) = server.handler.requests.lock()[0].clone();
        assert_eq!(request, Request::Custom(Bytes::from_static(b"q")));

        server
            .conn
            .send_response(
                Response::to(id, ResponseBody::Custom(Bytes::from_static(b"a"))),
                Guarantee::Critical,
            )
            .unwrap();
        pump(&client, &server);

        assert!(item.wait());
        assert_eq!(
            item.response().map(|r| r.body),
            Some(ResponseBody::Custom(Bytes::from_static(b"a")))
        );
        // Matched responses do not go to the response-only handler
        assert!(client.handler.responses.lock().is_empty());
    }

    #[test]
    fn test_unsolicited_response_goes_to_handler() {
        let (_clock, client, server) = handshake_pair(
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            RecordingHandler::default(),
        );

        server
            .conn
            .send_response(
                Response::unsolicited(ResponseBody::Custom(Bytes::from_static(b"push"))),
                Guarantee::ResendOnce,
            )
            .unwrap();
        pump(&client, &server);

        let responses = client.handler.responses.lock();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].kind(), ResponseKind::Custom);
    }

    #[test]
    fn test_local_close_notifies_peer() {
        let (_clock, client, server) = handshake_pair(
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            RecordingHandler::default(),
        );

        let pending = client
            .conn
            .send_request(Request::Custom(Bytes::new()), Guarantee::Critical)
            .unwrap();
        client.transport.take();

        client.conn.close();
        client.conn.close();
        assert_eq!(pending.status(), Completion::Failed);
        assert_eq!(client.transport.close_requests.lock().len(), 1);

        pump(&client, &server);
        assert_eq!(server.conn.state(), ConnectionState::Closed);
        assert!(client.conn.send_request(Request::Echo, Guarantee::None).is_err());
    }

    #[test]
    fn test_release_after_remote_close_sends_one_notice() {
        let (_clock, client, server) = handshake_pair(
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            RecordingHandler::default(),
        );

        client.conn.close();
        pump(&client, &server);
        assert_eq!(server.conn.state(), ConnectionState::Closed);

        server.conn.release();
        server.conn.release();
        assert_eq!(server.transport.take().len(), 1);
        assert!(server.conn.is_released());
    }

    #[test]
    fn test_silence_times_out() {
        let clock = Arc::new(ManualClock::new());
        let conn = peer(1, Side::Acceptor, ConnectionConfig::default(), &clock, RecordingHandler::default());
        conn.conn.init().unwrap();

        clock.advance(Duration::from_secs(179));
        conn.conn.update();
        assert_ne!(conn.conn.state(), ConnectionState::Closed);

        clock.advance(Duration::from_secs(2));
        conn.conn.update();
        assert_eq!(conn.conn.state(), ConnectionState::Closed);
        assert_eq!(conn.transport.close_requests.lock().len(), 1);
    }

    #[test]
    fn test_keepalive_after_idle() {
        let (clock, client, server) = handshake_pair(
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            RecordingHandler::default(),
        );
        clock.advance(Duration::from_millis(250));
        client.conn.update();
        server.conn.update();
        pump(&client, &server);

        clock.advance(Duration::from_secs(121));
        server.conn.update();
        assert_eq!(server.conn.outstanding_count(), 1);
        pump(&client, &server);
        assert_ne!(client.conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_restricted_connection_refuses_other_requests() {
        let (_clock, client, server) = {
            let clock = Arc::new(ManualClock::new());
            let client = peer(1, Side::Initiator, ConnectionConfig::default(), &clock, RecordingHandler::default());
            let server = peer(2, Side::Acceptor, ConnectionConfig::default(), &clock, RecordingHandler::default());
            server.conn.set_restriction(Restriction::ReceiveRemoteConsole);
            client.conn.init().unwrap();
            pump(&client, &server);
            (clock, client, server)
        };
        assert_eq!(server.conn.state(), ConnectionState::Authenticated);

        client
            .conn
            .send_request(Request::Custom(Bytes::new()), Guarantee::Critical)
            .unwrap();
        pump(&client, &server);

        assert_eq!(server.conn.state(), ConnectionState::Closed);
        assert!(server.handler.requests.lock().is_empty());
    }

    #[test]
    fn test_restricted_connection_opened_by_console_request() {
        let clock = Arc::new(ManualClock::new());
        let client = peer(1, Side::Initiator, ConnectionConfig::default(), &clock, RecordingHandler::default());
        let server = peer(
            2,
            Side::Acceptor,
            ConnectionConfig::default(),
            &clock,
            RecordingHandler {
                accept_restricted: true,
                ..Default::default()
            },
        );
        server.conn.set_restriction(Restriction::ReceiveRemoteConsole);
        client.conn.init().unwrap();
        pump(&client, &server);

        client
            .conn
            .send_request(Request::RemoteConsoleAccess { session_token: 5 }, Guarantee::Critical)
            .unwrap();
        pump(&client, &server);
        assert_eq!(server.conn.restriction(), Restriction::None);

        client
            .conn
            .send_request(Request::Custom(Bytes::new()), Guarantee::Critical)
            .unwrap();
        pump(&client, &server);
        assert_eq!(server.handler.requests.lock().len(), 1);
        assert_eq!(server.conn.state(), ConnectionState::Authenticated);
    }

    #[test]
    fn test_ping_reports_round_trip() {
        let (clock, client, server) = handshake_pair(
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            RecordingHandler::default(),
        );

        let result = Arc::new(Mutex::new(None));
        let out = Arc::clone(&result);
        client.conn.calculate_ping(
            3,
            0,
            move |ping, fails| *out.lock() = Some((ping, fails)),
            |reason, _| panic!("ping failed: {:?}", reason),
        );

        clock.advance(Duration::from_millis(20));
        pump(&client, &server);
        assert_eq!(*result.lock(), Some((20, 0)));
    }

    #[test]
    fn test_ping_on_closed_connection() {
        let clock = Arc::new(ManualClock::new());
        let conn = peer(1, Side::Initiator, ConnectionConfig::default(), &clock, RecordingHandler::default());
        conn.conn.close();

        let result = Arc::new(Mutex::new(None));
        let out = Arc::clone(&result);
        conn.conn.calculate_ping(
            0,
            0,
            |_, _| panic!("ping should fail"),
            move |reason, fails| *out.lock() = Some((reason, fails)),
        );
        assert_eq!(*result.lock(), Some((PingFailure::ConnectionClosed, 0)));
    }

    #[test]
    fn test_punchthrough_probes_then_connects() {
        let clock = Arc::new(ManualClock::new());
        let client = peer(1, Side::Initiator, ConnectionConfig::default(), &clock, RecordingHandler::default());
        client.conn.start_punchthrough().unwrap();
        assert_eq!(client.conn.state(), ConnectionState::Punchthrough);

        let mut sent = Vec::new();
        for _ in 0..10 {
            clock.advance(Duration::from_millis(100));
            client.conn.update();
            sent.extend(client.transport.take());
        }

        let probes = sent.iter().filter(|d| d[..] == [0x61, 0x4C, 0]).count();
        assert_eq!(probes, 10);
        assert_eq!(requests_of(&sent, RequestKind::Connect).len(), 1);
        assert_eq!(client.conn.state(), ConnectionState::Initial);
    }

    #[test]
    fn test_malformed_datagram_counted() {
        let clock = Arc::new(ManualClock::new());
        let conn = peer(1, Side::Acceptor, ConnectionConfig::default(), &clock, RecordingHandler::default());

        conn.conn.handle_datagram(&[0x6E, 0x4C, 1]);
        conn.conn.handle_datagram(&[0xFF, 0xFF, 0, 0, 0, 0]);

        assert_eq!(conn.conn.stats().malformed_dropped, 2);
        assert_eq!(conn.conn.state(), ConnectionState::NothingReceived);
    }

    #[test]
    fn test_unknown_ack_ignored() {
        let clock = Arc::new(ManualClock::new());
        let conn = peer(1, Side::Acceptor, ConnectionConfig::default(), &clock, RecordingHandler::default());
        let item = conn
            .conn
            .send_request(Request::Custom(Bytes::new()), Guarantee::Critical)
            .unwrap();

        let bogus = packet::encode_ack_only(&[50]).unwrap();
        conn.conn.handle_datagram(&bogus);
        assert_eq!(item.status(), Completion::Waiting);

        let real = packet::encode_ack_only(&[1]).unwrap();
        conn.conn.handle_datagram(&real);
        assert_eq!(item.status(), Completion::Done);
    }
}
