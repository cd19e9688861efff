//! Helpers shared by the integration tests
//!
//! Connections are wired to an in-memory transport and a manual clock, so
//! every exchange is deterministic.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_io::{Clock, ManualClock};
use tether_protocol::packet::{self, DecodeFlow, MessageHeader, PacketError, PacketVisitor};
use tether_protocol::{
    Connection, ConnectionConfig, ConnectionId, Message, MessageHandler, MessageId, Request,
    RequestKind, Response, Side, Transport,
};

#[derive(Default)]
pub struct CaptureTransport {
    pub sent: Mutex<Vec<Vec<u8>>>,
    pub close_requests: Mutex<Vec<ConnectionId>>,
}

impl CaptureTransport {
    pub fn take(&self) -> Vec<Vec<u8>> {
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
pub struct RecordingHandler {
    pub requests: Mutex<Vec<(MessageId, Request)>>,
    pub responses: Mutex<Vec<Response>>,
}

impl MessageHandler for RecordingHandler {
    fn handle_request(&self, _connection: &Arc<Connection>, id: MessageId, request: Request) {
        self.requests.lock().push((id, request));
    }

    fn handle_response_only(&self, _connection: &Arc<Connection>, response: Response) {
        self.responses.lock().push(response);
    }
}

pub struct Peer {
    pub conn: Arc<Connection>,
    pub transport: Arc<CaptureTransport>,
    pub handler: Arc<RecordingHandler>,
}

pub fn peer(id: u32, side: Side, config: ConnectionConfig, clock: &Arc<ManualClock>) -> Peer {
    let transport = Arc::new(CaptureTransport::default());
    let handler = Arc::new(RecordingHandler::default());
    let remote: SocketAddr = format!("127.0.0.1:{}", 5000 + id).parse().unwrap();
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

/// An initiator and an acceptor sharing one clock
pub fn pair() -> (Arc<ManualClock>, Peer, Peer) {
    let clock = Arc::new(ManualClock::new());
    let client = peer(1, Side::Initiator, ConnectionConfig::default(), &clock);
    let server = peer(2, Side::Acceptor, ConnectionConfig::default(), &clock);
    (clock, client, server)
}

/// Deliver traffic in both directions until both sides go quiet
pub fn pump(a: &Peer, b: &Peer) {
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

/// One update tick: advance time, update both sides, then deliver what was
/// in flight at the start of the tick (one hop per tick)
pub fn tick(clock: &ManualClock, a: &Peer, b: &Peer, step: Duration) {
    let from_a = a.transport.take();
    let from_b = b.transport.take();

    clock.advance(step);
    a.conn.update();
    b.conn.update();

    for datagram in from_a {
        b.conn.handle_datagram(&datagram);
    }
    for datagram in from_b {
        a.conn.handle_datagram(&datagram);
    }
}

/// Connect `client` to `server` and run the handshake to completion
pub fn handshake(client: &Peer, server: &Peer) {
    client.conn.init().unwrap();
    server.conn.init().unwrap();
    pump(client, server);
}

/// Message ids of every `kind` request carried by `datagrams`
pub fn requests_of(datagrams: &[Vec<u8>], kind: RequestKind) -> Vec<MessageId> {
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

/// Every message decoded from one datagram, in wire order
pub fn decode_messages(datagram: &[u8]) -> Result<Vec<(MessageId, Message)>, PacketError> {
    struct Collect(Vec<(MessageId, Message)>);

    impl PacketVisitor for Collect {
        fn on_message(
            &mut self,
            header: MessageHeader,
            payload: &mut &[u8],
        ) -> Result<DecodeFlow, PacketError> {
            let message = header.decode_message(payload)?;
            self.0.push((header.id, message));
            Ok(DecodeFlow::Continue)
        }
    }

    let mut collect = Collect(Vec::new());
    packet::decode(datagram, &mut collect)?;
    Ok(collect.0)
}
