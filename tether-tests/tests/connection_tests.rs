//! End-to-end connection tests
//!
//! Two connections exchange datagrams through in-memory transports while a
//! manual clock stands in for time.

mod common;

use bytes::Bytes;
use common::{decode_messages, handshake, pair, pump, requests_of, tick};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::{
    Completion, ConnectionError, ConnectionId, ConnectionState, Guarantee, Message, Request,
    RequestKind, Response, ResponseBody,
};

#[test]
fn test_handshake_over_update_ticks() {
    let (clock, client, server) = pair();
    client.conn.init().unwrap();
    server.conn.init().unwrap();

    let mut ticks = 0;
    while !(client.conn.is_authenticated() && server.conn.is_authenticated()) {
        assert!(ticks < 8, "handshake did not finish");
        tick(&clock, &client, &server, Duration::from_millis(50));
        ticks += 1;
    }

    // Connect, Security and Authenticate each take one round trip
    assert_eq!(ticks, 6);

    let client_credentials = client.conn.credentials().unwrap();
    let server_credentials = server.conn.credentials().unwrap();
    assert_eq!(client_credentials, server_credentials);
    assert_eq!(server_credentials.user_id, 2);
}

#[test]
fn test_handshake_survives_lost_connect_response() {
    let (clock, client, server) = pair();
    client.conn.init().unwrap();
    server.conn.init().unwrap();

    for datagram in client.transport.take() {
        server.conn.handle_datagram(&datagram);
    }
    let dropped = server.transport.take();
    let replies: Vec<Message> = dropped
        .iter()
        .flat_map(|datagram| decode_messages(datagram).unwrap())
        .map(|(_, message)| message)
        .collect();
    assert!(replies.iter().any(|message| matches!(
        message,
        Message::Response(Response {
            body: ResponseBody::Connect { .. },
            ..
        })
    )));

    let mut ticks = 0;
    while !(client.conn.is_authenticated() && server.conn.is_authenticated()) {
        assert!(ticks < 40, "handshake did not recover");
        tick(&clock, &client, &server, Duration::from_millis(250));
        ticks += 1;
    }

    assert!(server.conn.stats().resends >= 1);
    assert_eq!(client.conn.credentials(), server.conn.credentials());
    assert!(server.handler.requests.lock().is_empty());
}

#[test]
fn test_lost_transmission_recovered_by_resend() {
    let (clock, client, server) = pair();
    handshake(&client, &server);

    let item = client
        .conn
        .send_request(Request::Custom(Bytes::from_static(b"again")), Guarantee::ResendOnce)
        .unwrap();
    let dropped = client.transport.take();
    assert_eq!(requests_of(&dropped, RequestKind::Custom).len(), 1);

    clock.advance(Duration::from_millis(1001));
    client.conn.update();
    let resent = client.transport.take();
    assert_eq!(
        requests_of(&resent, RequestKind::Custom),
        requests_of(&dropped, RequestKind::Custom)
    );
    assert_eq!(client.conn.stats().resends, 1);

    for datagram in &resent {
        server.conn.handle_datagram(datagram);
    }
    assert_eq!(server.handler.requests.lock().len(), 1);

    // The acceptor acknowledges on its next update
    clock.advance(Duration::from_millis(250));
    server.conn.update();
    client.conn.update();
    pump(&client, &server);

    assert_eq!(item.status(), Completion::Done);
    assert_eq!(server.handler.requests.lock().len(), 1);
    assert!(client.conn.is_authenticated());
}

#[test]
fn test_unanswered_connect_closes_after_three_tries() {
    let (clock, client, _server) = pair();
    client.conn.init().unwrap();

    let mut lost = client.transport.take();
    for _ in 0..3 {
        clock.advance(Duration::from_millis(1001));
        client.conn.update();
        lost.extend(client.transport.take());
    }

    assert_eq!(requests_of(&lost, RequestKind::Connect).len(), 3);
    assert_eq!(client.conn.state(), ConnectionState::Closed);
    assert!(client.conn.credentials().is_none());
    assert_eq!(
        *client.transport.close_requests.lock(),
        vec![ConnectionId::new(1)]
    );
}

#[test]
fn test_ping_over_varied_round_trips() {
    let (clock, client, server) = pair();
    handshake(&client, &server);

    let result = Arc::new(Mutex::new(None));
    {
        let ok = Arc::clone(&result);
        let failed = Arc::clone(&result);
        client.conn.calculate_ping(
            3,
            0,
            move |ping, failures| *ok.lock() = Some(Ok((ping, failures))),
            move |reason, failures| *failed.lock() = Some(Err((reason, failures))),
        );
    }

    let echoes = client.transport.take();
    assert_eq!(requests_of(&echoes, RequestKind::Echo).len(), 3);

    // Each echo is answered 10ms later than the previous one
    for echo in &echoes {
        server.conn.handle_datagram(echo);
        clock.advance(Duration::from_millis(10));
        for reply in server.transport.take() {
            client.conn.handle_datagram(&reply);
        }
    }

    // round(20 + 0.7 × 8.165)
    assert_eq!(*result.lock(), Some(Ok((26, 0))));
}

#[test]
fn test_close_propagates_to_peer() {
    let (_clock, client, server) = pair();
    handshake(&client, &server);

    let pending = server
        .conn
        .send_request(Request::Custom(Bytes::from_static(b"late")), Guarantee::Critical)
        .unwrap();
    server.transport.take();

    client.conn.close();
    assert_eq!(client.conn.state(), ConnectionState::Closed);
    pump(&client, &server);

    assert_eq!(server.conn.state(), ConnectionState::Closed);
    assert_eq!(pending.status(), Completion::Failed);
    assert_eq!(
        *server.transport.close_requests.lock(),
        vec![ConnectionId::new(2)]
    );
    assert_eq!(
        *client.transport.close_requests.lock(),
        vec![ConnectionId::new(1)]
    );
    assert!(matches!(
        server.conn.send_request(Request::Echo, Guarantee::None),
        Err(ConnectionError::Closed)
    ));
}
