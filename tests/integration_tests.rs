//! End-to-end tunnel tests over the in-memory network.
//!
//! Covers payload delivery in both directions, idle keepalives, peer
//! binding and shutdown, plus the ICMP traffic a client puts on the wire.

use icmptun_core::frame;
use icmptun_core::{
    ClientSession, MAX_TUNNEL_PAYLOAD, PacketConn, ServerSession, ServerState, SessionError,
};
use icmptun_integration_tests::{
    CLIENT_ADDR, SERVER_ADDR, client_with_raw_peer, fast_client_config, fast_server_config,
    stays_pending, tunnel, within,
};
use icmptun_transport::{EchoKind, EchoPacket, MemoryNetwork, Transport};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

const QUIET: Duration = Duration::from_millis(300);

/// Wait until the server has bound a peer
async fn bound(server: &ServerSession) {
    within(async {
        while server.state() != ServerState::Bound {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

/// Receive the next datagram addressed to a bare transport
async fn next_request(peer: &dyn Transport) -> (Vec<u8>, IpAddr) {
    let mut buf = vec![0u8; 2048];
    let (len, from) = within(peer.recv_from(&mut buf)).await.unwrap();
    buf.truncate(len);
    (buf, from)
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_ping_delivered_exactly_once() {
    let (client, server) = tunnel();

    client.enqueue(b"ping".to_vec()).await.unwrap();
    assert_eq!(within(server.dequeue()).await.unwrap(), b"ping");

    assert!(stays_pending(server.dequeue(), QUIET).await);
    assert_eq!(server.stats().payloads_delivered, 1);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_round_trip_both_directions() {
    let (client, server) = tunnel();

    for i in 0..10u8 {
        client.enqueue(vec![i; 32]).await.unwrap();
    }
    for i in 0..10u8 {
        assert_eq!(within(server.dequeue()).await.unwrap(), vec![i; 32]);
    }

    for i in 0..5u8 {
        server.enqueue(format!("reply-{}", i).into_bytes()).await.unwrap();
    }
    for i in 0..5u8 {
        assert_eq!(
            within(client.dequeue()).await.unwrap(),
            format!("reply-{}", i).into_bytes()
        );
    }

    assert_eq!(server.identify(), Some(client.identify()));
    assert_eq!(server.peer().map(|peer| peer.addr), Some(CLIENT_ADDR));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_large_payload_crosses_tunnel() {
    let (client, server) = tunnel();
    let payload: Vec<u8> = (0..1400u32).map(|i| (i % 251) as u8).collect();

    client.enqueue(payload.clone()).await.unwrap();
    assert_eq!(within(server.dequeue()).await.unwrap(), payload);

    server.enqueue(payload.clone()).await.unwrap();
    assert_eq!(within(client.dequeue()).await.unwrap(), payload);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_datagram_sized_payload_limit() {
    let (client, server) = tunnel();

    // One byte over: rejected up front, session stays usable
    for session in [&client as &dyn PacketConn, &server] {
        let err = session
            .enqueue(vec![0u8; MAX_TUNNEL_PAYLOAD + 1])
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::PayloadTooLarge(65505)));
        assert!(!session.is_closed());
    }

    // Exactly at the limit: crosses in both directions
    let payload: Vec<u8> = (0..MAX_TUNNEL_PAYLOAD).map(|i| (i % 253) as u8).collect();
    client.enqueue(payload.clone()).await.unwrap();
    assert_eq!(within(server.dequeue()).await.unwrap(), payload);

    server.enqueue(payload.clone()).await.unwrap();
    assert_eq!(within(client.dequeue()).await.unwrap(), payload);

    client.enqueue(b"still open".to_vec()).await.unwrap();
    assert_eq!(within(server.dequeue()).await.unwrap(), b"still open");
    assert!(!client.is_closed());
    assert!(!server.is_closed());

    client.close().await;
    server.close().await;
}

// ============================================================================
// Idle behaviour
// ============================================================================

#[tokio::test]
async fn test_idle_tunnel_sends_only_keepalives() {
    let (client, server) = tunnel();

    tokio::time::sleep(QUIET).await;

    let stats = client.stats();
    assert!(stats.keepalives_sent >= 2);
    assert_eq!(stats.datagrams_sent, stats.keepalives_sent);
    assert_eq!(server.stats().payloads_delivered, 0);
    assert_eq!(server.state(), ServerState::Bound);
    assert!(stays_pending(server.dequeue(), Duration::from_millis(100)).await);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_server_waits_for_first_request() {
    let network = MemoryNetwork::new();
    let server_side = network.attach(SERVER_ADDR).unwrap();
    let server = ServerSession::accept_on(
        Arc::new(server_side),
        Ipv4Addr::UNSPECIFIED,
        fast_server_config(),
    )
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.state(), ServerState::AwaitingPeer);
    assert_eq!(server.peer(), None);

    // Queued before any client exists, sent once one binds.
    server.enqueue(b"early".to_vec()).await.unwrap();

    let client_side = network.attach(CLIENT_ADDR).unwrap();
    let client =
        ClientSession::connect(Arc::new(client_side), SERVER_ADDR, fast_client_config()).unwrap();

    assert_eq!(within(client.dequeue()).await.unwrap(), b"early");

    client.close().await;
    server.close().await;
}

// ============================================================================
// Peer binding
// ============================================================================

#[tokio::test]
async fn test_server_ignores_second_client() {
    let network = MemoryNetwork::new();
    let server_side = network.attach(SERVER_ADDR).unwrap();
    let server = ServerSession::accept_on(
        Arc::new(server_side),
        Ipv4Addr::UNSPECIFIED,
        fast_server_config(),
    )
    .unwrap();

    let first = ClientSession::connect(
        Arc::new(network.attach(CLIENT_ADDR).unwrap()),
        SERVER_ADDR,
        fast_client_config(),
    )
    .unwrap();
    bound(&server).await;

    let intruder_addr = Ipv4Addr::new(10, 8, 0, 99);
    let intruder = ClientSession::connect(
        Arc::new(network.attach(intruder_addr).unwrap()),
        SERVER_ADDR,
        icmptun_core::ClientConfig {
            identify: Some(0x0bad),
            ..fast_client_config()
        },
    )
    .unwrap();

    intruder.enqueue(b"intruder".to_vec()).await.unwrap();
    first.enqueue(b"legit".to_vec()).await.unwrap();

    assert_eq!(within(server.dequeue()).await.unwrap(), b"legit");
    assert!(stays_pending(server.dequeue(), QUIET).await);
    assert!(server.stats().discarded >= 1);
    assert_eq!(server.peer().map(|peer| peer.addr), Some(CLIENT_ADDR));

    first.close().await;
    intruder.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_server_filter_selects_client() {
    let network = MemoryNetwork::new();
    let wanted_addr = Ipv4Addr::new(10, 8, 0, 7);
    let server = ServerSession::accept_on(
        Arc::new(network.attach(SERVER_ADDR).unwrap()),
        wanted_addr,
        fast_server_config(),
    )
    .unwrap();

    let stranger = ClientSession::connect(
        Arc::new(network.attach(CLIENT_ADDR).unwrap()),
        SERVER_ADDR,
        fast_client_config(),
    )
    .unwrap();
    stranger.enqueue(b"stranger".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.state(), ServerState::AwaitingPeer);

    let wanted = ClientSession::connect(
        Arc::new(network.attach(wanted_addr).unwrap()),
        SERVER_ADDR,
        fast_client_config(),
    )
    .unwrap();
    wanted.enqueue(b"wanted".to_vec()).await.unwrap();

    assert_eq!(within(server.dequeue()).await.unwrap(), b"wanted");
    assert_eq!(server.peer().map(|peer| peer.addr), Some(wanted_addr));

    stranger.close().await;
    wanted.close().await;
    server.close().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_close_unblocks_dequeue() {
    let (client, server) = tunnel();
    let client = Arc::new(client);
    let server = Arc::new(server);

    let client_wait = {
        let client = client.clone();
        tokio::spawn(async move { client.dequeue().await })
    };
    let server_wait = {
        let server = server.clone();
        tokio::spawn(async move { server.dequeue().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.close().await;
    server.close().await;

    assert!(within(client_wait).await.unwrap().unwrap_err().is_closed());
    assert!(within(server_wait).await.unwrap().unwrap_err().is_closed());

    assert!(client.enqueue(b"late".to_vec()).await.unwrap_err().is_closed());
    assert!(server.enqueue(b"late".to_vec()).await.unwrap_err().is_closed());
    assert_eq!(server.state(), ServerState::Closed);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (client, server) = tunnel();

    client.close().await;
    client.close().await;
    within(client.closed()).await;
    assert!(client.is_closed());

    server.close().await;
    server.close().await;
    within(server.closed()).await;
    assert!(server.is_closed());
}

#[tokio::test]
async fn test_sessions_usable_as_packet_conn() {
    let (client, server) = tunnel();
    let client: Arc<dyn PacketConn> = Arc::new(client);
    let server: Arc<dyn PacketConn> = Arc::new(server);

    client.enqueue(b"dyn".to_vec()).await.unwrap();
    assert_eq!(within(server.dequeue()).await.unwrap(), b"dyn");

    client.close().await;
    server.close().await;
    assert!(client.is_closed());
    assert!(server.is_closed());
}

// ============================================================================
// Wire format
// ============================================================================

#[tokio::test]
async fn test_client_wire_traffic() {
    let (client, peer) = client_with_raw_peer();

    // Idle: keepalive frames in echo requests with consecutive sequences.
    let (first, from) = next_request(&peer).await;
    assert_eq!(from, IpAddr::V4(CLIENT_ADDR));
    let first = EchoPacket::parse(&first).unwrap();
    assert_eq!(first.kind, EchoKind::Request);
    assert_eq!(first.identifier, client.identify());
    assert_eq!(first.data, &[0x02, 0x00, 0x00]);

    let (second, _) = next_request(&peer).await;
    let second = EchoPacket::parse(&second).unwrap();
    assert_eq!(second.sequence, first.sequence.wrapping_add(1));

    // Data frame carries the payload after the three byte header.
    client.enqueue(b"abc".to_vec()).await.unwrap();
    let data = within(async {
        loop {
            let (bytes, _) = next_request(&peer).await;
            let packet = EchoPacket::parse(&bytes).unwrap();
            let frame = frame::decode(packet.data).unwrap();
            if !frame.is_keepalive() {
                break packet.data.to_vec();
            }
        }
    })
    .await;
    assert_eq!(data, [0x00, 0x00, 0x03, b'a', b'b', b'c']);

    // A reply on our identifier is delivered, one on another is not.
    let stray = frame::encode(Default::default(), b"stray").unwrap();
    let bytes = EchoPacket::reply(client.identify().wrapping_add(1), 7, &stray).encode();
    peer.send_to(&bytes, IpAddr::V4(CLIENT_ADDR)).await.unwrap();

    let reply = frame::encode(Default::default(), b"pong").unwrap();
    let bytes = EchoPacket::reply(client.identify(), 8, &reply).encode();
    peer.send_to(&bytes, IpAddr::V4(CLIENT_ADDR)).await.unwrap();

    assert_eq!(within(client.dequeue()).await.unwrap(), b"pong");
    assert_eq!(client.peer_sequence(), 8);
    assert!(client.stats().discarded >= 1);

    client.close().await;
}

// ============================================================================
// Keepalive pacing
// ============================================================================

/// Count echo requests arriving at a bare transport during `window`
async fn count_requests(peer: &dyn Transport, window: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + window;
    let mut buf = vec![0u8; 2048];
    let mut count = 0;
    while let Ok(received) = tokio::time::timeout_at(deadline, peer.recv_from(&mut buf)).await {
        let (len, _) = received.unwrap();
        if let Ok(packet) = EchoPacket::parse(&buf[..len]) {
            if packet.kind == EchoKind::Request {
                count += 1;
            }
        }
    }
    count
}

#[tokio::test]
async fn test_keepalive_cadence_follows_booster() {
    let network = MemoryNetwork::new();
    let client_side = network.attach(CLIENT_ADDR).unwrap();
    let peer = network.attach(SERVER_ADDR).unwrap();
    let client = ClientSession::connect(
        Arc::new(client_side),
        SERVER_ADDR,
        icmptun_core::ClientConfig {
            max_air_seq: Some(8),
            ..fast_client_config()
        },
    )
    .unwrap();
    let window = Duration::from_millis(400);

    // Idle: one keepalive per 40ms boost period
    let idle = count_requests(&peer, window).await;
    assert_eq!(client.air_sequence(), 1);
    assert!(idle <= 14, "idle cadence too high: {}", idle);

    // A steady stream of replies drives the air count to its maximum
    let flood = {
        let peer = peer.clone();
        let identify = client.identify();
        tokio::spawn(async move {
            let keepalive = frame::Frame::keepalive().encode().unwrap();
            let mut seq = 0u16;
            loop {
                seq = seq.wrapping_add(1);
                let reply = EchoPacket::reply(identify, seq, &keepalive).encode();
                if peer.send_to(&reply, IpAddr::V4(CLIENT_ADDR)).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };
    within(async {
        while client.air_sequence() < 8 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    // Eight keepalives per boost period once the writer has been rearmed
    let boosted = count_requests(&peer, window).await;
    assert!(
        boosted >= idle * 3,
        "cadence did not rise: {} idle vs {} boosted",
        idle,
        boosted
    );
    let stats = client.stats();
    assert_eq!(stats.datagrams_sent, stats.keepalives_sent);

    flood.abort();
    client.close().await;
}
