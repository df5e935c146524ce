//! End-to-end integration tests.
//!
//! Two nodes on loopback sockets: dial, upgrade (security and multiplexer
//! negotiation), open streams, and run the request/echo exchange, over both
//! plain TCP and WebSocket.

use ferry_core::app::{Exchange, Handler};
use ferry_core::{
    Endpoint, Error, Identity, NegotiationError, Node, NodeConfig, Protocol, ProtocolId,
    SecurityError,
};
use ferry_crypto::handshake::{Initiator, Responder};
use ferry_crypto::signatures::SigningKey;
use ferry_integration_tests::{TwoNodeFixture, WireTransport, upgraded_pair};
use rand_core::OsRng;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

// ============================================================================
// Request / echo exchange
// ============================================================================

async fn assert_hey_echo(transport: WireTransport) {
    let fixture = TwoNodeFixture::new(transport).await.unwrap();
    let (conn, stream) = fixture.dial_app().await.unwrap();
    assert_eq!(conn.remote_peer(), fixture.server.peer_id());
    assert_eq!(
        stream.protocol(),
        Some(&TwoNodeFixture::app_protocol())
    );

    let responses = Exchange::start(stream, b"hey", &fixture.client.config().exchange)
        .await
        .unwrap();
    assert_eq!(responses.collect_all().await.unwrap(), vec![b"hey".to_vec()]);

    conn.close_and_wait().await;
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_hey_echo_over_websocket() {
    assert_hey_echo(WireTransport::WebSocket).await;
}

#[tokio::test]
async fn test_hey_echo_over_tcp() {
    assert_hey_echo(WireTransport::Tcp).await;
}

#[tokio::test]
async fn test_replies_stream_one_at_a_time() {
    let fixture = TwoNodeFixture::new(WireTransport::Tcp).await.unwrap();
    let (_conn, stream) = fixture.dial_app().await.unwrap();

    let mut responses = Exchange::start(stream, b"one", &fixture.client.config().exchange)
        .await
        .unwrap();
    assert_eq!(responses.next().await.unwrap().unwrap(), b"one");
    // Remote half-closed after echoing: the sequence ends and stays ended
    assert!(responses.next().await.is_none());
    assert!(responses.next().await.is_none());
}

#[tokio::test]
async fn test_empty_request_echoed() {
    let fixture = TwoNodeFixture::new(WireTransport::Tcp).await.unwrap();
    let (_conn, stream) = fixture.dial_app().await.unwrap();

    let responses = Exchange::start(stream, b"", &fixture.client.config().exchange)
        .await
        .unwrap();
    assert_eq!(responses.collect_all().await.unwrap(), vec![Vec::<u8>::new()]);
}

#[tokio::test]
async fn test_exchanges_share_one_connection() {
    let fixture = TwoNodeFixture::new(WireTransport::WebSocket).await.unwrap();
    let conn = fixture.dial().await.unwrap();
    let config = fixture.client.config().exchange.clone();

    for i in 0..5u8 {
        let stream = conn
            .open_stream(&TwoNodeFixture::app_protocol())
            .await
            .unwrap();
        let responses = Exchange::start(stream, &[i; 100], &config).await.unwrap();
        assert_eq!(responses.collect_all().await.unwrap(), vec![vec![i; 100]]);
    }
    assert!(!conn.is_closed());
}

// ============================================================================
// Identity
// ============================================================================

#[tokio::test]
async fn test_both_sides_learn_authenticated_identity() {
    let server = Node::new(Identity::generate(), NodeConfig::default()).unwrap();
    let client = Node::new(Identity::generate(), NodeConfig::default()).unwrap();

    let mut listener = server
        .listen(&"/ip4/127.0.0.1/tcp/0/ws".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.p2p_addr();

    let (outbound, inbound) = tokio::join!(client.dial(&addr), listener.accept());
    let (outbound, inbound) = (outbound.unwrap(), inbound.unwrap());

    assert_eq!(outbound.remote_peer(), server.peer_id());
    assert_eq!(inbound.remote_peer(), client.peer_id());
    assert_eq!(outbound.endpoint(), Endpoint::Dialer);
    assert_eq!(inbound.endpoint(), Endpoint::Listener);
    // The dialer reports the address without the peer id suffix
    assert_eq!(outbound.remote_addr(), &listener.local_addr());
}

#[tokio::test]
async fn test_dial_with_wrong_peer_id_rejected() {
    let fixture = TwoNodeFixture::new(WireTransport::Tcp).await.unwrap();
    let impostor = Identity::generate().peer_id();
    let addr = fixture
        .server_addr
        .without_peer_id()
        .with(Protocol::P2p(impostor.to_bytes()));

    let result = fixture.client.dial(&addr).await;
    assert!(matches!(
        result,
        Err(Error::Security(SecurityError::IdentityMismatch { .. }))
    ));
}

#[tokio::test]
async fn test_dial_without_peer_id_accepts_any_identity() {
    let fixture = TwoNodeFixture::new(WireTransport::Tcp).await.unwrap();
    let conn = fixture
        .client
        .dial(&fixture.server_addr.without_peer_id())
        .await
        .unwrap();
    assert_eq!(conn.remote_peer(), fixture.server.peer_id());
}

#[tokio::test]
async fn test_seeded_identities_survive_restart() {
    let seed = [0x5Au8; 32];
    let first = Node::new(Identity::from_seed(&seed), NodeConfig::default()).unwrap();
    let second = Node::new(Identity::from_seed(&seed), NodeConfig::default()).unwrap();
    assert_eq!(first.peer_id(), second.peer_id());
    assert_eq!(first.peer_id().to_string().len(), 64);
}

// ============================================================================
// Stream negotiation
// ============================================================================

#[tokio::test]
async fn test_unsupported_protocol_leaves_connection_usable() {
    let fixture = TwoNodeFixture::new(WireTransport::WebSocket).await.unwrap();
    let conn = fixture.dial().await.unwrap();

    let unknown = ProtocolId::new("/unknown/1.0.0").unwrap();
    let result = conn.open_stream(&unknown).await;
    assert!(matches!(
        result,
        Err(Error::Negotiation(NegotiationError::NoCommonProtocol))
    ));
    assert!(!conn.is_closed());

    let stream = conn
        .open_stream(&TwoNodeFixture::app_protocol())
        .await
        .unwrap();
    let responses = Exchange::start(stream, b"still here", &fixture.client.config().exchange)
        .await
        .unwrap();
    assert_eq!(
        responses.collect_all().await.unwrap(),
        vec![b"still here".to_vec()]
    );
}

#[tokio::test]
async fn test_dialer_falls_back_to_later_proposal() {
    let fixture = TwoNodeFixture::new(WireTransport::Tcp).await.unwrap();
    let conn = fixture.dial().await.unwrap();

    let proposals = [
        ProtocolId::new("/app/2.0.0").unwrap(),
        TwoNodeFixture::app_protocol(),
    ];
    let stream = conn.open_stream_with(&proposals).await.unwrap();
    assert_eq!(stream.protocol(), Some(&TwoNodeFixture::app_protocol()));
}

#[tokio::test]
async fn test_delivered_streams_reach_application() {
    let chat = ProtocolId::new("/chat/1.0.0").unwrap();
    let (tx, mut rx) = mpsc::channel(4);
    let mut server_config = NodeConfig::default();
    server_config
        .protocols
        .insert(chat.clone(), Handler::Deliver(tx));

    let fixture =
        TwoNodeFixture::with_configs(WireTransport::Tcp, server_config, NodeConfig::default())
            .await
            .unwrap();
    let (_conn, mut stream) = fixture
        .client
        .dial_protocol(&fixture.server_addr, &chat)
        .await
        .unwrap();

    stream.write(b"hello").await.unwrap();
    stream.close_write().await.unwrap();

    let mut inbound = rx.recv().await.unwrap();
    assert_eq!(inbound.protocol, chat);
    assert!(!inbound.stream.is_outbound());

    let mut request = Vec::new();
    inbound.stream.read_to_end(&mut request).await.unwrap();
    assert_eq!(request, b"hello");
    inbound.stream.write(b"world").await.unwrap();
    inbound.stream.close().await.unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"world");
}

// ============================================================================
// Ping and identify
// ============================================================================

#[tokio::test]
async fn test_ping_over_websocket() {
    let fixture = TwoNodeFixture::new(WireTransport::WebSocket).await.unwrap();
    let rtts = fixture.client.ping(&fixture.server_addr, 5).await.unwrap();
    assert_eq!(rtts.len(), 5);
}

#[tokio::test]
async fn test_identify_reports_served_protocols() {
    let fixture = TwoNodeFixture::new(WireTransport::Tcp).await.unwrap();
    let info = fixture.client.identify(&fixture.server_addr).await.unwrap();

    assert_eq!(info.peer_id().unwrap(), fixture.server.peer_id());
    assert_eq!(info.protocol_version, ferry_core::DEFAULT_APP_PROTOCOL);
    let app = TwoNodeFixture::app_protocol();
    assert!(info.protocols.iter().any(|p| p == app.as_str()));
    assert_eq!(info.listen_addrs, vec![fixture.server_addr.without_peer_id()]);
}

// ============================================================================
// Crypto / session integration
// ============================================================================

#[test]
fn test_handshake_keys_interoperate() {
    let initiator_key = SigningKey::generate(&mut OsRng);
    let responder_key = SigningKey::generate(&mut OsRng);

    let initiator = Initiator::new(&initiator_key, &mut OsRng);
    let msg1 = initiator.write_message_1();
    let (msg2, awaiting) = Responder::new(&responder_key)
        .read_message_1(&msg1, &mut OsRng)
        .unwrap();
    let (msg3, initiator_outcome) = initiator.read_message_2(&msg2).unwrap();
    let responder_outcome = awaiting.read_message_3(&msg3).unwrap();

    assert_eq!(
        initiator_outcome.remote_identity.to_bytes(),
        responder_key.verifying_key().to_bytes()
    );
    assert_eq!(
        responder_outcome.remote_identity.to_bytes(),
        initiator_key.verifying_key().to_bytes()
    );

    let mut i_send = initiator_outcome.keys.sender();
    let mut r_recv = responder_outcome.keys.receiver();
    let mut r_send = responder_outcome.keys.sender();
    let mut i_recv = initiator_outcome.keys.receiver();

    for n in 0..10u8 {
        let sealed = i_send.seal(&[n; 17], b"").unwrap();
        assert_eq!(r_recv.open(&sealed, b"").unwrap(), vec![n; 17]);
        let sealed = r_send.seal(&[n; 3], b"").unwrap();
        assert_eq!(i_recv.open(&sealed, b"").unwrap(), vec![n; 3]);
    }
}

#[tokio::test]
async fn test_in_memory_upgrade_pair() {
    let dialer = Identity::generate();
    let listener = Identity::generate();
    let (dialer_peer, listener_peer) = (dialer.peer_id(), listener.peer_id());

    let config = NodeConfig::default().with_echo(TwoNodeFixture::app_protocol());
    let (outbound, inbound) = upgraded_pair(dialer, listener, config, |io| io)
        .await
        .unwrap();
    assert_eq!(outbound.remote_peer(), listener_peer);
    assert_eq!(inbound.remote_peer(), dialer_peer);

    let server = tokio::spawn(async move {
        let accepted = inbound.accept_stream().await.unwrap();
        assert_eq!(accepted.protocol, TwoNodeFixture::app_protocol());
        let echoed =
            ferry_core::app::serve_echo(accepted.stream, &NodeConfig::default().exchange)
                .await
                .unwrap();
        assert_eq!(echoed, 1);
        inbound
    });

    let stream = outbound
        .open_stream(&TwoNodeFixture::app_protocol())
        .await
        .unwrap();
    let responses = Exchange::start(stream, b"hey", &NodeConfig::default().exchange)
        .await
        .unwrap();
    assert_eq!(responses.collect_all().await.unwrap(), vec![b"hey".to_vec()]);
    let _inbound = server.await.unwrap();
}
