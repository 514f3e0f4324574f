//! Integration tests for Courier Tunnel
//!
//! Exercises the full flow: key negotiation, sealed packet dispatch,
//! chunk reorder/reassembly, TCP tunnels against a real localhost echo
//! server, HTTP exchanges against a real localhost HTTP server, and the
//! command/authorization paths.

use async_trait::async_trait;
use bytes::Bytes;
use courier_tunnel::accumulator::{Accumulator, AccumulatorConfig};
use courier_tunnel::auth::Authorize;
use courier_tunnel::crypto::{negotiate, KeyPair, PublicKeyAnnouncement, Sealed, Secret};
use courier_tunnel::packet::{InboundPacket, OutboundPacket};
use courier_tunnel::session::{split_chunks, Multiplexer, MuxConfig};
use courier_tunnel::storage::Credentials;
use courier_tunnel::transport::{
    ChatTransport, Contact, IncomingMessage, LoginInfo, Profile, TransportError, TransportEvent,
};
use courier_tunnel::FINAL_CHUNK;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const CHAT: i64 = 10;
const AUTHORIZED_SENDER: i64 = 111;

/// Transport stub capturing every outbound message.
struct MockTransport {
    sent: mpsc::UnboundedSender<(i64, String)>,
    acks: AtomicUsize,
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TransportError> {
        self.sent
            .send((chat_id, text.to_string()))
            .map_err(|_| TransportError::NotConnected)
    }

    async fn ack_seen(
        &self,
        _seq: i64,
        _chat_id: i64,
        _message_id: &str,
    ) -> Result<(), TransportError> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reopen(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn present_device(&self, _device_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn request_code(&self, _phone: &str) -> Result<String, TransportError> {
        Ok("verify".to_string())
    }

    async fn present_code(
        &self,
        _verify_token: &str,
        _code: &str,
    ) -> Result<Option<String>, TransportError> {
        Ok(Some("token".to_string()))
    }

    async fn present_token(&self, _token: &str) -> Result<LoginInfo, TransportError> {
        Ok(LoginInfo {
            profile: Profile {
                contact: Contact {
                    id: 1,
                    names: vec![],
                },
            },
            chats: vec![],
        })
    }
}

struct FixedList(HashSet<i64>);

impl Authorize for FixedList {
    fn is_authorized(&self, sender: i64) -> bool {
        self.0.contains(&sender)
    }
}

struct Harness {
    events: mpsc::Sender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<(i64, String)>,
    transport: Arc<MockTransport>,
}

/// Spin up a multiplexer wired to the mock transport, with tight timing so
/// tests finish quickly.
fn start_mux(authorized: &[i64]) -> Harness {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(MockTransport {
        sent: sent_tx,
        acks: AtomicUsize::new(0),
    });
    let (events_tx, events_rx) = mpsc::channel(64);

    let config = MuxConfig {
        debounce: Duration::from_millis(30),
        send_spacing: Duration::from_millis(1),
        idle_timeout: Duration::from_secs(60),
        reap_interval: Duration::from_secs(3600),
        ..MuxConfig::default()
    };
    let mux = Multiplexer::new(
        transport.clone(),
        Arc::new(FixedList(authorized.iter().copied().collect())),
        Credentials {
            device_id: "test-device".to_string(),
            token: "test-token".to_string(),
        },
        config,
    )
    .expect("failed to build multiplexer");

    tokio::spawn(mux.run(events_rx));

    Harness {
        events: events_tx,
        outbound: sent_rx,
        transport,
    }
}

impl Harness {
    async fn deliver(&self, sender: i64, text: String) {
        self.events
            .send(TransportEvent::Message(IncomingMessage {
                seq: 1,
                chat_id: CHAT,
                message_id: "msg".to_string(),
                sender,
                text,
            }))
            .await
            .expect("mux is gone");
    }

    async fn next_outbound(&mut self) -> (i64, String) {
        timeout(Duration::from_secs(10), self.outbound.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("outbound channel closed")
    }

    /// Announce a peer key and complete the agreement from the peer's side.
    async fn negotiate_peer(&mut self) -> Secret {
        let peer = KeyPair::generate().unwrap();
        let announcement = peer.announcement();
        self.deliver(
            AUTHORIZED_SENDER,
            InboundPacket::Key {
                key: announcement.to_json(),
            }
            .encode(),
        )
        .await;

        let (chat, reply) = self.next_outbound().await;
        assert_eq!(chat, CHAT);
        let host_key = match OutboundPacket::decode(&reply).unwrap() {
            OutboundPacket::Key { key } => PublicKeyAnnouncement::from_json(&key).unwrap(),
            other => panic!("expected key reply, got {:?}", other),
        };
        negotiate(peer, &host_key).unwrap()
    }

    fn seal(&self, secret: &Secret, packet: &InboundPacket) -> String {
        secret.seal(packet.encode().as_bytes()).unwrap().encode()
    }

    fn open(&self, secret: &Secret, text: &str) -> OutboundPacket {
        let sealed = Sealed::decode(text).unwrap();
        let plaintext = secret.open(&sealed).unwrap();
        OutboundPacket::decode(std::str::from_utf8(&plaintext).unwrap()).unwrap()
    }
}

/// Accumulator delivers out-of-order adds in ascending sequence order.
#[tokio::test]
async fn test_accumulator_reorders_within_window() {
    let (tx, mut rx) = mpsc::channel(16);
    let acc = Accumulator::spawn(
        AccumulatorConfig {
            debounce: Duration::from_millis(150),
            spacing: None,
        },
        tx,
    );

    acc.add(3, "c");
    acc.add(1, "a");
    acc.add(2, "b");

    let mut delivered = Vec::new();
    for _ in 0..3 {
        delivered.push(rx.recv().await.unwrap());
    }
    assert_eq!(delivered, vec![(1, "a"), (2, "b"), (3, "c")]);
}

/// Adds spaced inside the window defer the flush; once additions stop,
/// exactly one flush delivers everything.
#[tokio::test]
async fn test_accumulator_debounce_defers_then_flushes_once() {
    let (tx, mut rx) = mpsc::channel(16);
    let acc = Accumulator::spawn(
        AccumulatorConfig {
            debounce: Duration::from_millis(300),
            spacing: None,
        },
        tx,
    );

    for seq in 0..4u32 {
        acc.add(seq, seq);
        sleep(Duration::from_millis(100)).await;
        assert!(
            rx.try_recv().is_err(),
            "flush fired while producer was still active"
        );
    }

    // Producer went quiet: a single flush delivers the whole batch.
    sleep(Duration::from_millis(600)).await;
    let mut delivered = Vec::new();
    while let Ok(item) = rx.try_recv() {
        delivered.push(item);
    }
    assert_eq!(delivered, vec![(0, 0), (1, 1), (2, 2), (3, 3)]);
}

/// A 4000-byte payload splits 1500/1500/1000 and reassembles byte-identical
/// through the inbound accumulator even when chunks arrive shuffled.
#[tokio::test]
async fn test_chunk_split_and_reassembly() {
    let payload: Vec<u8> = (0..4000u32).map(|i| (i % 256) as u8).collect();
    let chunks = split_chunks(&Bytes::from(payload.clone()), 1500);
    assert_eq!(
        chunks.iter().map(|c| c.len()).collect::<Vec<_>>(),
        vec![1500, 1500, 1000]
    );

    let (tx, mut rx) = mpsc::channel(16);
    let acc = Accumulator::spawn(
        AccumulatorConfig {
            debounce: Duration::from_millis(50),
            spacing: None,
        },
        tx,
    );

    // Arrival order 2, 0, 1
    acc.add(2, chunks[2].clone());
    acc.add(0, chunks[0].clone());
    acc.add(1, chunks[1].clone());

    let mut rebuilt = Vec::new();
    let mut expected_seq = 0;
    for _ in 0..3 {
        let (seq, data) = rx.recv().await.unwrap();
        assert_eq!(seq, expected_seq);
        expected_seq += 1;
        rebuilt.extend_from_slice(&data);
    }
    assert_eq!(rebuilt, payload);
}

/// Unauthorized senders are ignored entirely: no ack, no reply, no session.
#[tokio::test]
async fn test_unauthorized_sender_is_silent() {
    let mut harness = start_mux(&[AUTHORIZED_SENDER, 222]);

    harness.deliver(999, "/id".to_string()).await;
    let peer = KeyPair::generate().unwrap();
    harness
        .deliver(
            999,
            InboundPacket::Key {
                key: peer.announcement().to_json(),
            }
            .encode(),
        )
        .await;

    sleep(Duration::from_millis(300)).await;
    assert!(harness.outbound.try_recv().is_err());
    assert_eq!(harness.transport.acks.load(Ordering::SeqCst), 0);
}

/// The command token answers with the sender's own identifier.
#[tokio::test]
async fn test_id_command_replies_with_sender() {
    let mut harness = start_mux(&[AUTHORIZED_SENDER]);

    harness
        .deliver(AUTHORIZED_SENDER, "/id".to_string())
        .await;

    let (chat, text) = harness.next_outbound().await;
    assert_eq!(chat, CHAT);
    assert_eq!(text, "111");
    assert!(harness.transport.acks.load(Ordering::SeqCst) >= 1);
}

/// Sealed traffic before any key negotiation is dropped without a reply.
#[tokio::test]
async fn test_sealed_before_key_is_dropped() {
    let mut harness = start_mux(&[AUTHORIZED_SENDER]);

    harness
        .deliver(AUTHORIZED_SENDER, "sabcde~fghij".to_string())
        .await;

    sleep(Duration::from_millis(200)).await;
    assert!(harness.outbound.try_recv().is_err());
}

/// Full TCP tunnel: key negotiation, encInit + encData against a localhost
/// echo server, terminal propagation both ways, late chunks ignored.
#[tokio::test]
async fn test_tcp_tunnel_echo_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = sock.split();
        // Echo until the tunnel shuts our read side down.
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    });

    let mut harness = start_mux(&[AUTHORIZED_SENDER]);
    let secret = harness.negotiate_peer().await;

    let reqseq = 1;
    let open = InboundPacket::EncInit {
        reqseq,
        host: format!("127.0.0.1:{}", addr.port()),
        data: Bytes::from_static(b"hello "),
    };
    let sealed_open = harness.seal(&secret, &open);
    harness.deliver(AUTHORIZED_SENDER, sealed_open).await;

    let chunk = InboundPacket::EncData {
        reqseq,
        datseq: 0,
        data: Bytes::from_static(b"world"),
    };
    let sealed_chunk = harness.seal(&secret, &chunk);
    harness.deliver(AUTHORIZED_SENDER, sealed_chunk).await;

    let terminal = InboundPacket::EncData {
        reqseq,
        datseq: FINAL_CHUNK,
        data: Bytes::new(),
    };
    let sealed_terminal = harness.seal(&secret, &terminal);
    harness.deliver(AUTHORIZED_SENDER, sealed_terminal).await;

    // Collect echoed chunks until the terminal marker comes back.
    let mut echoed: Vec<(u32, Bytes)> = Vec::new();
    loop {
        let (_, text) = harness.next_outbound().await;
        match harness.open(&secret, &text) {
            OutboundPacket::EncData { datseq, data, .. } if datseq == FINAL_CHUNK => {
                assert!(data.is_empty());
                break;
            }
            OutboundPacket::EncData { datseq, data, .. } => echoed.push((datseq, data)),
            other => panic!("unexpected outbound packet: {:?}", other),
        }
    }

    echoed.sort_by_key(|(datseq, _)| *datseq);
    let rebuilt: Vec<u8> = echoed.iter().flat_map(|(_, data)| data.to_vec()).collect();
    assert_eq!(rebuilt, b"hello world");

    // A chunk arriving after the terminal marker is ignored outright.
    let late = InboundPacket::EncData {
        reqseq,
        datseq: 1,
        data: Bytes::from_static(b"late"),
    };
    let sealed_late = harness.seal(&secret, &late);
    harness.deliver(AUTHORIZED_SENDER, sealed_late).await;
    sleep(Duration::from_millis(300)).await;
    assert!(harness.outbound.try_recv().is_err());
}

/// Full HTTP exchange: req against a localhost HTTP server, response head
/// forwarded immediately, body streamed as resData, then the terminal chunk.
#[tokio::test]
async fn test_http_exchange_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let mut request = Vec::new();
        loop {
            let n = sock.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);
            if request.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        sock.write_all(
            b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello",
        )
        .await
        .unwrap();
        let _ = sock.shutdown().await;
    });

    let mut harness = start_mux(&[AUTHORIZED_SENDER]);
    let secret = harness.negotiate_peer().await;

    let reqseq = 2;
    let req = InboundPacket::Req {
        reqseq,
        hostname: "127.0.0.1".to_string(),
        port: addr.port(),
        path: "/".to_string(),
        method: "GET".to_string(),
        headers: vec![("accept".to_string(), "*/*".to_string())],
        body: Bytes::new(),
    };
    let sealed_req = harness.seal(&secret, &req);
    harness.deliver(AUTHORIZED_SENDER, sealed_req).await;

    // Response head arrives first, body empty.
    let (_, text) = harness.next_outbound().await;
    match harness.open(&secret, &text) {
        OutboundPacket::Res {
            reqseq: rs,
            status,
            status_text,
            body,
            ..
        } => {
            assert_eq!(rs, reqseq);
            assert_eq!(status, 200);
            assert_eq!(status_text, "OK");
            assert!(body.is_empty());
        }
        other => panic!("expected response head, got {:?}", other),
    }

    // Then the body chunks, then the terminal marker.
    let mut body = Vec::new();
    loop {
        let (_, text) = harness.next_outbound().await;
        match harness.open(&secret, &text) {
            OutboundPacket::ResData { datseq, data, .. } if datseq == FINAL_CHUNK => {
                assert!(data.is_empty());
                break;
            }
            OutboundPacket::ResData { data, .. } => body.extend_from_slice(&data),
            other => panic!("unexpected outbound packet: {:?}", other),
        }
    }
    assert_eq!(body, b"hello");
}

/// Re-keying mid-conversation replaces the secret: traffic sealed with the
/// new key flows, traffic sealed with the old key is dropped.
#[tokio::test]
async fn test_rekey_replaces_secret() {
    let mut harness = start_mux(&[AUTHORIZED_SENDER]);
    let old_secret = harness.negotiate_peer().await;
    let new_secret = harness.negotiate_peer().await;

    // Sealed with the replaced key: dropped silently.
    let stale = harness.seal(
        &old_secret,
        &InboundPacket::EncInit {
            reqseq: 9,
            host: "127.0.0.1:1".to_string(),
            data: Bytes::new(),
        },
    );
    harness.deliver(AUTHORIZED_SENDER, stale).await;
    sleep(Duration::from_millis(200)).await;
    assert!(harness.outbound.try_recv().is_err());

    // Sealed with the current key: accepted (the connect fails, which is a
    // session-level event, not a protocol reply).
    let fresh = harness.seal(
        &new_secret,
        &InboundPacket::EncData {
            reqseq: 42,
            datseq: 0,
            data: Bytes::from_static(b"x"),
        },
    );
    harness.deliver(AUTHORIZED_SENDER, fresh).await;
    sleep(Duration::from_millis(100)).await;
}
