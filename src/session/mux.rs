//! Session multiplexer
//!
//! Owns the conversation registry and drives every live session. All
//! registry mutation happens on the multiplexer task; per-session upstream
//! I/O runs on one spawned task per session, reporting back over a channel,
//! so a failure in one session can never take down another or the transport.
//!
//! A conversation is created implicitly by the first message from an
//! authorized sender. Its negotiated secret is replaced whenever a new key
//! announcement arrives (last key wins). Sessions are keyed by the
//! initiator-chosen `reqseq`, removed explicitly once closed, and swept by
//! an idle-timeout reaper as a backstop against peers that never finish.

use super::http::{self, HttpExchange};
use super::tcp;
use super::{Direction, SessionError, SessionEvent, SessionKind, SessionState};
use crate::accumulator::{
    Accumulator, AccumulatorConfig, FlushSink, DEBOUNCE_WINDOW, SEND_SPACING,
};
use crate::auth::Authorize;
use crate::config::Config;
use crate::crypto::{negotiate, KeyPair, PublicKeyAnnouncement, Sealed, Secret, SEALED_MARKER};
use crate::packet::{InboundPacket, OutboundPacket};
use crate::storage::Credentials;
use crate::transport::{ChatTransport, IncomingMessage, TransportError, TransportEvent};
use crate::{FINAL_CHUNK, ID_COMMAND};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Multiplexer tuning
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Payload bytes per data chunk
    pub chunk_size: usize,
    /// Accumulator quiescence window
    pub debounce: Duration,
    /// Delay between successive outbound message sends
    pub send_spacing: Duration,
    /// Idle time after which the reaper removes a session
    pub idle_timeout: Duration,
    /// How often the reaper sweeps
    pub reap_interval: Duration,
    /// Port assumed when a tunnel-open host string omits one
    pub default_tcp_port: u16,
    /// Reconnection attempts before giving up on the transport
    pub max_reconnect_attempts: u32,
    /// First reconnection backoff step
    pub reconnect_base_delay: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::CHUNK_SIZE,
            debounce: DEBOUNCE_WINDOW,
            send_spacing: SEND_SPACING,
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(60),
            default_tcp_port: 443,
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
        }
    }
}

impl MuxConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.tunnel.chunk_size,
            debounce: config.tunnel.debounce(),
            send_spacing: config.tunnel.send_spacing(),
            idle_timeout: config.tunnel.idle_timeout(),
            default_tcp_port: config.tunnel.default_tcp_port,
            max_reconnect_attempts: config.transport.max_reconnect_attempts,
            ..Self::default()
        }
    }
}

/// One conversation: its negotiated secret and its live sessions.
#[derive(Default)]
struct Conversation {
    secret: Option<Secret>,
    sessions: HashMap<u32, Session>,
}

/// Registry entry for one live session.
struct Session {
    kind: SessionKind,
    state: SessionState,
    last_activity: Instant,
    /// Next outbound chunk index for this session.
    next_datseq: u32,
    inbound_done: bool,
    outbound_done: bool,
    /// Reassembles inbound chunks; absent when no more request data can come.
    inbound: Option<Accumulator<Bytes>>,
    /// Batches sealed outbound messages toward the shared chat stream.
    outbound: Accumulator<String>,
    task: JoinHandle<()>,
}

impl Session {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        if self.state == SessionState::Created {
            self.state = SessionState::Active;
        }
    }

    fn half_close(&mut self, direction: Direction) {
        self.state = match self.state {
            SessionState::HalfClosed(other) if other != direction => SessionState::Closed,
            SessionState::Closed => SessionState::Closed,
            _ => SessionState::HalfClosed(direction),
        };
    }

    /// Immediate teardown without flushing: reaper and error paths.
    fn force_stop(&self) {
        if let Some(inbound) = &self.inbound {
            inbound.abort();
        }
        self.outbound.abort();
        self.task.abort();
    }
}

/// Outbound accumulator sink: delivers sealed message text into the
/// conversation's shared chat stream.
struct TransportSink {
    transport: Arc<dyn ChatTransport>,
    chat_id: i64,
}

#[async_trait]
impl FlushSink<String> for TransportSink {
    async fn deliver(&mut self, _seq: u32, text: String) {
        if let Err(e) = self.transport.send_message(self.chat_id, &text).await {
            warn!(chat_id = self.chat_id, "outbound send failed: {}", e);
        }
    }
}

/// The session multiplexer. Consumes transport events, drives sessions,
/// produces outbound chat messages.
pub struct Multiplexer {
    transport: Arc<dyn ChatTransport>,
    authorizer: Arc<dyn Authorize>,
    credentials: Credentials,
    config: MuxConfig,
    http_client: reqwest::Client,
    conversations: HashMap<i64, Conversation>,
    session_tx: mpsc::Sender<SessionEvent>,
    session_rx: mpsc::Receiver<SessionEvent>,
}

enum Tick {
    Transport(Option<TransportEvent>),
    Session(SessionEvent),
    Reap,
}

impl Multiplexer {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        authorizer: Arc<dyn Authorize>,
        credentials: Credentials,
        config: MuxConfig,
    ) -> crate::Result<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(SessionError::from)?;
        let (session_tx, session_rx) = mpsc::channel(256);
        Ok(Self {
            transport,
            authorizer,
            credentials,
            config,
            http_client,
            conversations: HashMap::new(),
            session_tx,
            session_rx,
        })
    }

    /// Run until the transport event stream ends or reconnection is
    /// exhausted.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<TransportEvent>,
    ) -> crate::Result<()> {
        let mut reaper = tokio::time::interval(self.config.reap_interval);
        reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let tick = tokio::select! {
                event = events.recv() => Tick::Transport(event),
                Some(event) = self.session_rx.recv() => Tick::Session(event),
                _ = reaper.tick() => Tick::Reap,
            };

            match tick {
                Tick::Transport(Some(TransportEvent::Message(msg))) => self.handle_message(msg),
                Tick::Transport(Some(TransportEvent::Disconnected)) => self.reconnect().await?,
                Tick::Transport(None) => {
                    info!("transport event stream ended");
                    return Ok(());
                }
                Tick::Session(event) => self.handle_session_event(event),
                Tick::Reap => self.reap_idle(),
            }
        }
    }

    fn handle_message(&mut self, msg: IncomingMessage) {
        if !self.authorizer.is_authorized(msg.sender) {
            trace!(sender = msg.sender, "ignoring unauthorized sender");
            return;
        }

        // Mark the message seen; a failure here is cosmetic.
        {
            let transport = self.transport.clone();
            let (seq, chat_id, message_id) = (msg.seq, msg.chat_id, msg.message_id.clone());
            tokio::spawn(async move {
                if let Err(e) = transport.ack_seen(seq, chat_id, &message_id).await {
                    trace!(chat_id, "seen ack failed: {}", e);
                }
            });
        }

        if msg.text == ID_COMMAND {
            self.send_direct(msg.chat_id, msg.sender.to_string());
            return;
        }

        if msg.text.starts_with(SEALED_MARKER) {
            self.handle_sealed(msg.chat_id, &msg.text);
            return;
        }

        match InboundPacket::decode(&msg.text) {
            Ok(InboundPacket::Key { key }) => self.negotiate_key(msg.chat_id, &key),
            Ok(_) => debug!(chat_id = msg.chat_id, "dropping plaintext data packet"),
            Err(e) => debug!(chat_id = msg.chat_id, "dropping undecodable message: {}", e),
        }
    }

    fn handle_sealed(&mut self, chat_id: i64, text: &str) {
        let sealed = match Sealed::decode(text) {
            Ok(sealed) => sealed,
            Err(e) => {
                debug!(chat_id, "malformed sealed message: {}", e);
                return;
            }
        };

        let Some(secret) = self
            .conversations
            .get(&chat_id)
            .and_then(|conv| conv.secret.as_ref())
        else {
            debug!(chat_id, "sealed message before key negotiation, dropping");
            return;
        };

        let plaintext = match secret.open(&sealed) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                debug!(chat_id, "dropping message that failed authentication");
                return;
            }
        };
        let inner = match String::from_utf8(plaintext) {
            Ok(inner) => inner,
            Err(_) => {
                debug!(chat_id, "sealed payload is not UTF-8, dropping");
                return;
            }
        };

        match InboundPacket::decode(&inner) {
            Ok(packet) => self.dispatch(chat_id, packet),
            Err(e) => debug!(chat_id, "dropping undecodable inner packet: {}", e),
        }
    }

    fn dispatch(&mut self, chat_id: i64, packet: InboundPacket) {
        match packet {
            InboundPacket::Key { key } => self.negotiate_key(chat_id, &key),
            InboundPacket::Req {
                reqseq,
                hostname,
                port,
                path,
                method,
                headers,
                body,
            } => self.open_http_session(
                chat_id,
                reqseq,
                HttpExchange {
                    hostname,
                    port,
                    path,
                    method,
                    headers,
                    body,
                },
            ),
            InboundPacket::EncInit { reqseq, host, data } => {
                self.open_tcp_session(chat_id, reqseq, &host, data)
            }
            InboundPacket::ReqData {
                reqseq,
                datseq,
                data,
            } => self.feed_session(chat_id, reqseq, datseq, data, SessionKind::Http),
            InboundPacket::EncData {
                reqseq,
                datseq,
                data,
            } => self.feed_session(chat_id, reqseq, datseq, data, SessionKind::Tcp),
        }
    }

    /// Derive (or replace) the conversation secret and announce our public
    /// half back. A fresh ephemeral pair is used for every negotiation.
    fn negotiate_key(&mut self, chat_id: i64, key_json: &serde_json::Value) {
        let announcement = match PublicKeyAnnouncement::from_json(key_json) {
            Ok(announcement) => announcement,
            Err(e) => {
                warn!(chat_id, "rejecting key announcement: {}", e);
                return;
            }
        };
        let local = match KeyPair::generate() {
            Ok(local) => local,
            Err(e) => {
                warn!(chat_id, "key generation failed: {}", e);
                return;
            }
        };
        let reply = OutboundPacket::Key {
            key: local.announcement().to_json(),
        }
        .encode();
        let secret = match negotiate(local, &announcement) {
            Ok(secret) => secret,
            Err(e) => {
                warn!(chat_id, "key agreement failed: {}", e);
                return;
            }
        };

        let conv = self.conversations.entry(chat_id).or_default();
        if conv.secret.replace(secret).is_some() {
            info!(chat_id, "conversation re-keyed");
        } else {
            info!(chat_id, "conversation key negotiated");
        }
        self.send_direct(chat_id, reply);
    }

    fn open_http_session(&mut self, chat_id: i64, reqseq: u32, exchange: HttpExchange) {
        if self.session_exists(chat_id, reqseq) {
            debug!(chat_id, reqseq, "duplicate reqseq ignored");
            return;
        }

        // More request body arrives as reqData only when the declared length
        // says the packet's own body is not the whole story.
        let expects_more = declared_content_length(&exchange.headers)
            .map_or(false, |length| length > exchange.body.len() as u64);

        let (inbound, body_rx) = if expects_more {
            let (tx, rx) = mpsc::channel(64);
            let acc = Accumulator::spawn(
                AccumulatorConfig {
                    debounce: self.config.debounce,
                    spacing: None,
                },
                tx,
            );
            (Some(acc), Some(rx))
        } else {
            (None, None)
        };

        let task = tokio::spawn(http::run_exchange(
            self.http_client.clone(),
            chat_id,
            reqseq,
            exchange,
            body_rx,
            self.session_tx.clone(),
        ));

        debug!(chat_id, reqseq, "HTTP exchange opened");
        self.insert_session(chat_id, reqseq, SessionKind::Http, inbound, task);
    }

    fn open_tcp_session(&mut self, chat_id: i64, reqseq: u32, host: &str, data: Bytes) {
        if self.session_exists(chat_id, reqseq) {
            debug!(chat_id, reqseq, "duplicate reqseq ignored");
            return;
        }

        let target = resolve_target(host, self.config.default_tcp_port);
        let (tx, rx) = mpsc::channel(64);
        let inbound = Accumulator::spawn(
            AccumulatorConfig {
                debounce: self.config.debounce,
                spacing: None,
            },
            tx,
        );

        let task = tokio::spawn(tcp::run_tunnel(
            target,
            data,
            rx,
            self.session_tx.clone(),
            chat_id,
            reqseq,
        ));

        debug!(chat_id, reqseq, host, "TCP tunnel opened");
        self.insert_session(chat_id, reqseq, SessionKind::Tcp, Some(inbound), task);
    }

    fn session_exists(&self, chat_id: i64, reqseq: u32) -> bool {
        self.conversations
            .get(&chat_id)
            .is_some_and(|conv| conv.sessions.contains_key(&reqseq))
    }

    fn insert_session(
        &mut self,
        chat_id: i64,
        reqseq: u32,
        kind: SessionKind,
        inbound: Option<Accumulator<Bytes>>,
        task: JoinHandle<()>,
    ) {
        let outbound = Accumulator::spawn(
            AccumulatorConfig {
                debounce: self.config.debounce,
                spacing: Some(self.config.send_spacing),
            },
            TransportSink {
                transport: self.transport.clone(),
                chat_id,
            },
        );
        let inbound_done = inbound.is_none();
        let conv = self.conversations.entry(chat_id).or_default();
        conv.sessions.insert(
            reqseq,
            Session {
                kind,
                state: SessionState::Created,
                last_activity: Instant::now(),
                next_datseq: 0,
                inbound_done,
                outbound_done: false,
                inbound,
                outbound,
                task,
            },
        );
    }

    /// Feed one inbound data chunk to its session's reassembly buffer.
    fn feed_session(
        &mut self,
        chat_id: i64,
        reqseq: u32,
        datseq: u32,
        data: Bytes,
        expected: SessionKind,
    ) {
        let Some(conv) = self.conversations.get_mut(&chat_id) else {
            debug!(chat_id, reqseq, "chunk for unknown conversation");
            return;
        };
        let Some(session) = conv.sessions.get_mut(&reqseq) else {
            debug!(chat_id, reqseq, "chunk for unknown session");
            return;
        };
        if session.kind != expected {
            debug!(chat_id, reqseq, "chunk kind does not match session kind");
            return;
        }
        if session.inbound_done {
            debug!(chat_id, reqseq, datseq, "chunk after terminal ignored");
            return;
        }

        session.touch();
        if datseq == FINAL_CHUNK {
            session.inbound_done = true;
            session.half_close(Direction::Inbound);
        }
        match &session.inbound {
            Some(acc) => {
                acc.add(datseq, data);
            }
            None => debug!(chat_id, reqseq, "session accepts no request data"),
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ResponseHead {
                chat_id,
                reqseq,
                status,
                status_text,
                headers,
            } => {
                let packet = OutboundPacket::Res {
                    reqseq,
                    status,
                    status_text,
                    headers,
                    body: Bytes::new(),
                };
                let Some(conv) = self.conversations.get_mut(&chat_id) else {
                    return;
                };
                let Some(secret) = conv.secret.as_ref() else {
                    warn!(chat_id, "conversation lost its key, dropping response");
                    return;
                };
                let Some(text) = seal_packet(secret, &packet) else {
                    return;
                };
                if let Some(session) = conv.sessions.get_mut(&reqseq) {
                    session.touch();
                }
                self.send_direct(chat_id, text);
            }
            SessionEvent::Data {
                chat_id,
                reqseq,
                data,
            } => {
                let chunk_size = self.config.chunk_size;
                let Some(conv) = self.conversations.get_mut(&chat_id) else {
                    return;
                };
                let Some(secret) = conv.secret.as_ref() else {
                    warn!(chat_id, "conversation lost its key, dropping data");
                    return;
                };
                let Some(session) = conv.sessions.get_mut(&reqseq) else {
                    return;
                };
                session.touch();
                for chunk in split_chunks(&data, chunk_size) {
                    let datseq = session.next_datseq;
                    session.next_datseq += 1;
                    let packet = data_packet(session.kind, reqseq, datseq, chunk);
                    if let Some(text) = seal_packet(secret, &packet) {
                        session.outbound.add(datseq, text);
                    }
                }
            }
            SessionEvent::End { chat_id, reqseq } => self.finish_outbound(chat_id, reqseq),
            SessionEvent::Closed {
                chat_id,
                reqseq,
                error,
            } => self.close_session(chat_id, reqseq, error),
        }
    }

    /// Emit the terminal chunk for the upstream → peer direction.
    fn finish_outbound(&mut self, chat_id: i64, reqseq: u32) {
        let Some(conv) = self.conversations.get_mut(&chat_id) else {
            return;
        };
        let Some(session) = conv.sessions.get_mut(&reqseq) else {
            return;
        };
        if session.outbound_done {
            return;
        }
        if let Some(secret) = conv.secret.as_ref() {
            let packet = data_packet(session.kind, reqseq, FINAL_CHUNK, Bytes::new());
            if let Some(text) = seal_packet(secret, &packet) {
                session.outbound.add(FINAL_CHUNK, text);
            }
        }
        session.outbound_done = true;
        session.half_close(Direction::Outbound);
    }

    /// Remove a finished or failed session and release its resources. The
    /// dropped accumulators flush anything still queued (the terminal chunk
    /// included) before their tasks exit.
    fn close_session(&mut self, chat_id: i64, reqseq: u32, error: Option<SessionError>) {
        if let Some(e) = &error {
            warn!(chat_id, reqseq, "session failed: {}", e);
            self.finish_outbound(chat_id, reqseq);
        }
        let Some(conv) = self.conversations.get_mut(&chat_id) else {
            return;
        };
        if let Some(session) = conv.sessions.remove(&reqseq) {
            debug!(
                chat_id,
                reqseq,
                state = ?session.state,
                "session closed and removed"
            );
        }
    }

    /// Backstop against peers that never finish a session.
    fn reap_idle(&mut self) {
        let idle_timeout = self.config.idle_timeout;
        let now = Instant::now();
        for (chat_id, conv) in self.conversations.iter_mut() {
            conv.sessions.retain(|reqseq, session| {
                if now.duration_since(session.last_activity) <= idle_timeout {
                    return true;
                }
                warn!(chat_id = *chat_id, reqseq = *reqseq, "reaping idle session");
                session.force_stop();
                false
            });
        }
    }

    /// Send one message outside any session's accumulator (key replies,
    /// response heads, `/id` answers).
    fn send_direct(&self, chat_id: i64, text: String) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.send_message(chat_id, &text).await {
                warn!(chat_id, "direct send failed: {}", e);
            }
        });
    }

    /// Bounded reconnect-and-reauthenticate. In-flight sessions are left
    /// untouched; nothing is resent.
    async fn reconnect(&self) -> crate::Result<()> {
        let mut delay = self.config.reconnect_base_delay;
        for attempt in 1..=self.config.max_reconnect_attempts {
            info!(attempt, "transport disconnected, reconnecting");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(60));
            match self.try_reconnect().await {
                Ok(()) => {
                    info!("transport reconnected");
                    return Ok(());
                }
                Err(e) => warn!(attempt, "reconnect failed: {}", e),
            }
        }
        Err(crate::Error::Transport(TransportError::NotConnected))
    }

    async fn try_reconnect(&self) -> Result<(), TransportError> {
        self.transport.reopen().await?;
        self.transport
            .present_device(&self.credentials.device_id)
            .await?;
        self.transport
            .present_token(&self.credentials.token)
            .await?;
        Ok(())
    }
}

/// Split a read into wire-sized chunks, preserving byte order.
pub fn split_chunks(data: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(data.len().div_ceil(chunk_size));
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + chunk_size).min(data.len());
        chunks.push(data.slice(offset..end));
        offset = end;
    }
    chunks
}

fn data_packet(kind: SessionKind, reqseq: u32, datseq: u32, data: Bytes) -> OutboundPacket {
    match kind {
        SessionKind::Http => OutboundPacket::ResData {
            reqseq,
            datseq,
            data,
        },
        SessionKind::Tcp => OutboundPacket::EncData {
            reqseq,
            datseq,
            data,
        },
    }
}

fn seal_packet(secret: &Secret, packet: &OutboundPacket) -> Option<String> {
    match secret.seal(packet.encode().as_bytes()) {
        Ok(sealed) => Some(sealed.encode()),
        Err(e) => {
            warn!("sealing failed, dropping outbound packet: {}", e);
            None
        }
    }
}

/// `host[:port]`, default port when omitted or unparsable.
fn resolve_target(host: &str, default_port: u16) -> String {
    match host.rsplit_once(':') {
        Some((name, port)) if port.parse::<u16>().is_ok() => format!("{}:{}", name, port),
        _ => format!("{}:{}", host, default_port),
    }
}

fn declared_content_length(headers: &[(String, String)]) -> Option<u64> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
}
