//! Websocket client for the chat service
//!
//! The service speaks JSON envelopes over a websocket:
//! `{ver, cmd, seq, opcode, payload}` where `cmd` 0 is a request, 1 a reply
//! correlated by `seq`, and 3 a server push. Message pushes and seen-acks
//! share one opcode, distinguished by direction.

use super::{
    ChatTransport, IncomingMessage, LoginInfo, TransportError, TransportEvent,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};

/// Envelope protocol version
const PROTOCOL_VER: u8 = 11;

/// Request (client → server) direction
const CMD_REQUEST: u8 = 0;
/// Reply to a request, correlated by seq
const CMD_REPLY: u8 = 1;
/// Unsolicited server push
const CMD_PUSH: u8 = 3;

const OPCODE_PRESENT_DEVICE: u16 = 6;
const OPCODE_REQUEST_CODE: u16 = 17;
const OPCODE_PRESENT_CODE: u16 = 18;
const OPCODE_PRESENT_TOKEN: u16 = 19;
const OPCODE_SEND_MESSAGE: u16 = 64;
const OPCODE_MESSAGE_NOTIFY: u16 = 128;

/// Default reply timeout for request/reply exchanges
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    ver: u8,
    cmd: u8,
    seq: u64,
    opcode: u16,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageNotify {
    chat_id: i64,
    message: PushedMessage,
}

#[derive(Debug, Deserialize)]
struct PushedMessage {
    id: String,
    sender: i64,
    #[serde(default)]
    text: Option<String>,
}

/// The device descriptor presented at connect time.
fn device_descriptor() -> Value {
    json!({
        "appVersion": "25.9.12",
        "deviceLocale": "en",
        "deviceName": "Chrome",
        "deviceType": "WEB",
        "headerUserAgent": "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36",
        "locale": "en",
        "osVersion": "Linux",
        "screen": "1080x1920 1.0x",
        "timezone": "Europe/Moscow",
    })
}

struct Shared {
    url: String,
    request_timeout: Duration,
    seq: AtomicU64,
    /// Bumped on every (re)open; stale reader tasks detect it and go quiet.
    generation: AtomicU64,
    outbox: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Envelope>>>,
    events: mpsc::Sender<TransportEvent>,
}

/// Websocket-backed [`ChatTransport`].
pub struct WsChatClient {
    shared: Arc<Shared>,
}

impl WsChatClient {
    /// Connect and return the client plus the stream of transport events.
    pub async fn connect(
        url: &str,
        request_timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let (events_tx, events_rx) = mpsc::channel(256);
        let client = Self {
            shared: Arc::new(Shared {
                url: url.to_string(),
                request_timeout,
                seq: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                outbox: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                events: events_tx,
            }),
        };
        client.open().await?;
        Ok((client, events_rx))
    }

    async fn open(&self) -> Result<(), TransportError> {
        let (ws, _response) = connect_async(self.shared.url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, "chat transport connected");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        *self.shared.outbox.lock().unwrap() = Some(out_tx);

        // Writer: drain the outbox into the socket.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    warn!("chat transport write failed: {}", e);
                    break;
                }
            }
        });

        // Reader: route replies to waiters, pushes to the event stream.
        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => shared.handle_frame(&text),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            // Only the current connection's reader reports the disconnect.
            if shared.generation.load(Ordering::SeqCst) == generation {
                shared.outbox.lock().unwrap().take();
                shared.fail_pending();
                let _ = shared.events.send(TransportEvent::Disconnected).await;
            }
        });

        Ok(())
    }

    fn next_seq(&self) -> u64 {
        self.shared.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn post(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let text = serde_json::to_string(envelope)?;
        let outbox = self.shared.outbox.lock().unwrap();
        let tx = outbox.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(Message::Text(text))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Request/reply exchange correlated by seq.
    async fn request(&self, opcode: u16, payload: Value) -> Result<Envelope, TransportError> {
        let seq = self.next_seq();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(seq, reply_tx);

        let envelope = Envelope {
            ver: PROTOCOL_VER,
            cmd: CMD_REQUEST,
            seq,
            opcode,
            payload,
        };
        if let Err(e) = self.post(&envelope) {
            self.shared.pending.lock().unwrap().remove(&seq);
            return Err(e);
        }

        match tokio::time::timeout(self.shared.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&seq);
                Err(TransportError::Timeout)
            }
        }
    }
}

impl Shared {
    fn handle_frame(&self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                trace!("unparseable frame: {}", e);
                return;
            }
        };

        match envelope.cmd {
            CMD_REPLY => {
                if let Some(waiter) = self.pending.lock().unwrap().remove(&envelope.seq) {
                    let _ = waiter.send(envelope);
                }
            }
            CMD_REQUEST | CMD_PUSH if envelope.opcode == OPCODE_MESSAGE_NOTIFY => {
                let notify: MessageNotify = match serde_json::from_value(envelope.payload) {
                    Ok(notify) => notify,
                    Err(e) => {
                        trace!("unparseable message push: {}", e);
                        return;
                    }
                };
                let Some(text) = notify.message.text else {
                    return;
                };
                let incoming = IncomingMessage {
                    seq: envelope.seq as i64,
                    chat_id: notify.chat_id,
                    message_id: notify.message.id,
                    sender: notify.message.sender,
                    text,
                };
                if self.events.try_send(TransportEvent::Message(incoming)).is_err() {
                    warn!("event queue full, dropping incoming message");
                }
            }
            _ => {}
        }
    }

    fn fail_pending(&self) {
        // Dropping the senders wakes every waiter with a Closed error.
        self.pending.lock().unwrap().clear();
    }
}

#[async_trait]
impl ChatTransport for WsChatClient {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TransportError> {
        use rand::Rng;
        let cid: i64 = rand::thread_rng().gen_range(0..i64::MAX);
        self.request(
            OPCODE_SEND_MESSAGE,
            json!({
                "chatId": chat_id,
                "message": {
                    "text": text,
                    "cid": cid,
                    "elements": [],
                    "attaches": [],
                },
                "notify": true,
            }),
        )
        .await?;
        Ok(())
    }

    async fn ack_seen(
        &self,
        seq: i64,
        chat_id: i64,
        message_id: &str,
    ) -> Result<(), TransportError> {
        // Echoes the push's seq in the reply direction; no reply expected.
        self.post(&Envelope {
            ver: PROTOCOL_VER,
            cmd: CMD_REPLY,
            seq: seq as u64,
            opcode: OPCODE_MESSAGE_NOTIFY,
            payload: json!({
                "chatId": chat_id,
                "messageId": message_id,
            }),
        })
    }

    async fn reopen(&self) -> Result<(), TransportError> {
        self.shared.outbox.lock().unwrap().take();
        self.shared.fail_pending();
        self.open().await
    }

    async fn present_device(&self, device_id: &str) -> Result<(), TransportError> {
        self.request(
            OPCODE_PRESENT_DEVICE,
            json!({
                "userAgent": device_descriptor(),
                "deviceId": device_id,
            }),
        )
        .await?;
        Ok(())
    }

    async fn request_code(&self, phone: &str) -> Result<String, TransportError> {
        let reply = self
            .request(
                OPCODE_REQUEST_CODE,
                json!({
                    "phone": phone,
                    "type": "START_AUTH",
                    "language": "en",
                }),
            )
            .await?;
        reply.payload["token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| TransportError::Payload("missing verification token".to_string()))
    }

    async fn present_code(
        &self,
        verify_token: &str,
        code: &str,
    ) -> Result<Option<String>, TransportError> {
        let reply = self
            .request(
                OPCODE_PRESENT_CODE,
                json!({
                    "token": verify_token,
                    "verifyCode": code,
                    "authTokenType": "CHECK_CODE",
                }),
            )
            .await?;
        let token = reply.payload["tokenAttrs"]["LOGIN"]["token"]
            .as_str()
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        Ok(token)
    }

    async fn present_token(&self, token: &str) -> Result<LoginInfo, TransportError> {
        let reply = self
            .request(
                OPCODE_PRESENT_TOKEN,
                json!({
                    "interactive": true,
                    "token": token,
                    "chatsSync": 0,
                    "contactsSync": 0,
                    "presenceSync": 0,
                    "draftsSync": 0,
                    "chatsCount": 40,
                }),
            )
            .await?;
        Ok(serde_json::from_value(reply.payload)?)
    }
}
