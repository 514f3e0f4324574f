//! Chat transport collaborator
//!
//! The tunnel core only depends on sending and receiving opaque UTF-8 text
//! per conversation; everything service-specific (login handshake, websocket
//! framing, acknowledgments) lives behind [`ChatTransport`].

mod ws;

pub use ws::{WsChatClient, REQUEST_TIMEOUT};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("not connected")]
    NotConnected,

    #[error("request timed out")]
    Timeout,

    #[error("connection closed before reply")]
    Closed,

    #[error("unexpected server payload: {0}")]
    Payload(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One chat message addressed to us.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Server sequence number of the push, echoed by the seen-ack.
    pub seq: i64,
    pub chat_id: i64,
    pub message_id: String,
    pub sender: i64,
    pub text: String,
}

/// Events surfaced to the session multiplexer.
#[derive(Debug)]
pub enum TransportEvent {
    Message(IncomingMessage),
    Disconnected,
}

/// Profile and conversation listing returned by token presentment.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginInfo {
    pub profile: Profile,
    #[serde(default)]
    pub chats: Vec<Chat>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub contact: Contact,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Contact {
    pub id: i64,
    #[serde(default)]
    pub names: Vec<ContactName>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactName {
    pub name: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
}

/// The message-channel operations the tunnel core depends on.
#[async_trait]
pub trait ChatTransport: Send + Sync + 'static {
    /// Send one message into a conversation and await the server ack.
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TransportError>;

    /// Mark an incoming message as seen (fire and forget).
    async fn ack_seen(&self, seq: i64, chat_id: i64, message_id: &str)
        -> Result<(), TransportError>;

    /// Tear down and re-establish the underlying connection.
    async fn reopen(&self) -> Result<(), TransportError>;

    /// Present our device identifier after (re)connecting.
    async fn present_device(&self, device_id: &str) -> Result<(), TransportError>;

    /// Start phone verification; returns the verification token.
    async fn request_code(&self, phone: &str) -> Result<String, TransportError>;

    /// Complete phone verification; `None` means the code was rejected.
    async fn present_code(
        &self,
        verify_token: &str,
        code: &str,
    ) -> Result<Option<String>, TransportError>;

    /// Present the long-lived auth token; returns profile and conversations.
    async fn present_token(&self, token: &str) -> Result<LoginInfo, TransportError>;
}
