//! # Courier Tunnel
//!
//! Tunnels arbitrary HTTP requests and raw TCP byte streams through a
//! consumer chat messenger, with end-to-end encryption negotiated per
//! conversation.
//!
//! The proxy host logs into the chat service like a regular client, then
//! treats each conversation as an encrypted packet channel: authorized peers
//! send chunked, sequence-numbered control packets embedded in ordinary chat
//! messages, and the host translates them into real HTTP requests or TCP
//! connections, returning results the same way.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Session Multiplexer                  │
//! │   (conversations, HTTP exchanges, TCP tunnels)       │
//! ├─────────────────────────────────────────────────────┤
//! │                Reorder Accumulators                  │
//! │     (debounced, sequence-sorted chunk delivery)      │
//! ├─────────────────────────────────────────────────────┤
//! │               Cryptographic Channel                  │
//! │      (P-256 key agreement, AES-256-GCM sealing)      │
//! ├─────────────────────────────────────────────────────┤
//! │                   Packet Codec                       │
//! │       (tagged variants, Z85-armored fields)          │
//! ├─────────────────────────────────────────────────────┤
//! │                  Chat Transport                      │
//! │        (websocket client, login, message I/O)        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod accumulator;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod packet;
pub mod session;
pub mod storage;
pub mod transport;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum payload bytes carried by one data chunk. Sized so that an armored,
/// sealed chunk stays well under the chat service's message-size limit.
pub const CHUNK_SIZE: usize = 1500;

/// Reserved `datseq` value marking the final chunk of one stream direction.
pub const FINAL_CHUNK: u32 = 0xFFFF_FFFF;

/// Command token answered with the sender's own numeric identifier.
pub const ID_COMMAND: &str = "/id";

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] packet::DecodeError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed")]
    AuthenticationFailed,
}
