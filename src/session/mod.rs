//! Session layer - conversations, HTTP exchanges, TCP tunnels
//!
//! Provides:
//! - The session multiplexer and its conversation registry
//! - Per-session upstream drivers (HTTP exchange, raw TCP tunnel)
//! - Session lifecycle tracking

mod http;
mod mux;
mod tcp;

pub use mux::{split_chunks, Multiplexer, MuxConfig};

use crate::packet::Headers;
use bytes::Bytes;
use thiserror::Error;

/// Session layer errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid request: {0}")]
    BadRequest(String),
}

/// What a session drives on the upstream side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Http,
    Tcp,
}

/// One flow direction of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Peer → upstream (request body, tunnel writes)
    Inbound,
    /// Upstream → peer (response body, tunnel reads)
    Outbound,
}

/// Session lifecycle. A session is created on the first `req`/`encInit`
/// packet for a fresh reqseq, half-closes per direction on terminal chunks,
/// and is removed from the registry once closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    HalfClosed(Direction),
    Closed,
}

/// Events session tasks report back to the multiplexer.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// HTTP response head, available as soon as headers arrive.
    ResponseHead {
        chat_id: i64,
        reqseq: u32,
        status: u16,
        status_text: String,
        headers: Headers,
    },
    /// Bytes read from the upstream, not yet chunked.
    Data {
        chat_id: i64,
        reqseq: u32,
        data: Bytes,
    },
    /// The upstream → peer direction finished cleanly.
    End { chat_id: i64, reqseq: u32 },
    /// The session task finished; `error` is why, if not clean.
    Closed {
        chat_id: i64,
        reqseq: u32,
        error: Option<SessionError>,
    },
}
