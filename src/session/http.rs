//! HTTP exchange driver
//!
//! One task per `req` packet. The request is dispatched immediately; when the
//! declared content length exceeds the body bytes carried by the packet, the
//! remainder streams in through the session's reassembly channel. The
//! response head is reported as soon as headers arrive, then body bytes
//! stream back until the upstream finishes.

use super::{SessionError, SessionEvent};
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use tokio::sync::mpsc;
use tracing::debug;

use crate::packet::Headers;
use crate::FINAL_CHUNK;

/// Everything a `req` packet specifies about the upstream request.
#[derive(Debug, Clone)]
pub(crate) struct HttpExchange {
    pub hostname: String,
    pub port: u16,
    pub path: String,
    pub method: String,
    pub headers: Headers,
    pub body: Bytes,
}

pub(crate) async fn run_exchange(
    client: reqwest::Client,
    chat_id: i64,
    reqseq: u32,
    exchange: HttpExchange,
    body_rx: Option<mpsc::Receiver<(u32, Bytes)>>,
    events: mpsc::Sender<SessionEvent>,
) {
    let error = drive(client, chat_id, reqseq, exchange, body_rx, &events)
        .await
        .err();
    let _ = events
        .send(SessionEvent::Closed {
            chat_id,
            reqseq,
            error,
        })
        .await;
}

async fn drive(
    client: reqwest::Client,
    chat_id: i64,
    reqseq: u32,
    exchange: HttpExchange,
    body_rx: Option<mpsc::Receiver<(u32, Bytes)>>,
    events: &mpsc::Sender<SessionEvent>,
) -> Result<(), SessionError> {
    // Port 443 is the only signal we have for TLS upstreams.
    let scheme = if exchange.port == 443 { "https" } else { "http" };
    let url = format!(
        "{}://{}:{}{}",
        scheme, exchange.hostname, exchange.port, exchange.path
    );

    let method = Method::from_bytes(exchange.method.as_bytes())
        .map_err(|_| SessionError::BadRequest(format!("method {:?}", exchange.method)))?;

    let mut headers = HeaderMap::new();
    for (name, value) in &exchange.headers {
        // Repeated names append, preserving multi-value headers.
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!(reqseq, header = %name, "skipping malformed request header"),
        }
    }

    let builder = client.request(method, &url).headers(headers);
    let builder = match body_rx {
        Some(rx) => builder.body(reqwest::Body::wrap_stream(body_stream(
            exchange.body.clone(),
            rx,
        ))),
        None => builder.body(exchange.body.to_vec()),
    };

    let response = builder.send().await?;

    let status = response.status();
    let response_headers: Headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    if events
        .send(SessionEvent::ResponseHead {
            chat_id,
            reqseq,
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: response_headers,
        })
        .await
        .is_err()
    {
        return Ok(());
    }

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        if events
            .send(SessionEvent::Data {
                chat_id,
                reqseq,
                data: chunk,
            })
            .await
            .is_err()
        {
            return Ok(());
        }
    }

    let _ = events.send(SessionEvent::End { chat_id, reqseq }).await;
    Ok(())
}

/// Request body: the packet's own bytes first, then reassembled `reqData`
/// chunks until the terminal marker ends the stream.
fn body_stream(
    initial: Bytes,
    rx: mpsc::Receiver<(u32, Bytes)>,
) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Send {
    let head = futures_util::stream::iter(if initial.is_empty() {
        None
    } else {
        Some(Ok::<Bytes, std::io::Error>(initial))
    });

    let tail = futures_util::stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Some((datseq, _)) if datseq == FINAL_CHUNK => None,
            Some((_, data)) => Some((Ok::<Bytes, std::io::Error>(data), rx)),
            None => None,
        }
    });

    head.chain(tail)
}
