//! Raw TCP tunnel driver
//!
//! One task per `encInit` packet. The task owns the socket: reassembled
//! inbound chunks are written to it, reads are reported back for chunking,
//! and each direction closes independently. Read EOF ends the outbound
//! direction; the inbound terminal marker shuts down the write half. The
//! task finishes once both directions are done or the socket errors.

use super::{SessionError, SessionEvent};
use crate::FINAL_CHUNK;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

pub(crate) async fn run_tunnel(
    target: String,
    initial: Bytes,
    chunks: mpsc::Receiver<(u32, Bytes)>,
    events: mpsc::Sender<SessionEvent>,
    chat_id: i64,
    reqseq: u32,
) {
    let error = drive(&target, initial, chunks, &events, chat_id, reqseq)
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
    target: &str,
    initial: Bytes,
    mut chunks: mpsc::Receiver<(u32, Bytes)>,
    events: &mpsc::Sender<SessionEvent>,
    chat_id: i64,
    reqseq: u32,
) -> Result<(), SessionError> {
    let mut stream = TcpStream::connect(target).await?;
    debug!(reqseq, remote = %target, "tunnel connected");

    if !initial.is_empty() {
        stream.write_all(&initial).await?;
    }

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; crate::CHUNK_SIZE];
    let mut read_open = true;
    let mut write_open = true;

    while read_open || write_open {
        tokio::select! {
            read = reader.read(&mut buf), if read_open => match read {
                Ok(0) => {
                    read_open = false;
                    if events.send(SessionEvent::End { chat_id, reqseq }).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if events.send(SessionEvent::Data { chat_id, reqseq, data }).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e.into()),
            },
            chunk = chunks.recv(), if write_open => match chunk {
                Some((datseq, _)) if datseq == FINAL_CHUNK => {
                    write_open = false;
                    let _ = writer.shutdown().await;
                }
                Some((_, data)) => writer.write_all(&data).await?,
                None => {
                    // Reassembly channel gone: the session is being torn down.
                    write_open = false;
                    let _ = writer.shutdown().await;
                }
            },
        }
    }

    Ok(())
}
