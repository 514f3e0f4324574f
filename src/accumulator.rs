//! Debounced reorder accumulator
//!
//! The chat transport delivers discrete messages that may arrive out of
//! order. Both directions of every session buffer chunks here: each `add`
//! re-arms a quiescence timer, and only once no chunk has arrived for a full
//! window does the buffer flush, sorted ascending by sequence number and
//! delivered one item at a time to the configured sink.
//!
//! The same type serves both specializations: inbound reassembly (sink feeds
//! the session's write channel, no spacing) and outbound batching (sink is
//! the chat-transport send primitive, with a fixed spacing delay awaited
//! between successive sends to throttle bursts).
//!
//! A producer that keeps adding within every window defers the flush
//! indefinitely; sustained high-frequency input can starve delivery.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};

/// Default quiescence window before a flush fires
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(400);

/// Default delay between successive outbound deliveries
pub const SEND_SPACING: Duration = Duration::from_millis(150);

/// Receives flushed items, in ascending sequence order, one at a time.
#[async_trait]
pub trait FlushSink<T>: Send + 'static {
    async fn deliver(&mut self, seq: u32, item: T);
}

/// Any channel sender works as a sink; delivery failures mean the consumer
/// is gone and the items are dropped.
#[async_trait]
impl<T: Send + 'static> FlushSink<T> for mpsc::Sender<(u32, T)> {
    async fn deliver(&mut self, seq: u32, item: T) {
        let _ = self.send((seq, item)).await;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AccumulatorConfig {
    /// Quiescence window; every `add` re-arms it.
    pub debounce: Duration,
    /// Delay awaited between successive deliveries of one flush.
    pub spacing: Option<Duration>,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            debounce: DEBOUNCE_WINDOW,
            spacing: None,
        }
    }
}

/// Flush timer state. One owned timer per accumulator; `Pending` holds the
/// deadline. The third phase, flushing, swaps the buffer out before any
/// delivery, so items added mid-flush queue for a fresh window instead of
/// racing the in-flight batch.
enum FlushState {
    Idle,
    Pending(Instant),
}

/// Handle to one accumulator task. Dropping it closes the intake channel;
/// the task flushes anything still buffered and exits, so no timer outlives
/// its session.
pub struct Accumulator<T> {
    tx: mpsc::UnboundedSender<(u32, T)>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> Accumulator<T> {
    pub fn spawn<S: FlushSink<T>>(config: AccumulatorConfig, sink: S) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(config, rx, sink));
        Self { tx, task }
    }

    /// Buffer one sequenced item and re-arm the flush timer.
    /// Returns false if the accumulator task is gone.
    pub fn add(&self, seq: u32, item: T) -> bool {
        self.tx.send((seq, item)).is_ok()
    }

    /// Force-stop without flushing buffered items.
    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn run<T, S: FlushSink<T>>(
    config: AccumulatorConfig,
    mut rx: mpsc::UnboundedReceiver<(u32, T)>,
    mut sink: S,
) {
    let mut buffer: Vec<(u32, T)> = Vec::new();
    let mut state = FlushState::Idle;

    loop {
        match state {
            FlushState::Idle => match rx.recv().await {
                Some(item) => {
                    buffer.push(item);
                    state = FlushState::Pending(Instant::now() + config.debounce);
                }
                None => break,
            },
            FlushState::Pending(deadline) => {
                tokio::select! {
                    received = rx.recv() => match received {
                        Some(item) => {
                            buffer.push(item);
                            state = FlushState::Pending(Instant::now() + config.debounce);
                        }
                        None => break,
                    },
                    _ = sleep_until(deadline) => {
                        flush(&mut buffer, &mut sink, config.spacing).await;
                        state = FlushState::Idle;
                    }
                }
            }
        }
    }

    // Intake closed: deliver whatever is still buffered, then stop.
    flush(&mut buffer, &mut sink, config.spacing).await;
}

async fn flush<T, S: FlushSink<T>>(
    buffer: &mut Vec<(u32, T)>,
    sink: &mut S,
    spacing: Option<Duration>,
) {
    let mut batch = std::mem::take(buffer);
    batch.sort_by_key(|(seq, _)| *seq);

    let mut first = true;
    for (seq, item) in batch {
        if !first {
            if let Some(delay) = spacing {
                sleep(delay).await;
            }
        }
        first = false;
        sink.deliver(seq, item).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (mpsc::Sender<(u32, &'static str)>, mpsc::Receiver<(u32, &'static str)>) {
        mpsc::channel(64)
    }

    #[tokio::test]
    async fn test_flush_after_quiescence() {
        let (tx, mut rx) = collector();
        let acc = Accumulator::spawn(
            AccumulatorConfig {
                debounce: Duration::from_millis(50),
                spacing: None,
            },
            tx,
        );

        acc.add(0, "only");
        let (seq, item) = rx.recv().await.unwrap();
        assert_eq!((seq, item), (0, "only"));
    }

    #[tokio::test]
    async fn test_drop_flushes_remainder() {
        let (tx, mut rx) = collector();
        let acc = Accumulator::spawn(
            AccumulatorConfig {
                debounce: Duration::from_secs(3600),
                spacing: None,
            },
            tx,
        );

        acc.add(2, "b");
        acc.add(1, "a");
        drop(acc);

        assert_eq!(rx.recv().await.unwrap(), (1, "a"));
        assert_eq!(rx.recv().await.unwrap(), (2, "b"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_abort_discards_buffer() {
        let (tx, mut rx) = collector();
        let acc = Accumulator::spawn(
            AccumulatorConfig {
                debounce: Duration::from_secs(3600),
                spacing: None,
            },
            tx,
        );

        acc.add(0, "lost");
        acc.abort();
        assert!(rx.recv().await.is_none());
    }
}
