//! Dedicated writer task for outbound websocket messages.
//!
//! The socket sink is owned by a single task that receives messages via an
//! mpsc channel. Everything else holds a cheap [`WriterHandle`] and never
//! touches the sink directly.
//!
//! # Architecture
//!
//! ```text
//! read loop   ─┐
//! call worker ─┼─► mpsc::Sender<Message> ─► Writer Task ─► websocket sink
//! eval caller ─┘
//! ```
//!
//! Ready messages are fed in batches and flushed once per batch.

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::codec::JsonCodec;
use crate::error::{PagewireError, Result};
use crate::protocol::Envelope;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum messages fed before a flush.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the outbound queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending messages to the writer task.
///
/// Cheaply cloneable; all clones feed the same connection.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    tx: mpsc::Sender<Message>,
}

impl WriterHandle {
    /// Encode and queue an envelope, waiting for queue space.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let text = JsonCodec::encode(envelope)?;
        self.send_message(Message::Text(text.into())).await
    }

    /// Encode and queue an envelope without waiting.
    ///
    /// Fire-and-forget: returns `Backpressure` immediately if the queue is full.
    pub fn try_send(&self, envelope: &Envelope) -> Result<()> {
        let text = JsonCodec::encode(envelope)?;
        self.try_send_message(Message::Text(text.into()))
    }

    /// Queue a raw websocket message.
    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| PagewireError::ConnectionClosed)
    }

    /// Queue a raw websocket message without waiting.
    pub fn try_send_message(&self, message: Message) -> Result<()> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PagewireError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => PagewireError::ConnectionClosed,
        })
    }

    /// Ask the writer to send a close frame and stop.
    pub async fn close(&self) -> Result<()> {
        self.send_message(Message::Close(None)).await
    }

    /// Whether the writer task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending messages.
///
/// The task ends when every handle is dropped, after a close frame was
/// written, or on the first sink error.
pub fn spawn_writer_task<S>(sink: S, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let task = tokio::spawn(writer_loop(rx, sink));
    (WriterHandle { tx }, task)
}

/// Spawn the writer task with default configuration.
pub fn spawn_writer_task_default<S>(sink: S) -> (WriterHandle, JoinHandle<Result<()>>)
where
    S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    spawn_writer_task(sink, WriterConfig::default())
}

async fn writer_loop<S>(mut rx: mpsc::Receiver<Message>, mut sink: S) -> Result<()>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(m) => m,
            None => {
                // All handles dropped.
                let _ = sink.close().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(m) => batch.push(m),
                Err(_) => break,
            }
        }

        let mut closing = false;
        for message in batch {
            closing = message.is_close();
            sink.feed(message).await?;
            if closing {
                break;
            }
        }
        sink.flush().await?;

        if closing {
            tracing::debug!("Writer sent close frame");
            return Ok(());
        }
    }
}
