//! Dedicated writer task for outbound protocol messages.
//!
//! All outbound messages of a connection go through one mpsc channel to one
//! task that owns the write half of the transport. Channel order is write
//! order, so messages reach the peer in the order they were queued.
//!
//! ```text
//! send_file ─────┐
//! read loop acks ┼─► mpsc::Sender<OutboundMessage> ─► Writer Task ─► transport
//! bulk ops ──────┘
//! ```
//!
//! Ready messages are batched into a single `write_vectored` call. Fragment
//! data is never copied: each message contributes its encoded head and, for
//! segments, the payload slice as separate `IoSlice`s.

use std::io::IoSlice;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backpressure::BackpressureController;
use crate::error::{Result, WireDropError};
use crate::protocol::Message;

/// Default maximum queued messages before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_MESSAGES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum messages to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A message ready to be written to the transport.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Header plus fixed fields (and filename for `FileStart`).
    pub head: Bytes,
    /// Fragment data; empty for every other opcode.
    pub payload: Bytes,
}

impl OutboundMessage {
    /// Split an encoded message into head and zero-copy payload.
    pub fn from_message(message: &Message) -> Self {
        let payload = message.trailing_payload().cloned().unwrap_or_default();
        let mut head = BytesMut::with_capacity(message.encoded_len() - payload.len());
        message.encode_head(&mut head);
        Self {
            head: head.freeze(),
            payload,
        }
    }

    /// Total size of this message on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.head.len() + self.payload.len()
    }
}

impl From<&Message> for OutboundMessage {
    fn from(message: &Message) -> Self {
        Self::from_message(message)
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub max_pending_messages: usize,
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_messages: DEFAULT_MAX_PENDING_MESSAGES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for queueing messages to the writer task. Cheap to clone.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundMessage>,
    backpressure: BackpressureController,
}

impl WriterHandle {
    /// Queue a message, waiting while backpressure is active.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.send_raw(OutboundMessage::from_message(message)).await
    }

    /// Queue an already split message.
    pub async fn send_raw(&self, message: OutboundMessage) -> Result<()> {
        self.backpressure.reserve().await?;
        self.tx.send(message).await.map_err(|_| {
            self.backpressure.release();
            WireDropError::ConnectionClosed
        })
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.backpressure.is_active()
    }

    /// Messages queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.backpressure.pending_count()
    }
}

/// Spawn the writer task and return a handle for queueing messages.
///
/// The task ends cleanly when every handle is dropped, or with an error
/// when the transport fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let backpressure =
        BackpressureController::new(config.max_pending_messages, config.backpressure_timeout);

    let handle = WriterHandle {
        tx,
        backpressure: backpressure.clone(),
    };
    let task = tokio::spawn(writer_loop(rx, writer, backpressure));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundMessage>,
    mut writer: W,
    backpressure: BackpressureController,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(m) => m,
            None => {
                let _ = writer.shutdown().await;
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

        let batch_size = batch.len();
        let result = write_batch(&mut writer, &batch).await;
        backpressure.release_many(batch_size);
        if let Err(e) = result {
            tracing::error!("writer task stopped: {}", e);
            rx.close();
            return Err(e);
        }
    }
}

/// Write a batch of messages using scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundMessage]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(OutboundMessage::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        if slices.is_empty() {
            break;
        }
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(WireDropError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data after the first `skip_bytes`.
fn build_remaining_slices(batch: &[OutboundMessage], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for message in batch {
        for part in [&message.head, &message.payload] {
            if part.is_empty() {
                continue;
            }
            let end = offset + part.len();
            if skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}
