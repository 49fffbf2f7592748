//! Session builder and connection driver.
//!
//! The [`SessionBuilder`] collects configuration and the accept policy.
//! A [`Session`] wraps one [`Engine`] behind a per-connection mutex and
//! exposes the async operation surface:
//! 1. Outbound: `send_file`, bulk operations, `send_files`
//! 2. Inbound: `feed` (or the read loop started by `spawn`)
//! 3. Teardown: `cleanup_transfer_data`, `close`
//!
//! Requests and fragments are queued to the writer while the engine lock is
//! held, so bytes reach the transport in the order the state machine
//! produced them. Replies to inbound messages are queued by `feed` after
//! the lock is released. Waiting for acknowledgements happens outside the
//! lock.
//!
//! # Example
//!
//! ```no_run
//! use wiredrop::{Session, TransferEvent};
//!
//! # async fn run(stream: tokio::net::TcpStream) -> wiredrop::Result<()> {
//! let (session, mut events) = Session::builder()
//!     .fragment_size(16 * 1024)
//!     .peer_version(0, 0)
//!     .spawn(stream)?;
//!
//! session.send_file(&b"hello"[..], 0, 1, "hello.txt").await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let TransferEvent::ReceivedFile(file) = event {
//!         println!("got {:?} ({} bytes)", file.filename_str(), file.payload.len());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{PeerVersion, SessionConfig};
use crate::engine::{AckReceiver, Engine};
use crate::error::{Result, WireDropError};
use crate::events::{self, EventReceiver};
use crate::protocol::{Ack, ClientType, MessageBuffer, Reason};
use crate::transfer::{AcceptAll, AcceptPolicy};
use crate::version::Compatibility;
use crate::writer::{spawn_writer_task, WriterHandle};

/// Read buffer size for the connection driver.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Builder for configuring and creating a session.
pub struct SessionBuilder {
    config: SessionConfig,
    policy: Arc<dyn AcceptPolicy>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            policy: Arc::new(AcceptAll),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Maximum payload bytes per outbound fragment.
    ///
    /// Default: 64 KiB
    pub fn fragment_size(mut self, size: u32) -> Self {
        self.config.fragment_size = size;
        self
    }

    /// Inbound fragments larger than this are treated as malformed.
    ///
    /// Default: 1 MiB
    pub fn max_inbound_fragment_size(mut self, size: u32) -> Self {
        self.config.max_inbound_fragment_size = size;
        self
    }

    /// Versions this endpoint speaks and accepts.
    pub fn local_version(mut self, version: u32, min_supported: u32) -> Self {
        self.config.local_version = version;
        self.config.local_min_supported_version = min_supported;
        self
    }

    /// Versions the peer declared during connection setup.
    pub fn peer_version(mut self, version: u32, min_supported: u32) -> Self {
        self.config.peer_version = Some(PeerVersion {
            version,
            min_supported,
        });
        self
    }

    pub fn client_type(mut self, client_type: ClientType) -> Self {
        self.config.client_type = client_type;
        self
    }

    /// Set the maximum queued outbound messages for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_messages(mut self, limit: usize) -> Self {
        self.config.max_pending_messages = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.backpressure_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Stop the read loop on malformed input instead of skipping it.
    ///
    /// Default: true
    pub fn teardown_on_malformed(mut self, teardown: bool) -> Self {
        self.config.teardown_on_malformed = teardown;
        self
    }

    /// Install the policy consulted on inbound start requests.
    pub fn accept_policy<P: AcceptPolicy>(mut self, policy: P) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Build a session writing to `writer`. Inbound bytes are supplied by
    /// the caller through [`Session::feed`].
    pub fn build<W>(self, writer: W) -> Result<(Session, EventReceiver)>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.config.validate()?;

        let (writer, writer_task) = spawn_writer_task(writer, self.config.writer_config());
        let (event_tx, event_rx) = events::channel();
        let (closed, _) = watch::channel(false);

        let inner = Inner {
            buffer: MessageBuffer::with_max_fragment(self.config.max_inbound_fragment_size),
            closed: false,
            engine: Engine::new(self.config.clone(), self.policy, event_tx),
        };
        let session = Session {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                writer,
                closed,
                teardown_on_malformed: self.config.teardown_on_malformed,
                _writer_task: writer_task,
            }),
        };
        Ok((session, event_rx))
    }

    /// Build a session over a full-duplex byte stream and start reading.
    ///
    /// On EOF or a transport error the session closes: pending operations
    /// resolve with `ConnectionClosed` and the transfer state is cleared.
    pub fn spawn<T>(self, io: T) -> Result<(Session, EventReceiver)>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (session, events) = self.build(writer)?;

        let driver = session.clone();
        tokio::spawn(async move {
            match Session::read_loop(reader, &driver).await {
                Ok(()) => info!("peer closed the connection"),
                Err(e) => error!("read loop error: {}", e),
            }
            driver.close().await;
        });

        Ok((session, events))
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A file queued for [`Session::send_files`].
#[derive(Debug, Clone)]
pub struct OutboundFile {
    pub filename: Bytes,
    pub data: Bytes,
}

impl OutboundFile {
    pub fn new(filename: impl Into<Bytes>, data: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            data: data.into(),
        }
    }
}

struct Inner {
    engine: Engine,
    buffer: MessageBuffer,
    closed: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    writer: WriterHandle,
    closed: watch::Sender<bool>,
    teardown_on_malformed: bool,
    _writer_task: JoinHandle<Result<()>>,
}

/// One protocol connection. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

async fn wait_ack(rx: AckReceiver) -> Result<Ack> {
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(WireDropError::Cancelled),
    }
}

/// Releases the outbound file slot if `send_file` is dropped or fails
/// before its final acknowledgement.
struct AbandonOnDrop {
    shared: Option<Arc<Shared>>,
    file_id: u16,
}

impl AbandonOnDrop {
    fn disarm(mut self) {
        self.shared = None;
    }
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        let file_id = self.file_id;
        if let Ok(mut inner) = shared.inner.try_lock() {
            inner.engine.abandon_file(file_id);
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                shared.inner.lock().await.engine.abandon_file(file_id);
            });
        }
    }
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    async fn lock_open(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.shared.inner.lock().await;
        if inner.closed {
            return Err(WireDropError::ConnectionClosed);
        }
        Ok(inner)
    }

    /// Main read loop - reads bytes and feeds them to the engine.
    async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, session: &Session) -> Result<()> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) => return Err(WireDropError::Io(e)),
            };

            match session.feed(&buf[..n]).await {
                Ok(()) => {}
                Err(WireDropError::MalformedMessage(reason))
                    if !session.shared.teardown_on_malformed =>
                {
                    debug!(%reason, "skipped malformed input");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Deliver raw inbound bytes.
    ///
    /// Bytes need not align with message boundaries. Replies are queued to
    /// the writer before this returns, in order as long as one task feeds
    /// the session. Per-message protocol errors (such as an out-of-order
    /// fragment or an unsolicited ack) are logged and do not fail the call.
    /// Undecodable input returns `MalformedMessage` after every message
    /// decoded ahead of it has been handled.
    pub async fn feed(&self, data: &[u8]) -> Result<()> {
        let mut replies = Vec::new();
        let malformed = {
            let mut inner = self.lock_open().await?;
            inner.buffer.extend(data);
            loop {
                let message = match inner.buffer.next_message() {
                    Ok(Some(message)) => message,
                    Ok(None) => break None,
                    Err(e) => break Some(e),
                };
                let opcode = message.opcode();
                let id = message.id();
                match inner.engine.handle(message) {
                    Ok(Some(reply)) => replies.push(reply),
                    Ok(None) => {}
                    Err(e) => debug!(?opcode, id, "message not applied: {}", e),
                }
            }
        };

        for reply in &replies {
            self.shared.writer.send(reply).await?;
        }
        match malformed {
            Some(e) => {
                warn!("dropping malformed input: {}", e);
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Send one file and wait for the peer's verdict.
    ///
    /// Inside an open bulk the file counts towards the bulk. Fails with
    /// `TransferAlreadyInProgress` if another file occupies the connection,
    /// `Rejected` if the peer refuses it, `TransferFailed` if the peer
    /// reports it incomplete, and `Cancelled` if the transfer is cleaned up
    /// meanwhile.
    pub async fn send_file(
        &self,
        data: impl Into<Bytes>,
        file_no: u16,
        total: u16,
        filename: impl Into<Bytes>,
    ) -> Result<()> {
        let start = {
            let mut inner = self.lock_open().await?;
            let start = inner
                .engine
                .begin_send_file(data.into(), file_no, total, filename.into())?;
            if let Err(e) = self.shared.writer.send(&start.message).await {
                inner.engine.abandon_file(start.id);
                return Err(e);
            }
            start
        };
        let file_id = start.id;
        let guard = AbandonOnDrop {
            shared: Some(self.shared.clone()),
            file_id,
        };

        let ack = wait_ack(start.ack).await?;
        if !ack.ok {
            guard.disarm();
            return Err(WireDropError::Rejected(ack.reason));
        }

        loop {
            let mut inner = self.lock_open().await?;
            match inner.engine.next_fragment(file_id)? {
                Some(segment) => self.shared.writer.send(&segment).await?,
                None => break,
            }
        }

        let end = {
            let mut inner = self.lock_open().await?;
            let end = inner.engine.finish_send(file_id)?;
            self.shared.writer.send(&end.message).await?;
            end
        };

        let ack = wait_ack(end.ack).await;
        guard.disarm();
        let ack = ack?;
        if ack.ok {
            Ok(())
        } else {
            Err(WireDropError::TransferFailed(ack.reason))
        }
    }

    /// Open a bulk session of `total` files. Returns the bulk id.
    pub async fn start_bulk_transfer(&self, total: u16) -> Result<u16> {
        let start = {
            let mut inner = self.lock_open().await?;
            let start = inner.engine.begin_bulk(total)?;
            if let Err(e) = self.shared.writer.send(&start.message).await {
                inner.engine.abandon_bulk(start.id);
                return Err(e);
            }
            start
        };

        let bulk_id = start.id;
        let ack = wait_ack(start.ack).await?;
        if ack.ok {
            Ok(bulk_id)
        } else {
            Err(WireDropError::Rejected(ack.reason))
        }
    }

    async fn end_bulk(&self, aborted: bool, reason: Reason) -> Result<Ack> {
        let end = {
            let mut inner = self.lock_open().await?;
            let end = inner.engine.end_bulk(aborted, reason)?;
            self.shared.writer.send(&end.message).await?;
            end
        };
        wait_ack(end.ack).await
    }

    /// Close the open bulk session. Succeeds only if the peer confirms that
    /// every announced file arrived.
    pub async fn end_bulk_transfer(&self) -> Result<()> {
        let ack = self.end_bulk(false, Reason::Accepted).await?;
        if ack.ok {
            Ok(())
        } else {
            Err(WireDropError::TransferFailed(ack.reason))
        }
    }

    /// Abort the open bulk session, abandoning the file in flight.
    pub async fn abort_bulk_transfer(&self, reason: Reason) -> Result<()> {
        let ack = self.end_bulk(true, reason).await?;
        debug!(bulk_id = ack.id, reason = ?ack.reason, "bulk aborted");
        Ok(())
    }

    /// Send `files` as one bulk, in order. The bulk is aborted on the first
    /// file that fails and that file's error is returned.
    pub async fn send_files(&self, files: Vec<OutboundFile>) -> Result<()> {
        let total = u16::try_from(files.len()).map_err(|_| {
            WireDropError::PayloadTooLarge(format!("{} files exceeds u16 file count", files.len()))
        })?;
        let bulk_id = self.start_bulk_transfer(total).await?;

        for (file_no, file) in files.into_iter().enumerate() {
            if let Err(e) = self
                .send_file(file.data, file_no as u16, total, file.filename)
                .await
            {
                warn!(bulk_id, file_no, "file failed, aborting bulk: {}", e);
                if let Err(abort_err) = self.abort_bulk_transfer(Reason::Aborted).await {
                    warn!(bulk_id, "bulk abort failed: {}", abort_err);
                }
                return Err(e);
            }
        }

        self.end_bulk_transfer().await
    }

    /// Reset the transfer state. Pending operations resolve with
    /// `Cancelled`.
    pub async fn cleanup_transfer_data(&self) {
        let mut inner = self.shared.inner.lock().await;
        inner.engine.cleanup(|| WireDropError::Cancelled);
    }

    /// Record the peer's versions, e.g. after a renegotiation.
    pub async fn update_version(&self, version: u32, min_supported: u32) -> Compatibility {
        let mut inner = self.shared.inner.lock().await;
        inner.engine.update_version(PeerVersion {
            version,
            min_supported,
        })
    }

    pub async fn compatibility(&self) -> Compatibility {
        self.shared.inner.lock().await.engine.compatibility().clone()
    }

    pub async fn current_file_no(&self) -> u16 {
        self.shared.inner.lock().await.engine.current_file_no()
    }

    pub async fn total_files_to_transfer(&self) -> u16 {
        self.shared.inner.lock().await.engine.total_files_to_transfer()
    }

    /// Mark the session closed. Pending operations resolve with
    /// `ConnectionClosed` and later calls fail with it.
    pub async fn close(&self) {
        let mut inner = self.shared.inner.lock().await;
        if !inner.closed {
            inner.closed = true;
            inner.buffer.clear();
            inner.engine.cleanup(|| WireDropError::ConnectionClosed);
        }
        drop(inner);
        self.shared.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Wait until the session is closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Get the current backpressure status.
    pub fn is_backpressure_active(&self) -> bool {
        self.shared.writer.is_backpressure_active()
    }

    /// Get the number of outbound messages not yet written.
    pub fn pending_messages(&self) -> usize {
        self.shared.writer.pending_count()
    }
}
