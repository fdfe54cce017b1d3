//! Per-connection session: receive loop, batched sends, single-shot disconnect.
//!
//! A [`Session`] owns one byte-stream connection for its whole lifetime. A
//! read task feeds inbound bytes through a [`RecvBuffer`] into the owner's
//! [`StreamHandler`]. Outbound chunks queue behind at most one in-flight
//! vectored write; when that write completes the backlog is drained into the
//! next batch.
//!
//! ```text
//! send(a) ──► queue ──► pending batch ──► write task ──► connection
//! send(b) ──► queue ─┘        ▲                │
//!                             └── on complete ─┘
//! ```
//!
//! Transport and protocol failures never escape the session: they end in
//! [`Session::disconnect`], which the owner observes once through
//! [`StreamHandler::on_disconnected`].

use std::collections::VecDeque;
use std::fmt;
use std::io::IoSlice;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, watch};

use crate::error::{ProtocolError, SessionError};
use crate::recv_buffer::{
    DEFAULT_LOW_WATER, DEFAULT_MAX_RECV_BUFFER_SIZE, DEFAULT_RECV_BUFFER_SIZE, MIN_RECV_CEILING,
    RecvBuffer,
};

/// Any ordered byte stream a session can own.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Connection for T {}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Process-unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Session lifecycle. Transitions exactly once, Active → Disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Reads and writes are being issued.
    Active = 0,
    /// Torn down; terminal.
    Disconnected = 1,
}

/// Raw byte-stream callbacks a session owner implements.
///
/// Callbacks may run on any runtime worker thread and may call back into the
/// session, including [`Session::disconnect`].
pub trait StreamHandler: Send + Sync + 'static {
    /// Fired once, right after the session starts.
    fn on_connected(&self, _session: &Session, _peer_addr: SocketAddr) {}

    /// Inspect the unconsumed receive bytes and return how many were fully
    /// processed. Unconsumed bytes are presented again after the next read.
    fn on_receive(&self, session: &Session, data: &[u8]) -> Result<usize, ProtocolError>;

    /// Fired once per completed physical write, with the bytes it carried.
    fn on_sent(&self, _session: &Session, _bytes: usize) {}

    /// Fired exactly once, whatever caused the disconnect.
    fn on_disconnected(&self, _session: &Session, _peer_addr: SocketAddr) {}
}

impl<T: StreamHandler> StreamHandler for Arc<T> {
    fn on_connected(&self, session: &Session, peer_addr: SocketAddr) {
        (**self).on_connected(session, peer_addr);
    }

    fn on_receive(&self, session: &Session, data: &[u8]) -> Result<usize, ProtocolError> {
        (**self).on_receive(session, data)
    }

    fn on_sent(&self, session: &Session, bytes: usize) {
        (**self).on_sent(session, bytes);
    }

    fn on_disconnected(&self, session: &Session, peer_addr: SocketAddr) {
        (**self).on_disconnected(session, peer_addr);
    }
}

/// Tuning for a single session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Initial receive buffer capacity. Default: 4 KB.
    pub recv_buffer_size: usize,
    /// Free space below which the receive buffer compacts. Default: 1 KB.
    pub recv_low_water: usize,
    /// Ceiling for receive buffer growth. Default: 1 MB. Values below
    /// [`MIN_RECV_CEILING`] are raised to it.
    pub max_recv_buffer_size: usize,
    /// Maximum queued (not yet in-flight) chunks. `None` = unbounded.
    pub max_send_queue: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            recv_low_water: DEFAULT_LOW_WATER,
            max_recv_buffer_size: DEFAULT_MAX_RECV_BUFFER_SIZE,
            max_send_queue: None,
        }
    }
}

#[derive(Default)]
struct SendState {
    /// Chunks waiting for the next batch, in wire order.
    queue: VecDeque<Bytes>,
    /// Chunks covered by the write currently in flight.
    pending: Vec<Bytes>,
}

impl SendState {
    fn take_batch(&mut self) -> Vec<Bytes> {
        self.pending.extend(self.queue.drain(..));
        self.pending.clone()
    }
}

/// One connection and its I/O state.
pub struct Session {
    id: SessionId,
    peer_addr: SocketAddr,
    state: AtomicU8,
    handler: Box<dyn StreamHandler>,
    send: Mutex<SendState>,
    writer: AsyncMutex<Option<BoxedWriter>>,
    shutdown_tx: watch::Sender<bool>,
    runtime: Handle,
    max_send_queue: Option<usize>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    me: Weak<Session>,
}

impl Session {
    /// Take ownership of `connection` and start the session.
    ///
    /// Fires [`StreamHandler::on_connected`] before the first read is issued.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<C, H>(
        connection: C,
        peer_addr: SocketAddr,
        handler: H,
        config: &SessionConfig,
    ) -> Arc<Session>
    where
        C: Connection,
        H: StreamHandler,
    {
        let (reader, writer) = tokio::io::split(connection);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session = Arc::new_cyclic(|me| Session {
            id: SessionId::next(),
            peer_addr,
            state: AtomicU8::new(SessionState::Active as u8),
            handler: Box::new(handler),
            send: Mutex::new(SendState::default()),
            writer: AsyncMutex::new(Some(Box::new(writer))),
            shutdown_tx,
            runtime: Handle::current(),
            max_send_queue: config.max_send_queue,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            me: me.clone(),
        });

        tracing::info!("Session {:?} started with {peer_addr}", session.id);
        session.handler.on_connected(&session, peer_addr);

        let buffer = RecvBuffer::with_limits(
            config.recv_buffer_size,
            config.recv_low_water,
            config.max_recv_buffer_size.max(MIN_RECV_CEILING),
        );
        let task_session = Arc::clone(&session);
        session.runtime.spawn(async move {
            task_session.read_loop(reader, buffer, shutdown_rx).await;
        });

        session
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote address of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        if self.state.load(Ordering::Acquire) == SessionState::Active as u8 {
            SessionState::Active
        } else {
            SessionState::Disconnected
        }
    }

    /// Whether the session is still [`SessionState::Active`].
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Total bytes written to the connection.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Total bytes read from the connection.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Chunks waiting behind the in-flight write.
    pub fn queued_chunks(&self) -> usize {
        self.lock_send().queue.len()
    }

    /// Whether a write is currently in flight.
    pub fn has_pending_batch(&self) -> bool {
        !self.lock_send().pending.is_empty()
    }

    /// Queue `chunk` for transmission.
    ///
    /// Issues a write immediately when none is in flight; otherwise the chunk
    /// joins the next batch. Chunks reach the wire in call order.
    pub fn send(&self, chunk: Bytes) -> Result<(), SessionError> {
        let batch = {
            let mut send = self.lock_send();
            if !self.is_active() {
                return Err(SessionError::Disconnected);
            }
            if let Some(limit) = self.max_send_queue
                && send.queue.len() >= limit
            {
                return Err(SessionError::SendQueueFull { limit });
            }

            send.queue.push_back(chunk);
            if !send.pending.is_empty() {
                return Ok(());
            }
            send.take_batch()
        };

        self.spawn_flush(batch);
        Ok(())
    }

    /// Tear the session down.
    ///
    /// Safe to call any number of times from any thread or callback; only the
    /// first call closes the connection, drops queued chunks and fires
    /// [`StreamHandler::on_disconnected`].
    pub fn disconnect(&self) {
        if self
            .state
            .compare_exchange(
                SessionState::Active as u8,
                SessionState::Disconnected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let _ = self.shutdown_tx.send(true);
        {
            let mut send = self.lock_send();
            send.queue.clear();
            send.pending.clear();
        }
        self.close_writer();

        tracing::info!("Session {:?} disconnected from {}", self.id, self.peer_addr);
        self.handler.on_disconnected(self, self.peer_addr);
    }

    fn lock_send(&self) -> MutexGuard<'_, SendState> {
        self.send.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close_with(&self, cause: SessionError) {
        if self.is_active() {
            match &cause {
                SessionError::Protocol(_) => {
                    tracing::warn!("Session {:?} closing: {cause}", self.id);
                }
                _ => tracing::debug!("Session {:?} closing: {cause}", self.id),
            }
        }
        self.disconnect();
    }

    fn close_writer(&self) {
        let Some(session) = self.me.upgrade() else {
            return;
        };
        self.runtime.spawn(async move {
            let writer = session.writer.lock().await.take();
            if let Some(mut writer) = writer {
                let _ = writer.shutdown().await;
            }
        });
    }

    fn spawn_flush(&self, batch: Vec<Bytes>) {
        let Some(session) = self.me.upgrade() else {
            return;
        };
        self.runtime.spawn(async move {
            session.flush(batch).await;
        });
    }

    /// Write task. Runs while batches keep forming; only one exists at a time.
    async fn flush(self: Arc<Self>, mut batch: Vec<Bytes>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if !self.is_active() {
                return;
            }

            let result = {
                let mut guard = self.writer.lock().await;
                let Some(writer) = guard.as_mut() else {
                    return;
                };
                tokio::select! {
                    result = write_batch(writer, &batch) => result,
                    _ = shutdown_rx.changed() => return,
                }
            };

            let sent = match result {
                Ok(n) => n,
                Err(e) => {
                    self.close_with(SessionError::Transport(e));
                    return;
                }
            };
            self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
            tracing::debug!(
                "Session {:?} wrote {} chunks ({sent} bytes)",
                self.id,
                batch.len()
            );

            let next = {
                let mut send = self.lock_send();
                send.pending.clear();
                if send.queue.is_empty() || !self.is_active() {
                    None
                } else {
                    Some(send.take_batch())
                }
            };

            if self.is_active() {
                self.handler.on_sent(&self, sent);
            }

            match next {
                Some(next) => batch = next,
                None => return,
            }
        }
    }

    async fn read_loop<R>(
        self: Arc<Self>,
        mut reader: R,
        mut buffer: RecvBuffer,
        mut shutdown_rx: watch::Receiver<bool>,
    ) where
        R: AsyncRead + Unpin,
    {
        while self.is_active() {
            buffer.reclaim();
            if buffer.is_full() {
                let capacity = buffer.capacity();
                self.close_with(ProtocolError::BufferExhausted { capacity }.into());
                break;
            }

            let result = tokio::select! {
                result = reader.read(buffer.write_segment()) => result,
                _ = shutdown_rx.changed() => break,
            };

            match result {
                Ok(0) => {
                    tracing::debug!("Session {:?} closed by peer", self.id);
                    self.disconnect();
                    break;
                }
                Ok(_) if !self.is_active() => break,
                Ok(n) => {
                    buffer.commit_write(n);
                    self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    tracing::trace!("Session {:?} received {n} bytes", self.id);

                    if let Err(e) = self.dispatch_received(&mut buffer) {
                        self.close_with(e.into());
                        break;
                    }
                }
                Err(e) => {
                    self.close_with(SessionError::Transport(e));
                    break;
                }
            }
        }
    }

    /// Hand the readable region to the handler and consume what it parsed.
    fn dispatch_received(&self, buffer: &mut RecvBuffer) -> Result<(), ProtocolError> {
        let available = buffer.data_size();
        let consumed = self.handler.on_receive(self, buffer.read_segment())?;
        if consumed > available {
            return Err(ProtocolError::OverConsumed {
                consumed,
                available,
            });
        }
        buffer.commit_read(consumed);
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Write every chunk of `batch` using vectored writes, resuming after
/// partial writes. Returns the total byte count.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let total: usize = batch.iter().map(Bytes::len).sum();
    let mut written = 0;

    while written < total {
        let slices = remaining_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "connection accepted zero bytes",
            ));
        }
        written += n;
    }

    writer.flush().await?;
    Ok(total)
}

/// Slices covering `batch` with the first `skip` bytes removed.
fn remaining_slices(batch: &[Bytes], mut skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    for chunk in batch {
        if skip >= chunk.len() {
            skip -= chunk.len();
            continue;
        }
        slices.push(IoSlice::new(&chunk[skip..]));
        skip = 0;
    }
    slices
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
