//! Send side of a virtual connection

use std::sync::{Mutex, Weak};

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::Notify;
use vmux_core::MuxError;
use vmux_protocol::StreamId;

use crate::lock;
use crate::multiplexer::Shared;

/// How far [`VirtualOutputStream::push`] goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Push {
    /// Send one chunk, waiting for credit if there is none
    One,
    /// Send everything, waiting for credit as needed
    All,
}

struct OutputState {
    /// Bytes written but not yet transmitted
    buffer: BytesMut,
    /// Bytes the peer is currently willing to receive
    credit: u64,
    /// `close()` has completed locally
    closed: bool,
    /// CLOSE, CLOSEACK or shutdown reached this stream
    disconnected: bool,
}

/// Buffered, credit-limited send side of one logical stream
///
/// Writes fill a buffer of `capacity` bytes. Once it is full, the writer
/// waits for credit from the peer and pushes at most that many bytes as
/// TRANSMIT frames. Operations on one stream are serialized so chunks
/// leave in the order they were written.
pub struct VirtualOutputStream {
    id: StreamId,
    capacity: usize,
    max_chunk: usize,
    state: Mutex<OutputState>,
    writable: Notify,
    op_lock: tokio::sync::Mutex<()>,
    mux: Weak<Shared>,
}

impl VirtualOutputStream {
    pub(crate) fn new(id: StreamId, capacity: usize, max_chunk: usize, mux: Weak<Shared>) -> Self {
        Self {
            id,
            capacity,
            max_chunk,
            state: Mutex::new(OutputState {
                buffer: BytesMut::with_capacity(capacity),
                credit: 0,
                closed: false,
                disconnected: false,
            }),
            writable: Notify::new(),
            op_lock: tokio::sync::Mutex::new(()),
            mux,
        }
    }

    /// Logical stream id
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Credit currently granted by the peer
    pub fn credit(&self) -> u64 {
        lock(&self.state).credit
    }

    /// Bytes buffered but not yet transmitted
    pub fn pending(&self) -> usize {
        lock(&self.state).buffer.len()
    }

    /// Whether `close()` has completed
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Whether the peer closed the stream or the multiplexer shut down
    pub fn is_disconnected(&self) -> bool {
        lock(&self.state).disconnected
    }

    /// Write all of `data`, waiting for credit whenever the buffer fills
    pub async fn write(&self, data: &[u8]) -> Result<(), MuxError> {
        let _op = self.op_lock.lock().await;
        let mut remaining = data;

        loop {
            {
                let mut state = lock(&self.state);
                if state.closed || state.disconnected {
                    return Err(MuxError::ConnectionClosed);
                }
                let room = self.capacity - state.buffer.len();
                let n = room.min(remaining.len());
                state.buffer.extend_from_slice(&remaining[..n]);
                remaining = &remaining[n..];
            }

            if remaining.is_empty() {
                return Ok(());
            }
            self.push(Push::One).await?;
        }
    }

    /// Transmit every buffered byte, waiting for credit as needed
    pub async fn flush(&self) -> Result<(), MuxError> {
        let _op = self.op_lock.lock().await;
        if lock(&self.state).closed {
            return Err(MuxError::ConnectionClosed);
        }
        self.push(Push::All).await
    }

    /// Flush, then send CLOSE
    ///
    /// Idempotent. Closing a stream the peer already closed succeeds without
    /// sending anything; buffered bytes that can no longer be delivered are
    /// dropped.
    pub async fn close(&self) -> Result<(), MuxError> {
        let _op = self.op_lock.lock().await;
        if lock(&self.state).closed {
            return Ok(());
        }

        let flushed = self.push(Push::All).await;
        {
            let mut state = lock(&self.state);
            state.closed = true;
            if !state.buffer.is_empty() {
                tracing::debug!(
                    "{}: discarding {} undelivered bytes on close",
                    self.id,
                    state.buffer.len()
                );
                state.buffer.clear();
            }
        }

        match flushed {
            Ok(()) | Err(MuxError::ConnectionClosed) => {}
            Err(e) => return Err(e),
        }

        match self.mux.upgrade() {
            Some(mux) => mux.send_close(self.id).await,
            None => Ok(()),
        }
    }

    /// Send buffered bytes within the available credit
    ///
    /// Bytes leave the buffer and credit is charged only once their
    /// TRANSMIT is queued, so dropping this future never loses data.
    async fn push(&self, mode: Push) -> Result<(), MuxError> {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let chunk = {
                let state = lock(&self.state);
                if state.disconnected {
                    return Err(MuxError::ConnectionClosed);
                }
                if state.buffer.is_empty() {
                    return Ok(());
                }
                self.peek_chunk(&state)
            };

            match chunk {
                Some(payload) => {
                    let mux = self.mux.upgrade().ok_or(MuxError::ConnectionClosed)?;
                    let len = payload.len();
                    mux.send_transmit(self.id, payload, || self.consume(len))
                        .await?;
                    if mode == Push::One {
                        return Ok(());
                    }
                }
                None => {
                    tracing::trace!("{}: waiting for credit", self.id);
                    notified.await;
                }
            }
        }
    }

    /// Copy of the front of the buffer, as much as credit allows
    fn peek_chunk(&self, state: &OutputState) -> Option<Bytes> {
        let allowed = usize::try_from(state.credit).unwrap_or(usize::MAX);
        let n = allowed.min(state.buffer.len()).min(self.max_chunk);
        if n == 0 {
            return None;
        }
        Some(Bytes::copy_from_slice(&state.buffer[..n]))
    }

    /// Drop `len` sent bytes from the buffer and charge them to credit
    fn consume(&self, len: usize) {
        let mut state = lock(&self.state);
        state.credit = state.credit.saturating_sub(len as u64);
        // A disconnect while sending has already cleared the buffer
        let len = len.min(state.buffer.len());
        state.buffer.advance(len);
    }

    /// Add credit from a REQUEST frame and wake a waiting writer
    pub(crate) fn add_credit(&self, delta: u32) {
        {
            let mut state = lock(&self.state);
            state.credit = state.credit.saturating_add(u64::from(delta));
        }
        self.writable.notify_waiters();
    }

    /// Fail current and future writes
    pub(crate) fn disconnect(&self) {
        {
            let mut state = lock(&self.state);
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            state.buffer.clear();
        }
        self.writable.notify_waiters();
    }
}

impl std::fmt::Debug for VirtualOutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualOutputStream")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .finish()
    }
}
