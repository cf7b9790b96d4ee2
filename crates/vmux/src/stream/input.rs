//! Receive side of a virtual connection

use std::sync::{Mutex, Weak};

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::Notify;
use vmux_core::MuxError;
use vmux_protocol::StreamId;

use crate::lock;
use crate::multiplexer::Shared;

/// How the input side was disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    /// CLOSE/CLOSEACK: drain what is buffered, then end of stream
    Graceful,
    /// Multiplexer shutdown: reads fail
    Reset,
}

struct InputState {
    /// Bytes received but not yet read
    buffer: BytesMut,
    /// Credit granted to the peer and not yet used by TRANSMITs
    requested: usize,
    disconnected: Option<Disconnect>,
}

/// Buffered receive side of one logical stream
///
/// Reads suspend while the buffer is empty. The stream grants credit to the
/// peer whenever buffered plus outstanding bytes fall below half of its
/// capacity, topping the window back up to the full capacity.
pub struct VirtualInputStream {
    id: StreamId,
    capacity: usize,
    state: Mutex<InputState>,
    readable: Notify,
    mux: Weak<Shared>,
}

impl VirtualInputStream {
    pub(crate) fn new(id: StreamId, capacity: usize, mux: Weak<Shared>) -> Self {
        Self {
            id,
            capacity,
            state: Mutex::new(InputState {
                buffer: BytesMut::with_capacity(capacity),
                requested: 0,
                disconnected: None,
            }),
            readable: Notify::new(),
            mux,
        }
    }

    /// Logical stream id
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Bytes that can be read without waiting
    pub fn available(&self) -> usize {
        lock(&self.state).buffer.len()
    }

    /// Whether CLOSE, CLOSEACK or shutdown has reached this stream
    pub fn is_disconnected(&self) -> bool {
        lock(&self.state).disconnected.is_some()
    }

    /// Read up to `buf.len()` bytes
    ///
    /// Returns `Ok(0)` once the stream was closed by the peer and every
    /// buffered byte has been read. After a multiplexer shutdown it fails
    /// with `ConnectionClosed`.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, MuxError> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (read, grant, disconnected) = {
                let mut state = lock(&self.state);
                if state.disconnected == Some(Disconnect::Reset) {
                    return Err(MuxError::ConnectionClosed);
                }

                let n = buf.len().min(state.buffer.len());
                if n > 0 {
                    buf[..n].copy_from_slice(&state.buffer[..n]);
                    state.buffer.advance(n);
                }

                let grant = match state.disconnected {
                    Some(_) => 0,
                    None => self.take_grant(&mut state),
                };
                (n, grant, state.disconnected.is_some())
            };

            if grant > 0 {
                self.spawn_request(grant);
            }

            if read > 0 {
                return Ok(read);
            }
            if disconnected {
                return Ok(0);
            }

            notified.await;
        }
    }

    /// Credit to grant now, if the window has fallen below half capacity
    fn take_grant(&self, state: &mut InputState) -> usize {
        let outstanding = state.buffer.len() + state.requested;
        if outstanding >= self.capacity.div_ceil(2) {
            return 0;
        }
        let grant = self.capacity - outstanding;
        state.requested += grant;
        grant
    }

    /// Send a REQUEST from its own task
    ///
    /// The grant is already counted in `requested`, so it must reach the wire
    /// even if the read that produced it is dropped.
    fn spawn_request(&self, grant: usize) {
        let Some(mux) = self.mux.upgrade() else {
            return;
        };
        let id = self.id;
        // Capacity is validated to fit a u32 grant
        let credit = u32::try_from(grant).unwrap_or(u32::MAX);
        tokio::spawn(async move {
            if let Err(e) = mux.send_request(id, credit).await {
                tracing::debug!("{}: credit grant of {} failed: {}", id, credit, e);
            }
        });
    }

    /// Append a TRANSMIT payload from the receive loop
    pub(crate) fn receive(&self, payload: Bytes) {
        {
            let mut state = lock(&self.state);
            if state.disconnected.is_some() {
                tracing::debug!(
                    "{}: dropping {} bytes received after disconnect",
                    self.id,
                    payload.len()
                );
                return;
            }
            if payload.len() > state.requested {
                tracing::warn!(
                    "{}: peer sent {} bytes with only {} bytes of credit outstanding",
                    self.id,
                    payload.len(),
                    state.requested
                );
            }
            state.requested = state.requested.saturating_sub(payload.len());
            state.buffer.extend_from_slice(&payload);
        }
        self.readable.notify_waiters();
    }

    /// Wake blocked readers and refuse further data
    pub(crate) fn disconnect(&self, graceful: bool) {
        {
            let mut state = lock(&self.state);
            if state.disconnected.is_some() {
                return;
            }
            if graceful {
                state.disconnected = Some(Disconnect::Graceful);
            } else {
                state.disconnected = Some(Disconnect::Reset);
                state.buffer.clear();
            }
        }
        self.readable.notify_waiters();
    }
}

impl std::fmt::Debug for VirtualInputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualInputStream")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn detached(capacity: usize) -> VirtualInputStream {
        VirtualInputStream::new(StreamId::new(1), capacity, Weak::new())
    }

    #[tokio::test]
    async fn test_graceful_disconnect_drains_then_eof() {
        let input = detached(16);
        lock(&input.state).requested = 16;
        input.receive(Bytes::from_static(b"abcdef"));
        input.disconnect(true);

        let mut buf = [0u8; 4];
        assert_eq!(input.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(input.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(input.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_fails_reads() {
        let input = detached(16);
        lock(&input.state).requested = 16;
        input.receive(Bytes::from_static(b"abc"));
        input.disconnect(false);

        let mut buf = [0u8; 4];
        assert!(matches!(
            input.read(&mut buf).await,
            Err(MuxError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_blocked_reader_woken_by_receive() {
        let input = Arc::new(detached(16));
        // Pretend the window is already granted so no REQUEST is needed
        lock(&input.state).requested = 16;

        let reader = {
            let input = Arc::clone(&input);
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                let n = input.read(&mut buf).await.unwrap();
                buf[..n].to_vec()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        input.receive(Bytes::from_static(b"xyz"));

        let data = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, b"xyz");
    }

    #[tokio::test]
    async fn test_blocked_reader_woken_by_disconnect() {
        let input = Arc::new(detached(16));
        lock(&input.state).requested = 16;

        let reader = {
            let input = Arc::clone(&input);
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                input.read(&mut buf).await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        input.disconnect(true);

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap(), 0);
    }

    #[test]
    fn test_grant_policy() {
        let input = detached(100);
        let mut state = lock(&input.state);

        // Empty window: grant the full capacity
        assert_eq!(input.take_grant(&mut state), 100);
        assert_eq!(input.take_grant(&mut state), 0);

        // Peer used 60 bytes, reader consumed them: 40 outstanding < 50
        state.requested = 40;
        assert_eq!(input.take_grant(&mut state), 60);

        // 30 buffered + 30 outstanding is above the low-water mark
        state.requested = 30;
        state.buffer.extend_from_slice(&[0u8; 30]);
        assert_eq!(input.take_grant(&mut state), 0);
    }

    #[test]
    fn test_receive_beyond_capacity_is_kept() {
        let input = detached(4);
        lock(&input.state).requested = 4;
        input.receive(Bytes::from_static(b"0123456789"));
        assert_eq!(input.available(), 10);
        assert_eq!(lock(&input.state).requested, 0);
    }
}
