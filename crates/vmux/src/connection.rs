//! Application-facing virtual connection handle

use std::sync::Arc;

use tokio::sync::mpsc;
use vmux_core::MuxError;
use vmux_protocol::StreamId;

use crate::stream::{VirtualInputStream, VirtualOutputStream};

/// Receives virtual connections opened by the peer
///
/// Called on the receive-loop task for every accepted OPEN, so it must hand
/// the connection off quickly (spawn a task, send it down a channel) rather
/// than serve it inline.
pub trait AcceptConnection: Send + Sync + 'static {
    /// Take ownership of a newly opened connection
    fn accept(&self, connection: VirtualConnection);
}

impl<F> AcceptConnection for F
where
    F: Fn(VirtualConnection) + Send + Sync + 'static,
{
    fn accept(&self, connection: VirtualConnection) {
        self(connection)
    }
}

/// Acceptor that forwards peer-opened connections to a channel
///
/// Connections arriving after the receiver is dropped are closed.
pub fn accept_channel() -> (
    impl AcceptConnection,
    mpsc::UnboundedReceiver<VirtualConnection>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let acceptor = move |connection: VirtualConnection| {
        if let Err(mpsc::error::SendError(connection)) = tx.send(connection) {
            tracing::debug!("No acceptor listening; closing {}", connection.id());
        }
    };
    (acceptor, rx)
}

/// One logical connection multiplexed over the shared stream
///
/// Reading and writing may happen concurrently from different tasks through
/// a shared reference. Dropping a handle that was not closed flushes and
/// closes it in the background. Like [`close`](Self::close), that flush waits
/// for credit; it ends once the peer grants it, the peer closes the stream,
/// or the multiplexer shuts down.
#[derive(Debug)]
pub struct VirtualConnection {
    input: Arc<VirtualInputStream>,
    output: Arc<VirtualOutputStream>,
}

impl VirtualConnection {
    pub(crate) fn new(input: Arc<VirtualInputStream>, output: Arc<VirtualOutputStream>) -> Self {
        Self { input, output }
    }

    /// Logical stream id
    pub fn id(&self) -> StreamId {
        self.input.id()
    }

    /// Read up to `buf.len()` bytes; `Ok(0)` means end of stream
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, MuxError> {
        self.input.read(buf).await
    }

    /// Read until end of stream, appending to `out`
    pub async fn read_to_end(&self, out: &mut Vec<u8>) -> Result<usize, MuxError> {
        let mut chunk = [0u8; 1024];
        let mut total = 0;
        loop {
            let n = self.input.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }

    /// Write all of `data`
    pub async fn write(&self, data: &[u8]) -> Result<(), MuxError> {
        self.output.write(data).await
    }

    /// Transmit everything written so far
    pub async fn flush(&self) -> Result<(), MuxError> {
        self.output.flush().await
    }

    /// Flush and close the sending direction
    ///
    /// Data the peer sends before acknowledging the close can still be read.
    pub async fn close(&self) -> Result<(), MuxError> {
        self.output.close().await
    }

    /// Receive side
    pub fn input(&self) -> &Arc<VirtualInputStream> {
        &self.input
    }

    /// Send side
    pub fn output(&self) -> &Arc<VirtualOutputStream> {
        &self.output
    }
}

impl Drop for VirtualConnection {
    fn drop(&mut self) {
        if self.output.is_closed() || self.output.is_disconnected() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("{} dropped outside a runtime; not closing", self.id());
            return;
        };

        let output = Arc::clone(&self.output);
        runtime.spawn(async move {
            if let Err(e) = output.close().await {
                tracing::debug!("{}: close on drop failed: {}", output.id(), e);
            }
        });
    }
}
