//! Multiplexer: receive loop, frame dispatch and outbound framing
//!
//! One task runs [`Multiplexer::run`], reading frames in wire order and
//! routing them to the table's streams. Any number of tasks send frames
//! concurrently; every frame is written whole under one async lock on the
//! write half.
//!
//! Lock order is write half → table. CLOSE/CLOSEACK bookkeeping happens with
//! the write half held, so the wire always sees OPEN/CLOSE/CLOSEACK for a
//! given id in the same order the table applied them.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use vmux_core::{MuxConfig, MuxError, ProtocolViolation};
use vmux_protocol::{Frame, FrameCodec, OpCode, StreamId};

use crate::connection::{AcceptConnection, VirtualConnection};
use crate::lock;
use crate::stream::{VirtualInputStream, VirtualOutputStream};
use crate::table::{Admission, ConnectionRecord, ConnectionTable};

type FrameWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, FrameCodec>;
type FrameReader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, FrameCodec>;

/// State shared by the multiplexer handle, the receive loop and every
/// stream (streams hold it weakly)
pub(crate) struct Shared {
    config: MuxConfig,
    is_originator: bool,
    table: ConnectionTable,
    writer: tokio::sync::Mutex<FrameWriter>,
    cancel: CancellationToken,
}

/// Read half and acceptor, taken by the one task that runs the loop
struct Receiver {
    frames: FrameReader,
    acceptor: Arc<dyn AcceptConnection>,
}

/// Many virtual connections over one byte stream
///
/// Cloning is cheap; all clones drive the same underlying stream.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
    receiver: Arc<Mutex<Option<Receiver>>>,
}

impl Multiplexer {
    /// Create a multiplexer with the default configuration
    ///
    /// `is_originator` must be true on exactly one of the two endpoints; it
    /// partitions the id space so both sides can open streams concurrently.
    pub fn new<S, A>(stream: S, is_originator: bool, acceptor: A) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        A: AcceptConnection,
    {
        Self::build(stream, is_originator, MuxConfig::default(), Arc::new(acceptor))
    }

    /// Create a multiplexer with explicit tunables
    pub fn with_config<S, A>(
        stream: S,
        is_originator: bool,
        config: MuxConfig,
        acceptor: A,
    ) -> Result<Self, MuxError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        A: AcceptConnection,
    {
        config.validate()?;
        Ok(Self::build(stream, is_originator, config, Arc::new(acceptor)))
    }

    fn build<S>(
        stream: S,
        is_originator: bool,
        config: MuxConfig,
        acceptor: Arc<dyn AcceptConnection>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let read_half: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
        let write_half: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);

        let frames = FramedRead::new(
            read_half,
            FrameCodec::with_max_frame_length(config.max_frame_length),
        );
        let writer = FramedWrite::new(
            write_half,
            FrameCodec::with_max_frame_length(config.max_frame_length),
        );

        let shared = Arc::new(Shared {
            table: ConnectionTable::new(config.max_connections),
            config,
            is_originator,
            writer: tokio::sync::Mutex::new(writer),
            cancel: CancellationToken::new(),
        });

        Self {
            shared,
            receiver: Arc::new(Mutex::new(Some(Receiver { frames, acceptor }))),
        }
    }

    /// Run the receive loop until the stream ends, a fatal error occurs or
    /// [`shutdown`](Self::shutdown) is called
    ///
    /// Returns `Ok(())` on a clean end of stream or local shutdown. Transport
    /// and protocol errors are returned after the multiplexer has shut down.
    pub async fn run(&self) -> Result<(), MuxError> {
        let mut receiver = lock(&self.receiver)
            .take()
            .ok_or(MuxError::AlreadyRunning)?;

        tracing::debug!(
            "Multiplexer receive loop started (originator: {})",
            self.shared.is_originator
        );
        let result = self.shared.receive_loop(&mut receiver).await;
        self.shared.shutdown();

        match &result {
            Ok(()) => tracing::info!("Multiplexer closed"),
            Err(e) => tracing::warn!("Multiplexer failed: {}", e),
        }
        result
    }

    /// Open a new virtual connection to the peer
    ///
    /// Fails with `CapacityExceeded` when the live-connection ceiling is
    /// reached, and with `ConnectionClosed` after shutdown.
    pub async fn open_connection(&self) -> Result<VirtualConnection, MuxError> {
        self.shared.open_connection().await
    }

    /// Tear down every virtual connection and release the stream
    ///
    /// Idempotent and callable from any task.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    /// Whether the multiplexer is still running
    pub fn is_alive(&self) -> bool {
        self.shared.table.is_alive()
    }

    /// Number of open virtual connections
    pub fn connection_count(&self) -> usize {
        self.shared.table.len()
    }

    /// Configuration in effect
    pub fn config(&self) -> &MuxConfig {
        &self.shared.config
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("is_originator", &self.shared.is_originator)
            .field("alive", &self.is_alive())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl Shared {
    fn new_streams(
        self: &Arc<Self>,
        id: StreamId,
    ) -> (Arc<VirtualInputStream>, Arc<VirtualOutputStream>) {
        let input = Arc::new(VirtualInputStream::new(
            id,
            self.config.buffer_size,
            Arc::downgrade(self),
        ));
        let output = Arc::new(VirtualOutputStream::new(
            id,
            self.config.buffer_size,
            self.config.max_frame_length,
            Arc::downgrade(self),
        ));
        (input, output)
    }

    async fn receive_loop(self: &Arc<Self>, receiver: &mut Receiver) -> Result<(), MuxError> {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                next = receiver.frames.next() => next,
            };

            let frame = match next {
                Some(frame) => frame?,
                None => {
                    tracing::debug!("Underlying stream reached end of stream");
                    return Ok(());
                }
            };

            match self.dispatch(frame, receiver.acceptor.as_ref()).await {
                Ok(()) => {}
                // Lost a race with a local shutdown
                Err(MuxError::ConnectionClosed) if !self.table.is_alive() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        frame: Frame,
        acceptor: &dyn AcceptConnection,
    ) -> Result<(), MuxError> {
        tracing::trace!("Received {} for {}", frame.op_code(), frame.stream_id());

        match frame {
            Frame::Open(id) => self.handle_open(id, acceptor).await,
            Frame::Close(id) => self.handle_close(id).await,
            Frame::CloseAck(id) => {
                let record = self.table.remove_acknowledged(id)?;
                record.disconnect(true);
                tracing::debug!("{} closed (acknowledged)", id);
                Ok(())
            }
            Frame::Request { stream_id, credit } => {
                let (_, output) = self.table.expect(OpCode::Request, stream_id)?;
                output.add_credit(credit);
                Ok(())
            }
            Frame::Transmit { stream_id, payload } => {
                let (input, _) = self.table.expect(OpCode::Transmit, stream_id)?;
                input.receive(payload);
                Ok(())
            }
        }
    }

    async fn handle_open(
        self: &Arc<Self>,
        id: StreamId,
        acceptor: &dyn AcceptConnection,
    ) -> Result<(), MuxError> {
        let (input, output) = self.new_streams(id);
        let record = ConnectionRecord::new(id, Arc::clone(&input), Arc::clone(&output));

        match self.table.insert_remote(record)? {
            Admission::Accepted => {
                tracing::debug!("Peer opened {}", id);
                acceptor.accept(VirtualConnection::new(input, output));
                Ok(())
            }
            Admission::Refused => {
                tracing::warn!(
                    "Refusing {}: connection limit of {} reached",
                    id,
                    self.table.max_connections()
                );
                input.disconnect(false);
                output.disconnect();
                self.send_frame(Frame::Close(id)).await
            }
        }
    }

    async fn handle_close(self: &Arc<Self>, id: StreamId) -> Result<(), MuxError> {
        let mut writer = self.lock_writer().await?;
        let record = self.table.remove(id).ok_or(ProtocolViolation::UnknownStream {
            op: OpCode::Close,
            id,
        })?;
        record.disconnect(true);
        tracing::debug!("Peer closed {}", id);

        if record.closed_sent {
            return Ok(());
        }
        self.write_locked(&mut writer, Frame::CloseAck(id)).await
    }

    async fn open_connection(self: &Arc<Self>) -> Result<VirtualConnection, MuxError> {
        let mut writer = self.lock_writer().await?;

        let mut streams = None;
        let id = self.table.allocate(self.is_originator, |id| {
            let (input, output) = self.new_streams(id);
            streams = Some((Arc::clone(&input), Arc::clone(&output)));
            ConnectionRecord::new(id, input, output)
        })?;
        let (input, output) = streams.ok_or(MuxError::ConnectionClosed)?;

        self.write_locked(&mut writer, Frame::Open(id)).await?;
        tracing::debug!("Opened {}", id);
        Ok(VirtualConnection::new(input, output))
    }

    /// Send payload bytes
    ///
    /// `on_queued` runs once the frame is committed to the write half. A
    /// caller dropped before that point has sent nothing, so buffered bytes
    /// must only be consumed inside `on_queued`.
    ///
    /// Fails with `ConnectionClosed` once CLOSE or CLOSEACK has been written
    /// for the id, since the peer may already have forgotten it.
    pub(crate) async fn send_transmit<F>(
        self: &Arc<Self>,
        id: StreamId,
        payload: Bytes,
        on_queued: F,
    ) -> Result<(), MuxError>
    where
        F: FnOnce(),
    {
        let mut writer = self.lock_writer().await?;
        if !self.table.is_open(id) {
            return Err(MuxError::ConnectionClosed);
        }
        let frame = Frame::Transmit {
            stream_id: id,
            payload,
        };
        self.write_committed(&mut writer, frame, on_queued).await
    }

    /// Grant the peer credit
    ///
    /// Silently skipped once the stream is closing; the grant would name an
    /// id the peer may already have removed.
    pub(crate) async fn send_request(
        self: &Arc<Self>,
        id: StreamId,
        credit: u32,
    ) -> Result<(), MuxError> {
        let mut writer = self.lock_writer().await?;
        if !self.table.is_open(id) {
            tracing::trace!("Skipping credit grant for closing {}", id);
            return Ok(());
        }
        let frame = Frame::Request {
            stream_id: id,
            credit,
        };
        self.write_locked(&mut writer, frame).await
    }

    /// Send CLOSE unless CLOSE/CLOSEACK was already sent or the id is gone
    pub(crate) async fn send_close(self: &Arc<Self>, id: StreamId) -> Result<(), MuxError> {
        let mut writer = self.lock_writer().await?;
        if !self.table.mark_close_sent(id) {
            return Ok(());
        }
        tracing::debug!("Closing {}", id);
        self.write_locked(&mut writer, Frame::Close(id)).await
    }

    async fn send_frame(self: &Arc<Self>, frame: Frame) -> Result<(), MuxError> {
        let mut writer = self.lock_writer().await?;
        self.write_locked(&mut writer, frame).await
    }

    /// Take the write half, giving up once the multiplexer shuts down
    async fn lock_writer(
        self: &Arc<Self>,
    ) -> Result<tokio::sync::MutexGuard<'_, FrameWriter>, MuxError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(MuxError::ConnectionClosed),
            writer = self.writer.lock() => Ok(writer),
        }
    }

    /// Write one frame with the write half already locked
    async fn write_locked(
        self: &Arc<Self>,
        writer: &mut FrameWriter,
        frame: Frame,
    ) -> Result<(), MuxError> {
        self.write_committed(writer, frame, || {}).await
    }

    /// Queue `frame`, run `on_queued`, then flush
    ///
    /// Both steps give up with `ConnectionClosed` when the multiplexer shuts
    /// down, so a peer that stops reading cannot pin a caller here. A failed
    /// write shuts the multiplexer down and is returned to the caller.
    async fn write_committed<F>(
        self: &Arc<Self>,
        writer: &mut FrameWriter,
        frame: Frame,
        on_queued: F,
    ) -> Result<(), MuxError>
    where
        F: FnOnce(),
    {
        if !self.table.is_alive() {
            return Err(MuxError::ConnectionClosed);
        }

        tracing::trace!("Sending {} for {}", frame.op_code(), frame.stream_id());
        let queued = tokio::select! {
            _ = self.cancel.cancelled() => return Err(MuxError::ConnectionClosed),
            queued = writer.feed(frame) => queued,
        };
        if let Err(e) = queued {
            return Err(self.write_failed(e.into()));
        }
        // A fed frame goes out with the next flush even if this caller is
        // dropped while flushing
        on_queued();

        let flushed = tokio::select! {
            _ = self.cancel.cancelled() => return Err(MuxError::ConnectionClosed),
            flushed = writer.flush() => flushed,
        };
        flushed.map_err(|e| self.write_failed(e.into()))
    }

    fn write_failed(self: &Arc<Self>, err: MuxError) -> MuxError {
        tracing::warn!("Frame write failed: {}", err);
        self.shutdown();
        err
    }

    pub(crate) fn shutdown(self: &Arc<Self>) {
        let Some(records) = self.table.shut_down() else {
            return;
        };
        tracing::info!(
            "Shutting down multiplexer with {} open connections",
            records.len()
        );

        for record in records {
            record.disconnect(false);
        }
        self.cancel.cancel();

        // Close the write half once whoever holds it is done
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let shared = Arc::clone(self);
                runtime.spawn(async move {
                    let mut writer = shared.writer.lock().await;
                    if let Err(e) = writer.close().await {
                        tracing::debug!("Error closing underlying stream: {}", e);
                    }
                });
            }
            Err(_) => {
                tracing::debug!("No runtime; underlying stream released on drop");
            }
        }
    }
}
