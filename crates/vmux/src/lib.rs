//! vmux: Flow-controlled virtual connections over one byte stream
//!
//! A [`Multiplexer`] takes ownership of a single ordered, reliable duplex
//! stream (a TCP socket, a pipe, an SSH channel) and carries any number of
//! independent [`VirtualConnection`]s over it. Each virtual connection has its
//! own credit-based flow control, so a slow reader on one connection never
//! stalls the others.
//!
//! ```ignore
//! let (acceptor, mut incoming) = vmux::accept_channel();
//! let mux = Multiplexer::new(socket, true, acceptor);
//! tokio::spawn({
//!     let mux = mux.clone();
//!     async move { mux.run().await }
//! });
//!
//! let conn = mux.open_connection().await?;
//! conn.write(b"hello").await?;
//! conn.close().await?;
//! ```

pub mod connection;
pub mod multiplexer;
pub mod stream;
pub mod table;

pub use connection::{accept_channel, AcceptConnection, VirtualConnection};
pub use multiplexer::Multiplexer;
pub use stream::{VirtualInputStream, VirtualOutputStream};
pub use table::{Admission, ConnectionRecord, ConnectionTable};

pub use vmux_core::{MuxConfig, MuxError, ProtocolViolation};
pub use vmux_protocol::StreamId;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
