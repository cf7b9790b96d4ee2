//! Per-connection flow-controlled buffers
//!
//! Each virtual connection owns one [`VirtualInputStream`] fed by the
//! receive loop and one [`VirtualOutputStream`] drained by application
//! writes. Both keep their state behind a short-lived std mutex paired with a
//! [`tokio::sync::Notify`]; no frame is ever sent while that mutex is held.

mod input;
mod output;

pub use input::VirtualInputStream;
pub use output::VirtualOutputStream;
