//! CLI command implementations

mod send;
mod serve;

pub use send::{exchange, send_command};
pub use serve::{serve, serve_command};
