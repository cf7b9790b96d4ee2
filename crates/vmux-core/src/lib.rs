//! vmux-core: Core error types and configuration for vmux
//!
//! This crate provides the error taxonomy and configuration structures
//! shared by the multiplexer runtime and the CLI.

pub mod config;
pub mod error;

pub use config::{CliConfig, MuxConfig};
pub use error::{ConfigError, MuxError, ProtocolViolation};
