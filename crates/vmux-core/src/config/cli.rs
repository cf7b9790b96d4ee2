//! CLI configuration

use serde::{Deserialize, Serialize};

use super::mux::MuxConfig;

/// Configuration for the `vmux` binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Address `vmux serve` listens on
    pub bind_address: String,

    /// Address `vmux send` connects to
    pub connect_address: String,

    /// Multiplexer tunables, shared by both ends
    pub mux: MuxConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7710".to_string(),
            connect_address: "127.0.0.1:7710".to_string(),
            mux: MuxConfig::default(),
        }
    }
}
