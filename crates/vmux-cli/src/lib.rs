//! vmux-cli: command implementations behind the `vmux` binary

pub mod commands;

use std::path::Path;

use anyhow::{Context, Result};
use vmux_core::config::{self, CliConfig};

/// Load the CLI configuration
///
/// An explicit path must load. Without one, the default path is used when it
/// exists, falling back to defaults if it cannot be parsed.
pub fn load_cli_config(config_path: Option<&Path>) -> Result<CliConfig> {
    let config: CliConfig = if let Some(config_path) = config_path {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                CliConfig::default()
            })
        } else {
            tracing::debug!("Using default configuration");
            CliConfig::default()
        }
    };

    config
        .mux
        .validate()
        .context("Invalid [mux] configuration")?;
    Ok(config)
}
