//! Binary configuration
//!
//! An optional YAML file supplies defaults; command-line flags and their
//! environment variables override it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tether_router::TunnelConfig;

/// Contents of the `--config` file; every key is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub listen: Option<String>,
    pub peer: Option<String>,
    pub log_level: Option<String>,
    pub tunnel: TunnelConfig,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: FileConfig = serde_yaml::from_str(&yaml)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config
            .tunnel
            .validate()
            .with_context(|| format!("Invalid timings in config file: {:?}", path))?;

        Ok(config)
    }
}

/// Values parsed from the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub peer: Option<String>,
    pub log_level: Option<String>,
}

/// Final settings after merging
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen: String,
    pub peer: Option<String>,
    /// `None` defers to `RUST_LOG`
    pub log_level: Option<String>,
    pub tunnel: TunnelConfig,
}

impl Settings {
    pub fn merge(file: FileConfig, cli: Overrides) -> Result<Self> {
        let listen = cli
            .listen
            .or(file.listen)
            .context("No listen address given (use --listen or `listen:` in the config file)")?;

        Ok(Self {
            listen,
            peer: cli.peer.or(file.peer),
            log_level: cli.log_level.or(file.log_level),
            tunnel: file.tunnel,
        })
    }
}
