//! Node configuration: `config.toml` plus environment overrides.
//!
//! | Variable                 | Effect                                   |
//! |--------------------------|------------------------------------------|
//! | `HYDRA_CONFIG`           | Path of the config file                  |
//! | `HYDRA_SUBSCRIBE_ADDR`   | Overrides `hydra_subscribe_addr`         |
//! | `HYDRA_REMOTE_RECV_ADDR` | Overrides `hydra_remote_recv_addr`       |
//! | `HYDRA_LISTEN_ADDR`      | Overrides `hydra_listen_addr`            |
//! | `HYDRA_NODE_NAME`        | Name reported by `hydra.status`          |
//! | `HYDRA_LOG_JSON`         | `1`/`true` switches logs to JSON         |
//!
//! An override set to the empty string disables that channel.

use anyhow::{Context, Result};
use hydra_bus::BusConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Config file read when `HYDRA_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Everything the node needs at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Name reported to peers.
    pub node_name: String,
    /// Bus addresses and tuning.
    pub bus: BusConfig,
    /// Emit logs as JSON lines.
    pub log_json: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "hydra".to_string(),
            bus: BusConfig::default(),
            log_json: false,
        }
    }
}

/// Load the node configuration.
///
/// `lookup` reads environment variables; pass `|key| std::env::var(key).ok()`
/// in production. A missing file at the default path is not an error (every
/// channel stays disabled unless an override enables it); a missing file named
/// explicitly through `HYDRA_CONFIG` is.
///
/// # Errors
///
/// Unreadable or invalid config file, or an invalid override.
pub fn load_config<F>(lookup: F) -> Result<NodeConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let explicit = lookup("HYDRA_CONFIG").map(PathBuf::from);
    let path = explicit
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut bus = if explicit.is_some() || path.exists() {
        load_file(&path)?
    } else {
        warn!(path = %path.display(), "No config file found, using defaults");
        BusConfig::default()
    };

    if let Some(addr) = lookup("HYDRA_SUBSCRIBE_ADDR") {
        bus = bus
            .with_subscribe_addr(&addr)
            .context("Invalid HYDRA_SUBSCRIBE_ADDR")?;
    }
    if let Some(addr) = lookup("HYDRA_REMOTE_RECV_ADDR") {
        bus = bus
            .with_remote_recv_addr(&addr)
            .context("Invalid HYDRA_REMOTE_RECV_ADDR")?;
    }
    if let Some(addr) = lookup("HYDRA_LISTEN_ADDR") {
        bus = bus
            .with_listen_addr(&addr)
            .context("Invalid HYDRA_LISTEN_ADDR")?;
    }

    let defaults = NodeConfig::default();
    Ok(NodeConfig {
        node_name: lookup("HYDRA_NODE_NAME")
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(defaults.node_name),
        bus,
        log_json: json_logs(&lookup),
    })
}

/// Whether `HYDRA_LOG_JSON` asks for JSON logs.
///
/// Separate from [`load_config`] so logging can be set up before the config
/// file is read.
pub fn json_logs<F>(lookup: &F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup("HYDRA_LOG_JSON").is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn load_file(path: &Path) -> Result<BusConfig> {
    let config = BusConfig::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    info!(path = %path.display(), "Loaded config");
    Ok(config)
}
