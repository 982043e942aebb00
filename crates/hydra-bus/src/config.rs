//! # Bus Configuration
//!
//! Loaded from the application's `config.toml`. Only the keys below are read;
//! everything else in the file is ignored.
//!
//! ```toml
//! hydra_subscribe_addr = "239.255.42.99:5400"
//! hydra_remote_recv_addr = "10.0.0.7:5401"
//! hydra_listen_addr = "0.0.0.0:5401"
//!
//! [hydra]
//! max_frame_len = 65536
//! request_timeout_ms = 5000
//! connect_timeout_ms = 2000
//! write_timeout_ms = 1000
//! sweep_interval_ms = 1000
//! multicast_ttl = 1
//! multicast_interface = "0.0.0.0"
//! inbox_capacity = 1024
//! ```
//!
//! An empty address string disables the corresponding channel.

use serde::Deserialize;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::address::{ChannelKind, PeerAddress};
use crate::envelope::LENGTH_PREFIX_LEN;
use crate::error::ConfigError;
use crate::multicast::MulticastOptions;
use crate::DEFAULT_MAX_FRAME_LEN;

/// Default deadline for `request()` when the caller has no better value.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default bound on establishing the outbound directed connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default bound on writing one frame to a directed connection. A peer that
/// stops reading has its connection dropped after this long.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default period of the correlation sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(1000);

/// Default capacity of the directed inbox.
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// Smallest frame body that can carry a one-byte topic.
const MIN_FRAME_LEN: usize = 16;

/// Validated bus configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Multicast group to publish to and listen on.
    pub subscribe_addr: Option<PeerAddress>,
    /// Remote receiver for directed work.
    pub remote_recv_addr: Option<PeerAddress>,
    /// Local address on which to serve directed work.
    pub listen_addr: Option<SocketAddr>,
    /// Upper bound on a frame body.
    pub max_frame_len: usize,
    /// Default request deadline.
    pub request_timeout: Duration,
    /// Outbound connect deadline.
    pub connect_timeout: Duration,
    /// Deadline for writing one directed frame.
    pub write_timeout: Duration,
    /// Correlation sweep period.
    pub sweep_interval: Duration,
    /// Multicast hop limit.
    pub multicast_ttl: u32,
    /// Interface used for multicast.
    pub multicast_interface: Ipv4Addr,
    /// Directed inbox capacity.
    pub inbox_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscribe_addr: None,
            remote_recv_addr: None,
            listen_addr: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            multicast_ttl: 1,
            multicast_interface: Ipv4Addr::UNSPECIFIED,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }
}

/// Configuration file structure.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    hydra_subscribe_addr: String,
    #[serde(default)]
    hydra_remote_recv_addr: String,
    #[serde(default)]
    hydra_listen_addr: String,
    #[serde(default)]
    hydra: TuningFile,
}

#[derive(Debug, Deserialize, Default)]
struct TuningFile {
    max_frame_len: Option<usize>,
    request_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
    multicast_ttl: Option<u32>,
    multicast_interface: Option<Ipv4Addr>,
    inbox_capacity: Option<usize>,
}

impl BusConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed, or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns error on malformed TOML, unresolvable addresses or out-of-range
    /// tuning values.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let defaults = Self::default();
        let tuning = file.hydra;
        let config = Self {
            max_frame_len: tuning.max_frame_len.unwrap_or(defaults.max_frame_len),
            request_timeout: tuning
                .request_timeout_ms
                .map_or(defaults.request_timeout, Duration::from_millis),
            connect_timeout: tuning
                .connect_timeout_ms
                .map_or(defaults.connect_timeout, Duration::from_millis),
            write_timeout: tuning
                .write_timeout_ms
                .map_or(defaults.write_timeout, Duration::from_millis),
            sweep_interval: tuning
                .sweep_interval_ms
                .map_or(defaults.sweep_interval, Duration::from_millis),
            multicast_ttl: tuning.multicast_ttl.unwrap_or(defaults.multicast_ttl),
            multicast_interface: tuning
                .multicast_interface
                .unwrap_or(defaults.multicast_interface),
            inbox_capacity: tuning.inbox_capacity.unwrap_or(defaults.inbox_capacity),
            ..defaults
        }
        .with_subscribe_addr(&file.hydra_subscribe_addr)?
        .with_remote_recv_addr(&file.hydra_remote_recv_addr)?
        .with_listen_addr(&file.hydra_listen_addr)?;

        config.validate()?;
        Ok(config)
    }

    /// Set the multicast group. An empty string disables the channel.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidAddress`] if the address is not a multicast group.
    pub fn with_subscribe_addr(mut self, addr: &str) -> Result<Self, ConfigError> {
        self.subscribe_addr = parse_optional(addr, ChannelKind::Multicast)?;
        Ok(self)
    }

    /// Set the remote receiver. An empty string disables outbound directed
    /// traffic.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidAddress`] if the address is not unicast.
    pub fn with_remote_recv_addr(mut self, addr: &str) -> Result<Self, ConfigError> {
        self.remote_recv_addr = parse_optional(addr, ChannelKind::Unicast)?;
        Ok(self)
    }

    /// Set the local serving address. An empty string disables serving.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidAddress`] if the address is not unicast.
    pub fn with_listen_addr(mut self, addr: &str) -> Result<Self, ConfigError> {
        self.listen_addr =
            parse_optional(addr, ChannelKind::Unicast)?.map(|peer| peer.socket_addr());
        Ok(self)
    }

    /// Check tuning values.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max_body = u32::MAX as usize - LENGTH_PREFIX_LEN;
        if self.max_frame_len < MIN_FRAME_LEN || self.max_frame_len > max_body {
            return Err(ConfigError::InvalidValue {
                field: "max_frame_len",
                reason: format!("must be between {MIN_FRAME_LEN} and {max_body}"),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "connect_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "write_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "sweep_interval_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.multicast_ttl > 255 {
            return Err(ConfigError::InvalidValue {
                field: "multicast_ttl",
                reason: "must be at most 255".into(),
            });
        }
        if self.inbox_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "inbox_capacity",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Whether any directed traffic (outbound or served) is configured.
    #[must_use]
    pub fn directed_enabled(&self) -> bool {
        self.remote_recv_addr.is_some() || self.listen_addr.is_some()
    }

    /// Socket options for the multicast channel.
    #[must_use]
    pub fn multicast_options(&self) -> MulticastOptions {
        MulticastOptions {
            ttl: self.multicast_ttl,
            interface: self.multicast_interface,
        }
    }
}

fn parse_optional(addr: &str, kind: ChannelKind) -> Result<Option<PeerAddress>, ConfigError> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Ok(None);
    }
    PeerAddress::parse(addr, kind).map(Some)
}
