//! # Peer Addresses
//!
//! Transport endpoints read from configuration. Hostnames are resolved once
//! at start-up; a [`PeerAddress`] never changes afterwards.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::ConfigError;

/// Which channel an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Best-effort group broadcast (UDP multicast).
    Multicast,
    /// Point-to-point directed work (TCP).
    Unicast,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Multicast => write!(f, "multicast"),
            Self::Unicast => write!(f, "unicast"),
        }
    }
}

/// A resolved, validated transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    host: String,
    port: u16,
    kind: ChannelKind,
    resolved: SocketAddr,
}

impl PeerAddress {
    /// Parse and resolve a `host:port` string for the given channel.
    ///
    /// A `udp://` or `tcp://` scheme prefix is accepted and ignored. IPv6
    /// literals use the bracket form (`[ff02::1]:5000`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] if the string is malformed,
    /// cannot be resolved, or resolves to the wrong kind of address (a unicast
    /// IP for the multicast channel or vice versa).
    pub fn parse(addr: &str, kind: ChannelKind) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidAddress {
            addr: addr.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = addr.trim();
        let bare = trimmed
            .strip_prefix("udp://")
            .or_else(|| trimmed.strip_prefix("tcp://"))
            .unwrap_or(trimmed);

        let (host, port) = bare
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let resolved = (host, port)
            .to_socket_addrs()
            .map_err(|e| invalid(&e.to_string()))?
            .next()
            .ok_or_else(|| invalid("host did not resolve"))?;

        match (kind, resolved.ip().is_multicast()) {
            (ChannelKind::Multicast, false) => return Err(invalid("not a multicast group")),
            (ChannelKind::Unicast, true) => return Err(invalid("multicast group used as unicast address")),
            _ => {}
        }

        Ok(Self {
            host: host.to_string(),
            port,
            kind,
            resolved,
        })
    }

    /// Build from an already-resolved socket address.
    ///
    /// # Errors
    ///
    /// Same kind validation as [`PeerAddress::parse`].
    pub fn from_socket_addr(addr: SocketAddr, kind: ChannelKind) -> Result<Self, ConfigError> {
        Self::parse(&addr.to_string(), kind)
    }

    /// Host as written in configuration.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Channel this address belongs to.
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Socket address resolved at start-up.
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        self.resolved
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.host, self.port, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_multicast_group() {
        let addr = PeerAddress::parse("239.255.42.99:5400", ChannelKind::Multicast).unwrap();
        assert_eq!(addr.port(), 5400);
        assert_eq!(addr.kind(), ChannelKind::Multicast);
        assert!(addr.socket_addr().ip().is_multicast());
    }

    #[test]
    fn test_parse_with_scheme() {
        let addr = PeerAddress::parse("tcp://127.0.0.1:7000", ChannelKind::Unicast).unwrap();
        assert_eq!(addr.host(), "127.0.0.1");
        assert_eq!(addr.socket_addr(), "127.0.0.1:7000".parse().unwrap());
    }

    #[test]
    fn test_parse_ipv6_brackets() {
        let addr = PeerAddress::parse("[::1]:7000", ChannelKind::Unicast).unwrap();
        assert_eq!(addr.host(), "::1");
        assert!(addr.socket_addr().is_ipv6());
    }

    #[test]
    fn test_rejects_wrong_kind() {
        assert!(PeerAddress::parse("127.0.0.1:5400", ChannelKind::Multicast).is_err());
        assert!(PeerAddress::parse("239.1.2.3:5400", ChannelKind::Unicast).is_err());
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["", "127.0.0.1", "127.0.0.1:notaport", ":5000", "127.0.0.1:70000"] {
            assert!(
                PeerAddress::parse(bad, ChannelKind::Unicast).is_err(),
                "{bad:?} should be rejected"
            );
        }
    }
}
