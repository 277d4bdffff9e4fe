//! Destination hosts and their parsing
//!
//! Destinations are given either as a single `(host, port)` pair or as a
//! comma-separated list of `host[:port]` entries. List order is failover
//! order: the first entry is the primary.

use crate::core::{DeliveryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// One destination a connection can be opened to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostInfo {
    host: String,
    port: u16,
}

impl HostInfo {
    /// Create a destination; use [`parse_destinations`] for validated input
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve to socket addresses, freshly on every call
    ///
    /// Re-resolving on each connection attempt lets DNS changes take effect
    /// after a reconnect.
    pub fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} resolved to no addresses", self),
            ));
        }
        Ok(addrs)
    }
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse a comma-separated `host[:port]` list
///
/// Entries without a port use `default_port`; when there is no default the
/// port is mandatory. IPv6 literals must be bracketed (`[::1]:5000`).
///
/// # Errors
///
/// Rejects empty lists, empty entries, missing or non-numeric ports and
/// ports outside `1..=65535`.
///
/// # Example
///
/// ```
/// use logstash_delivery::net::parse_destinations;
///
/// let hosts = parse_destinations("primary:5000, backup", Some(4560)).unwrap();
/// assert_eq!(hosts[0].port(), 5000);
/// assert_eq!(hosts[1].port(), 4560);
/// ```
pub fn parse_destinations(list: &str, default_port: Option<u16>) -> Result<Vec<HostInfo>> {
    if list.trim().is_empty() {
        return Err(DeliveryError::destination(list, "no destinations given"));
    }

    list.split(',')
        .map(|entry| parse_entry(entry.trim(), default_port))
        .collect()
}

fn parse_entry(entry: &str, default_port: Option<u16>) -> Result<HostInfo> {
    if entry.is_empty() {
        return Err(DeliveryError::destination(entry, "empty destination entry"));
    }

    let (host, port) = if let Some(rest) = entry.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| DeliveryError::destination(entry, "unterminated '[' in IPv6 address"))?;
        let port = match after {
            "" => None,
            p => Some(
                p.strip_prefix(':')
                    .ok_or_else(|| DeliveryError::destination(entry, "expected ':' after ']'"))?,
            ),
        };
        (host, port)
    } else {
        match entry.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => {
                return Err(DeliveryError::destination(
                    entry,
                    "IPv6 addresses must be enclosed in brackets",
                ))
            }
            Some((host, port)) => (host, Some(port)),
            None => (entry, None),
        }
    };

    if host.trim().is_empty() {
        return Err(DeliveryError::destination(entry, "host is empty"));
    }

    let port = match port {
        Some(p) => parse_port(entry, p)?,
        None => default_port
            .ok_or_else(|| DeliveryError::destination(entry, "port is required"))?,
    };
    if port == 0 {
        return Err(DeliveryError::destination(entry, "port must be positive"));
    }

    Ok(HostInfo::new(host.trim(), port))
}

fn parse_port(entry: &str, port: &str) -> Result<u16> {
    let value: i64 = port
        .trim()
        .parse()
        .map_err(|_| DeliveryError::destination(entry, format!("invalid port '{}'", port)))?;
    if value <= 0 {
        return Err(DeliveryError::destination(entry, "port must be positive"));
    }
    u16::try_from(value)
        .map_err(|_| DeliveryError::destination(entry, format!("port {} out of range", value)))
}
