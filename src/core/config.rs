//! Appender configuration
//!
//! [`AppenderConfig`] is the serialisable surface: every field has a default
//! and durations are plain milliseconds so it can be embedded in any config
//! file format serde understands. [`AppenderConfig::validate`] turns it into
//! [`DeliverySettings`], the checked form the appender runs with.

use super::encoder::parse_separator;
use super::error::{DeliveryError, Result};
use super::ring_buffer::DEFAULT_RING_BUFFER_SIZE;
use crate::net::{parse_destinations, ConnectionSettings, HostInfo, KeepAlive, TlsConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default consecutive drops between two drop warnings
pub const DEFAULT_DROPPED_WARN_FREQUENCY: u64 = 1000;

/// Default time `stop()` waits for the worker threads
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

const COMPONENT: &str = "TcpAppender";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppenderConfig {
    /// Used for thread names and diagnostics
    pub name: String,

    /// Single destination host; requires `port`
    pub remote_host: Option<String>,

    /// Port of `remote_host`, and the default port for `destinations`
    /// entries without one
    pub port: Option<u16>,

    /// Comma separated `host[:port]` list, primary first
    pub destinations: Option<String>,

    /// Must be a power of two
    pub ring_buffer_size: usize,

    pub connect_timeout_ms: u64,
    pub reconnection_delay_ms: u64,

    /// Reconnect to the primary after this long on a secondary
    pub reattempt_primary_delay_ms: Option<u64>,

    /// Idle time before a keep-alive message is written; 0 disables
    pub keep_alive_interval_ms: Option<u64>,

    /// `SYSTEM`, `UNIX`, `WINDOWS` or literal text (`\n`, `\r`, `\t`
    /// escapes are understood)
    pub keep_alive_message: String,

    pub keep_alive_charset: String,

    pub write_buffer_size: usize,
    pub write_timeout_ms: Option<u64>,

    /// Frame payloads and gate them on acknowledgements from the peer
    pub ack_protocol: bool,
    pub ack_window_size: u32,

    pub dropped_warn_frequency: u64,

    /// When true, dropping a running appender does not wait for its threads
    pub daemon: bool,

    pub shutdown_timeout_ms: u64,
    pub max_write_attempts: u32,

    pub tls: Option<TlsConfig>,
}

impl Default for AppenderConfig {
    fn default() -> Self {
        Self {
            name: "tcp".to_string(),
            remote_host: None,
            port: None,
            destinations: None,
            ring_buffer_size: DEFAULT_RING_BUFFER_SIZE,
            connect_timeout_ms: 5000,
            reconnection_delay_ms: 30_000,
            reattempt_primary_delay_ms: None,
            keep_alive_interval_ms: None,
            keep_alive_message: "SYSTEM".to_string(),
            keep_alive_charset: "UTF-8".to_string(),
            write_buffer_size: 8192,
            write_timeout_ms: None,
            ack_protocol: false,
            ack_window_size: crate::net::DEFAULT_WINDOW_SIZE,
            dropped_warn_frequency: DEFAULT_DROPPED_WARN_FREQUENCY,
            daemon: true,
            shutdown_timeout_ms: millis(DEFAULT_SHUTDOWN_TIMEOUT),
            max_write_attempts: crate::net::DEFAULT_MAX_WRITE_ATTEMPTS,
            tls: None,
        }
    }
}

/// Checked configuration
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub name: String,
    pub destinations: Vec<HostInfo>,
    pub ring_buffer_size: usize,
    pub connection: ConnectionSettings,
    pub keep_alive: Option<KeepAlive>,
    /// Window size when the acknowledgement protocol is enabled
    pub ack_window: Option<u32>,
    pub dropped_warn_frequency: u64,
    pub daemon: bool,
    pub shutdown_timeout: Duration,
    pub max_write_attempts: u32,
    pub tls: Option<TlsConfig>,
}

impl AppenderConfig {
    /// Check every field and resolve the destinations once
    ///
    /// Resolution here only proves the names exist; every connection attempt
    /// resolves again so DNS changes are picked up.
    pub fn validate(&self) -> Result<DeliverySettings> {
        if self.name.trim().is_empty() {
            return Err(DeliveryError::config(COMPONENT, "name must not be empty"));
        }

        let destinations = self.destinations()?;
        for host in &destinations {
            match host.resolve() {
                Ok(addrs) if !addrs.is_empty() => {}
                Ok(_) => {
                    return Err(DeliveryError::destination(
                        host.to_string(),
                        "host has no addresses",
                    ))
                }
                Err(e) => {
                    return Err(DeliveryError::destination(
                        host.to_string(),
                        format!("cannot resolve host: {}", e),
                    ))
                }
            }
        }

        if self.ring_buffer_size == 0 || !self.ring_buffer_size.is_power_of_two() {
            return Err(DeliveryError::config(
                COMPONENT,
                format!("ring_buffer_size must be a power of two, got {}", self.ring_buffer_size),
            ));
        }
        positive("connect_timeout_ms", self.connect_timeout_ms)?;
        positive("reconnection_delay_ms", self.reconnection_delay_ms)?;
        if let Some(delay) = self.reattempt_primary_delay_ms {
            positive("reattempt_primary_delay_ms", delay)?;
        }
        if let Some(timeout) = self.write_timeout_ms {
            positive("write_timeout_ms", timeout)?;
        }
        positive("write_buffer_size", self.write_buffer_size as u64)?;
        positive("ack_window_size", u64::from(self.ack_window_size))?;
        positive("dropped_warn_frequency", self.dropped_warn_frequency)?;
        positive("max_write_attempts", u64::from(self.max_write_attempts))?;

        let keep_alive = self.keep_alive()?;
        if keep_alive.is_some() && self.ack_protocol {
            // Raw keep-alive bytes would corrupt the framed stream.
            return Err(DeliveryError::config(
                COMPONENT,
                "keep-alive messages cannot be combined with ack_protocol",
            ));
        }

        #[cfg(not(feature = "tls"))]
        if self.tls.is_some() {
            return Err(DeliveryError::config(
                COMPONENT,
                "TLS requested but the crate was built without the `tls` feature",
            ));
        }

        Ok(DeliverySettings {
            name: self.name.clone(),
            destinations,
            ring_buffer_size: self.ring_buffer_size,
            connection: ConnectionSettings {
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                reconnection_delay: Duration::from_millis(self.reconnection_delay_ms),
                reattempt_primary_delay: self.reattempt_primary_delay_ms.map(Duration::from_millis),
                write_buffer_size: self.write_buffer_size,
                write_timeout: self.write_timeout_ms.map(Duration::from_millis),
            },
            keep_alive,
            ack_window: self.ack_protocol.then_some(self.ack_window_size),
            dropped_warn_frequency: self.dropped_warn_frequency,
            daemon: self.daemon,
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            max_write_attempts: self.max_write_attempts,
            tls: self.tls.clone(),
        })
    }

    fn destinations(&self) -> Result<Vec<HostInfo>> {
        match (&self.destinations, &self.remote_host) {
            (Some(_), Some(_)) => Err(DeliveryError::config(
                COMPONENT,
                "set either remote_host or destinations, not both",
            )),
            (Some(list), None) => parse_destinations(list, self.port),
            (None, Some(host)) => {
                let host = host.trim();
                if host.is_empty() {
                    return Err(DeliveryError::config(COMPONENT, "remote_host must not be empty"));
                }
                match self.port {
                    None => Err(DeliveryError::config(COMPONENT, "remote_host requires a port")),
                    Some(0) => Err(DeliveryError::destination(host, "port must be positive")),
                    Some(port) => Ok(vec![HostInfo::new(host, port)]),
                }
            }
            (None, None) => Err(DeliveryError::config(COMPONENT, "no destinations configured")),
        }
    }

    fn keep_alive(&self) -> Result<Option<KeepAlive>> {
        let interval = match self.keep_alive_interval_ms {
            None | Some(0) => return Ok(None),
            Some(ms) => Duration::from_millis(ms),
        };

        let message = parse_separator(&self.keep_alive_message);
        if message.is_empty() {
            return Err(DeliveryError::config(COMPONENT, "keep_alive_message must not be empty"));
        }

        let charset: String = self
            .keep_alive_charset
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match charset.as_str() {
            "UTF8" => {}
            "USASCII" | "ASCII" => {
                if !message.is_ascii() {
                    return Err(DeliveryError::config(
                        COMPONENT,
                        "keep_alive_message is not representable in US-ASCII",
                    ));
                }
            }
            _ => {
                return Err(DeliveryError::config(
                    COMPONENT,
                    format!("unsupported keep_alive_charset '{}'", self.keep_alive_charset),
                ))
            }
        }

        Ok(Some(KeepAlive { interval, message }))
    }
}

fn positive(field: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(DeliveryError::config(COMPONENT, format!("{} must be positive", field)));
    }
    Ok(())
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(port: u16) -> AppenderConfig {
        AppenderConfig {
            remote_host: Some("127.0.0.1".to_string()),
            port: Some(port),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let settings = local(4560).validate().unwrap();
        assert_eq!(settings.ring_buffer_size, 8192);
        assert_eq!(settings.connection.connect_timeout, Duration::from_millis(5000));
        assert_eq!(settings.connection.reconnection_delay, Duration::from_millis(30_000));
        assert_eq!(settings.connection.write_buffer_size, 8192);
        assert!(settings.keep_alive.is_none());
        assert!(settings.ack_window.is_none());
        assert_eq!(settings.dropped_warn_frequency, 1000);
        assert!(settings.daemon);
        assert_eq!(settings.shutdown_timeout, Duration::from_secs(60));
        assert_eq!(settings.max_write_attempts, 5);
    }

    #[test]
    fn test_destination_list_uses_port_as_default() {
        let config = AppenderConfig {
            destinations: Some("127.0.0.1:5000, localhost".to_string()),
            port: Some(4560),
            ..Default::default()
        };
        let settings = config.validate().unwrap();
        assert_eq!(
            settings.destinations,
            vec![HostInfo::new("127.0.0.1", 5000), HostInfo::new("localhost", 4560)]
        );
    }

    #[test]
    fn test_rejects_missing_or_ambiguous_destinations() {
        let err = AppenderConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("no destinations configured"));

        let config = AppenderConfig {
            destinations: Some("127.0.0.1:5000".to_string()),
            ..local(4560)
        };
        assert!(config.validate().is_err());

        let config = AppenderConfig {
            port: None,
            ..local(4560)
        };
        assert!(config.validate().unwrap_err().to_string().contains("requires a port"));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let config = AppenderConfig {
            ring_buffer_size: 1000,
            ..local(4560)
        };
        assert!(config.validate().unwrap_err().to_string().contains("power of two"));

        let config = AppenderConfig {
            reconnection_delay_ms: 0,
            ..local(4560)
        };
        assert!(config.validate().is_err());

        let config = AppenderConfig {
            ack_window_size: 0,
            ..local(4560)
        };
        assert!(config.validate().is_err());

        assert!(matches!(
            local(0).validate(),
            Err(DeliveryError::InvalidDestination { .. })
        ));
    }

    #[test]
    fn test_rejects_unresolvable_host() {
        let config = AppenderConfig {
            remote_host: Some("host.invalid".to_string()),
            ..local(4560)
        };
        assert!(matches!(
            config.validate(),
            Err(DeliveryError::InvalidDestination { .. })
        ));
    }

    #[test]
    fn test_keep_alive_settings() {
        let config = AppenderConfig {
            keep_alive_interval_ms: Some(250),
            keep_alive_message: "UNIX".to_string(),
            ..local(4560)
        };
        let keep_alive = config.validate().unwrap().keep_alive.unwrap();
        assert_eq!(keep_alive.interval, Duration::from_millis(250));
        assert_eq!(keep_alive.message, b"\n");

        let config = AppenderConfig {
            keep_alive_interval_ms: Some(0),
            ..local(4560)
        };
        assert!(config.validate().unwrap().keep_alive.is_none());

        let config = AppenderConfig {
            keep_alive_interval_ms: Some(250),
            keep_alive_message: "ping ✓".to_string(),
            keep_alive_charset: "US-ASCII".to_string(),
            ..local(4560)
        };
        assert!(config.validate().is_err());

        let config = AppenderConfig {
            keep_alive_interval_ms: Some(250),
            keep_alive_charset: "EBCDIC".to_string(),
            ..local(4560)
        };
        assert!(config.validate().unwrap_err().to_string().contains("EBCDIC"));
    }

    #[test]
    fn test_rejects_keep_alive_with_ack_protocol() {
        let config = AppenderConfig {
            keep_alive_interval_ms: Some(250),
            ack_protocol: true,
            ..local(4560)
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidConfiguration { .. }));
        assert!(err.to_string().contains("ack_protocol"));

        let config = AppenderConfig {
            keep_alive_interval_ms: Some(0),
            ack_protocol: true,
            ..local(4560)
        };
        assert!(config.validate().unwrap().keep_alive.is_none());
    }

    #[test]
    fn test_deserialize_from_json() {
        let config: AppenderConfig = serde_json::from_str(
            r#"{
                "name": "shipper",
                "destinations": "127.0.0.1:5000,127.0.0.1:5001",
                "reattempt_primary_delay_ms": 60000,
                "ack_protocol": true,
                "ack_window_size": 32
            }"#,
        )
        .unwrap();

        let settings = config.validate().unwrap();
        assert_eq!(settings.name, "shipper");
        assert_eq!(settings.destinations.len(), 2);
        assert_eq!(settings.ack_window, Some(32));
        assert_eq!(
            settings.connection.reattempt_primary_delay,
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let result: std::result::Result<AppenderConfig, _> =
            serde_json::from_str(r#"{"remote_host": "127.0.0.1", "prot": 4560}"#);
        assert!(result.is_err());
    }
}
