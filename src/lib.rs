//! # Logstash Delivery
//!
//! Asynchronous network delivery of encoded log events to a remote collector
//! such as Logstash.
//!
//! ## Features
//!
//! - **Never blocks the caller**: events go into a lock-free ring buffer and
//!   are dropped, with throttled warnings, when it is full
//! - **Failover**: ordered destination list with primary reattempt
//! - **Reconnects**: bounded connect timeouts, backoff between passes,
//!   bounded retry per event
//! - **Flow control**: optional windowed send/acknowledge protocol
//! - **TLS** via rustls (feature `tls`, enabled by default)
//! - **Keep-alives** written only when the connection is idle

pub mod appenders;
pub mod core;
pub mod net;

pub mod prelude {
    pub use crate::appenders::{TcpAppender, TcpAppenderBuilder};
    #[cfg(feature = "udp")]
    pub use crate::appenders::UdpAppender;
    pub use crate::core::{
        Appender, AppenderConfig, DeliveryError, DeliveryListener, DeliveryMetrics, Encoder,
        JsonLinesEncoder, LineEncoder, Result,
    };
    pub use crate::net::{ConnectionInfo, HostInfo, TlsConfig};
}

pub use crate::appenders::{TcpAppender, TcpAppenderBuilder};
#[cfg(feature = "udp")]
pub use crate::appenders::UdpAppender;
pub use crate::core::{
    Appender, AppenderConfig, DeliveryError, DeliveryListener, DeliveryMetrics, DeliverySettings,
    Encoder, JsonLinesEncoder, LineEncoder, Result, DEFAULT_DROPPED_WARN_FREQUENCY,
    DEFAULT_RING_BUFFER_SIZE, DEFAULT_SHUTDOWN_TIMEOUT,
};
pub use crate::net::{parse_destinations, ConnectionInfo, HostInfo, TlsConfig};
