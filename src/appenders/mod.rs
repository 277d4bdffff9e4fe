//! Appender implementations

pub mod tcp;

#[cfg(feature = "udp")]
pub mod udp;

pub use tcp::{TcpAppender, TcpAppenderBuilder};

#[cfg(feature = "udp")]
pub use udp::UdpAppender;

pub use crate::core::Appender;
