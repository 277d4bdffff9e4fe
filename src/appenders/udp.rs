//! UDP appender
//!
//! Encodes each event on the calling thread and sends it as one datagram.
//! There is no buffering, no connection state and no retry: a failed send is
//! counted and the event is lost.

use crate::core::{Appender, DeliveryError, DeliveryMetrics, Encoder, Result};
use crate::net::HostInfo;
use parking_lot::Mutex;
use std::net::UdpSocket;
use tracing::warn;

pub struct UdpAppender<E> {
    name: String,
    destination: HostInfo,
    socket: UdpSocket,
    encoder: Mutex<Box<dyn Encoder<E>>>,
    metrics: DeliveryMetrics,
}

impl<E> UdpAppender<E> {
    /// Bind an ephemeral local port and connect it to `destination`
    pub fn new(destination: HostInfo, encoder: impl Encoder<E> + 'static) -> Result<Self> {
        let addr = destination
            .resolve()
            .map_err(|e| DeliveryError::destination(destination.to_string(), e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                DeliveryError::destination(destination.to_string(), "host has no addresses")
            })?;

        let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local)
            .map_err(|e| DeliveryError::io_operation("binding UDP socket", local, e))?;
        socket.connect(addr).map_err(|e| {
            DeliveryError::io_operation("connecting UDP socket", addr.to_string(), e)
        })?;

        Ok(Self {
            name: "udp".to_string(),
            destination,
            socket,
            encoder: Mutex::new(Box::new(encoder)),
            metrics: DeliveryMetrics::new(),
        })
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn destination(&self) -> &HostInfo {
        &self.destination
    }

    pub fn metrics(&self) -> &DeliveryMetrics {
        &self.metrics
    }
}

impl<E> Appender<E> for UdpAppender<E> {
    fn append(&self, event: E) -> bool {
        let payload = match self.encoder.lock().encode(&event) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(appender = %self.name, %error, "dropping event that could not be encoded");
                self.metrics.record_encode_failure();
                return false;
            }
        };

        match self.socket.send(&payload) {
            Ok(_) => {
                self.metrics.record_sent();
                true
            }
            Err(error) => {
                warn!(
                    appender = %self.name,
                    destination = %self.destination,
                    %error,
                    "datagram not sent"
                );
                self.metrics.record_send_failure();
                false
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LineEncoder;
    use std::time::Duration;

    #[test]
    fn test_sends_one_datagram_per_event() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let port = server.local_addr().unwrap().port();

        let appender =
            UdpAppender::new(HostInfo::new("127.0.0.1", port), LineEncoder::new()).unwrap();
        assert!(appender.append("first"));
        assert!(appender.append("second"));

        let mut buf = [0u8; 64];
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"first\n");
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"second\n");
        assert_eq!(appender.metrics().sent_count(), 2);
    }

    #[test]
    fn test_unresolvable_destination() {
        let result =
            UdpAppender::<&str>::new(HostInfo::new("host.invalid", 514), LineEncoder::new());
        assert!(matches!(result, Err(DeliveryError::InvalidDestination { .. })));
    }
}
