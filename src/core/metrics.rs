//! Delivery metrics for observability
//!
//! Counters for monitoring the health of a delivery pipeline: how many
//! events were accepted, dropped at the ring buffer, written to the wire,
//! and how often the connection had to be re-established.

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics for a single delivery pipeline
///
/// Every appender owns its own instance, so independent pipelines never
/// share counters.
///
/// # Example
///
/// ```
/// use logstash_delivery::DeliveryMetrics;
///
/// let metrics = DeliveryMetrics::new();
///
/// metrics.record_published();
/// metrics.record_dropped();
///
/// assert_eq!(metrics.published_count(), 1);
/// assert_eq!(metrics.dropped_count(), 1);
/// ```
#[derive(Debug)]
pub struct DeliveryMetrics {
    /// Events accepted into the ring buffer
    published: AtomicU64,

    /// Events rejected because the ring buffer was full
    dropped: AtomicU64,

    /// Events written to a connection
    sent: AtomicU64,

    /// Write attempts that failed with an I/O error
    send_failures: AtomicU64,

    /// Events the encoder could not serialize
    encode_failures: AtomicU64,

    /// Events abandoned after exhausting their write attempts
    abandoned: AtomicU64,

    /// Connections successfully opened
    connections_opened: AtomicU64,

    /// Individual host connection attempts that failed
    connect_failures: AtomicU64,

    /// Keep-alive messages written
    keep_alives_sent: AtomicU64,

    /// Acknowledgement frames received
    acks_received: AtomicU64,
}

impl DeliveryMetrics {
    /// Create a new metrics instance with all counters at zero
    pub const fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            encode_failures: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            keep_alives_sent: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn encode_failures(&self) -> u64 {
        self.encode_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn abandoned_count(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn connections_opened(&self) -> u64 {
        self.connections_opened.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn connect_failures(&self) -> u64 {
        self.connect_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn keep_alives_sent(&self) -> u64 {
        self.keep_alives_sent.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn acks_received(&self) -> u64 {
        self.acks_received.load(Ordering::Relaxed)
    }

    /// Record an accepted event, returning the previous count
    #[inline]
    pub fn record_published(&self) -> u64 {
        self.published.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn record_dropped(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn record_sent(&self) -> u64 {
        self.sent.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn record_send_failure(&self) -> u64 {
        self.send_failures.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn record_encode_failure(&self) -> u64 {
        self.encode_failures.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn record_abandoned(&self) -> u64 {
        self.abandoned.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn record_connection_opened(&self) -> u64 {
        self.connections_opened.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn record_connect_failure(&self) -> u64 {
        self.connect_failures.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn record_keep_alive(&self) -> u64 {
        self.keep_alives_sent.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn record_ack(&self) -> u64 {
        self.acks_received.fetch_add(1, Ordering::Relaxed)
    }

    /// Get drop rate as a percentage (0.0 - 100.0)
    ///
    /// Returns 0.0 if nothing has been appended yet.
    pub fn drop_rate(&self) -> f64 {
        let dropped = self.dropped_count() as f64;
        let total = self.published_count() as f64 + dropped;
        if total == 0.0 {
            0.0
        } else {
            (dropped / total) * 100.0
        }
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        for counter in [
            &self.published,
            &self.dropped,
            &self.sent,
            &self.send_failures,
            &self.encode_failures,
            &self.abandoned,
            &self.connections_opened,
            &self.connect_failures,
            &self.keep_alives_sent,
            &self.acks_received,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for DeliveryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for DeliveryMetrics {
    /// Create a snapshot of the current metrics values
    fn clone(&self) -> Self {
        Self {
            published: AtomicU64::new(self.published_count()),
            dropped: AtomicU64::new(self.dropped_count()),
            sent: AtomicU64::new(self.sent_count()),
            send_failures: AtomicU64::new(self.send_failures()),
            encode_failures: AtomicU64::new(self.encode_failures()),
            abandoned: AtomicU64::new(self.abandoned_count()),
            connections_opened: AtomicU64::new(self.connections_opened()),
            connect_failures: AtomicU64::new(self.connect_failures()),
            keep_alives_sent: AtomicU64::new(self.keep_alives_sent()),
            acks_received: AtomicU64::new(self.acks_received()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = DeliveryMetrics::new();
        assert_eq!(metrics.published_count(), 0);
        assert_eq!(metrics.dropped_count(), 0);
        assert_eq!(metrics.sent_count(), 0);
        assert_eq!(metrics.connections_opened(), 0);
        assert_eq!(metrics.acks_received(), 0);
    }

    #[test]
    fn test_metrics_record_returns_previous() {
        let metrics = DeliveryMetrics::new();
        assert_eq!(metrics.record_dropped(), 0);
        assert_eq!(metrics.record_dropped(), 1);
        assert_eq!(metrics.dropped_count(), 2);
    }

    #[test]
    fn test_metrics_drop_rate() {
        let metrics = DeliveryMetrics::new();
        assert_eq!(metrics.drop_rate(), 0.0);

        for _ in 0..90 {
            metrics.record_published();
        }
        for _ in 0..10 {
            metrics.record_dropped();
        }

        let rate = metrics.drop_rate();
        assert!((9.9..=10.1).contains(&rate), "Drop rate was {}", rate);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = DeliveryMetrics::new();
        metrics.record_sent();
        metrics.record_keep_alive();
        metrics.record_connect_failure();

        metrics.reset();

        assert_eq!(metrics.sent_count(), 0);
        assert_eq!(metrics.keep_alives_sent(), 0);
        assert_eq!(metrics.connect_failures(), 0);
    }

    #[test]
    fn test_metrics_clone_is_snapshot() {
        let metrics = DeliveryMetrics::new();
        metrics.record_sent();

        let snapshot = metrics.clone();
        metrics.record_sent();

        assert_eq!(snapshot.sent_count(), 1);
        assert_eq!(metrics.sent_count(), 2);
    }
}
