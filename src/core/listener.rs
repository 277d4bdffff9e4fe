//! Delivery listeners
//!
//! A [`DeliveryListener`] is the status channel of an appender. Every method
//! has an empty default body so implementations only override what they
//! care about. Listeners are invoked synchronously from the thread that
//! observed the event (a producer for drops, the worker for writes, the
//! reader for acks), so they must be cheap and must not block.

use crate::net::HostInfo;
use std::io;
use std::sync::Arc;
use std::time::Duration;

#[allow(unused_variables)]
pub trait DeliveryListener: Send + Sync {
    /// The appender finished starting its threads
    fn appender_started(&self, name: &str) {}

    /// The appender finished shutting down
    fn appender_stopped(&self, name: &str) {}

    /// Called every `dropped_warn_frequency` consecutive drops
    ///
    /// `consecutive` is the length of the current drop streak.
    fn events_dropped(&self, consecutive: u64) {}

    /// The first successful publish after a drop streak of `total` events
    fn drop_streak_ended(&self, total: u64) {}

    /// An event was written to the connection
    fn event_sent(&self, bytes: usize, duration: Duration) {}

    /// Writing an event failed on attempt `attempt`
    fn event_send_failure(&self, attempt: u32, error: &io::Error) {}

    fn connection_opened(&self, host: &HostInfo) {}

    fn connection_failed(&self, host: &HostInfo, error: &io::Error) {}

    fn connection_closed(&self, host: &HostInfo) {}

    fn keep_alive_sent(&self) {}

    fn ack_received(&self, sequence: u32) {}

    /// The reader skipped a frame that failed validation
    fn malformed_frame(&self, reason: &str) {}
}

/// Shared, cloneable set of listeners attached to one appender
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<Vec<Arc<dyn DeliveryListener>>>,
}

impl Listeners {
    pub fn new(listeners: Vec<Arc<dyn DeliveryListener>>) -> Self {
        Self {
            inner: Arc::new(listeners),
        }
    }

    /// Invoke `f` for every registered listener, in registration order
    #[inline]
    pub fn notify(&self, f: impl Fn(&dyn DeliveryListener)) {
        for listener in self.inner.iter() {
            f(listener.as_ref());
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.inner.len())
            .finish()
    }
}
