//! Appender trait for event destinations

/// A destination that accepts events from application threads
///
/// `append` never blocks on the network and never fails loudly: it returns
/// false when the event was not accepted (buffer full, appender stopped, or
/// an immediate send failure for unbuffered appenders).
pub trait Appender<E>: Send + Sync {
    fn append(&self, event: E) -> bool;
    fn name(&self) -> &str;
}
