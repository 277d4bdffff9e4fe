//! Keep-alive scheduling
//!
//! The scheduler never writes to the socket itself. When the connection has
//! been idle for the configured interval it publishes a keep-alive marker
//! into the ring buffer, so the marker is ordered with real events and
//! written by the worker like everything else.

use crate::core::ShutdownSignal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Keep-alive settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAlive {
    pub interval: Duration,
    pub message: Vec<u8>,
}

/// Time of the last write to the connection, shared between the worker and
/// the scheduler
#[derive(Debug, Clone)]
pub struct SendClock {
    base: Instant,
    last_nanos: Arc<AtomicU64>,
}

impl SendClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            last_nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a write happening now
    pub fn touch(&self) {
        let nanos = u64::try_from(self.base.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last_nanos.store(nanos, Ordering::Release);
    }

    pub fn last_send(&self) -> Instant {
        self.base + Duration::from_nanos(self.last_nanos.load(Ordering::Acquire))
    }

    pub fn since_last_send(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_send())
    }
}

impl Default for SendClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the scheduler until shutdown
///
/// `publish` enqueues one keep-alive marker and returns false when the ring
/// buffer is full, in which case the worker is busy anyway.
pub fn run_scheduler<F>(interval: Duration, clock: SendClock, shutdown: ShutdownSignal, publish: F)
where
    F: Fn() -> bool,
{
    loop {
        let now = Instant::now();
        let due = clock.last_send() + interval;

        let next = if now >= due {
            if publish() {
                trace!("keep-alive marker published");
            } else {
                debug!("ring buffer full, skipping keep-alive");
            }
            now + interval
        } else {
            due
        };

        if shutdown.wait_until(next) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_clock_tracks_last_send() {
        let clock = SendClock::new();
        thread::sleep(Duration::from_millis(20));
        assert!(clock.since_last_send() >= Duration::from_millis(20));

        clock.touch();
        assert!(clock.since_last_send() < Duration::from_millis(20));
    }

    #[test]
    fn test_scheduler_waits_for_idle_interval() {
        let clock = SendClock::new();
        clock.touch();
        let shutdown = ShutdownSignal::new();
        let published = Arc::new(AtomicUsize::new(0));

        let handle = {
            let clock = clock.clone();
            let shutdown = shutdown.clone();
            let published = Arc::clone(&published);
            thread::spawn(move || {
                run_scheduler(Duration::from_millis(100), clock, shutdown, || {
                    published.fetch_add(1, Ordering::SeqCst);
                    true
                })
            })
        };

        // Keep the connection busy for a while: no marker is due.
        for _ in 0..6 {
            thread::sleep(Duration::from_millis(30));
            clock.touch();
        }
        assert_eq!(published.load(Ordering::SeqCst), 0);

        // Idle: about one marker per interval.
        thread::sleep(Duration::from_millis(450));
        shutdown.trigger();
        handle.join().unwrap();

        let count = published.load(Ordering::SeqCst);
        assert!((2..=6).contains(&count), "published {} markers", count);
    }
}
