//! Cooperative shutdown signal
//!
//! Tripped once by `stop()`. Every sleeping or blocking loop in the pipeline
//! (reconnect backoff, keep-alive scheduling, ack waits) either sleeps on it
//! or polls it, so tripping it wakes them all at once.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    triggered: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the signal and wake every waiter. Idempotent.
    pub fn trigger(&self) {
        let _guard = self.inner.lock.lock();
        self.inner.triggered.store(true, Ordering::Release);
        self.inner.cond.notify_all();
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// Sleep for `timeout` unless the signal trips first
    ///
    /// Returns true if the signal was tripped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(deadline),
            None => {
                let mut guard = self.inner.lock.lock();
                while !self.is_triggered() {
                    self.inner.cond.wait(&mut guard);
                }
                true
            }
        }
    }

    /// Sleep until `deadline` unless the signal trips first
    ///
    /// Returns true if the signal was tripped.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut guard = self.inner.lock.lock();
        while !self.is_triggered() {
            if self.inner.cond.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_triggered()
    }
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}
