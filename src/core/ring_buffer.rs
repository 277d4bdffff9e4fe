//! Bounded multi-producer / single-consumer ring buffer
//!
//! Storage is a lock-free [`ArrayQueue`]; publishing never blocks and fails
//! when every slot is taken. Producers unpark the consumer after each
//! publish so an idle worker wakes without polling.
//!
//! The buffer is created as a pair: a cloneable [`RingProducer`] and a single
//! [`RingConsumer`]. The consumer is not `Clone`, so the single-consumer
//! requirement is checked by the compiler.
//!
//! # Example
//!
//! ```
//! use logstash_delivery::core::ring_buffer;
//!
//! let (producer, mut consumer) = ring_buffer::ring_buffer::<u32>(8).unwrap();
//! assert!(producer.publish(1).is_ok());
//! assert!(producer.publish(2).is_ok());
//!
//! let mut seen = Vec::new();
//! consumer.consume_batch(|value, _end_of_batch| seen.push(value));
//! assert_eq!(seen, vec![1, 2]);
//! ```

use super::error::{DeliveryError, Result};
use crossbeam_queue::ArrayQueue;
use crossbeam_utils::sync::{Parker, Unparker};
use std::sync::Arc;
use std::time::Duration;

/// Default number of slots
pub const DEFAULT_RING_BUFFER_SIZE: usize = 8192;

struct Shared<T> {
    queue: ArrayQueue<T>,
    unparker: Unparker,
}

/// Publishing half of the ring buffer; cheap to clone
pub struct RingProducer<T> {
    shared: Arc<Shared<T>>,
}

/// Consuming half of the ring buffer; exactly one exists per buffer
pub struct RingConsumer<T> {
    shared: Arc<Shared<T>>,
    parker: Parker,
}

/// Create a ring buffer with `capacity` slots
///
/// # Errors
///
/// Returns an error unless `capacity` is a non-zero power of two.
pub fn ring_buffer<T>(capacity: usize) -> Result<(RingProducer<T>, RingConsumer<T>)> {
    if capacity == 0 || !capacity.is_power_of_two() {
        return Err(DeliveryError::config(
            "RingBuffer",
            format!("capacity must be a positive power of two, got {}", capacity),
        ));
    }

    let parker = Parker::new();
    let shared = Arc::new(Shared {
        queue: ArrayQueue::new(capacity),
        unparker: parker.unparker().clone(),
    });

    Ok((
        RingProducer {
            shared: Arc::clone(&shared),
        },
        RingConsumer { shared, parker },
    ))
}

impl<T> RingProducer<T> {
    /// Try to publish a value without blocking
    ///
    /// Returns the value back when every slot is occupied.
    pub fn publish(&self, value: T) -> std::result::Result<(), T> {
        self.shared.queue.push(value)?;
        self.shared.unparker.unpark();
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.shared.queue.capacity()
    }

    /// Approximate number of values waiting to be consumed
    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }
}

impl<T> Clone for RingProducer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> RingConsumer<T> {
    /// Take the next value, if one has been fully published
    pub fn poll(&mut self) -> Option<T> {
        self.shared.queue.pop()
    }

    /// Deliver every value available right now to `handler`, in publish order
    ///
    /// The second argument to `handler` is true for the last value of the
    /// batch, i.e. when no further value was available at the time it was
    /// handed out. Returns the number of values delivered.
    pub fn consume_batch<F>(&mut self, mut handler: F) -> usize
    where
        F: FnMut(T, bool),
    {
        let mut delivered = 0;
        let mut next = self.poll();

        while let Some(value) = next {
            next = self.poll();
            handler(value, next.is_none());
            delivered += 1;
        }

        delivered
    }

    /// Park the calling thread until a producer publishes or `timeout` elapses
    ///
    /// Returns immediately when values are already waiting. Spurious wakeups
    /// are possible, so callers re-check with [`RingConsumer::poll`].
    pub fn wait(&self, timeout: Duration) {
        if !self.is_empty() {
            return;
        }
        self.parker.park_timeout(timeout);
    }

    /// Wake a consumer blocked in [`RingConsumer::wait`]
    pub fn unparker(&self) -> Unparker {
        self.parker.unparker().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.queue.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_rejects_non_power_of_two() {
        assert!(ring_buffer::<u8>(0).is_err());
        assert!(ring_buffer::<u8>(12).is_err());
        assert!(ring_buffer::<u8>(16).is_ok());
    }

    #[test]
    fn test_publish_fails_when_full() {
        let (producer, mut consumer) = ring_buffer(4).unwrap();
        for i in 0..4 {
            assert!(producer.publish(i).is_ok());
        }
        assert_eq!(producer.publish(99), Err(99));
        assert_eq!(producer.len(), 4);

        assert_eq!(consumer.poll(), Some(0));
        assert!(producer.publish(4).is_ok());

        let mut seen = Vec::new();
        consumer.consume_batch(|v, _| seen.push(v));
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_end_of_batch_flag() {
        let (producer, mut consumer) = ring_buffer(8).unwrap();
        for i in 0..3 {
            producer.publish(i).unwrap();
        }

        let mut flags = Vec::new();
        let delivered = consumer.consume_batch(|_, end| flags.push(end));

        assert_eq!(delivered, 3);
        assert_eq!(flags, vec![false, false, true]);
        assert_eq!(consumer.consume_batch(|_, _| {}), 0);
    }

    #[test]
    fn test_wraps_around_many_times() {
        let (producer, mut consumer) = ring_buffer(2).unwrap();
        for i in 0..100u32 {
            producer.publish(i).unwrap();
            assert_eq!(consumer.poll(), Some(i));
        }
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_unconsumed_values_are_dropped() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            let (producer, mut consumer) = ring_buffer(4).unwrap();
            for _ in 0..3 {
                assert!(producer.publish(Counted).is_ok());
            }
            drop(consumer.poll());
        }

        assert_eq!(DROPS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_concurrent_producers_preserve_per_producer_order() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 10_000;

        let (producer, mut consumer) = ring_buffer::<(usize, usize)>(1024).unwrap();

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|id| {
                let producer = producer.clone();
                thread::spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        let mut value = (id, seq);
                        while let Err(back) = producer.publish(value) {
                            value = back;
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let mut last = [None::<usize>; PRODUCERS];
        let mut received = 0;
        while received < PRODUCERS * PER_PRODUCER {
            received += consumer.consume_batch(|(id, seq), _| {
                if let Some(prev) = last[id] {
                    assert_eq!(seq, prev + 1, "producer {} reordered", id);
                }
                last[id] = Some(seq);
            });
            consumer.wait(Duration::from_millis(1));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(received, PRODUCERS * PER_PRODUCER);
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_wait_returns_after_publish() {
        let (producer, consumer) = ring_buffer::<u8>(8).unwrap();
        let start = std::time::Instant::now();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.publish(1).unwrap();
        });

        consumer.wait(Duration::from_secs(5));
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
