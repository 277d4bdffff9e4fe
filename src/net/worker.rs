//! The delivery worker
//!
//! One worker thread per TCP appender. It is the only consumer of the ring
//! buffer and the only owner of the connection, so everything downstream of
//! the buffer is single-threaded. Events leave the worker in exactly the
//! order they were published, across reconnects included.

use super::codec::FrameCodec;
use super::connection::{ConnectionInfo, ConnectionManager};
use super::flow::{FlowController, ReaderHandoff};
use super::keep_alive::{KeepAlive, SendClock};
use crate::core::{
    DeliveryError, DeliveryMetrics, Encoder, Listeners, RingConsumer, ShutdownSignal,
};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long the worker parks when the ring buffer is empty
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Default number of write attempts per event
pub const DEFAULT_MAX_WRITE_ATTEMPTS: u32 = 5;

/// An item travelling through the ring buffer
pub enum Envelope<E> {
    /// An application event
    Event(E),
    /// Published by the keep-alive scheduler
    KeepAlive,
    /// Published by the acknowledgement reader when the link broke
    ConnectionCheck,
}

pub struct DeliveryWorker<E> {
    connections: ConnectionManager,
    encoder: Box<dyn Encoder<E>>,
    codec: Box<dyn FrameCodec>,
    flow: Box<dyn FlowController>,
    keep_alive: Option<KeepAlive>,
    clock: SendClock,
    handoffs: Option<Sender<ReaderHandoff>>,
    connection_info: Arc<Mutex<Option<ConnectionInfo>>>,
    max_write_attempts: u32,
    shutdown: ShutdownSignal,
    listeners: Listeners,
    metrics: Arc<DeliveryMetrics>,
}

impl<E> DeliveryWorker<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connections: ConnectionManager,
        encoder: Box<dyn Encoder<E>>,
        codec: Box<dyn FrameCodec>,
        flow: Box<dyn FlowController>,
        keep_alive: Option<KeepAlive>,
        clock: SendClock,
        shutdown: ShutdownSignal,
        listeners: Listeners,
        metrics: Arc<DeliveryMetrics>,
    ) -> Self {
        Self {
            connections,
            encoder,
            codec,
            flow,
            keep_alive,
            clock,
            handoffs: None,
            connection_info: Arc::new(Mutex::new(None)),
            max_write_attempts: DEFAULT_MAX_WRITE_ATTEMPTS,
            shutdown,
            listeners,
            metrics,
        }
    }

    /// Send the inbound half of every new connection to the ack reader
    #[must_use]
    pub fn with_reader_handoff(mut self, handoffs: Sender<ReaderHandoff>) -> Self {
        self.handoffs = Some(handoffs);
        self
    }

    /// Publish a snapshot of the current connection into `slot`
    #[must_use]
    pub fn with_connection_info(mut self, slot: Arc<Mutex<Option<ConnectionInfo>>>) -> Self {
        self.connection_info = slot;
        self
    }

    #[must_use]
    pub fn with_max_write_attempts(mut self, attempts: u32) -> Self {
        self.max_write_attempts = attempts.max(1);
        self
    }

    /// Run until shutdown is signalled and the buffer is drained
    ///
    /// After shutdown the worker keeps writing whatever is still buffered as
    /// long as it has a connection; items are abandoned once it does not.
    pub fn run(mut self, mut consumer: RingConsumer<Envelope<E>>) {
        self.reconnect(false);

        loop {
            let delivered = consumer.consume_batch(|item, end_of_batch| {
                self.handle(item, end_of_batch);
            });

            if delivered == 0 {
                if self.shutdown.is_triggered() {
                    break;
                }
                if self.connections.should_close_connection(Instant::now()) {
                    self.reattempt_primary();
                }
                consumer.wait(IDLE_WAIT);
            }
        }

        self.close_connection(true);
        debug!("delivery worker stopped");
    }

    fn handle(&mut self, item: Envelope<E>, end_of_batch: bool) {
        let mut attempt = 0;
        let mut settled = false;

        while !settled && self.connections.is_connected() {
            attempt += 1;
            match self.write_item(&item) {
                Ok(()) => settled = true,
                Err(error) if !error.is_transport() => {
                    warn!(%error, "dropping event that could not be encoded");
                    self.metrics.record_encode_failure();
                    settled = true;
                }
                Err(error) => {
                    let error = into_io(error);
                    if self.shutdown.is_triggered() {
                        debug!(%error, "write interrupted by shutdown");
                        self.close_connection(false);
                        break;
                    }

                    self.metrics.record_send_failure();
                    self.listeners.notify(|l| l.event_send_failure(attempt, &error));
                    warn!(
                        attempt,
                        max_attempts = self.max_write_attempts,
                        %error,
                        "write failed, reconnecting"
                    );
                    self.reconnect(false);

                    if attempt >= self.max_write_attempts {
                        warn!(attempts = attempt, "giving up on event");
                        break;
                    }
                }
            }
        }

        if !settled && matches!(item, Envelope::Event(_)) {
            self.metrics.record_abandoned();
        }

        if end_of_batch {
            self.flush();
        }

        if self.connections.should_close_connection(Instant::now()) {
            self.flush();
            self.reattempt_primary();
        }
    }

    fn write_item(&mut self, item: &Envelope<E>) -> Result<(), DeliveryError> {
        let connection = self
            .connections
            .current_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no connection"))?;

        match item {
            Envelope::Event(event) => {
                let link = Arc::clone(connection.link());
                if link.is_broken() {
                    return Err(broken_link().into());
                }
                self.flow.acquire(&link, connection.writer(), &self.shutdown)?;

                let started = Instant::now();
                let payload = self.encoder.encode(event)?;
                self.codec.write_payload(connection.writer(), &payload)?;
                self.flow.record_sent();
                self.clock.touch();

                self.metrics.record_sent();
                let elapsed = started.elapsed();
                self.listeners.notify(|l| l.event_sent(payload.len(), elapsed));
            }
            Envelope::KeepAlive => {
                if let Some(keep_alive) = &self.keep_alive {
                    // A real event may have reset the idle timer since the
                    // marker was published.
                    if self.clock.since_last_send() >= keep_alive.interval {
                        connection.writer().write_all(&keep_alive.message)?;
                        self.clock.touch();
                        self.metrics.record_keep_alive();
                        self.listeners.notify(|l| l.keep_alive_sent());
                    }
                }
            }
            Envelope::ConnectionCheck => {
                if connection.link().is_broken() {
                    return Err(broken_link().into());
                }
            }
        }

        Ok(())
    }

    fn flush(&mut self) {
        let Some(connection) = self.connections.current_mut() else {
            return;
        };

        if let Err(error) = connection.writer().flush() {
            if self.shutdown.is_triggered() {
                debug!(%error, "flush failed during shutdown");
                return;
            }
            self.metrics.record_send_failure();
            warn!(%error, "flush failed, buffered events may be lost; reconnecting");
            self.reconnect(false);
        }
    }

    fn reattempt_primary(&mut self) {
        if let Some(connection) = self.connections.current() {
            info!(
                host = %connection.host(),
                "reattempting connection to primary destination"
            );
        }
        self.close_connection(true);
        self.connections.prefer_primary();
        self.reconnect(false);
    }

    /// Replace the current connection with a fresh one
    ///
    /// Blocks until a connection is up and initialised or shutdown is
    /// signalled. Connections whose initialisation fails (encoder header,
    /// window announcement) are dropped and the attempt is repeated after the
    /// reconnection delay.
    fn reconnect(&mut self, graceful: bool) {
        self.close_connection(graceful);

        loop {
            if !self.connections.connect() {
                return;
            }

            match self.on_connected() {
                Ok(()) => return,
                Err(error) => {
                    warn!(%error, "initialising connection failed");
                    self.close_connection(false);
                    let delay = self.connections.settings().reconnection_delay;
                    if self.shutdown.wait_timeout(delay) {
                        return;
                    }
                }
            }
        }
    }

    fn on_connected(&mut self) -> io::Result<()> {
        let Some(connection) = self.connections.current_mut() else {
            return Ok(());
        };

        self.encoder.init(connection.writer())?;
        self.flow.on_connect(connection.writer())?;
        connection.writer().flush()?;
        self.clock.touch();

        if let Some(handoffs) = &self.handoffs {
            if let Some(reader) = connection.take_reader() {
                let handoff = ReaderHandoff {
                    host: connection.host().clone(),
                    reader,
                };
                if handoffs.send(handoff).is_err() {
                    warn!("acknowledgement reader is gone");
                }
            }
        }

        *self.connection_info.lock() = Some(connection.info());
        Ok(())
    }

    fn close_connection(&mut self, graceful: bool) {
        if graceful {
            if let Some(connection) = self.connections.current_mut() {
                if let Err(error) = self.encoder.close(connection.writer()) {
                    debug!(%error, "encoder footer not written");
                }
            }
        }
        self.connections.close_socket();
        *self.connection_info.lock() = None;
    }
}

fn broken_link() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "peer closed the connection")
}

fn into_io(error: DeliveryError) -> io::Error {
    match error {
        DeliveryError::IoError(e) => e,
        DeliveryError::IoOperation { source, .. } => source,
        other => io::Error::other(other.to_string()),
    }
}
