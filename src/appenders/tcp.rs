//! TCP appender
//!
//! Application threads publish into a lock-free ring buffer and return
//! immediately; a dedicated worker thread drains the buffer into a TCP (or
//! TLS) connection with failover, reconnects and optional acknowledgement
//! based flow control. A full buffer drops the event instead of blocking the
//! caller.

use crate::core::config::millis;
use crate::core::ring_buffer::{self, RingConsumer, RingProducer};
use crate::core::{
    Appender, AppenderConfig, DeliveryError, DeliveryListener, DeliveryMetrics, DeliverySettings,
    Encoder, Listeners, Result, ShutdownSignal,
};
use crate::net::flow::{ack_window, AckReader, FlowController, ReaderHandoff, Unbounded};
use crate::net::keep_alive::{self, SendClock};
use crate::net::{
    ConnectionInfo, ConnectionManager, DeliveryWorker, Envelope, FrameCodec, LumberjackFrameCodec,
    RawFrameCodec, TlsConfig,
};
use crossbeam_utils::sync::Unparker;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Parts handed to the worker on start
struct Pending<E> {
    consumer: RingConsumer<Envelope<E>>,
    encoder: Box<dyn Encoder<E>>,
}

/// Asynchronous TCP appender
///
/// # Example
///
/// ```no_run
/// use logstash_delivery::prelude::*;
///
/// let appender = TcpAppender::<String>::builder()
///     .destinations("logs-1.example.com:4560,logs-2.example.com:4560")
///     .encoder(LineEncoder::new())
///     .build()
///     .expect("valid configuration");
///
/// appender.start().expect("appender started");
/// appender.append("hello".to_string());
/// appender.stop();
/// ```
pub struct TcpAppender<E: Send + 'static> {
    settings: DeliverySettings,
    producer: RingProducer<Envelope<E>>,
    pending: Mutex<Option<Pending<E>>>,
    unparker: Unparker,
    running: AtomicBool,
    shutdown: ShutdownSignal,
    threads: Mutex<Vec<JoinHandle<()>>>,
    consecutive_dropped: AtomicU64,
    metrics: Arc<DeliveryMetrics>,
    listeners: Listeners,
    connection_info: Arc<Mutex<Option<ConnectionInfo>>>,
}

impl<E: Send + 'static> TcpAppender<E> {
    pub fn builder() -> TcpAppenderBuilder<E> {
        TcpAppenderBuilder::new()
    }

    /// Create a stopped appender from a configuration
    pub fn from_config(
        config: &AppenderConfig,
        encoder: Box<dyn Encoder<E>>,
        listeners: Vec<Arc<dyn DeliveryListener>>,
    ) -> Result<Self> {
        let settings = config.validate()?;
        let (producer, consumer) = ring_buffer::ring_buffer(settings.ring_buffer_size)?;

        Ok(Self {
            unparker: consumer.unparker(),
            pending: Mutex::new(Some(Pending { consumer, encoder })),
            producer,
            settings,
            running: AtomicBool::new(false),
            shutdown: ShutdownSignal::new(),
            threads: Mutex::new(Vec::new()),
            consecutive_dropped: AtomicU64::new(0),
            metrics: Arc::new(DeliveryMetrics::new()),
            listeners: Listeners::new(listeners),
            connection_info: Arc::new(Mutex::new(None)),
        })
    }

    /// Spawn the worker, keep-alive and acknowledgement reader threads
    ///
    /// An appender can be started once; starting it again, also after
    /// [`TcpAppender::stop`], is an error.
    pub fn start(&self) -> Result<()> {
        #[cfg(feature = "tls")]
        let tls = match &self.settings.tls {
            Some(tls) => Some(crate::net::tls::TlsConnector::from_config(tls)?),
            None => None,
        };

        let Some(Pending { consumer, encoder }) = self.pending.lock().take() else {
            return Err(DeliveryError::AlreadyStarted(self.settings.name.clone()));
        };

        #[allow(unused_mut)]
        let mut connections = ConnectionManager::new(
            self.settings.destinations.clone(),
            self.settings.connection.clone(),
            self.shutdown.clone(),
            self.listeners.clone(),
            Arc::clone(&self.metrics),
        );
        #[cfg(feature = "tls")]
        if let Some(tls) = tls {
            connections = connections.with_tls(tls);
        }

        let mut threads = Vec::new();
        if let Err(error) = self.launch(connections, consumer, encoder, &mut threads) {
            error!(appender = %self.settings.name, %error, "appender failed to start");
            self.abort_start(threads);
            return Err(error);
        }

        *self.threads.lock() = threads;
        self.running.store(true, Ordering::Release);

        info!(
            appender = %self.settings.name,
            destinations = self.settings.destinations.len(),
            ack_protocol = self.settings.ack_window.is_some(),
            "appender started"
        );
        self.listeners.notify(|l| l.appender_started(&self.settings.name));
        Ok(())
    }

    fn launch(
        &self,
        connections: ConnectionManager,
        consumer: RingConsumer<Envelope<E>>,
        encoder: Box<dyn Encoder<E>>,
        threads: &mut Vec<JoinHandle<()>>,
    ) -> Result<()> {
        let clock = SendClock::new();
        let name = &self.settings.name;

        let codec: Box<dyn FrameCodec>;
        let flow: Box<dyn FlowController>;
        let mut handoffs = None;

        match self.settings.ack_window {
            Some(window_size) => {
                let (controller, acks) = ack_window(window_size);
                let (handoff_tx, handoff_rx) = crossbeam_channel::unbounded::<ReaderHandoff>();

                let producer = self.producer.clone();
                let reader = AckReader::new(
                    handoff_rx,
                    acks,
                    Box::new(move || producer.publish(Envelope::ConnectionCheck).is_ok()),
                    self.shutdown.clone(),
                    self.listeners.clone(),
                    Arc::clone(&self.metrics),
                );
                threads.push(spawn(format!("{}-ack-reader", name), move || reader.run())?);

                codec = Box::new(LumberjackFrameCodec::new());
                flow = Box::new(controller);
                handoffs = Some(handoff_tx);
            }
            None => {
                codec = Box::new(RawFrameCodec);
                flow = Box::new(Unbounded);
            }
        }

        if let Some(interval) = self.settings.keep_alive.as_ref().map(|k| k.interval) {
            let clock = clock.clone();
            let shutdown = self.shutdown.clone();
            let producer = self.producer.clone();
            threads.push(spawn(format!("{}-keep-alive", name), move || {
                keep_alive::run_scheduler(interval, clock, shutdown, || {
                    producer.publish(Envelope::KeepAlive).is_ok()
                })
            })?);
        }

        let mut worker = DeliveryWorker::new(
            connections,
            encoder,
            codec,
            flow,
            self.settings.keep_alive.clone(),
            clock,
            self.shutdown.clone(),
            self.listeners.clone(),
            Arc::clone(&self.metrics),
        )
        .with_connection_info(Arc::clone(&self.connection_info))
        .with_max_write_attempts(self.settings.max_write_attempts);
        if let Some(handoffs) = handoffs {
            worker = worker.with_reader_handoff(handoffs);
        }
        threads.push(spawn(format!("{}-worker", name), move || worker.run(consumer))?);
        Ok(())
    }

    /// Stop and join the threads of a start that failed part-way
    fn abort_start(&self, threads: Vec<JoinHandle<()>>) {
        *self.threads.lock() = threads;
        self.shutdown.trigger();
        self.unparker.unpark();
        self.join_threads();
    }

    /// Signal shutdown and wait up to the shutdown timeout for the threads
    ///
    /// Returns false when the threads did not finish in time, in which case
    /// events still buffered may be lost. Calling `stop` on a stopped
    /// appender returns true.
    pub fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return true;
        }

        self.shutdown.trigger();
        self.unparker.unpark();
        let clean = self.join_threads();

        info!(
            appender = %self.settings.name,
            sent = self.metrics.sent_count(),
            dropped = self.metrics.dropped_count(),
            "appender stopped"
        );
        self.listeners.notify(|l| l.appender_stopped(&self.settings.name));
        clean
    }

    /// Join every thread, all under one shutdown deadline
    fn join_threads(&self) -> bool {
        let timeout = self.settings.shutdown_timeout;
        let start = Instant::now();
        let mut clean = true;

        for handle in self.threads.lock().drain(..) {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            loop {
                if handle.is_finished() {
                    if handle.join().is_err() {
                        error!(thread = %name, "appender thread panicked");
                        clean = false;
                    }
                    break;
                }

                if start.elapsed() >= timeout {
                    warn!(
                        appender = %self.settings.name,
                        thread = %name,
                        ?timeout,
                        "thread did not finish in time, buffered events may have been lost"
                    );
                    clean = false;
                    break;
                }

                thread::sleep(Duration::from_millis(10));
            }
        }

        clean
    }

    pub fn is_started(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    pub fn metrics(&self) -> &DeliveryMetrics {
        &self.metrics
    }

    /// The connection the worker is currently writing to
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.connection_info.lock().clone()
    }

    /// Events waiting in the ring buffer
    pub fn buffered(&self) -> usize {
        self.producer.len()
    }

    fn record_drop(&self) {
        self.metrics.record_dropped();
        let consecutive = self.consecutive_dropped.fetch_add(1, Ordering::AcqRel) + 1;
        if consecutive % self.settings.dropped_warn_frequency == 0 {
            warn!(
                appender = %self.settings.name,
                consecutive,
                capacity = self.producer.capacity(),
                "ring buffer full, dropping events"
            );
            self.listeners.notify(|l| l.events_dropped(consecutive));
        }
    }

    fn record_publish(&self) {
        self.metrics.record_published();
        let total = self.consecutive_dropped.swap(0, Ordering::AcqRel);
        if total > 0 {
            info!(appender = %self.settings.name, total, "ring buffer accepting events again");
            self.listeners.notify(|l| l.drop_streak_ended(total));
        }
    }
}

fn spawn<F>(thread_name: String, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(thread_name.clone())
        .spawn(f)
        .map_err(|e| DeliveryError::io_operation("spawning thread", thread_name, e))
}

impl<E: Send + 'static> Appender<E> for TcpAppender<E> {
    fn append(&self, event: E) -> bool {
        if !self.is_started() {
            debug!(appender = %self.settings.name, "event ignored, appender not running");
            return false;
        }

        match self.producer.publish(Envelope::Event(event)) {
            Ok(()) => {
                self.record_publish();
                true
            }
            Err(_) => {
                self.record_drop();
                false
            }
        }
    }

    fn name(&self) -> &str {
        &self.settings.name
    }
}

impl<E: Send + 'static> Drop for TcpAppender<E> {
    fn drop(&mut self) {
        if !self.is_started() {
            return;
        }
        if self.settings.daemon {
            self.running.store(false, Ordering::Release);
            self.shutdown.trigger();
            self.unparker.unpark();
        } else {
            self.stop();
        }
    }
}

/// Builder for [`TcpAppender`]
///
/// Every setter mirrors a field of [`AppenderConfig`]; the result is
/// validated by [`TcpAppenderBuilder::build`].
pub struct TcpAppenderBuilder<E> {
    config: AppenderConfig,
    encoder: Option<Box<dyn Encoder<E>>>,
    listeners: Vec<Arc<dyn DeliveryListener>>,
}

impl<E: Send + 'static> TcpAppenderBuilder<E> {
    pub fn new() -> Self {
        Self {
            config: AppenderConfig::default(),
            encoder: None,
            listeners: Vec::new(),
        }
    }

    /// Start from an existing configuration
    #[must_use = "builder methods return a new value"]
    pub fn config(mut self, config: AppenderConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use = "builder methods return a new value"]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Single destination
    #[must_use = "builder methods return a new value"]
    pub fn remote_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.remote_host = Some(host.into());
        self.config.port = Some(port);
        self
    }

    /// Comma separated `host[:port]` list, primary first
    #[must_use = "builder methods return a new value"]
    pub fn destinations(mut self, destinations: impl Into<String>) -> Self {
        self.config.destinations = Some(destinations.into());
        self
    }

    /// Port for destinations listed without one
    #[must_use = "builder methods return a new value"]
    pub fn default_port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    #[must_use = "builder methods return a new value"]
    pub fn ring_buffer_size(mut self, size: usize) -> Self {
        self.config.ring_buffer_size = size;
        self
    }

    #[must_use = "builder methods return a new value"]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = millis(timeout);
        self
    }

    #[must_use = "builder methods return a new value"]
    pub fn reconnection_delay(mut self, delay: Duration) -> Self {
        self.config.reconnection_delay_ms = millis(delay);
        self
    }

    #[must_use = "builder methods return a new value"]
    pub fn reattempt_primary_delay(mut self, delay: Duration) -> Self {
        self.config.reattempt_primary_delay_ms = Some(millis(delay));
        self
    }

    /// Write `message` after `interval` without any other write
    #[must_use = "builder methods return a new value"]
    pub fn keep_alive(mut self, interval: Duration, message: impl Into<String>) -> Self {
        self.config.keep_alive_interval_ms = Some(millis(interval));
        self.config.keep_alive_message = message.into();
        self
    }

    #[must_use = "builder methods return a new value"]
    pub fn keep_alive_charset(mut self, charset: impl Into<String>) -> Self {
        self.config.keep_alive_charset = charset.into();
        self
    }

    #[must_use = "builder methods return a new value"]
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    #[must_use = "builder methods return a new value"]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout_ms = Some(millis(timeout));
        self
    }

    /// Enable the acknowledgement protocol with the given window size
    #[must_use = "builder methods return a new value"]
    pub fn ack_protocol(mut self, window_size: u32) -> Self {
        self.config.ack_protocol = true;
        self.config.ack_window_size = window_size;
        self
    }

    #[must_use = "builder methods return a new value"]
    pub fn dropped_warn_frequency(mut self, frequency: u64) -> Self {
        self.config.dropped_warn_frequency = frequency;
        self
    }

    #[must_use = "builder methods return a new value"]
    pub fn daemon(mut self, daemon: bool) -> Self {
        self.config.daemon = daemon;
        self
    }

    #[must_use = "builder methods return a new value"]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout_ms = millis(timeout);
        self
    }

    #[must_use = "builder methods return a new value"]
    pub fn max_write_attempts(mut self, attempts: u32) -> Self {
        self.config.max_write_attempts = attempts;
        self
    }

    #[must_use = "builder methods return a new value"]
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.config.tls = Some(tls);
        self
    }

    #[must_use = "builder methods return a new value"]
    pub fn encoder(mut self, encoder: impl Encoder<E> + 'static) -> Self {
        self.encoder = Some(Box::new(encoder));
        self
    }

    #[must_use = "builder methods return a new value"]
    pub fn listener(mut self, listener: Arc<dyn DeliveryListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Validate the configuration and create a stopped appender
    pub fn build(self) -> Result<TcpAppender<E>> {
        let encoder = self
            .encoder
            .ok_or_else(|| DeliveryError::config("TcpAppender", "no encoder configured"))?;
        TcpAppender::from_config(&self.config, encoder, self.listeners)
    }
}

impl<E: Send + 'static> Default for TcpAppenderBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}
