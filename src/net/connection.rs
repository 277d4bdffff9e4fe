//! Connection management
//!
//! The [`ConnectionManager`] owns the one live connection of a TCP appender
//! and is only ever touched by the delivery worker thread. It walks the
//! destination list for failover, bounds every connect attempt with a
//! timeout, backs off between full passes over the list, and forces a
//! reconnect towards the primary once a secondary connection has been up for
//! `reattempt_primary_delay`.
//!
//! Each connection is split into a buffered writer, used by the worker, and a
//! reader half that is handed to the acknowledgement reader. The reader
//! never closes or replaces the connection; it reports problems through the
//! connection's [`LinkState`].

use super::host::HostInfo;
#[cfg(feature = "tls")]
use super::tls::{TlsConnector, TlsStream};
use crate::core::{DeliveryMetrics, Listeners, ShutdownSignal};
use chrono::{DateTime, Utc};
#[cfg(feature = "tls")]
use parking_lot::Mutex;
use serde::Serialize;
use std::io::{self, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often a TLS reader re-checks whether its connection was closed
#[cfg(feature = "tls")]
const TLS_READ_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Timing and buffering knobs for connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub reconnection_delay: Duration,
    pub reattempt_primary_delay: Option<Duration>,
    pub write_buffer_size: usize,
    pub write_timeout: Option<Duration>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            reconnection_delay: Duration::from_millis(30_000),
            reattempt_primary_delay: None,
            write_buffer_size: 8192,
            write_timeout: None,
        }
    }
}

/// Health flags shared between the worker and the reader of one connection
#[derive(Debug, Default)]
pub struct LinkState {
    closed: AtomicBool,
    broken: AtomicBool,
}

impl LinkState {
    /// Set by the worker when it closes the connection on purpose
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Set by the reader when the peer went away or the stream failed
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }
}

/// Snapshot of the current connection, for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub host: HostInfo,
    pub index: usize,
    pub established_at: DateTime<Utc>,
}

pub(crate) enum SocketWriter {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Arc<Mutex<TlsStream>>),
}

impl Write for SocketWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SocketWriter::Plain(socket) => socket.write(buf),
            #[cfg(feature = "tls")]
            SocketWriter::Tls(stream) => stream.lock().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SocketWriter::Plain(socket) => socket.flush(),
            #[cfg(feature = "tls")]
            SocketWriter::Tls(stream) => stream.lock().flush(),
        }
    }
}

/// Inbound half of a connection
pub struct SocketReader {
    inner: ReaderInner,
    link: Arc<LinkState>,
}

enum ReaderInner {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls {
        stream: Arc<Mutex<TlsStream>>,
        raw: TcpStream,
    },
}

impl SocketReader {
    pub fn link(&self) -> &Arc<LinkState> {
        &self.link
    }
}

impl Read for SocketReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            ReaderInner::Plain(socket) => socket.read(buf),
            #[cfg(feature = "tls")]
            ReaderInner::Tls { stream, raw } => read_tls(stream, raw, &self.link, buf),
        }
    }
}

/// Read plaintext without holding the TLS lock while waiting for data, so
/// the worker can keep writing.
#[cfg(feature = "tls")]
fn read_tls(
    stream: &Arc<Mutex<TlsStream>>,
    raw: &TcpStream,
    link: &LinkState,
    buf: &mut [u8],
) -> io::Result<usize> {
    loop {
        if link.is_closed() {
            return Ok(0);
        }

        {
            let mut tls = stream.lock();
            match tls.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        let mut probe = [0u8; 1];
        match raw.peek(&mut probe) {
            Ok(0) => return Ok(0),
            Ok(_) => {}
            Err(e) if is_timeout(&e) => continue,
            Err(e) => return Err(e),
        }

        let mut tls = stream.lock();
        let TlsStream { conn, sock, .. } = &mut *tls;
        match conn.read_tls(sock) {
            Ok(0) => return Ok(0),
            Ok(_) => {
                conn.process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
            Err(e) if is_timeout(&e) => {}
            Err(e) => return Err(e),
        }
    }
}

#[cfg(feature = "tls")]
fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// A live connection to one destination
pub struct Connection {
    host: HostInfo,
    index: usize,
    established_at: DateTime<Utc>,
    expires_at: Option<Instant>,
    writer: BufWriter<SocketWriter>,
    socket: TcpStream,
    link: Arc<LinkState>,
    reader: Option<SocketReader>,
}

impl Connection {
    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    /// Position of the host in the destination list; 0 is the primary
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn writer(&mut self) -> &mut dyn Write {
        &mut self.writer
    }

    pub fn link(&self) -> &Arc<LinkState> {
        &self.link
    }

    /// Take the inbound half; only the first call returns it
    pub fn take_reader(&mut self) -> Option<SocketReader> {
        self.reader.take()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: self.host.clone(),
            index: self.index,
            established_at: self.established_at,
        }
    }
}

/// Owner of the live connection and of the failover policy
pub struct ConnectionManager {
    destinations: Vec<HostInfo>,
    settings: ConnectionSettings,
    #[cfg(feature = "tls")]
    tls: Option<TlsConnector>,
    /// Where the next connect pass begins
    next_start: usize,
    current: Option<Connection>,
    shutdown: ShutdownSignal,
    listeners: Listeners,
    metrics: Arc<DeliveryMetrics>,
}

impl ConnectionManager {
    pub fn new(
        destinations: Vec<HostInfo>,
        settings: ConnectionSettings,
        shutdown: ShutdownSignal,
        listeners: Listeners,
        metrics: Arc<DeliveryMetrics>,
    ) -> Self {
        Self {
            destinations,
            settings,
            #[cfg(feature = "tls")]
            tls: None,
            next_start: 0,
            current: None,
            shutdown,
            listeners,
            metrics,
        }
    }

    #[cfg(feature = "tls")]
    pub(crate) fn with_tls(mut self, tls: TlsConnector) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_mut(&mut self) -> Option<&mut Connection> {
        self.current.as_mut()
    }

    pub fn current(&self) -> Option<&Connection> {
        self.current.as_ref()
    }

    /// True once a connection to a secondary host has outlived its
    /// primary-reattempt deadline
    pub fn should_close_connection(&self, now: Instant) -> bool {
        self.current
            .as_ref()
            .and_then(|c| c.expires_at)
            .is_some_and(|deadline| now >= deadline)
    }

    /// Make the next connect pass start at the primary
    pub fn prefer_primary(&mut self) {
        self.next_start = 0;
    }

    /// Open a connection, retrying until one succeeds or shutdown is signalled
    ///
    /// The first pass starts at the last host that worked (or the primary);
    /// later passes always start at the primary. Hosts within a pass are
    /// tried back to back. After a failed pass the manager sleeps for
    /// `reconnection_delay` minus the time the pass took.
    ///
    /// Returns false only when shutdown interrupted the attempt.
    pub fn connect(&mut self) -> bool {
        self.close_socket();

        let count = self.destinations.len();
        let mut start = self.next_start.min(count.saturating_sub(1));

        loop {
            let pass_started = Instant::now();

            for offset in 0..count {
                if self.shutdown.is_triggered() {
                    return false;
                }

                let index = (start + offset) % count;
                let host = &self.destinations[index];
                match self.open(index) {
                    Ok(connection) => {
                        info!(host = %host, index, "connected");
                        self.metrics.record_connection_opened();
                        self.listeners.notify(|l| l.connection_opened(host));
                        self.next_start = index;
                        self.current = Some(connection);
                        return true;
                    }
                    Err(error) => {
                        warn!(host = %host, index, %error, "connection attempt failed");
                        self.metrics.record_connect_failure();
                        self.listeners.notify(|l| l.connection_failed(host, &error));
                    }
                }
            }

            start = 0;
            let delay = self
                .settings
                .reconnection_delay
                .saturating_sub(pass_started.elapsed());
            warn!(
                destinations = count,
                retry_in = ?delay,
                "all destinations unreachable"
            );
            if self.shutdown.is_triggered() || self.shutdown.wait_timeout(delay) {
                return false;
            }
        }
    }

    /// Best-effort close of the current connection; errors are swallowed
    pub fn close_socket(&mut self) {
        if let Some(mut connection) = self.current.take() {
            connection.link.mark_closed();
            let _ = connection.writer.flush();
            let _ = connection.socket.shutdown(Shutdown::Both);
            debug!(host = %connection.host, "connection closed");
            self.listeners.notify(|l| l.connection_closed(&connection.host));
        }
    }

    fn open(&self, index: usize) -> io::Result<Connection> {
        let host = &self.destinations[index];
        let mut last_error = None;

        for addr in host.resolve()? {
            match TcpStream::connect_timeout(&addr, self.settings.connect_timeout) {
                Ok(socket) => return self.establish(index, socket),
                Err(error) => {
                    debug!(%addr, %error, "address unreachable");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{} has no addresses", host))
        }))
    }

    fn establish(&self, index: usize, socket: TcpStream) -> io::Result<Connection> {
        let host = self.destinations[index].clone();
        socket.set_nodelay(true)?;
        socket.set_write_timeout(self.settings.write_timeout)?;

        let control = socket.try_clone()?;
        let link = Arc::new(LinkState::default());

        let (writer, reader) = match self.upgrade(&host, socket)? {
            Upgraded::Plain(socket) => {
                socket.set_read_timeout(None)?;
                let inbound = socket.try_clone()?;
                (SocketWriter::Plain(socket), ReaderInner::Plain(inbound))
            }
            #[cfg(feature = "tls")]
            Upgraded::Tls(stream) => {
                control.set_read_timeout(Some(TLS_READ_POLL_INTERVAL))?;
                let raw = control.try_clone()?;
                let stream = Arc::new(Mutex::new(stream));
                (
                    SocketWriter::Tls(Arc::clone(&stream)),
                    ReaderInner::Tls { stream, raw },
                )
            }
        };

        let expires_at = match self.settings.reattempt_primary_delay {
            Some(delay) if index != 0 => Some(Instant::now() + delay),
            _ => None,
        };

        Ok(Connection {
            host,
            index,
            established_at: Utc::now(),
            expires_at,
            writer: BufWriter::with_capacity(self.settings.write_buffer_size, writer),
            socket: control,
            reader: Some(SocketReader {
                inner: reader,
                link: Arc::clone(&link),
            }),
            link,
        })
    }

    #[cfg(feature = "tls")]
    fn upgrade(&self, host: &HostInfo, socket: TcpStream) -> io::Result<Upgraded> {
        match &self.tls {
            Some(tls) => tls
                .handshake(host, socket, self.settings.connect_timeout)
                .map(Upgraded::Tls),
            None => Ok(Upgraded::Plain(socket)),
        }
    }

    #[cfg(not(feature = "tls"))]
    fn upgrade(&self, _host: &HostInfo, socket: TcpStream) -> io::Result<Upgraded> {
        Ok(Upgraded::Plain(socket))
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close_socket();
    }
}

enum Upgraded {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(TlsStream),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn manager(destinations: Vec<HostInfo>, settings: ConnectionSettings) -> ConnectionManager {
        ConnectionManager::new(
            destinations,
            settings,
            ShutdownSignal::new(),
            Listeners::default(),
            Arc::new(DeliveryMetrics::new()),
        )
    }

    fn fast_settings() -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_millis(500),
            reconnection_delay: Duration::from_secs(30),
            ..Default::default()
        }
    }

    #[test]
    fn test_same_pass_failover_is_immediate() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let live = listener.local_addr().unwrap().port();

        let mut manager = manager(
            vec![HostInfo::new("127.0.0.1", closed_port()), HostInfo::new("127.0.0.1", live)],
            fast_settings(),
        );

        let start = Instant::now();
        assert!(manager.connect());
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(manager.current().map(Connection::index), Some(1));
        assert_eq!(manager.metrics.connect_failures(), 1);
    }

    #[test]
    fn test_secondary_connection_expires() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let live = listener.local_addr().unwrap().port();

        let mut manager = manager(
            vec![HostInfo::new("127.0.0.1", closed_port()), HostInfo::new("127.0.0.1", live)],
            ConnectionSettings {
                reattempt_primary_delay: Some(Duration::from_millis(50)),
                ..fast_settings()
            },
        );

        assert!(manager.connect());
        let now = Instant::now();
        assert!(!manager.should_close_connection(now));
        assert!(manager.should_close_connection(now + Duration::from_millis(100)));
    }

    #[test]
    fn test_primary_connection_never_expires() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let live = listener.local_addr().unwrap().port();

        let mut manager = manager(
            vec![HostInfo::new("127.0.0.1", live)],
            ConnectionSettings {
                reattempt_primary_delay: Some(Duration::from_millis(1)),
                ..fast_settings()
            },
        );

        assert!(manager.connect());
        assert!(!manager.should_close_connection(Instant::now() + Duration::from_secs(60)));
    }

    #[test]
    fn test_backoff_sleep_is_interrupted_by_shutdown() {
        let shutdown = ShutdownSignal::new();
        let mut manager = ConnectionManager::new(
            vec![HostInfo::new("127.0.0.1", closed_port())],
            fast_settings(),
            shutdown.clone(),
            Listeners::default(),
            Arc::new(DeliveryMetrics::new()),
        );

        let trigger = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            shutdown.trigger();
        });

        let start = Instant::now();
        assert!(!manager.connect());
        assert!(start.elapsed() < Duration::from_secs(10));
        trigger.join().unwrap();
    }

    #[test]
    fn test_close_socket_marks_link_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let live = listener.local_addr().unwrap().port();
        let mut manager = manager(vec![HostInfo::new("127.0.0.1", live)], fast_settings());

        assert!(manager.connect());
        let link = Arc::clone(manager.current().unwrap().link());
        manager.close_socket();

        assert!(link.is_closed());
        assert!(!manager.is_connected());
        manager.close_socket();
    }
}
