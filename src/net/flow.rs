//! Windowed flow control
//!
//! With the acknowledgement protocol enabled, at most `window_size` payload
//! frames may be in flight. The worker calls [`FlowController::acquire`]
//! before encoding each event and blocks there once the window is full,
//! until the [`AckReader`] hands it an acknowledgement. This is the only
//! place in the pipeline that is allowed to block on the remote side.
//!
//! Acknowledgements are counted, not matched: each one frees one slot of the
//! window. The sequence number is only kept for diagnostics. Every ack
//! carries the link it was read from, and acks from any other link than the
//! current one are discarded.

use super::codec::{read_control_frame, write_window_size, ControlFrame};
use super::connection::{LinkState, SocketReader};
use super::host::HostInfo;
use crate::core::{DeliveryMetrics, Listeners, ShutdownSignal};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Default number of unacknowledged frames
pub const DEFAULT_WINDOW_SIZE: u32 = 10;

/// Capacity of the queue between the reader and the worker
pub const ACK_QUEUE_CAPACITY: usize = 10;

/// How often a blocked waiter re-checks shutdown and link health
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Gate between encoded events and the wire
pub trait FlowController: Send {
    /// Called on every new connection, before the first event is written
    fn on_connect(&mut self, out: &mut dyn Write) -> io::Result<()>;

    /// Wait until one more frame may be sent
    ///
    /// Frames still buffered in `out` are flushed before waiting, since the
    /// peer can only acknowledge what it received. Fails when shutdown is
    /// signalled or the link breaks while waiting, so the caller can
    /// reconnect or give up.
    fn acquire(
        &mut self,
        link: &LinkState,
        out: &mut dyn Write,
        shutdown: &ShutdownSignal,
    ) -> io::Result<()>;

    /// Account for a frame that was written
    fn record_sent(&mut self);

    fn name(&self) -> &str;
}

/// No flow control: every frame may be sent immediately
#[derive(Debug, Default, Clone, Copy)]
pub struct Unbounded;

impl FlowController for Unbounded {
    fn on_connect(&mut self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    fn acquire(
        &mut self,
        _link: &LinkState,
        _out: &mut dyn Write,
        _shutdown: &ShutdownSignal,
    ) -> io::Result<()> {
        Ok(())
    }

    fn record_sent(&mut self) {}

    fn name(&self) -> &str {
        "unbounded"
    }
}

/// One acknowledgement, tagged with the connection it arrived on
#[derive(Debug, Clone)]
pub struct Ack {
    link: Arc<LinkState>,
    sequence: u32,
}

impl Ack {
    pub fn new(link: Arc<LinkState>, sequence: u32) -> Self {
        Self { link, sequence }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// True when the ack was read from `link`
    pub fn is_for(&self, link: &LinkState) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.link), link)
    }
}

/// Create the controller and the sending side used by the reader
pub fn ack_window(window_size: u32) -> (AckFlowController, Sender<Ack>) {
    let (sender, receiver) = crossbeam_channel::bounded(ACK_QUEUE_CAPACITY);
    (
        AckFlowController {
            window_size: window_size.max(1),
            outstanding: 0,
            acks: receiver,
        },
        sender,
    )
}

pub struct AckFlowController {
    window_size: u32,
    outstanding: u32,
    acks: Receiver<Ack>,
}

impl AckFlowController {
    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    /// Frames sent and not yet acknowledged
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    fn record_ack(&mut self, ack: Ack, link: &LinkState) {
        if !ack.is_for(link) {
            debug!(
                sequence = ack.sequence,
                "discarded acknowledgement from previous connection"
            );
            return;
        }
        self.outstanding = self.outstanding.saturating_sub(1);
        trace!(
            sequence = ack.sequence,
            outstanding = self.outstanding,
            "acknowledgement consumed"
        );
    }
}

impl FlowController for AckFlowController {
    fn on_connect(&mut self, out: &mut dyn Write) -> io::Result<()> {
        self.outstanding = 0;
        let stale = self.acks.try_iter().count();
        if stale > 0 {
            debug!(stale, "discarded acknowledgements from previous connection");
        }

        write_window_size(out, self.window_size)?;
        out.flush()
    }

    fn acquire(
        &mut self,
        link: &LinkState,
        out: &mut dyn Write,
        shutdown: &ShutdownSignal,
    ) -> io::Result<()> {
        while let Ok(ack) = self.acks.try_recv() {
            self.record_ack(ack, link);
        }

        if self.outstanding >= self.window_size {
            out.flush()?;
        }

        while self.outstanding >= self.window_size {
            if shutdown.is_triggered() {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "shutdown while waiting for acknowledgement",
                ));
            }
            if link.is_broken() {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection lost while waiting for acknowledgement",
                ));
            }

            match self.acks.recv_timeout(POLL_INTERVAL) {
                Ok(ack) => self.record_ack(ack, link),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "acknowledgement reader stopped",
                    ))
                }
            }
        }

        Ok(())
    }

    fn record_sent(&mut self) {
        self.outstanding += 1;
    }

    fn name(&self) -> &str {
        "ack_window"
    }
}

/// Inbound half of a freshly opened connection, passed to the reader
pub struct ReaderHandoff {
    pub host: HostInfo,
    pub reader: SocketReader,
}

/// Background task that reads acknowledgement frames
///
/// It receives one [`ReaderHandoff`] per connection over a channel and reads
/// from it until the connection is closed, the peer goes away or the
/// stream fails. On failure it marks the link broken and calls `nudge` so
/// the worker wakes up and notices.
pub struct AckReader {
    handoffs: Receiver<ReaderHandoff>,
    acks: Sender<Ack>,
    nudge: Box<dyn Fn() -> bool + Send>,
    shutdown: ShutdownSignal,
    listeners: Listeners,
    metrics: Arc<DeliveryMetrics>,
}

impl AckReader {
    pub fn new(
        handoffs: Receiver<ReaderHandoff>,
        acks: Sender<Ack>,
        nudge: Box<dyn Fn() -> bool + Send>,
        shutdown: ShutdownSignal,
        listeners: Listeners,
        metrics: Arc<DeliveryMetrics>,
    ) -> Self {
        Self {
            handoffs,
            acks,
            nudge,
            shutdown,
            listeners,
            metrics,
        }
    }

    pub fn run(self) {
        loop {
            match self.handoffs.recv_timeout(POLL_INTERVAL) {
                Ok(handoff) => self.read_connection(handoff),
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.is_triggered() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("acknowledgement reader stopped");
    }

    fn read_connection(&self, handoff: ReaderHandoff) {
        let ReaderHandoff { host, mut reader } = handoff;
        let link = Arc::clone(reader.link());

        loop {
            if link.is_closed() || self.shutdown.is_triggered() {
                return;
            }

            match read_control_frame(&mut reader) {
                Ok(Some(ControlFrame::Ack(sequence))) => {
                    self.metrics.record_ack();
                    self.listeners.notify(|l| l.ack_received(sequence));
                    self.deposit(Ack::new(Arc::clone(&link), sequence), &link);
                }
                Ok(Some(frame)) => {
                    let reason = format!("unexpected frame {:?}", frame);
                    warn!(host = %host, %reason, "skipping frame from peer");
                    self.listeners.notify(|l| l.malformed_frame(&reason));
                }
                Ok(None) => {
                    if !link.is_closed() {
                        debug!(host = %host, "peer closed the connection");
                        self.report_broken(&link);
                    }
                    return;
                }
                Err(error) => {
                    if !link.is_closed() {
                        warn!(host = %host, %error, "reading acknowledgements failed");
                        self.report_broken(&link);
                    }
                    return;
                }
            }
        }
    }

    fn deposit(&self, ack: Ack, link: &LinkState) {
        let mut pending = ack;
        loop {
            match self.acks.send_timeout(pending, POLL_INTERVAL) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(back)) => {
                    if link.is_closed() || self.shutdown.is_triggered() {
                        return;
                    }
                    pending = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }

    fn report_broken(&self, link: &LinkState) {
        link.mark_broken();
        if !(self.nudge)() {
            debug!("ring buffer full, worker will notice the broken link on its next write");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    /// Writer that only records how often it was flushed
    #[derive(Default)]
    struct FlushCounter {
        flushes: usize,
    }

    impl Write for FlushCounter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    #[test]
    fn test_on_connect_announces_window_and_resets() {
        let (mut flow, acks) = ack_window(3);
        let link = Arc::new(LinkState::default());
        flow.record_sent();
        flow.record_sent();
        acks.send(Ack::new(Arc::clone(&link), 1)).unwrap();

        let mut out = Vec::new();
        flow.on_connect(&mut out).unwrap();

        assert_eq!(out, vec![b'2', b'W', 0, 0, 0, 3]);
        assert_eq!(flow.outstanding(), 0);
        assert!(acks.is_empty());
    }

    #[test]
    fn test_acquire_does_not_block_below_window() {
        let (mut flow, _acks) = ack_window(2);
        let link = LinkState::default();
        let shutdown = ShutdownSignal::new();
        let mut out = FlushCounter::default();

        flow.acquire(&link, &mut out, &shutdown).unwrap();
        flow.record_sent();
        flow.acquire(&link, &mut out, &shutdown).unwrap();
        flow.record_sent();
        assert_eq!(flow.outstanding(), 2);
        assert_eq!(out.flushes, 0);
    }

    #[test]
    fn test_full_window_blocks_until_ack() {
        let (mut flow, acks) = ack_window(2);
        let link = Arc::new(LinkState::default());
        let shutdown = ShutdownSignal::new();
        flow.record_sent();
        flow.record_sent();

        let ack_link = Arc::clone(&link);
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            acks.send(Ack::new(ack_link, 1)).unwrap();
            acks
        });

        let start = Instant::now();
        flow.acquire(&link, &mut FlushCounter::default(), &shutdown).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(flow.outstanding(), 1);
        drop(sender.join().unwrap());
    }

    #[test]
    fn test_full_window_flushes_before_waiting() {
        let (mut flow, _acks) = ack_window(1);
        let shutdown = ShutdownSignal::new();
        let mut out = FlushCounter::default();
        flow.record_sent();
        shutdown.trigger();

        let err = flow.acquire(&LinkState::default(), &mut out, &shutdown).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert_eq!(out.flushes, 1);
    }

    #[test]
    fn test_acks_from_previous_connection_are_ignored() {
        let (mut flow, acks) = ack_window(1);
        let old_link = Arc::new(LinkState::default());
        let new_link = Arc::new(LinkState::default());
        flow.on_connect(&mut Vec::new()).unwrap();
        flow.record_sent();

        // Arrives after the reconnect drained the queue.
        acks.send(Ack::new(Arc::clone(&old_link), 7)).unwrap();
        new_link.mark_broken();

        let err = flow
            .acquire(&new_link, &mut FlushCounter::default(), &ShutdownSignal::new())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(flow.outstanding(), 1);

        acks.send(Ack::new(Arc::clone(&new_link), 8)).unwrap();
        let healthy = Arc::new(LinkState::default());
        acks.send(Ack::new(Arc::clone(&healthy), 9)).unwrap();
        flow.acquire(&healthy, &mut FlushCounter::default(), &ShutdownSignal::new())
            .unwrap();
        assert_eq!(flow.outstanding(), 0);
    }

    #[test]
    fn test_full_window_aborts_on_broken_link() {
        let (mut flow, _acks) = ack_window(1);
        let link = LinkState::default();
        flow.record_sent();
        link.mark_broken();

        let err = flow
            .acquire(&link, &mut FlushCounter::default(), &ShutdownSignal::new())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn test_full_window_aborts_on_shutdown() {
        let (mut flow, _acks) = ack_window(1);
        let shutdown = ShutdownSignal::new();
        flow.record_sent();
        shutdown.trigger();

        let err = flow
            .acquire(&LinkState::default(), &mut FlushCounter::default(), &shutdown)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn test_unbounded_never_blocks() {
        let mut flow = Unbounded;
        let link = LinkState::default();
        let shutdown = ShutdownSignal::new();
        let mut out = FlushCounter::default();
        for _ in 0..1000 {
            flow.acquire(&link, &mut out, &shutdown).unwrap();
            flow.record_sent();
        }
        assert_eq!(out.flushes, 0);
    }
}
