//! Binary frames of the windowed acknowledgement protocol
//!
//! All frames start with a protocol version byte and a frame type byte.
//! Integers are always four bytes, big-endian.
//!
//! ```text
//! window size  [ '2' ][ 'W' ][ window:u32 ]
//! ack          [ '2' ][ 'A' ][ sequence:u32 ]
//! payload      [ '2' ][ 'J' ][ sequence:u32 ][ length:u32 ][ payload ... ]
//! ```

use std::io::{self, Read, Write};

pub const PROTOCOL_VERSION: u8 = b'2';
pub const FRAME_WINDOW_SIZE: u8 = b'W';
pub const FRAME_ACK: u8 = b'A';
pub const FRAME_PAYLOAD: u8 = b'J';

/// Size of the window-size and ack frames
pub const CONTROL_FRAME_LEN: usize = 6;

/// A decoded fixed-size control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    WindowSize(u32),
    Ack(u32),
    /// A frame whose version or type byte was not recognised; it has been
    /// consumed from the stream and should be skipped
    Malformed { version: u8, frame_type: u8 },
}

impl ControlFrame {
    pub fn encode(&self) -> [u8; CONTROL_FRAME_LEN] {
        let (version, frame_type, value) = match *self {
            ControlFrame::WindowSize(size) => (PROTOCOL_VERSION, FRAME_WINDOW_SIZE, size),
            ControlFrame::Ack(sequence) => (PROTOCOL_VERSION, FRAME_ACK, sequence),
            ControlFrame::Malformed {
                version,
                frame_type,
            } => (version, frame_type, 0),
        };

        let mut frame = [0u8; CONTROL_FRAME_LEN];
        frame[0] = version;
        frame[1] = frame_type;
        frame[2..].copy_from_slice(&value.to_be_bytes());
        frame
    }
}

/// Write a window-size announcement
pub fn write_window_size(out: &mut dyn Write, window_size: u32) -> io::Result<()> {
    out.write_all(&ControlFrame::WindowSize(window_size).encode())
}

/// Write a payload frame
///
/// # Errors
///
/// Fails with `InvalidInput` if the payload is longer than `u32::MAX` bytes.
pub fn write_payload_frame(out: &mut dyn Write, sequence: u32, payload: &[u8]) -> io::Result<()> {
    let length = u32::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload of {} bytes exceeds frame limit", payload.len()),
        )
    })?;

    let mut header = [0u8; 10];
    header[0] = PROTOCOL_VERSION;
    header[1] = FRAME_PAYLOAD;
    header[2..6].copy_from_slice(&sequence.to_be_bytes());
    header[6..].copy_from_slice(&length.to_be_bytes());

    out.write_all(&header)?;
    out.write_all(payload)
}

/// Read the next control frame
///
/// Returns `Ok(None)` on a clean end of stream, i.e. when the peer closed the
/// connection between frames. An end of stream inside a frame is an
/// `UnexpectedEof` error. Frames with an unknown version or type are returned
/// as [`ControlFrame::Malformed`] rather than as errors so a long-lived
/// reader can skip them and keep going.
pub fn read_control_frame<R: Read + ?Sized>(input: &mut R) -> io::Result<Option<ControlFrame>> {
    let mut frame = [0u8; CONTROL_FRAME_LEN];

    loop {
        match input.read(&mut frame[..1]) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    input.read_exact(&mut frame[1..])?;

    let value = u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]);
    let decoded = match (frame[0], frame[1]) {
        (PROTOCOL_VERSION, FRAME_ACK) => ControlFrame::Ack(value),
        (PROTOCOL_VERSION, FRAME_WINDOW_SIZE) => ControlFrame::WindowSize(value),
        (version, frame_type) => ControlFrame::Malformed {
            version,
            frame_type,
        },
    };
    Ok(Some(decoded))
}

/// How encoded payloads are put on the wire
pub trait FrameCodec: Send {
    fn write_payload(&mut self, out: &mut dyn Write, payload: &[u8]) -> io::Result<()>;

    fn name(&self) -> &str;
}

/// Writes payloads as-is, relying on the encoder for delimiting
#[derive(Debug, Default, Clone, Copy)]
pub struct RawFrameCodec;

impl FrameCodec for RawFrameCodec {
    fn write_payload(&mut self, out: &mut dyn Write, payload: &[u8]) -> io::Result<()> {
        out.write_all(payload)
    }

    fn name(&self) -> &str {
        "raw"
    }
}

/// Wraps every payload in a `J` frame with a sequence number
///
/// Sequence numbers start at 1 and wrap modulo 2^32. The counter belongs to
/// the codec instance and is not reset on reconnect.
#[derive(Debug, Default)]
pub struct LumberjackFrameCodec {
    sequence: u32,
}

impl LumberjackFrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the most recently written frame
    pub fn last_sequence(&self) -> u32 {
        self.sequence
    }
}

impl FrameCodec for LumberjackFrameCodec {
    fn write_payload(&mut self, out: &mut dyn Write, payload: &[u8]) -> io::Result<()> {
        let sequence = self.sequence.wrapping_add(1);
        write_payload_frame(out, sequence, payload)?;
        self.sequence = sequence;
        Ok(())
    }

    fn name(&self) -> &str {
        "lumberjack"
    }
}
