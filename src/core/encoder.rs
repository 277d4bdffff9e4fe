//! Encoder collaborator
//!
//! The delivery engine never looks inside an event. An [`Encoder`] turns
//! each event into the exact bytes that go on the wire, and may write a
//! header when a connection opens and a footer when it closes.

use super::error::{DeliveryError, Result};
use serde::Serialize;
use std::io::{self, Write};
use std::marker::PhantomData;

pub trait Encoder<E>: Send {
    /// Called once per new connection, before any event is written
    fn init(&mut self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    /// Encode a single event into its wire representation
    fn encode(&mut self, event: &E) -> Result<Vec<u8>>;

    /// Called when a connection is closed gracefully
    fn close(&mut self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    fn name(&self) -> &str;
}

/// Parse a line separator name or literal
///
/// `SYSTEM` is the platform line ending, `UNIX` is `\n`, `WINDOWS` is
/// `\r\n` (all case-insensitive). Anything else is taken literally, with
/// the escapes `\n`, `\r` and `\t` expanded.
pub fn parse_separator(value: &str) -> Vec<u8> {
    match value.to_ascii_uppercase().as_str() {
        "SYSTEM" => {
            if cfg!(windows) {
                b"\r\n".to_vec()
            } else {
                b"\n".to_vec()
            }
        }
        "UNIX" => b"\n".to_vec(),
        "WINDOWS" => b"\r\n".to_vec(),
        _ => value
            .replace("\\n", "\n")
            .replace("\\r", "\r")
            .replace("\\t", "\t")
            .into_bytes(),
    }
}

/// Writes byte-like events verbatim, each followed by a separator
///
/// # Example
///
/// ```
/// use logstash_delivery::{Encoder, LineEncoder};
///
/// let mut encoder = LineEncoder::new();
/// let bytes = Encoder::<String>::encode(&mut encoder, &"hello".to_string()).unwrap();
/// assert_eq!(bytes, b"hello\n");
/// ```
#[derive(Debug, Clone)]
pub struct LineEncoder {
    separator: Vec<u8>,
}

impl LineEncoder {
    pub fn new() -> Self {
        Self {
            separator: b"\n".to_vec(),
        }
    }

    /// Use a custom separator, see [`parse_separator`]
    #[must_use]
    pub fn with_separator(mut self, value: &str) -> Self {
        self.separator = parse_separator(value);
        self
    }
}

impl Default for LineEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: AsRef<[u8]>> Encoder<E> for LineEncoder {
    fn encode(&mut self, event: &E) -> Result<Vec<u8>> {
        let body = event.as_ref();
        let mut out = Vec::with_capacity(body.len() + self.separator.len());
        out.extend_from_slice(body);
        out.extend_from_slice(&self.separator);
        Ok(out)
    }

    fn name(&self) -> &str {
        "line"
    }
}

/// Serializes events as one JSON document per line (JSONL)
///
/// This is the framing the Logstash `json_lines` codec expects.
pub struct JsonLinesEncoder<E> {
    pretty: bool,
    _event: PhantomData<fn(&E)>,
}

impl<E> JsonLinesEncoder<E> {
    pub fn new() -> Self {
        Self {
            pretty: false,
            _event: PhantomData,
        }
    }

    /// Pretty-print each document; only useful for debugging collectors that
    /// accept multi-line JSON
    #[must_use]
    pub fn pretty(mut self) -> Self {
        self.pretty = true;
        self
    }
}

impl<E> Default for JsonLinesEncoder<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Serialize> Encoder<E> for JsonLinesEncoder<E> {
    fn encode(&mut self, event: &E) -> Result<Vec<u8>> {
        let mut out = if self.pretty {
            serde_json::to_vec_pretty(event)
        } else {
            serde_json::to_vec(event)
        }
        .map_err(|e| DeliveryError::encoder("json_lines", e.to_string()))?;
        out.push(b'\n');
        Ok(out)
    }

    fn name(&self) -> &str {
        "json_lines"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_separator_named_values() {
        assert_eq!(parse_separator("UNIX"), b"\n");
        assert_eq!(parse_separator("windows"), b"\r\n");
        assert_eq!(parse_separator("\\r\\n"), b"\r\n");
        assert_eq!(parse_separator("PING"), b"PING");
    }

    #[test]
    fn test_line_encoder() {
        let mut encoder = LineEncoder::new().with_separator("WINDOWS");
        let bytes = Encoder::<&str>::encode(&mut encoder, &"user logged in").unwrap();
        assert_eq!(bytes, b"user logged in\r\n");
    }

    #[derive(Serialize)]
    struct Event {
        message: String,
        fields: BTreeMap<String, i64>,
    }

    #[test]
    fn test_json_lines_encoder() -> Result<()> {
        let mut encoder = JsonLinesEncoder::new();
        let mut fields = BTreeMap::new();
        fields.insert("user_id".to_string(), 123);

        let bytes = encoder.encode(&Event {
            message: "User logged in".to_string(),
            fields,
        })?;

        assert_eq!(bytes.last(), Some(&b'\n'));
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["message"], "User logged in");
        assert_eq!(parsed["fields"]["user_id"], 123);
        Ok(())
    }

    #[test]
    fn test_json_lines_encoder_rejects_non_string_keys() {
        let mut encoder = JsonLinesEncoder::new();
        let mut map = BTreeMap::new();
        map.insert(vec![1u8], 1);

        let err = encoder.encode(&map).unwrap_err();
        assert!(matches!(err, DeliveryError::EncoderError { .. }));
    }
}
