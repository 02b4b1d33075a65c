//! Wire framing for the USB bulk transport.
//!
//! Outbound (host -> device) messages are length-prefixed: a big-endian
//! u16 byte count followed by the JSON body. Inbound (device -> host)
//! commands are a bare, self-synchronizing stream of concatenated JSON
//! values with no length prefix - the decoder resynchronizes on whatever
//! whole values it can find in the buffer so far.

use serde_json::Deserializer;

use crate::error::WireError;
use crate::model::{Command, OutboundMessage};

/// Largest JSON body `build_frame` will encode. Oversized messages are
/// dropped by the caller rather than truncated or split.
pub const MAX_BODY_LEN: usize = 32767;

/// A framed outbound write: the two-byte length header and the body,
/// ready to be written to the bulk OUT endpoint as two separate writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: [u8; 2],
    pub body: Vec<u8>,
}

/// Encode `message` into a `Frame`. Returns `Err` if the body would not fit
/// in the u16 length prefix (the caller should drop the message and move
/// on, not treat this as fatal).
pub fn build_frame(message: &OutboundMessage) -> Result<Frame, WireError> {
    let body = if matches!(message, OutboundMessage::Empty) {
        b"{}".to_vec()
    } else {
        serde_json::to_vec(message).map_err(WireError::Encode)?
    };
    if body.len() > MAX_BODY_LEN {
        return Err(WireError::Encode(serde_json::Error::io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("body of {} bytes exceeds {MAX_BODY_LEN}", body.len()),
        ))));
    }
    let header = (body.len() as u16).to_be_bytes();
    Ok(Frame { header, body })
}

/// Incrementally decodes a stream of concatenated JSON `Command` values
/// read off the bulk IN endpoint. Feed raw bytes in with `push`, then
/// drain as many complete commands as are currently available with
/// `next_command`.
#[derive(Debug, Default)]
pub struct CommandDecoder {
    buf: Vec<u8>,
}

impl CommandDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly-read bytes to the internal buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to pull one complete `Command` out of the buffer. Returns
    /// `Ok(None)` when the buffer holds only a partial value (more bytes
    /// are needed); returns `Err` when the buffered bytes are not a valid
    /// JSON prefix at all, which the caller should treat as a fatal
    /// framing loss.
    pub fn next_command(&mut self) -> Result<Option<Command>, WireError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let mut stream = Deserializer::from_slice(&self.buf).into_iter::<Command>();
        match stream.next() {
            Some(Ok(command)) => {
                let consumed = stream.byte_offset();
                self.buf.drain(..consumed);
                Ok(Some(command))
            }
            Some(Err(err)) => {
                if err.is_eof() {
                    Ok(None)
                } else {
                    Err(WireError::Decode(err))
                }
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Country, Hotspot};

    #[test]
    fn frame_header_matches_body_length() {
        let msg = OutboundMessage::Scan { hotspots: vec![] };
        let frame = build_frame(&msg).unwrap();
        assert_eq!(u16::from_be_bytes(frame.header) as usize, frame.body.len());
    }

    #[test]
    fn oversized_body_is_rejected() {
        let countries = (0..5000)
            .map(|i| Country {
                code: format!("C{i}"),
                name: "x".repeat(20),
            })
            .collect();
        let msg = OutboundMessage::Choices { countries };
        assert!(build_frame(&msg).is_err());
    }

    #[test]
    fn decoder_resyncs_on_concatenated_stream() {
        let mut decoder = CommandDecoder::new();
        decoder.push(br#"{"action":"monitor","args":[]}{"action":"sca"#);
        assert_eq!(decoder.next_command().unwrap().unwrap().action, "monitor");
        assert!(decoder.next_command().unwrap().is_none());

        decoder.push(br#"n","args":["wlan0"]}"#);
        let second = decoder.next_command().unwrap().unwrap();
        assert_eq!(second.action, "scan");
        assert_eq!(second.args, vec!["wlan0".to_string()]);
        assert!(decoder.next_command().unwrap().is_none());
    }

    #[test]
    fn decoder_handles_whitespace_between_values() {
        let mut decoder = CommandDecoder::new();
        decoder.push(b"{\"action\":\"halt\",\"args\":[]}   \n  {\"action\":\"reboot\",\"args\":[]}");
        assert_eq!(decoder.next_command().unwrap().unwrap().action, "halt");
        assert_eq!(decoder.next_command().unwrap().unwrap().action, "reboot");
        assert!(decoder.next_command().unwrap().is_none());
    }

    #[test]
    fn malformed_prefix_is_fatal() {
        let mut decoder = CommandDecoder::new();
        decoder.push(b"not json at all");
        assert!(decoder.next_command().is_err());
    }

    #[test]
    fn empty_message_serializes_as_bare_object() {
        let frame = build_frame(&OutboundMessage::Empty).unwrap();
        assert_eq!(frame.body, b"{}");
    }

    #[test]
    fn hotspot_round_trips_through_json() {
        let msg = OutboundMessage::Scan {
            hotspots: vec![Hotspot {
                ssid: "home".to_string(),
                open: false,
                signal: -42,
            }],
        };
        let frame = build_frame(&msg).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&frame.body).unwrap();
        assert_eq!(value["type"], "scan");
        assert_eq!(value["hotspots"][0]["ssid"], "home");
    }
}
