//! Codec for encoding and decoding Herald frames.
//!
//! Frames use the `text/event-stream` line format:
//!
//! ```text
//! id: ping
//! data: {"hello":"world"}
//!
//! ```
//!
//! Each line is `field: value`, lines starting with `:` are comments and a
//! blank line ends the frame. Decoding accepts LF and CRLF line endings.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum encoded frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode a frame.
    #[error("Incomplete frame")]
    Incomplete,

    /// Frame bytes are not valid UTF-8.
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if the frame is too large or a single-line field
/// contains a line break.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// On error the buffer is left as it was.
///
/// # Errors
///
/// Returns an error if the frame is too large or a single-line field
/// contains a line break.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let start = buf.len();

    match frame {
        Frame::Message { id, event, data } => {
            if let Some(id) = id {
                put_field(buf, "id", single_line("id", id)?);
            }
            if let Some(event) = event {
                put_field(buf, "event", single_line("event", event)?);
            }
            for line in lines(data) {
                put_field(buf, "data", line);
            }
        }
        Frame::Comment(text) => {
            for line in lines(text) {
                buf.put_u8(b':');
                if !line.is_empty() {
                    buf.put_u8(b' ');
                    buf.put_slice(line.as_bytes());
                }
                buf.put_u8(b'\n');
            }
        }
    }
    buf.put_u8(b'\n');

    let size = buf.len() - start;
    if size > MAX_FRAME_SIZE {
        buf.truncate(start);
        return Err(ProtocolError::FrameTooLarge(size));
    }

    Ok(())
}

/// Decode a single complete frame.
///
/// # Errors
///
/// Returns [`ProtocolError::Incomplete`] if `data` holds no terminated
/// frame, or another error if the frame is invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let mut buf = BytesMut::from(data);
    decode_from(&mut buf)?.ok_or(ProtocolError::Incomplete)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
/// Stray blank lines between frames are skipped.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    loop {
        let Some((body_len, frame_len)) = find_frame(buf) else {
            if buf.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(buf.len()));
            }
            return Ok(None);
        };

        if frame_len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(frame_len));
        }

        let raw = buf.split_to(frame_len);
        if let Some(frame) = parse_frame(&raw[..body_len])? {
            return Ok(Some(frame));
        }
    }
}

fn put_field(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_u8(b'\n');
}

fn single_line<'a>(name: &str, value: &'a str) -> Result<&'a str, ProtocolError> {
    if value.contains(['\n', '\r']) {
        return Err(ProtocolError::Invalid(format!(
            "line break in {name} field"
        )));
    }
    Ok(value)
}

/// Split on any of `\r\n`, `\n` or a lone `\r`, the line ends readers accept.
fn lines(text: &str) -> impl Iterator<Item = &str> {
    text.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .flat_map(|line| line.split('\r'))
}

/// Locate the first blank line.
///
/// Returns the length of the frame body and the number of bytes to consume,
/// including the blank line itself.
fn find_frame(buf: &[u8]) -> Option<(usize, usize)> {
    let mut line_start = 0;
    while let Some(offset) = buf[line_start..].iter().position(|&b| b == b'\n') {
        let line_end = line_start + offset;
        let line = &buf[line_start..line_end];
        if line.strip_suffix(b"\r").unwrap_or(line).is_empty() {
            return Some((line_start, line_end + 1));
        }
        line_start = line_end + 1;
    }
    None
}

/// Parse the lines of one frame. Returns `None` for an empty body.
fn parse_frame(body: &[u8]) -> Result<Option<Frame>, ProtocolError> {
    let text = std::str::from_utf8(body).map_err(|_| ProtocolError::InvalidUtf8)?;

    let mut id = None;
    let mut event = None;
    let mut data: Option<String> = None;
    let mut comments = Vec::new();

    for line in lines(text).filter(|line| !line.is_empty()) {
        if let Some(comment) = line.strip_prefix(':') {
            comments.push(comment.strip_prefix(' ').unwrap_or(comment));
            continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "id" => id = Some(value.to_string()),
            "event" => event = Some(value.to_string()),
            "data" => match &mut data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            // `retry` and unknown fields carry nothing for us.
            _ => {}
        }
    }

    if id.is_none() && event.is_none() && data.is_none() {
        if comments.is_empty() {
            return Ok(None);
        }
        return Ok(Some(Frame::Comment(comments.join("\n"))));
    }

    Ok(Some(Frame::Message {
        id,
        event,
        data: data.unwrap_or_default(),
    }))
}
