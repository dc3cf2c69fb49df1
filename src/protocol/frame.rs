//! Frame struct and MUP1 frame encode/decode.
//!
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use mup1_client::protocol::{Frame, FrameType};
//!
//! let frame = Frame::ping_request();
//! assert_eq!(frame.encode(), b">p<<8553");
//!
//! let decoded = Frame::decode(b">p<<8553").unwrap();
//! assert_eq!(decoded.frame_type, FrameType::PingRequest);
//! assert!(decoded.payload().is_empty());
//! ```

use bytes::Bytes;

use super::wire_format::{
    checksum, escape_into, find_end_marker, format_checksum, parse_checksum, unescape,
    FrameError, IntegrityFault, Marker, CHECKSUM_LEN, EOF, ESC, MIN_FRAME_SIZE, SOF,
};

/// Frame type tag.
///
/// Host-originated frames use lowercase tags, device-originated frames
/// uppercase ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// `A`: unsolicited device announcement.
    Announce,
    /// `c`: CoAP message sent by the host.
    CoapRequest,
    /// `C`: CoAP message sent by the device.
    CoapResponse,
    /// `p`: keepalive probe sent by the host.
    PingRequest,
    /// `P`: keepalive answer sent by the device.
    PingResponse,
    /// `T`: firmware trace output.
    Trace,
    /// Any other tag.
    Unknown(u8),
}

impl FrameType {
    /// Map a wire tag to a frame type.
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            b'A' => FrameType::Announce,
            b'c' => FrameType::CoapRequest,
            b'C' => FrameType::CoapResponse,
            b'p' => FrameType::PingRequest,
            b'P' => FrameType::PingResponse,
            b'T' => FrameType::Trace,
            other => FrameType::Unknown(other),
        }
    }

    /// Wire tag for this frame type.
    pub fn tag(self) -> u8 {
        match self {
            FrameType::Announce => b'A',
            FrameType::CoapRequest => b'c',
            FrameType::CoapResponse => b'C',
            FrameType::PingRequest => b'p',
            FrameType::PingResponse => b'P',
            FrameType::Trace => b'T',
            FrameType::Unknown(tag) => tag,
        }
    }

    /// True for frames that carry an embedded CoAP message.
    #[inline]
    pub fn is_coap(self) -> bool {
        matches!(self, FrameType::CoapRequest | FrameType::CoapResponse)
    }
}

/// A complete MUP1 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Type tag.
    pub frame_type: FrameType,
    /// Unescaped payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    /// Host-to-device frame carrying an encoded CoAP message.
    pub fn coap(message: impl Into<Bytes>) -> Self {
        Self::new(FrameType::CoapRequest, message.into())
    }

    /// Host-to-device ping.
    pub fn ping_request() -> Self {
        Self::new(FrameType::PingRequest, Bytes::new())
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get a clone of the payload as Bytes (cheap, zero-copy).
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    /// Encode this frame for the wire.
    pub fn encode(&self) -> Vec<u8> {
        encode_frame(self.frame_type.tag(), &self.payload)
    }

    /// Decode exactly one frame from the start of `bytes`.
    ///
    /// Trailing bytes after the checksum are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        if bytes.len() < MIN_FRAME_SIZE {
            return Err(FrameError::Incomplete {
                needed: MIN_FRAME_SIZE - bytes.len(),
            });
        }
        if bytes[0] != SOF {
            return Err(FrameError::Checksum(IntegrityFault::MissingStart));
        }

        let (end_marker, len) = match scan(bytes, 0) {
            Scan::Complete { end_marker, len } => (end_marker, len),
            Scan::Partial { needed, .. } => {
                return Err(swallowed_end_marker(bytes).unwrap_or(FrameError::Incomplete { needed }))
            }
            Scan::Restart(_) => return Err(FrameError::Checksum(IntegrityFault::UnexpectedStart)),
        };

        let tag = bytes[1];
        if matches!(tag, SOF | EOF | ESC) {
            return Err(FrameError::Checksum(IntegrityFault::InvalidType(tag)));
        }

        let digits_at = len - CHECKSUM_LEN;
        let received = parse_checksum(&bytes[digits_at..len])
            .ok_or(FrameError::Checksum(IntegrityFault::NotHex))?;
        let computed = checksum(&bytes[..digits_at]);
        if received != computed {
            return Err(FrameError::Checksum(IntegrityFault::Mismatch {
                received,
                computed,
            }));
        }

        let payload = unescape(&bytes[2..end_marker])?;
        Ok(Frame::new(FrameType::from_tag(tag), Bytes::from(payload)))
    }
}

/// Detect a whole frame whose end marker was taken as the second byte of an
/// escape pair, as happens when corruption turns the last payload byte into
/// the escape byte.
fn swallowed_end_marker(bytes: &[u8]) -> Option<FrameError> {
    let digits_at = bytes.len().checked_sub(CHECKSUM_LEN)?;
    if digits_at < 3 || bytes[digits_at - 1] != EOF || bytes[digits_at - 2] != ESC {
        return None;
    }
    let received = parse_checksum(&bytes[digits_at..])?;
    let computed = checksum(&bytes[..digits_at]);
    let fault = if received == computed {
        IntegrityFault::BadEscape(EOF)
    } else {
        IntegrityFault::Mismatch { received, computed }
    };
    Some(FrameError::Checksum(fault))
}

/// Encode a frame from its tag and raw payload.
pub fn encode_frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + payload.len() / 8 + 4 + CHECKSUM_LEN);
    buf.push(SOF);
    buf.push(tag);
    escape_into(payload, &mut buf);
    buf.push(EOF);
    if buf.len() % 2 == 1 {
        buf.push(EOF);
    }
    let sum = checksum(&buf);
    buf.extend_from_slice(format_checksum(sum).as_bytes());
    buf
}

/// Result of scanning a buffer that starts with a start marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scan {
    /// Whole frame present: position of the first end marker and total length.
    Complete { end_marker: usize, len: usize },
    /// More bytes are required. A later scan can start at `resume`.
    Partial { needed: usize, resume: usize },
    /// An unescaped start marker was found at this position before any end marker.
    Restart(usize),
}

/// Locate the extent of the frame starting at `buf[0]`, searching for its end
/// marker from `from` on.
pub(crate) fn scan(buf: &[u8], from: usize) -> Scan {
    debug_assert_eq!(buf.first(), Some(&SOF));

    let end_marker = match find_end_marker(buf, from.max(2).min(buf.len())) {
        Marker::End(pos) => pos,
        Marker::NotFound { resume } => {
            return Scan::Partial {
                needed: (MIN_FRAME_SIZE.saturating_sub(buf.len())).max(1 + CHECKSUM_LEN),
                resume,
            }
        }
        Marker::Start(pos) => return Scan::Restart(pos),
    };
    let after = end_marker + 1;
    let Some(&next) = buf.get(after) else {
        return Scan::Partial {
            needed: CHECKSUM_LEN,
            resume: end_marker,
        };
    };

    let checksum_at = if next == EOF { after + 1 } else { after };
    let len = checksum_at + CHECKSUM_LEN;
    if buf.len() < len {
        return Scan::Partial {
            needed: len - buf.len(),
            resume: end_marker,
        };
    }

    Scan::Complete { end_marker, len }
}
