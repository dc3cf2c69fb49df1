//! MUP1 wire format: markers, escaping and checksum.
//!
//! ```text
//! ┌─────┬──────┬───────────────────┬─────┬───────┬──────────┐
//! │ '>' │ TYPE │ escaped payload   │ '<' │ ['<'] │ HHHH     │
//! │ SOF │ 1 B  │ N bytes           │ EOF │ pad   │ checksum │
//! └─────┴──────┴───────────────────┴─────┴───────┴──────────┘
//! ```
//!
//! The end marker is doubled whenever `SOF..=EOF` has an odd length, so the
//! checksummed region is always a whole number of 16-bit words. The checksum
//! is the one's complement of the one's-complement sum of that region read as
//! big-endian words, written as four hex digits.

use thiserror::Error;

/// Start-of-frame marker.
pub const SOF: u8 = b'>';

/// End-of-frame marker.
pub const EOF: u8 = b'<';

/// Escape byte.
pub const ESC: u8 = b'\\';

/// Number of ASCII hex digits carrying the checksum.
pub const CHECKSUM_LEN: usize = 4;

/// Smallest possible frame: SOF + type + EOF + checksum.
pub const MIN_FRAME_SIZE: usize = 3 + CHECKSUM_LEN;

/// Default upper bound on the wire size of one frame (64 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Why a frame failed its integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityFault {
    /// Checksum digits parsed but disagree with the computed value.
    Mismatch {
        /// Checksum carried by the frame.
        received: u16,
        /// Checksum computed over the received bytes.
        computed: u16,
    },
    /// Checksum digits are not hexadecimal.
    NotHex,
    /// Escape byte followed by a byte that is not a valid escape code.
    BadEscape(u8),
    /// Unescaped start marker inside the frame body.
    UnexpectedStart,
    /// Frame does not begin with a start marker.
    MissingStart,
    /// Type tag is a marker or escape byte.
    InvalidType(u8),
}

impl std::fmt::Display for IntegrityFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityFault::Mismatch { received, computed } => write!(
                f,
                "checksum mismatch (received {:04x}, computed {:04x})",
                received, computed
            ),
            IntegrityFault::NotHex => write!(f, "checksum is not hexadecimal"),
            IntegrityFault::BadEscape(b) => write!(f, "invalid escape sequence \\{:#04x}", b),
            IntegrityFault::UnexpectedStart => write!(f, "start marker inside frame"),
            IntegrityFault::MissingStart => write!(f, "missing start marker"),
            IntegrityFault::InvalidType(tag) => write!(f, "invalid frame type {:#04x}", tag),
        }
    }
}

/// Errors returned by the frame decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Not enough bytes yet. Wait for more data.
    #[error("incomplete frame: need at least {needed} more bytes")]
    Incomplete {
        /// Lower bound on the number of missing bytes.
        needed: usize,
    },

    /// Integrity check failed. Discard and resynchronize.
    #[error("frame integrity check failed: {0}")]
    Checksum(IntegrityFault),
}

impl FrameError {
    /// True if the caller should simply wait for more bytes.
    #[inline]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, FrameError::Incomplete { .. })
    }
}

/// Whether a raw byte must be escaped inside a frame.
#[inline]
pub fn needs_escape(byte: u8) -> bool {
    matches!(byte, SOF | EOF | ESC | 0x00 | 0xFF)
}

/// Append `data` to `out`, escaping marker, escape, 0x00 and 0xFF bytes.
pub fn escape_into(data: &[u8], out: &mut Vec<u8>) {
    for &byte in data {
        match byte {
            0x00 => out.extend_from_slice(&[ESC, b'0']),
            0xFF => out.extend_from_slice(&[ESC, b'F']),
            SOF | EOF | ESC => out.extend_from_slice(&[ESC, byte]),
            _ => out.push(byte),
        }
    }
}

/// Reverse [`escape_into`].
pub fn unescape(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();

    while let Some(&byte) = iter.next() {
        match byte {
            ESC => {
                let code = *iter
                    .next()
                    .ok_or(FrameError::Checksum(IntegrityFault::BadEscape(ESC)))?;
                out.push(match code {
                    b'0' => 0x00,
                    b'F' => 0xFF,
                    SOF | EOF | ESC => code,
                    other => return Err(FrameError::Checksum(IntegrityFault::BadEscape(other))),
                });
            }
            SOF => return Err(FrameError::Checksum(IntegrityFault::UnexpectedStart)),
            _ => out.push(byte),
        }
    }

    Ok(out)
}

/// One's-complement checksum over `data` read as big-endian 16-bit words.
///
/// A trailing odd byte is treated as the high half of a final word.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = data.chunks_exact(2);

    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum > 0xFFFF {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }

    !(sum as u16)
}

/// Render a checksum as four lowercase hex digits.
pub fn format_checksum(value: u16) -> String {
    hex::encode(value.to_be_bytes())
}

/// Parse four hex digits (either case).
pub fn parse_checksum(digits: &[u8]) -> Option<u16> {
    let mut word = [0u8; 2];
    hex::decode_to_slice(digits, &mut word).ok()?;
    Some(u16::from_be_bytes(word))
}

/// Result of searching a frame body for its end marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Unescaped end marker at this position.
    End(usize),
    /// Unescaped start marker at this position, met before any end marker.
    Start(usize),
    /// Neither marker yet. A later search can resume at `resume`, which never
    /// splits an escape pair.
    NotFound { resume: usize },
}

/// Find the first unescaped end marker at or after `from`.
///
/// `from` must not point at the second byte of an escape pair.
pub fn find_end_marker(buf: &[u8], from: usize) -> Marker {
    let mut i = from;
    while i < buf.len() {
        match buf[i] {
            ESC => i += 2,
            EOF => return Marker::End(i),
            SOF => return Marker::Start(i),
            _ => i += 1,
        }
    }
    // A trailing escape byte is rescanned once its pair arrives.
    let resume = if i > buf.len() { i - 2 } else { i };
    Marker::NotFound { resume }
}
