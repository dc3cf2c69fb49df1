//! Frame buffer for reassembling frames from a serial byte stream.
//!
//! Uses `bytes::BytesMut` for buffer management.
//! Implements a state machine for handling fragmented and corrupted input:
//! - `SeekingStart`: discard bytes until a start marker appears
//! - `Accumulating`: start marker at the head of the buffer, wait for the
//!   end marker and checksum
//!
//! A frame that fails its integrity check is dropped and the search resumes
//! one byte past its start marker. Corruption never poisons the stream.
//!
//! # Example
//!
//! ```
//! use mup1_client::protocol::{Frame, FrameBuffer, FrameType};
//!
//! let mut buffer = FrameBuffer::new();
//! let wire = Frame::ping_request().encode();
//!
//! // Data arrives in arbitrary chunks from the serial port
//! assert!(buffer.push(&wire[..3]).is_empty());
//! let frames = buffer.push(&wire[3..]);
//!
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].frame_type, FrameType::PingRequest);
//! ```

use bytes::{Buf, BytesMut};

use super::frame::{scan, Frame, Scan};
use super::wire_format::{FrameError, DEFAULT_MAX_FRAME_SIZE, MIN_FRAME_SIZE, SOF};

/// State machine for frame reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Looking for a start marker.
    SeekingStart,
    /// Buffer begins with a start marker.
    Accumulating,
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from transport reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Offset where the end-marker search resumes while accumulating.
    scanned: usize,
    /// Maximum wire size of a single frame.
    max_frame_size: usize,
    /// Frames discarded because of corruption or size.
    dropped: u64,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 4KB, max frame: 64KB.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with a custom maximum frame size.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
            state: State::SeekingStart,
            scanned: 0,
            max_frame_size: max_frame_size.max(MIN_FRAME_SIZE),
            dropped: 0,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns the frames completed by this chunk, in stream order. Partial
    /// data stays buffered for the next push.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one() {
            frames.push(frame);
        }
        frames
    }

    /// Try to extract a single frame from the buffer.
    ///
    /// Returns `None` once more data is needed.
    fn try_extract_one(&mut self) -> Option<Frame> {
        loop {
            match self.state {
                State::SeekingStart => {
                    let Some(start) = self.buffer.iter().position(|&b| b == SOF) else {
                        if !self.buffer.is_empty() {
                            tracing::trace!("discarding {} bytes of line noise", self.buffer.len());
                            self.buffer.clear();
                        }
                        return None;
                    };
                    if start > 0 {
                        tracing::trace!("discarding {} bytes before start marker", start);
                        self.buffer.advance(start);
                    }
                    self.state = State::Accumulating;
                    self.scanned = 0;
                }

                State::Accumulating => {
                    if self.buffer.len() < MIN_FRAME_SIZE {
                        return None;
                    }

                    match scan(&self.buffer, self.scanned) {
                        Scan::Partial { resume, .. } => {
                            if self.buffer.len() > self.max_frame_size {
                                tracing::warn!(
                                    "no end marker within {} bytes, resynchronizing",
                                    self.max_frame_size
                                );
                                self.discard_start();
                                continue;
                            }
                            self.scanned = resume;
                            return None;
                        }

                        Scan::Restart(next_start) => {
                            tracing::debug!("truncated frame ({} bytes) dropped", next_start);
                            self.dropped += 1;
                            self.buffer.advance(next_start);
                            self.scanned = 0;
                        }

                        Scan::Complete { len, .. } => match Frame::decode(&self.buffer[..len]) {
                            Ok(frame) => {
                                self.buffer.advance(len);
                                self.state = State::SeekingStart;
                                return Some(frame);
                            }
                            Err(FrameError::Checksum(fault)) => {
                                tracing::warn!("dropping corrupted frame: {}", fault);
                                self.discard_start();
                            }
                            Err(FrameError::Incomplete { .. }) => return None,
                        },
                    }
                }
            }
        }
    }

    /// Drop the start marker at the head and go back to seeking.
    fn discard_start(&mut self) {
        self.dropped += 1;
        self.buffer.advance(1);
        self.state = State::SeekingStart;
        self.scanned = 0;
    }

    /// Number of frames discarded since creation.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::SeekingStart;
        self.scanned = 0;
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::SeekingStart => "SeekingStart",
            State::Accumulating => "Accumulating",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_frame, FrameType, CHECKSUM_LEN, ESC};

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&encode_frame(b'C', b"hello"));

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::CoapResponse);
        assert_eq!(frames[0].payload(), b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();

        let mut combined = Vec::new();
        combined.extend(encode_frame(b'A', b"first"));
        combined.extend(encode_frame(b'C', b"second"));
        combined.extend(encode_frame(b'P', b""));

        let frames = buffer.push(&combined);

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].frame_type, FrameType::Announce);
        assert_eq!(frames[1].payload(), b"second");
        assert_eq!(frames[2].frame_type, FrameType::PingResponse);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_split_at_every_offset() {
        let payload: Vec<u8> = vec![0x44, 0x01, 0x3E, 0xFF, 0x00, 0x3C, 0x5C, 0xA1, 0x62];
        let wire = encode_frame(b'C', &payload);

        for split in 0..=wire.len() {
            let mut buffer = FrameBuffer::new();
            let mut frames = buffer.push(&wire[..split]);
            frames.extend(buffer.push(&wire[split..]));

            assert_eq!(frames.len(), 1, "split at {}", split);
            assert_eq!(frames[0].payload(), &payload[..], "split at {}", split);
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let wire = encode_frame(b'C', b"hi");

        let mut all_frames = Vec::new();
        for byte in &wire {
            all_frames.extend(buffer.push(&[*byte]));
        }

        assert_eq!(all_frames.len(), 1);
        assert_eq!(all_frames[0].payload(), b"hi");
    }

    #[test]
    fn test_waits_below_minimum_size() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(b">p<").is_empty());
        assert_eq!(buffer.state_name(), "Accumulating");
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_garbage_before_start_is_discarded() {
        let mut buffer = FrameBuffer::new();
        let mut data = b"\x00noise<<".to_vec();
        data.extend(encode_frame(b'A', b"boot"));

        let frames = buffer.push(&data);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"boot");
    }

    #[test]
    fn test_noise_without_start_is_dropped() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(b"line noise").is_empty());
        assert!(buffer.is_empty());
        assert_eq!(buffer.state_name(), "SeekingStart");
    }

    #[test]
    fn test_corrupted_then_valid_frame() {
        let mut corrupted = encode_frame(b'C', b"first response");
        corrupted[5] ^= 0x04;
        let valid = encode_frame(b'C', b"second response");

        let mut stream = corrupted.clone();
        stream.extend_from_slice(&valid);

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&stream);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"second response");
        assert!(buffer.dropped_frames() >= 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_truncated_frame_followed_by_valid() {
        let truncated = &encode_frame(b'C', b"cut short")[..6];
        let valid = encode_frame(b'A', b"ok");

        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(truncated).is_empty());
        let frames = buffer.push(&valid);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::Announce);
        assert_eq!(buffer.dropped_frames(), 1);
    }

    #[test]
    fn test_corrupted_checksum_digits_resync() {
        let mut bad = encode_frame(b'C', b"abc");
        let n = bad.len();
        bad[n - 1] = b'x';

        let mut buffer = FrameBuffer::new();
        let mut stream = bad;
        stream.extend(encode_frame(b'C', b"abd"));
        let frames = buffer.push(&stream);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"abd");
    }

    #[test]
    fn test_max_frame_size_resync() {
        let mut buffer = FrameBuffer::with_max_frame_size(16);
        let frames = buffer.push(b">Cthis frame never ends and keeps going");
        assert!(frames.is_empty());
        assert_eq!(buffer.dropped_frames(), 1);

        let frames = buffer.push(&encode_frame(b'A', b"x"));
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_large_frame_byte_at_a_time_resumes_scan() {
        let mut buffer = FrameBuffer::new();
        let payload: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();
        let wire = encode_frame(b'C', &payload);
        assert!(wire.iter().filter(|&&b| b == ESC).count() > 100);

        let body_len = wire.len() - CHECKSUM_LEN - 2;

        let mut frames = Vec::new();
        for (i, byte) in wire.iter().enumerate() {
            frames.extend(buffer.push(&[*byte]));
            if i < body_len && buffer.len() >= MIN_FRAME_SIZE {
                // Only the newest byte, or a trailing escape pair, is left to scan.
                assert!(buffer.scanned + 1 >= buffer.len(), "offset {} at byte {}", buffer.scanned, i);
            }
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &payload[..]);
        assert_eq!(buffer.dropped_frames(), 0);
    }

    #[test]
    fn test_escape_split_across_pushes() {
        let mut buffer = FrameBuffer::new();
        let wire = encode_frame(b'C', b"abc<def");
        let esc = wire.iter().position(|&b| b == ESC).unwrap();

        assert!(buffer.push(&wire[..=esc]).is_empty());
        let frames = buffer.push(&wire[esc + 1..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"abc<def");
    }

    #[test]
    fn test_large_payload() {
        let mut buffer = FrameBuffer::new();
        let payload = vec![0xAB; 32 * 1024];
        let frames = buffer.push(&encode_frame(b'C', &payload));

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload().len(), 32 * 1024);
        assert!(frames[0].payload().iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut buffer = FrameBuffer::new();

        let frame1 = encode_frame(b'C', b"first");
        let frame2 = encode_frame(b'C', b"second");

        let mut data = frame1.clone();
        data.extend_from_slice(&frame2[..5]);

        let frames = buffer.push(&data);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"first");
        assert_eq!(buffer.state_name(), "Accumulating");
        assert_eq!(buffer.len(), 5);

        let frames = buffer.push(&frame2[5..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"second");
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        buffer.push(b">Cpartial");
        assert_eq!(buffer.state_name(), "Accumulating");

        buffer.clear();

        assert_eq!(buffer.state_name(), "SeekingStart");
        assert!(buffer.is_empty());
    }
}
