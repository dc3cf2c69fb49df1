//! Protocol module - MUP1 wire format, framing, and frame types.
//!
//! This module implements the serial framing layer:
//! - Byte escaping and the 16-bit frame checksum
//! - Frame struct with typed frame tags
//! - Frame buffer for reassembling frames from partial reads

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{encode_frame, Frame, FrameType};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    checksum, escape_into, unescape, FrameError, IntegrityFault, CHECKSUM_LEN,
    DEFAULT_MAX_FRAME_SIZE, EOF, ESC, MIN_FRAME_SIZE, SOF,
};
