//! Serial traffic captured with `strace`, and its replay.
//!
//! A session recorded with `strace -e trace=write -yy` against a host tool
//! contains lines such as
//!
//! ```text
//! write(3</dev/ttyACM0>, ">c@\1\0\1\275\35ietf-interfaces:interfaces<d0b2", 36) = 36
//! ```
//!
//! [`extract_writes`] pulls the written bytes back out of such a log, and
//! [`replay`] sends them to a device again after a keepalive probe.

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Mup1Error, Result};
use crate::protocol::{Frame, FrameBuffer, FrameType};

/// One `write(2)` call found in a capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedWrite {
    pub fd: u32,
    pub data: Bytes,
}

/// Collect the writes to a device whose path contains `device` (for example
/// `ttyACM0`), optionally only those on descriptor `fd`.
///
/// Lines that are not writes to the device are skipped. A string argument
/// with a malformed escape fails the whole extraction.
pub fn extract_writes(log: &str, device: &str, fd: Option<u32>) -> Result<Vec<CapturedWrite>> {
    let mut writes = Vec::new();

    for (number, line) in log.lines().enumerate() {
        let Some((this_fd, path, literal)) = split_write_call(line) else {
            continue;
        };
        if !path.contains(device) || fd.is_some_and(|fd| fd != this_fd) {
            continue;
        }
        let data = unescape_c_string(literal).ok_or_else(|| {
            Mup1Error::Capture(format!("line {}: malformed string literal", number + 1))
        })?;
        writes.push(CapturedWrite {
            fd: this_fd,
            data: Bytes::from(data),
        });
    }

    tracing::debug!("extracted {} write(s) to {}", writes.len(), device);
    Ok(writes)
}

/// Split `write(FD<PATH>, "LITERAL"...` into its parts.
fn split_write_call(line: &str) -> Option<(u32, &str, &str)> {
    let rest = &line[line.find("write(")? + "write(".len()..];

    let open = rest.find('<')?;
    let fd = rest[..open].trim().parse().ok()?;
    let rest = &rest[open + 1..];

    let close = rest.find(">,")?;
    let path = &rest[..close];
    let rest = rest[close + 2..].trim_start().strip_prefix('"')?;

    // Literal ends at the first quote that is not escaped.
    let mut escaped = false;
    for (i, c) in rest.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            '"' if !escaped => return Some((fd, path, &rest[..i])),
            _ => escaped = false,
        }
    }
    None
}

/// Decode the C escapes strace prints: `\n \r \t \v \f \" \\`, `\xHH` and
/// octal `\N`, `\NN`, `\NNN`.
fn unescape_c_string(literal: &str) -> Option<Vec<u8>> {
    let bytes = literal.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let escape = *bytes.get(i + 1)?;
        i += 2;
        match escape {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(0x0B),
            b'f' => out.push(0x0C),
            b'"' | b'\\' | b'\'' => out.push(escape),
            b'x' => {
                let hex = literal.get(i..i + 2)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 2;
            }
            b'0'..=b'7' => {
                let mut value = u32::from(escape - b'0');
                let mut digits = 1;
                while digits < 3 {
                    match bytes.get(i) {
                        Some(d @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(d - b'0');
                            i += 1;
                            digits += 1;
                        }
                        _ => break,
                    }
                }
                out.push(u8::try_from(value).ok()?);
            }
            _ => return None,
        }
    }

    Some(out)
}

/// Reassemble the frames contained in captured writes.
///
/// Bytes that do not form valid frames are dropped, as on a live link.
pub fn frames(writes: &[CapturedWrite]) -> Vec<Frame> {
    let mut buffer = FrameBuffer::new();
    writes.iter().flat_map(|w| buffer.push(&w.data)).collect()
}

/// Send a ping probe followed by every captured write, in order.
///
/// Returns the number of bytes written after the probe.
pub async fn replay<W>(writer: &mut W, writes: &[CapturedWrite]) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&Frame::ping_request().encode()).await?;

    let mut total = 0;
    for write in writes {
        writer.write_all(&write.data).await?;
        total += write.data.len();
    }
    writer.flush().await?;

    let coap = frames(writes)
        .iter()
        .filter(|f| f.frame_type == FrameType::CoapRequest)
        .count();
    tracing::info!(
        "replayed {} bytes in {} write(s), {} CoAP request(s)",
        total,
        writes.len(),
        coap
    );
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_frame;

    const LOG: &str = r#"
execve("/usr/bin/mvdct", ["mvdct", "device", "/dev/ttyACM0", "get"], 0x7ffd /* 30 vars */) = 0
openat(AT_FDCWD</root>, "/dev/ttyACM0", O_RDWR|O_NOCTTY) = 3</dev/ttyACM0>
write(3</dev/ttyACM0>, ">p<<8553", 8) = 8
write(1</dev/pts/0>, "ok\n", 3) = 3
write(3</dev/ttyACM0>, ">c@\1\0\1\275\35ietf-interfaces:interfaces<d0b2", 36) = 36
write(4</dev/ttyACM1>, ">p<<8553", 8) = 8
"#;

    #[test]
    fn test_extract_device_writes() {
        let writes = extract_writes(LOG, "ttyACM0", None).unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].fd, 3);
        assert_eq!(&writes[0].data[..], b">p<<8553");

        let second = &writes[1].data;
        assert_eq!(&second[..4], &[b'>', b'c', b'@', 0x01]);
        assert_eq!(&second[4..7], &[0x00, 0x01, 0xBD]);
        assert_eq!(second[7], 0x1D);
        assert!(second.ends_with(b"interfaces<d0b2"));
    }

    #[test]
    fn test_extract_filters_by_fd() {
        assert_eq!(extract_writes(LOG, "ttyACM", Some(4)).unwrap().len(), 1);
        assert!(extract_writes(LOG, "ttyACM0", Some(7)).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_literal_reports_line() {
        let log = "\nwrite(3</dev/ttyACM0>, \"bad \\q\", 6) = 6\n";
        match extract_writes(log, "ttyACM0", None) {
            Err(Mup1Error::Capture(msg)) => assert!(msg.starts_with("line 2"), "{}", msg),
            other => panic!("expected capture error, got {:?}", other),
        }
    }

    #[test]
    fn test_unescape_c_string() {
        assert_eq!(unescape_c_string(r#"a\n\t\\\""#).unwrap(), b"a\n\t\\\"");
        assert_eq!(unescape_c_string(r"\x3e\xFF").unwrap(), vec![0x3E, 0xFF]);
        assert_eq!(unescape_c_string(r"\0\12\377").unwrap(), vec![0, 10, 0xFF]);
        assert_eq!(unescape_c_string(r"\1a").unwrap(), vec![1, b'a']);
        assert!(unescape_c_string(r"\q").is_none());
        assert!(unescape_c_string(r"trailing\").is_none());
        assert!(unescape_c_string(r"\x4").is_none());
    }

    #[test]
    fn test_escaped_quote_inside_literal() {
        let line = r#"write(3</dev/ttyACM0>, "say \"hi\"", 8) = 8"#;
        let writes = extract_writes(line, "ttyACM0", None).unwrap();
        assert_eq!(&writes[0].data[..], b"say \"hi\"");
    }

    #[test]
    fn test_frames_from_capture() {
        let frame = encode_frame(b'c', b"\x40\x01\x00\x01");
        let (head, tail) = frame.split_at(5);
        let writes = vec![
            CapturedWrite { fd: 3, data: Bytes::from_static(b">p<<8553") },
            CapturedWrite { fd: 3, data: Bytes::copy_from_slice(head) },
            CapturedWrite { fd: 3, data: Bytes::copy_from_slice(tail) },
        ];

        let frames = frames(&writes);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame_type, FrameType::PingRequest);
        assert_eq!(frames[1].payload(), b"\x40\x01\x00\x01");
    }

    #[tokio::test]
    async fn test_replay_sends_ping_first() {
        let writes = extract_writes(LOG, "ttyACM0", None).unwrap();
        let mut out = std::io::Cursor::new(Vec::new());

        let total = replay(&mut out, &writes).await.unwrap();
        assert_eq!(total, 8 + writes[1].data.len());

        let sent = out.into_inner();
        assert!(sent.starts_with(b">p<<8553>p<<8553>c"));
        assert_eq!(sent.len(), 8 + total);
    }
}
