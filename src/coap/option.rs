//! Option encoding.
//!
//! Each option starts with one byte holding a 4-bit delta (option number
//! minus the previous option number) and a 4-bit value length. Either nibble
//! may be extended:
//!
//! ```text
//! nibble 0..=12  value inline
//! nibble 13      1 extension byte, value - 13
//! nibble 14      2 extension bytes (big-endian), value - 269
//! nibble 15      reserved (0xFF as a whole byte is the payload marker)
//! ```
//!
//! Delta extensions precede length extensions.

use bytes::Bytes;

use super::CoapError;

/// Option numbers used by this crate.
pub mod number {
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
    pub const URI_QUERY: u16 = 15;
    pub const ACCEPT: u16 = 17;
}

/// Largest delta or length representable by an option header.
pub const MAX_OPTION_FIELD: usize = 269 + 0xFFFF;

/// Encoding of one delta or length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionNibble {
    /// 0..=12, carried in the nibble itself.
    Inline(u8),
    /// 13..=268, one extension byte holding `value - 13`.
    OneByteExt(u8),
    /// 269..=65804, two extension bytes holding `value - 269`.
    TwoByteExt(u16),
}

impl OptionNibble {
    /// Choose the encoding for a delta or length.
    pub fn for_value(value: usize) -> Result<Self, CoapError> {
        match value {
            0..=12 => Ok(OptionNibble::Inline(value as u8)),
            13..=268 => Ok(OptionNibble::OneByteExt((value - 13) as u8)),
            269..=MAX_OPTION_FIELD => Ok(OptionNibble::TwoByteExt((value - 269) as u16)),
            _ => Err(CoapError::OptionTooLarge(value)),
        }
    }

    /// The 4-bit value written into the option header byte.
    #[inline]
    pub fn nibble(self) -> u8 {
        match self {
            OptionNibble::Inline(v) => v,
            OptionNibble::OneByteExt(_) => 13,
            OptionNibble::TwoByteExt(_) => 14,
        }
    }

    /// The value this encoding stands for.
    pub fn value(self) -> usize {
        match self {
            OptionNibble::Inline(v) => v as usize,
            OptionNibble::OneByteExt(ext) => ext as usize + 13,
            OptionNibble::TwoByteExt(ext) => ext as usize + 269,
        }
    }

    /// Append the extension bytes, if any.
    pub fn write_ext(self, out: &mut Vec<u8>) {
        match self {
            OptionNibble::Inline(_) => {}
            OptionNibble::OneByteExt(ext) => out.push(ext),
            OptionNibble::TwoByteExt(ext) => out.extend_from_slice(&ext.to_be_bytes()),
        }
    }

    /// Read the field announced by `nibble`, consuming extension bytes at `*pos`.
    pub fn read(nibble: u8, data: &[u8], pos: &mut usize) -> Result<Self, CoapError> {
        let field = match nibble {
            0..=12 => OptionNibble::Inline(nibble),
            13 => {
                let ext = *data.get(*pos).ok_or(CoapError::Truncated("option extension"))?;
                *pos += 1;
                OptionNibble::OneByteExt(ext)
            }
            14 => {
                let ext = data
                    .get(*pos..*pos + 2)
                    .ok_or(CoapError::Truncated("option extension"))?;
                *pos += 2;
                OptionNibble::TwoByteExt(u16::from_be_bytes([ext[0], ext[1]]))
            }
            _ => return Err(CoapError::ReservedNibble),
        };
        Ok(field)
    }
}

/// One option instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Bytes,
}

impl CoapOption {
    pub fn new(number: u16, value: impl Into<Bytes>) -> Self {
        Self {
            number,
            value: value.into(),
        }
    }

    /// Option holding an unsigned integer in minimal big-endian form.
    ///
    /// Zero is encoded as an empty value.
    pub fn uint(number: u16, value: u32) -> Self {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        Self::new(number, Bytes::copy_from_slice(&bytes[skip..]))
    }

    /// Value read as a big-endian unsigned integer.
    pub fn as_uint(&self) -> Option<u32> {
        if self.value.len() > 4 {
            return None;
        }
        Some(self.value.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32))
    }

    /// Value read as UTF-8 text.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// Encode options in order. `options` must be sorted by number.
pub fn encode_options(options: &[CoapOption], out: &mut Vec<u8>) -> Result<(), CoapError> {
    let mut previous = 0u16;
    for option in options {
        debug_assert!(option.number >= previous, "options must be sorted");
        let delta = OptionNibble::for_value((option.number - previous) as usize)?;
        let length = OptionNibble::for_value(option.value.len())?;

        out.push((delta.nibble() << 4) | length.nibble());
        delta.write_ext(out);
        length.write_ext(out);
        out.extend_from_slice(&option.value);

        previous = option.number;
    }
    Ok(())
}

/// Walk the options section starting at `*pos`.
///
/// Stops at the end of `data` or at a payload marker, leaving `*pos` on the
/// marker. The 0xFF byte is only recognised where an option header would start,
/// so 0xFF inside option values is never mistaken for the marker.
pub fn decode_options(data: &[u8], pos: &mut usize) -> Result<Vec<CoapOption>, CoapError> {
    let mut options = Vec::new();
    let mut number = 0u32;

    while let Some(&header) = data.get(*pos) {
        if header == super::PAYLOAD_MARKER {
            break;
        }
        *pos += 1;

        let delta = OptionNibble::read(header >> 4, data, pos)?.value();
        let length = OptionNibble::read(header & 0x0F, data, pos)?.value();

        number += delta as u32;
        let number = u16::try_from(number).map_err(|_| CoapError::OptionNumberOverflow)?;

        let value = data
            .get(*pos..*pos + length)
            .ok_or(CoapError::Truncated("option value"))?;
        *pos += length;

        options.push(CoapOption::new(number, Bytes::copy_from_slice(value)));
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nibble_boundaries() {
        assert_eq!(OptionNibble::for_value(0), Ok(OptionNibble::Inline(0)));
        assert_eq!(OptionNibble::for_value(12), Ok(OptionNibble::Inline(12)));
        assert_eq!(OptionNibble::for_value(13), Ok(OptionNibble::OneByteExt(0)));
        assert_eq!(OptionNibble::for_value(268), Ok(OptionNibble::OneByteExt(255)));
        assert_eq!(OptionNibble::for_value(269), Ok(OptionNibble::TwoByteExt(0)));
        assert_eq!(
            OptionNibble::for_value(65804),
            Ok(OptionNibble::TwoByteExt(0xFFFF))
        );
        assert_eq!(
            OptionNibble::for_value(65805),
            Err(CoapError::OptionTooLarge(65805))
        );
    }

    #[test]
    fn test_nibble_read_back() {
        for value in [0, 5, 12, 13, 200, 268, 269, 1000, 65804] {
            let field = OptionNibble::for_value(value).unwrap();
            let mut ext = Vec::new();
            field.write_ext(&mut ext);

            let mut pos = 0;
            let read = OptionNibble::read(field.nibble(), &ext, &mut pos).unwrap();
            assert_eq!(read.value(), value);
            assert_eq!(pos, ext.len());
        }
    }

    #[test]
    fn test_reserved_nibble_rejected() {
        let mut pos = 0;
        assert_eq!(
            OptionNibble::read(15, &[], &mut pos),
            Err(CoapError::ReservedNibble)
        );
    }

    #[test]
    fn test_uint_minimal_length() {
        assert!(CoapOption::uint(number::CONTENT_FORMAT, 0).value.is_empty());
        assert_eq!(&CoapOption::uint(number::CONTENT_FORMAT, 60).value[..], &[60]);
        assert_eq!(&CoapOption::uint(number::CONTENT_FORMAT, 300).value[..], &[0x01, 0x2C]);
        assert_eq!(CoapOption::uint(number::ACCEPT, 140).as_uint(), Some(140));
    }

    #[test]
    fn test_encode_repeated_options_use_zero_delta() {
        let options = vec![
            CoapOption::new(number::URI_PATH, "a"),
            CoapOption::new(number::URI_PATH, "bc"),
            CoapOption::uint(number::CONTENT_FORMAT, 60),
        ];
        let mut out = Vec::new();
        encode_options(&options, &mut out).unwrap();

        assert_eq!(out, vec![0xB1, b'a', 0x02, b'b', b'c', 0x11, 60]);
    }

    #[test]
    fn test_value_containing_marker_byte() {
        let options = vec![CoapOption::new(number::URI_QUERY, vec![0xFF, 0xFF, 0x01])];
        let mut out = Vec::new();
        encode_options(&options, &mut out).unwrap();

        let mut pos = 0;
        let decoded = decode_options(&out, &mut pos).unwrap();
        assert_eq!(decoded, options);
        assert_eq!(pos, out.len());
    }

    #[test]
    fn test_truncated_value() {
        let mut pos = 0;
        assert_eq!(
            decode_options(&[0xB5, b'a', b'b'], &mut pos),
            Err(CoapError::Truncated("option value"))
        );
    }
}
