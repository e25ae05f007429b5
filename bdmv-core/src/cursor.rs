//! Bounds-checked big-endian reader for BDMV metadata files.
//!
//! Every BDMV navigation file (CLPI, MPLS, INDX, MOBJ) is a tree of
//! length-prefixed records addressed by absolute 32-bit offsets from a fixed
//! header. The cursor keeps an explicit position so that nested records can be
//! parsed as "read length, remember position, parse, seek past".

use byteorder::{BigEndian, ReadBytesExt};
use serde::Serialize;
use std::io::{Cursor, Read};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("bad tag at offset {offset}: expected {expected:?}, found {found:?}")]
    BadTag {
        offset: usize,
        expected: String,
        found: String,
    },
    #[error("unexpected end of data at offset {offset} (needed {needed} bytes)")]
    UnexpectedEof { offset: usize, needed: usize },
    #[error("length mismatch at offset {offset}: declared {declared}, available {available}")]
    LengthMismatch {
        offset: usize,
        declared: usize,
        available: usize,
    },
    #[error("invalid value at offset {offset}: {what}")]
    InvalidValue { offset: usize, what: String },
}

impl FormatError {
    /// Byte offset at which the violation was detected.
    pub fn offset(&self) -> usize {
        match self {
            FormatError::BadTag { offset, .. }
            | FormatError::UnexpectedEof { offset, .. }
            | FormatError::LengthMismatch { offset, .. }
            | FormatError::InvalidValue { offset, .. } => *offset,
        }
    }
}

pub type FormatResult<T> = Result<T, FormatError>;

/// The 8-byte `{tag, version}` header every metadata file starts with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BdHeader {
    pub tag: String,
    pub version: String,
}

const KNOWN_VERSIONS: [&str; 4] = ["0100", "0200", "0240", "0300"];

pub struct ByteCursor<'a> {
    inner: Cursor<&'a [u8]>,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            inner: Cursor::new(data),
        }
    }

    pub fn position(&self) -> usize {
        self.inner.position() as usize
    }

    pub fn len(&self) -> usize {
        self.inner.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining(&self) -> usize {
        self.len().saturating_sub(self.position())
    }

    fn read_with<T>(
        &mut self,
        needed: usize,
        read: impl FnOnce(&mut Cursor<&'a [u8]>) -> std::io::Result<T>,
    ) -> FormatResult<T> {
        let offset = self.position();
        if self.remaining() < needed {
            return Err(FormatError::UnexpectedEof { offset, needed });
        }
        read(&mut self.inner).map_err(|_| FormatError::UnexpectedEof { offset, needed })
    }

    pub fn read_u8(&mut self) -> FormatResult<u8> {
        self.read_with(1, |c| c.read_u8())
    }

    pub fn read_u16(&mut self) -> FormatResult<u16> {
        self.read_with(2, |c| c.read_u16::<BigEndian>())
    }

    pub fn read_u24(&mut self) -> FormatResult<u32> {
        self.read_with(3, |c| c.read_u24::<BigEndian>())
    }

    pub fn read_u32(&mut self) -> FormatResult<u32> {
        self.read_with(4, |c| c.read_u32::<BigEndian>())
    }

    /// Reads a 6-byte big-endian value (used by packed EP-map headers).
    pub fn read_u48(&mut self) -> FormatResult<u64> {
        self.read_with(6, |c| c.read_uint::<BigEndian>(6))
    }

    pub fn read_u64(&mut self) -> FormatResult<u64> {
        self.read_with(8, |c| c.read_u64::<BigEndian>())
    }

    pub fn read_bytes(&mut self, len: usize) -> FormatResult<&'a [u8]> {
        let offset = self.position();
        if self.remaining() < len {
            return Err(FormatError::UnexpectedEof {
                offset,
                needed: len,
            });
        }
        let data: &'a [u8] = *self.inner.get_ref();
        self.inner.set_position((offset + len) as u64);
        Ok(&data[offset..offset + len])
    }

    /// Reads `len` bytes as text. Non-UTF-8 bytes are replaced rather than rejected
    /// because language codes and clip ids on real discs are occasionally padded with junk.
    pub fn read_fixed_string(&mut self, len: usize) -> FormatResult<String> {
        let mut buf = vec![0u8; len];
        self.read_with(len, |c| c.read_exact(&mut buf))?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn skip(&mut self, len: usize) -> FormatResult<()> {
        let offset = self.position();
        if self.remaining() < len {
            return Err(FormatError::UnexpectedEof {
                offset,
                needed: len,
            });
        }
        self.inner.set_position((offset + len) as u64);
        Ok(())
    }

    pub fn seek(&mut self, pos: usize) -> FormatResult<()> {
        if pos > self.len() {
            return Err(FormatError::UnexpectedEof {
                offset: pos,
                needed: 0,
            });
        }
        self.inner.set_position(pos as u64);
        Ok(())
    }

    /// Checks that a record of `declared` bytes starting at the current position fits.
    pub fn check_span(&self, declared: usize) -> FormatResult<()> {
        if declared > self.remaining() {
            return Err(FormatError::LengthMismatch {
                offset: self.position(),
                declared,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    /// Reads a big-endian 32-bit section pointer and checks it lands inside the buffer.
    pub fn read_offset(&mut self) -> FormatResult<usize> {
        let at = self.position();
        let value = self.read_u32()? as usize;
        if value > self.len() {
            return Err(FormatError::InvalidValue {
                offset: at,
                what: format!("section offset {} beyond end of file ({})", value, self.len()),
            });
        }
        Ok(value)
    }
}

/// Reads the 8-byte file header. Only the tag is checked.
pub fn read_bd_header(cur: &mut ByteCursor<'_>, expected_tag: &str) -> FormatResult<BdHeader> {
    let offset = cur.position();
    let tag = cur.read_fixed_string(4)?;
    if tag != expected_tag {
        return Err(FormatError::BadTag {
            offset,
            expected: expected_tag.to_string(),
            found: tag,
        });
    }
    let version = cur.read_fixed_string(4)?;
    if !KNOWN_VERSIONS.contains(&version.as_str()) {
        tracing::warn!(tag = %tag, version = %version, "unrecognised file version, parsing anyway");
    }
    Ok(BdHeader { tag, version })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian_fields() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x01];
        let mut cur = ByteCursor::new(&data);
        assert_eq!(cur.read_u16().unwrap(), 0x1234);
        assert_eq!(cur.read_u24().unwrap(), 0x56789a);
        assert_eq!(cur.position(), 5);
        assert_eq!(cur.read_u32().unwrap(), 0xbcdef001);
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn eof_reports_offset() {
        let data = [0u8; 5];
        let mut cur = ByteCursor::new(&data);
        cur.skip(3).unwrap();
        let err = cur.read_u32().unwrap_err();
        assert_eq!(err, FormatError::UnexpectedEof { offset: 3, needed: 4 });
        // a failed read does not move the cursor
        assert_eq!(cur.position(), 3);
    }

    #[test]
    fn u48_packs_six_bytes() {
        let data = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05];
        let mut cur = ByteCursor::new(&data);
        assert_eq!(cur.read_u48().unwrap(), 0x0001_0203_0405);
    }

    #[test]
    fn header_rejects_wrong_tag() {
        let mut cur = ByteCursor::new(b"MPLS0200");
        let err = read_bd_header(&mut cur, "MOBJ").unwrap_err();
        assert_eq!(err.offset(), 0);
        assert!(matches!(err, FormatError::BadTag { .. }));
    }

    #[test]
    fn header_accepts_unknown_version() {
        let mut cur = ByteCursor::new(b"INDX0999");
        let header = read_bd_header(&mut cur, "INDX").unwrap();
        assert_eq!(header.tag, "INDX");
        assert_eq!(header.version, "0999");
        assert_eq!(cur.position(), 8);
    }

    #[test]
    fn check_span_detects_overrun() {
        let data = [0u8; 10];
        let mut cur = ByteCursor::new(&data);
        cur.skip(4).unwrap();
        assert!(cur.check_span(6).is_ok());
        assert_eq!(
            cur.check_span(7).unwrap_err(),
            FormatError::LengthMismatch { offset: 4, declared: 7, available: 6 }
        );
    }
}
