//! Primitive encodings shared by the envelope, content and filelist codecs.
//!
//! ```text
//! u8 / u16 / u32 / u64       big-endian fixed width
//! u8-bytes                   [u8 len][len bytes]
//! u32-bytes                  [u32 BE len][len bytes]       (len bounded by caller)
//! varint                     7 bits per byte, least significant group first,
//!                            high bit set on the LAST byte; 63-bit values only
//! ```
//!
//! Every read failure is a format error: these readers only ever see archive
//! bytes, and a short read is indistinguishable from tampering.

use std::io::{Read, Write};

use crate::error::{ArcaError, ArcaResult, OrFormat};
use crate::types::Tag;

/// Longest encoded varint (63 bits in 7-bit groups).
const VARINT_MAX_BYTES: usize = 9;

pub trait WireRead: Read {
    fn read_u8(&mut self) -> ArcaResult<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b).or_format()?;
        Ok(b[0])
    }

    fn read_u16_be(&mut self) -> ArcaResult<u16> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b).or_format()?;
        Ok(u16::from_be_bytes(b))
    }

    fn read_u32_be(&mut self) -> ArcaResult<u32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b).or_format()?;
        Ok(u32::from_be_bytes(b))
    }

    fn read_u64_be(&mut self) -> ArcaResult<u64> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b).or_format()?;
        Ok(u64::from_be_bytes(b))
    }

    fn read_bytes(&mut self, len: usize) -> ArcaResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).or_format()?;
        Ok(buf)
    }

    fn read_u8_bytes(&mut self) -> ArcaResult<Vec<u8>> {
        let len = self.read_u8()? as usize;
        self.read_bytes(len)
    }

    /// Read a u32-length-prefixed blob, rejecting lengths above `limit`.
    fn read_u32_bytes(&mut self, limit: usize) -> ArcaResult<Vec<u8>> {
        let len = self.read_u32_be()? as usize;
        if len > limit {
            return Err(ArcaError::Format);
        }
        self.read_bytes(len)
    }

    /// Read a u32-length-prefixed UTF-8 string, rejecting lengths above `limit`.
    fn read_u32_utf8(&mut self, limit: usize) -> ArcaResult<String> {
        String::from_utf8(self.read_u32_bytes(limit)?).or_format()
    }

    fn read_varint(&mut self) -> ArcaResult<u64> {
        let mut value = 0u64;
        for i in 0..VARINT_MAX_BYTES {
            let b = self.read_u8()?;
            value |= u64::from(b & 0x7f) << (7 * i);
            if b & 0x80 != 0 {
                return Ok(value);
            }
        }
        Err(ArcaError::Format)
    }

    fn read_tag(&mut self) -> ArcaResult<Tag> {
        Tag::try_from(self.read_u8()?)
    }

    fn expect_tag(&mut self, expected: Tag) -> ArcaResult<()> {
        if self.read_tag()? != expected {
            return Err(ArcaError::Format);
        }
        Ok(())
    }
}

impl<R: Read + ?Sized> WireRead for R {}

pub trait WireWrite: Write {
    fn write_u8(&mut self, v: u8) -> ArcaResult<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_u16_be(&mut self, v: u16) -> ArcaResult<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_u32_be(&mut self, v: u32) -> ArcaResult<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_u64_be(&mut self, v: u64) -> ArcaResult<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_u8_bytes(&mut self, data: &[u8]) -> ArcaResult<()> {
        let len = u8::try_from(data.len()).map_err(|_| {
            ArcaError::InvalidArgument(format!("{} bytes exceed a u8 length prefix", data.len()))
        })?;
        self.write_u8(len)?;
        self.write_all(data)?;
        Ok(())
    }

    fn write_u32_bytes(&mut self, data: &[u8]) -> ArcaResult<()> {
        let len = u32::try_from(data.len()).map_err(|_| {
            ArcaError::InvalidArgument(format!("{} bytes exceed a u32 length prefix", data.len()))
        })?;
        self.write_u32_be(len)?;
        self.write_all(data)?;
        Ok(())
    }

    fn write_varint(&mut self, value: u64) -> ArcaResult<()> {
        if value >> 63 != 0 {
            return Err(ArcaError::InvalidArgument(format!("varint out of range: {value}")));
        }
        let mut v = value;
        loop {
            let low = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                return self.write_u8(low | 0x80);
            }
            self.write_u8(low)?;
        }
    }

    fn write_tag(&mut self, tag: Tag) -> ArcaResult<()> {
        self.write_u8(tag.byte())
    }
}

impl<W: Write + ?Sized> WireWrite for W {}
