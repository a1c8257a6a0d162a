//! Self-checking random filler
//!
//! ```text
//! [1 byte: selector][N bytes: random][20 bytes: SHA-1(random)]
//! N = 16 + (selector & 0x0f)
//! ```
//!
//! A reader can skip a padded region without knowing its length up front, and
//! every skipped region is still verified.

use rand::{Rng, RngCore};
use sha1::{Digest, Sha1};
use std::io::{Read, Write};

use arca_core::{ArcaError, ArcaResult, WireRead};

/// Smallest filler length
pub const PADDING_MIN: usize = 16;

/// Exclusive upper bound of the filler length
pub const PADDING_MAX: usize = 32;

const PADDING_MASK: u8 = 0x0f;

/// SHA-1 digest length
pub const PADDING_DIGEST_SIZE: usize = 20;

/// Write a padding of random length. Returns the filler length.
pub fn write_padding<W: Write + ?Sized>(out: &mut W) -> ArcaResult<usize> {
    let selector: u8 = rand::thread_rng().gen();
    write_selected(out, selector)
}

/// Write a padding whose filler is exactly `len` bytes, `len` in `[16, 32)`.
pub fn write_padding_len<W: Write + ?Sized>(out: &mut W, len: usize) -> ArcaResult<usize> {
    if !(PADDING_MIN..PADDING_MAX).contains(&len) {
        return Err(ArcaError::InvalidArgument(format!(
            "padding length {len} outside [{PADDING_MIN}, {PADDING_MAX})"
        )));
    }
    let high: u8 = rand::thread_rng().gen::<u8>() & !PADDING_MASK;
    write_selected(out, high | (len - PADDING_MIN) as u8)
}

fn write_selected<W: Write + ?Sized>(out: &mut W, selector: u8) -> ArcaResult<usize> {
    let len = PADDING_MIN + (selector & PADDING_MASK) as usize;
    let mut filler = [0u8; PADDING_MAX];
    rand::thread_rng().fill_bytes(&mut filler[..len]);
    out.write_all(&[selector])?;
    out.write_all(&filler[..len])?;
    out.write_all(&Sha1::digest(&filler[..len]))?;
    Ok(len)
}

/// Read and verify a padding. Returns the filler length.
pub fn read_padding<R: Read + ?Sized>(input: &mut R) -> ArcaResult<usize> {
    let selector = input.read_u8()?;
    let len = PADDING_MIN + (selector & PADDING_MASK) as usize;
    let filler = input.read_bytes(len)?;
    let expected = input.read_bytes(PADDING_DIGEST_SIZE)?;
    if Sha1::digest(&filler).as_slice() != expected.as_slice() {
        return Err(ArcaError::Format);
    }
    Ok(len)
}

/// Total encoded size of a padding with a filler of `len` bytes.
pub fn encoded_len(len: usize) -> usize {
    1 + len + PADDING_DIGEST_SIZE
}

/// Largest possible encoded padding.
pub const PADDING_ENCODED_MAX: usize = 1 + PADDING_MAX - 1 + PADDING_DIGEST_SIZE;
