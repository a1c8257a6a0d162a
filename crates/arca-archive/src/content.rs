//! Entry content codec
//!
//! Each backed-up file is written into the content stream as
//!
//! ```text
//! [Tag::Data][Tag::Blocks] { [Tag::Block][u32-bytes raw] | [Tag::BlockGz][u32-bytes gzip] }* [Tag::BlocksEnd]
//! ```
//!
//! Chunks are at most [`CHUNK_SIZE`] plaintext bytes. The filelist records
//! the logical offset of the `Data` tag and the SHA-256 of the plaintext.

use std::io::{self, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use thiserror::Error;

use arca_core::{ArcaError, ArcaResult, OrFormat, Tag, WireRead, WireWrite};

/// Plaintext bytes per `Block`/`BlockGz` record.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Largest block record a reader accepts, compressed or decompressed.
pub const MAX_BLOCK_LEN: usize = 4 * 1024 * 1024;

/// Failure while writing one entry.
///
/// Keeps a failing source file apart from a failing archive: the first only
/// loses that entry, the second loses the whole archive.
#[derive(Debug, Error)]
pub enum EntryError {
    #[error("reading source: {0}")]
    Source(#[source] io::Error),

    #[error(transparent)]
    Archive(#[from] ArcaError),
}

/// Plaintext size and SHA-256 of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySummary {
    pub size: u64,
    pub checksum: Vec<u8>,
}

/// Fill `buf` from `input` until it is full or the input ends.
pub(crate) fn read_full<R: Read + ?Sized>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match input.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn gzip(data: &[u8]) -> ArcaResult<Vec<u8>> {
    let mut gz = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    gz.write_all(data)?;
    Ok(gz.finish()?)
}

/// Decompress a gzip record, refusing output beyond `limit` bytes.
pub(crate) fn gunzip(data: &[u8], limit: usize) -> ArcaResult<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .or_format()?;
    if out.len() > limit {
        return Err(ArcaError::Format);
    }
    Ok(out)
}

/// Stream `source` into `out` as one entry.
pub fn write_entry<W, R>(out: &mut W, mut source: R, compress: bool) -> Result<EntrySummary, EntryError>
where
    W: Write + ?Sized,
    R: Read,
{
    out.write_tag(Tag::Data)?;
    out.write_tag(Tag::Blocks)?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let n = read_full(&mut source, &mut chunk).map_err(EntryError::Source)?;
        if n > 0 {
            let data = &chunk[..n];
            hasher.update(data);
            size += n as u64;
            if compress {
                out.write_tag(Tag::BlockGz)?;
                out.write_u32_bytes(&gzip(data)?)?;
            } else {
                out.write_tag(Tag::Block)?;
                out.write_u32_bytes(data)?;
            }
        }
        if n < CHUNK_SIZE {
            break;
        }
    }
    out.write_tag(Tag::BlocksEnd)?;
    Ok(EntrySummary {
        size,
        checksum: hasher.finalize().to_vec(),
    })
}

/// Decode the entry at the current position of `input`, handing each
/// plaintext block to `visit`. Stops early when `visit` returns `false`;
/// the return value tells whether the whole entry was visited.
pub fn read_blocks<R, F>(input: &mut R, mut visit: F) -> ArcaResult<bool>
where
    R: Read + ?Sized,
    F: FnMut(&[u8]) -> ArcaResult<bool>,
{
    input.expect_tag(Tag::Data)?;
    input.expect_tag(Tag::Blocks)?;
    loop {
        let block = match input.read_tag()? {
            Tag::Block => input.read_u32_bytes(MAX_BLOCK_LEN)?,
            Tag::BlockGz => gunzip(&input.read_u32_bytes(MAX_BLOCK_LEN)?, MAX_BLOCK_LEN)?,
            Tag::BlocksEnd => return Ok(true),
            _ => return Err(ArcaError::Format),
        };
        if !visit(&block)? {
            return Ok(false);
        }
    }
}

/// Decode one entry into `out`. Write failures on `out` surface as
/// [`ArcaError::Io`], anything wrong with the archive as a format error.
pub fn copy_entry<R, W>(input: &mut R, out: &mut W) -> ArcaResult<EntrySummary>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    read_blocks(input, |block| {
        hasher.update(block);
        size += block.len() as u64;
        out.write_all(block)?;
        Ok(true)
    })?;
    out.flush()?;
    Ok(EntrySummary {
        size,
        checksum: hasher.finalize().to_vec(),
    })
}

/// Decode one entry only to digest it.
pub fn digest_entry<R: Read + ?Sized>(input: &mut R) -> ArcaResult<EntrySummary> {
    copy_entry(input, &mut io::sink())
}

/// Compare the entry at the position of `input` with the bytes of `other`.
/// A read failure on `other` counts as a difference.
pub fn compare_entry<R, O>(input: &mut R, other: &mut O) -> ArcaResult<bool>
where
    R: Read + ?Sized,
    O: Read + ?Sized,
{
    let mut theirs = Vec::new();
    let complete = read_blocks(input, |block| {
        theirs.resize(block.len(), 0);
        match read_full(&mut *other, &mut theirs) {
            Ok(n) => Ok(n == block.len() && theirs == block),
            Err(_) => Ok(false),
        }
    })?;
    if !complete {
        return Ok(false);
    }
    let mut extra = [0u8; 1];
    Ok(matches!(read_full(&mut *other, &mut extra), Ok(0)))
}
