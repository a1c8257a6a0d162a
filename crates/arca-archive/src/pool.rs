//! Seekable pool over the decrypted content stream
//!
//! One sequential cursor serves ordinary top-to-bottom reads. Up to
//! [`POOL_SIZE`] extra cursors serve `read_at`, so a handful of interleaved
//! comparisons each keep their current block decrypted. A miss evicts the
//! oldest cursor (FIFO); a hit moves the cursor to the back. Everything sits
//! behind one mutex.

use std::collections::VecDeque;
use std::io::{self, Read, Seek};
use std::sync::{Mutex, MutexGuard};

use arca_core::{ArcaError, ArcaResult};
use arca_crypto::Cipher;

use crate::block::{BlockCursor, BlockSource};

/// Random-access cursors kept besides the sequential one.
pub const POOL_SIZE: usize = 3;

struct Pool<R> {
    source: BlockSource<R>,
    sequential: BlockCursor,
    random: VecDeque<BlockCursor>,
}

/// Decrypting reader over an archive's content stream.
pub struct EncryptedReader<R> {
    pool: Mutex<Pool<R>>,
    size: u64,
}

impl<R: Read + Seek> EncryptedReader<R> {
    /// `content_start` is the first ciphertext byte of block 0; nothing at or
    /// beyond `raw_limit` belongs to the stream.
    pub fn new(
        input: R,
        cipher: Cipher,
        block_size: usize,
        content_start: u64,
        raw_limit: u64,
    ) -> ArcaResult<Self> {
        let mut source = BlockSource::new(input, cipher, block_size, content_start, raw_limit)?;
        let size = source.logical_size()?;
        Ok(Self {
            pool: Mutex::new(Pool {
                source,
                sequential: BlockCursor::default(),
                random: VecDeque::with_capacity(POOL_SIZE),
            }),
            size,
        })
    }

    fn lock(&self) -> ArcaResult<MutexGuard<'_, Pool<R>>> {
        self.pool
            .lock()
            .map_err(|_| ArcaError::Other(anyhow::anyhow!("content pool lock poisoned")))
    }

    /// Give back the raw archive source.
    pub fn into_inner(self) -> ArcaResult<R> {
        let pool = self
            .pool
            .into_inner()
            .map_err(|_| ArcaError::Other(anyhow::anyhow!("content pool lock poisoned")))?;
        Ok(pool.source.into_inner())
    }

    /// Logical (plaintext) size of the content stream.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn position(&self) -> ArcaResult<u64> {
        Ok(self.lock()?.sequential.position())
    }

    /// Move the sequential cursor. Positions past the end are a format error.
    pub fn set_position(&self, position: u64) -> ArcaResult<()> {
        if position > self.size {
            return Err(ArcaError::Format);
        }
        self.lock()?.sequential.set_position(position);
        Ok(())
    }

    /// Read from the sequential cursor.
    pub fn read_seq(&self, buf: &mut [u8]) -> ArcaResult<usize> {
        let mut guard = self.lock()?;
        let pool = &mut *guard;
        pool.sequential.read(&mut pool.source, buf)
    }

    /// Read as many bytes as available at `position` into `buf`, through a
    /// pooled cursor. Leaves the sequential cursor untouched.
    pub fn read_at(&self, position: u64, buf: &mut [u8]) -> ArcaResult<usize> {
        if position > self.size {
            return Err(ArcaError::Format);
        }
        let mut guard = self.lock()?;
        let pool = &mut *guard;
        let block_size = pool.source.block_size();

        let hit = pool
            .random
            .iter()
            .position(|c| c.position() == position || c.holds(position, block_size));
        let mut cursor = match hit {
            Some(i) => pool.random.remove(i).unwrap_or_default(),
            None if pool.random.len() >= POOL_SIZE => pool.random.pop_front().unwrap_or_default(),
            None => BlockCursor::default(),
        };
        cursor.set_position(position);

        let mut total = 0;
        let result = loop {
            if total == buf.len() {
                break Ok(total);
            }
            match cursor.read(&mut pool.source, &mut buf[total..]) {
                Ok(0) => break Ok(total),
                Ok(n) => total += n,
                Err(e) => break Err(e),
            }
        };
        pool.random.push_back(cursor);
        result
    }

    /// A `Read` adapter that reads through `read_at` from `position` onward.
    pub fn reader_at(&self, position: u64) -> PositionedReader<'_, R> {
        PositionedReader {
            reader: self,
            position,
        }
    }
}

/// Sequential reads through a shared reference, like `&File`.
impl<R: Read + Seek> Read for &EncryptedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_seq(buf).map_err(io::Error::other)
    }
}

/// Reader over the content stream that owns its own position.
pub struct PositionedReader<'a, R> {
    reader: &'a EncryptedReader<R>,
    position: u64,
}

impl<R> PositionedReader<'_, R> {
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl<R: Read + Seek> Read for PositionedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self
            .reader
            .read_at(self.position, buf)
            .map_err(io::Error::other)?;
        self.position += n as u64;
        Ok(n)
    }
}
