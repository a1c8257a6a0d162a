//! Seekable block-cipher content stream
//!
//! The content stream is cut into blocks of `block_size` plaintext bytes.
//! Every block is sealed under the same content key with its own IV, and the
//! IV is written (salt-marshalled) right before the block:
//!
//! ```text
//! [IV 0][block 0][IV 1][block 1] ... [IV n][block n (partial)]
//!       ^ content_start
//! block k begins at content_start + k * (block_size + overhead)
//! ```
//!
//! The first IV is emitted by the envelope writer, so `content_start` is the
//! first ciphertext byte. Every block except the last holds exactly
//! `block_size` bytes, which makes the position of any block computable.

use std::io::{self, Read, Seek, SeekFrom, Write};

use arca_core::{ArcaError, ArcaResult, OrFormat};
use arca_crypto::{marshal_salt, Cipher, FileFormat};

/// Encrypting writer. Logical positions count plaintext bytes.
pub struct BlockWriter<W: Write> {
    out: W,
    cipher: Cipher,
    block_size: usize,
    pending: Vec<u8>,
    index: u64,
    position: u64,
}

impl<W: Write> BlockWriter<W> {
    /// `cipher` carries the IV of block 0, which must already be written to `out`.
    pub fn new(out: W, cipher: Cipher, block_size: usize) -> Self {
        Self::at_block(out, cipher, block_size, 0)
    }

    /// Continue a stream at the start of block `index`, whose IV (from
    /// `cipher`) must already be written to `out`.
    pub fn at_block(out: W, cipher: Cipher, block_size: usize, index: u64) -> Self {
        Self {
            out,
            cipher,
            block_size,
            pending: Vec::with_capacity(block_size),
            index,
            position: index * block_size as u64,
        }
    }

    /// Plaintext bytes written so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn seal(&mut self) -> ArcaResult<()> {
        let format = self.cipher.format();
        let sealed = format.seal_block(&self.cipher, self.index, &self.pending)?;
        self.out.write_all(&sealed)?;
        self.pending.clear();
        Ok(())
    }

    /// Seal the current full block and open the next one under a fresh IV.
    fn next_block(&mut self) -> ArcaResult<()> {
        self.seal()?;
        self.index += 1;
        self.cipher.rekey()?;
        self.out.write_all(&marshal_salt(self.cipher.iv()))?;
        Ok(())
    }

    /// Seal the last block and hand back the underlying writer.
    pub fn finish(mut self) -> ArcaResult<W> {
        self.seal()?;
        self.out.flush()?;
        Ok(self.out)
    }
}

impl<W: Write> Write for BlockWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if self.pending.len() == self.block_size {
            self.next_block().map_err(io::Error::other)?;
        }
        let n = data.len().min(self.block_size - self.pending.len());
        self.pending.extend_from_slice(&data[..n]);
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Random-access decryptor over the raw archive bytes.
pub(crate) struct BlockSource<R> {
    input: R,
    cipher: Cipher,
    block_size: usize,
    content_start: u64,
    raw_limit: u64,
    scratch: Vec<u8>,
}

impl<R: Read + Seek> BlockSource<R> {
    pub(crate) fn new(
        input: R,
        cipher: Cipher,
        block_size: usize,
        content_start: u64,
        raw_limit: u64,
    ) -> ArcaResult<Self> {
        let iv_len = cipher.format().iv_len() as u64;
        if content_start < iv_len || raw_limit < content_start {
            return Err(ArcaError::Format);
        }
        Ok(Self {
            input,
            cipher,
            block_size,
            content_start,
            raw_limit,
            scratch: Vec::new(),
        })
    }

    fn format(&self) -> FileFormat {
        self.cipher.format()
    }

    fn stride(&self) -> u64 {
        (self.block_size + self.format().overhead()) as u64
    }

    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn into_inner(self) -> R {
        self.input
    }

    /// Decrypt block `index` into `out`. Returns `false` past the last block.
    pub(crate) fn load(&mut self, index: u64, out: &mut Vec<u8>) -> ArcaResult<bool> {
        let format = self.format();
        let iv_len = format.iv_len();
        let stride = self.stride();
        let iv_pos = index
            .checked_mul(stride)
            .and_then(|off| (self.content_start - iv_len as u64).checked_add(off))
            .or_format()?;
        if iv_pos >= self.raw_limit {
            return Ok(false);
        }
        let avail = (self.raw_limit - iv_pos).min(stride) as usize;
        if avail < format.overhead() - format.pad_len() {
            return Err(ArcaError::Format);
        }

        self.scratch.resize(avail, 0);
        self.input.seek(SeekFrom::Start(iv_pos)).or_format()?;
        self.input.read_exact(&mut self.scratch).or_format()?;

        let iv = marshal_salt(&self.scratch[..iv_len]);
        self.cipher.set_iv(&iv)?;
        let data = format.open_block(&self.cipher, index, &self.scratch[iv_len..])?;
        let last = (avail as u64) < stride;
        if data.len() > self.block_size || (!last && data.len() != self.block_size) {
            return Err(ArcaError::Format);
        }
        *out = data;
        Ok(true)
    }

    /// Plaintext length of the whole stream, derived from the raw length.
    pub(crate) fn logical_size(&mut self) -> ArcaResult<u64> {
        let iv_len = self.format().iv_len() as u64;
        let raw = self.raw_limit - (self.content_start - iv_len);
        let stride = self.stride();
        let full = raw / stride;
        if raw % stride == 0 {
            if full == 0 {
                return Err(ArcaError::Format);
            }
            return Ok(full * self.block_size as u64);
        }
        let mut last = Vec::new();
        if !self.load(full, &mut last)? {
            return Err(ArcaError::Format);
        }
        Ok(full * self.block_size as u64 + last.len() as u64)
    }
}

/// One decrypted block plus a logical read position.
#[derive(Default)]
pub(crate) struct BlockCursor {
    index: Option<u64>,
    data: Vec<u8>,
    position: u64,
}

impl BlockCursor {
    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    pub(crate) fn set_position(&mut self, position: u64) {
        self.position = position;
    }

    /// Whether `position` is served by the block already in memory.
    pub(crate) fn holds(&self, position: u64, block_size: usize) -> bool {
        match self.index {
            Some(index) => {
                let start = index * block_size as u64;
                position >= start && position < start + self.data.len() as u64
            }
            None => false,
        }
    }

    /// Read at the cursor position, loading blocks as needed. Returns 0 at
    /// the end of the stream.
    pub(crate) fn read<R: Read + Seek>(
        &mut self,
        source: &mut BlockSource<R>,
        buf: &mut [u8],
    ) -> ArcaResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let block_size = source.block_size();
        if !self.holds(self.position, block_size) {
            let index = self.position / block_size as u64;
            if !source.load(index, &mut self.data)? {
                self.index = None;
                return Ok(0);
            }
            self.index = Some(index);
            if !self.holds(self.position, block_size) {
                return Ok(0);
            }
        }
        let start = self.index.unwrap_or(0) * block_size as u64;
        let offset = (self.position - start) as usize;
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        self.position += n as u64;
        Ok(n)
    }
}
