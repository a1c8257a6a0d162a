//! Archive writer: envelope, entries, signed filelist trailer.

use std::io::{Read, Write};

use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use arca_core::{ArcaResult, Tag, WireWrite};
use arca_crypto::{write_padding, KeyStore};

use crate::block::BlockWriter;
use crate::content::{write_entry, EntryError, EntrySummary};
use crate::envelope::seal_envelope;
use crate::filelist::deflate;
use crate::format::ArchiveFormat;

/// Streams a new archive into `out`.
///
/// Entries go in one after another; the filelist referring to them is
/// handed to [`ArchiveWriter::finish`] last.
pub struct ArchiveWriter<W: Write> {
    stream: BlockWriter<W>,
    headers: Vec<u8>,
    padding3: usize,
    entries: usize,
}

impl<W: Write> ArchiveWriter<W> {
    /// Write the envelope for `slots` and open the content stream.
    pub fn create<K: KeyStore + ?Sized>(
        mut out: W,
        keys: &K,
        format: ArchiveFormat,
        slots: &[String],
    ) -> ArcaResult<Self> {
        let block_size = format.file_format().block_size();
        let envelope = seal_envelope(keys, format, slots, block_size)?;
        out.write_all(&envelope.bytes)?;
        let mut stream = BlockWriter::new(out, envelope.content_cipher, block_size);
        // Keeps every entry off logical offset 0, which means "not in this archive".
        write_padding(&mut stream)?;
        Ok(Self {
            stream,
            headers: envelope.headers,
            padding3: envelope.paddings.padding3,
            entries: 0,
        })
    }

    /// Logical position in the content stream.
    pub fn position(&self) -> u64 {
        self.stream.position()
    }

    /// Append one entry. Returns its logical offset and summary.
    pub fn write_entry<R: Read>(
        &mut self,
        source: R,
        compress: bool,
    ) -> Result<(u64, EntrySummary), EntryError> {
        let offset = self.stream.position();
        let summary = write_entry(&mut self.stream, source, compress)?;
        self.entries += 1;
        Ok((offset, summary))
    }

    /// Append the signed filelist trailer and close the archive.
    pub fn finish<K: KeyStore + ?Sized>(self, keys: &K, filelist: &[u8]) -> ArcaResult<W> {
        let gz = deflate(filelist)?;
        let out = close_stream(self.stream, keys, &self.headers, &gz, self.padding3)?;
        debug!(entries = self.entries, filelist_bytes = gz.len(), "archive closed");
        Ok(out)
    }
}

/// Write the filelist trailer for `gz` at the current position, signed over
/// the recipient slots `headers`, then seal the stream and add padding3.
pub(crate) fn close_stream<W: Write, K: KeyStore + ?Sized>(
    mut stream: BlockWriter<W>,
    keys: &K,
    headers: &[u8],
    gz: &[u8],
    padding3: usize,
) -> ArcaResult<W> {
    let digest = Sha256::digest(gz);
    let signature = keys.sign(&[headers, digest.as_slice()].concat())?;

    let offset = stream.position();
    stream.write_tag(Tag::FilelistGz)?;
    stream.write_u32_bytes(gz)?;
    stream.write_u8_bytes(&digest)?;
    stream.write_u32_bytes(&signature)?;
    stream.write_u64_be(offset)?;
    let size = stream.position();

    let mut out = stream.finish()?;
    let mut tail = vec![0u8; padding3];
    rand::thread_rng().fill_bytes(&mut tail);
    out.write_all(&tail)?;
    out.flush()?;
    debug!(content_bytes = size, filelist_offset = offset, "content stream sealed");
    Ok(out)
}
