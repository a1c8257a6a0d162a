//! Forwarding: re-address an existing archive to a new list of recipients.
//!
//! The content key and every content block in front of the one holding the
//! filelist trailer are kept byte for byte, so entry offsets stay valid. The
//! envelope is sealed again for the new slots and signed by `#self`. The
//! block holding the trailer and everything after it are re-encrypted under
//! fresh IVs, with the trailer signed over the new slots.

use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::debug;

use arca_core::{ArcaError, ArcaResult};
use arca_crypto::{marshal_salt, KeyStore};

use crate::block::BlockWriter;
use crate::envelope::{open_envelope, seal_envelope_with};
use crate::pool::EncryptedReader;
use crate::reader::read_trailer;
use crate::writer::close_stream;

/// Write to `out` a copy of the archive in `input` addressed to `slots`
/// (see [`ensure_slots`](crate::ensure_slots)). `keys` must be able to open
/// the archive.
pub fn forward_archive<R, W, K>(mut input: R, mut out: W, keys: &K, slots: &[String]) -> ArcaResult<W>
where
    R: Read + Seek,
    W: Write,
    K: KeyStore + ?Sized,
{
    let envelope = open_envelope(&mut input, keys)?;
    let format = envelope.format;
    let block_size = envelope.block_size;
    let content_start = envelope.content_start;
    let content = EncryptedReader::new(
        input,
        envelope.content_cipher.clone(),
        block_size,
        content_start,
        envelope.raw_limit,
    )?;
    let (filelist_offset, gz) =
        read_trailer(&content, keys, &envelope.signer_key, &envelope.headers)?;

    // Block holding the trailer tag, and the entry bytes it carries before it.
    let first = filelist_offset / block_size as u64;
    let head_start = first * block_size as u64;
    let mut head = vec![0u8; (filelist_offset - head_start) as usize];
    if content.read_at(head_start, &mut head)? != head.len() {
        return Err(ArcaError::Format);
    }
    let mut input = content.into_inner()?;

    let mut cipher = envelope.content_cipher;
    if first == 0 {
        // Block 0 is rewritten, so the envelope announces a new IV for it.
        cipher.rekey()?;
    }
    let sealed = seal_envelope_with(keys, format, slots, block_size, cipher.clone())?;
    out.write_all(&sealed.bytes)?;
    if first > 0 {
        let iv_len = format.file_format().iv_len() as u64;
        let stride = (block_size + format.file_format().overhead()) as u64;
        let kept = first * stride - iv_len;
        input.seek(SeekFrom::Start(content_start))?;
        if io::copy(&mut (&mut input).take(kept), &mut out)? != kept {
            return Err(ArcaError::Format);
        }
        cipher.rekey()?;
        out.write_all(&marshal_salt(cipher.iv()))?;
    }

    let mut stream = BlockWriter::at_block(out, cipher, block_size, first);
    stream.write_all(&head)?;
    let out = close_stream(stream, keys, &sealed.headers, &gz, sealed.paddings.padding3)?;
    debug!(
        slots = slots.len(),
        kept_blocks = first,
        filelist_offset,
        "forwarded archive"
    );
    Ok(out)
}
