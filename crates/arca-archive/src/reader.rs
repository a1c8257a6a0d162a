//! Archive reader
//!
//! Opening an archive decodes the envelope, then locates the filelist
//! trailer through the 8-byte back-pointer at the end of the content stream:
//!
//! ```text
//! ... entries ... [Tag::FilelistGz][u32-bytes gzip][u8-bytes SHA-256(gzip)]
//!                 [u32-bytes RSA-SHA256(slots | digest)][u64 BE offset of FilelistGz]
//! ```
//!
//! The trailer signature binds the filelist to the recipient slots it was
//! written with.

use std::io::{Read, Seek, Write};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use arca_core::{ArcaError, ArcaResult, Info, Tag, WireRead};
use arca_crypto::KeyStore;
use rsa::RsaPublicKey;

use crate::content::{compare_entry, copy_entry, digest_entry, EntrySummary};
use crate::envelope::open_envelope;
use crate::filelist::{decode_filelist, decode_filetree, inflate, Filelist};
use crate::format::{ArchiveFormat, SIG_SIZE};
use crate::pool::EncryptedReader;

/// Bound on the compressed filelist.
const MAX_FILELIST_GZ_LEN: usize = 64 * 1024 * 1024;

/// Summary of an opened archive, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveInfo {
    pub version: u8,
    pub iterations: u32,
    pub slot_count: usize,
    pub slot_index: usize,
    pub signer: String,
    pub block_size: usize,
    pub content_size: u64,
    pub filelist_offset: u64,
}

pub struct ArchiveReader<R> {
    format: ArchiveFormat,
    slot_count: usize,
    slot_index: usize,
    signer: String,
    block_size: usize,
    content: EncryptedReader<R>,
    filelist_offset: u64,
    filelist: Vec<u8>,
}

/// Locate and check the filelist trailer. Returns its offset and the
/// gzipped filelist.
pub(crate) fn read_trailer<R: Read + Seek>(
    content: &EncryptedReader<R>,
    keys: &(impl KeyStore + ?Sized),
    signer_key: &RsaPublicKey,
    headers: &[u8],
) -> ArcaResult<(u64, Vec<u8>)> {
    let size = content.size();
    let end = size.checked_sub(8).ok_or(ArcaError::Format)?;
    let offset = content.reader_at(end).read_u64_be()?;
    if offset == 0 || offset >= end {
        return Err(ArcaError::Format);
    }
    let limit = ((end - offset) as usize).min(MAX_FILELIST_GZ_LEN);
    let mut r = content.reader_at(offset);
    r.expect_tag(Tag::FilelistGz)?;
    let gz = r.read_u32_bytes(limit)?;
    let digest = r.read_u8_bytes()?;
    if Sha256::digest(&gz).as_slice() != digest.as_slice() {
        return Err(ArcaError::Format);
    }
    let signature = r.read_u32_bytes(SIG_SIZE)?;
    if r.position() != end {
        return Err(ArcaError::Format);
    }
    let signed = [headers, digest.as_slice()].concat();
    if !keys.verify(signer_key, &signed, &signature) {
        return Err(ArcaError::Format);
    }
    Ok((offset, gz))
}

impl<R: Read + Seek> ArchiveReader<R> {
    /// Decode the envelope with the local key pair and load the filelist.
    pub fn open<K: KeyStore + ?Sized>(mut input: R, keys: &K) -> ArcaResult<Self> {
        let envelope = open_envelope(&mut input, keys)?;
        let content = EncryptedReader::new(
            input,
            envelope.content_cipher,
            envelope.block_size,
            envelope.content_start,
            envelope.raw_limit,
        )?;
        let (filelist_offset, gz) =
            read_trailer(&content, keys, &envelope.signer_key, &envelope.headers)?;
        let filelist = inflate(&gz)?;
        debug!(
            version = envelope.format.version(),
            signer = %envelope.signer,
            content_size = content.size(),
            "opened archive"
        );
        Ok(Self {
            format: envelope.format,
            slot_count: envelope.slot_count,
            slot_index: envelope.slot_index,
            signer: envelope.signer,
            block_size: envelope.block_size,
            content,
            filelist_offset,
            filelist,
        })
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    pub fn info(&self) -> ArchiveInfo {
        ArchiveInfo {
            version: self.format.version(),
            iterations: self.format.iterations(),
            slot_count: self.slot_count,
            slot_index: self.slot_index,
            signer: self.signer.clone(),
            block_size: self.block_size,
            content_size: self.content.size(),
            filelist_offset: self.filelist_offset,
        }
    }

    /// Flat filelist, `""` being the root.
    pub fn filelist(&self) -> ArcaResult<Filelist> {
        decode_filelist(&self.filelist)
    }

    /// Nested filetree as JSON.
    pub fn filetree(&self) -> ArcaResult<serde_json::Value> {
        decode_filetree(&self.filelist)
    }

    /// Decrypted content stream.
    pub fn content(&self) -> &EncryptedReader<R> {
        &self.content
    }

    fn entry_offset(&self, info: &Info) -> ArcaResult<u64> {
        if info.is_dir() || info.is_reused() {
            return Err(ArcaError::InvalidArgument(
                "entry has no content in this archive".into(),
            ));
        }
        if info.offset >= self.filelist_offset {
            return Err(ArcaError::Format);
        }
        Ok(info.offset)
    }

    fn check(info: &Info, summary: &EntrySummary) -> ArcaResult<()> {
        let size_ok = summary.size as i64 == info.size;
        let checksum_ok = info
            .checksum
            .as_ref()
            .is_none_or(|expected| *expected == summary.checksum);
        if !size_ok || !checksum_ok {
            return Err(ArcaError::Format);
        }
        Ok(())
    }

    /// Decrypt the entry described by `info` into `out`, checking its size
    /// and checksum. Bytes may already be in `out` when this fails.
    pub fn copy_entry<W: Write + ?Sized>(&self, info: &Info, out: &mut W) -> ArcaResult<EntrySummary> {
        let mut r = self.content.reader_at(self.entry_offset(info)?);
        let summary = copy_entry(&mut r, out)?;
        Self::check(info, &summary)?;
        Ok(summary)
    }

    /// Decrypt the entry described by `info` into memory.
    pub fn read_entry(&self, info: &Info) -> ArcaResult<Vec<u8>> {
        let mut out = Vec::with_capacity(info.size.max(0) as usize);
        self.copy_entry(info, &mut out)?;
        Ok(out)
    }

    /// Decrypt and check the entry without keeping its bytes.
    pub fn verify_entry(&self, info: &Info) -> ArcaResult<()> {
        let mut r = self.content.reader_at(self.entry_offset(info)?);
        let summary = digest_entry(&mut r)?;
        Self::check(info, &summary)
    }

    /// Whether `other` holds exactly the bytes of the entry.
    pub fn compare_entry<O: Read + ?Sized>(&self, info: &Info, other: &mut O) -> ArcaResult<bool> {
        let mut r = self.content.reader_at(self.entry_offset(info)?);
        compare_entry(&mut r, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ensure_slots;
    use crate::filelist::FilelistBuilder;
    use crate::writer::ArchiveWriter;
    use arca_crypto::PemKeyStore;
    use rsa::RsaPrivateKey;
    use std::io::Cursor;
    use std::sync::OnceLock;

    fn keys() -> PemKeyStore {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        let key = KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap());
        PemKeyStore::in_memory(key.clone())
    }

    fn noise(len: u32) -> Vec<u8> {
        (0..len).map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8).collect()
    }

    struct Built {
        bytes: Vec<u8>,
        files: Vec<(String, Vec<u8>)>,
    }

    fn build(format: ArchiveFormat) -> Built {
        let keys = keys();
        let slots = ensure_slots(&[], 2).unwrap();
        let mut w = ArchiveWriter::create(Vec::new(), &keys, format, &slots).unwrap();
        let files = vec![
            ("a.txt".to_string(), b"alpha".repeat(10)),
            ("b.html".to_string(), b"<b>bravo</b>".repeat(30_000)),
            ("c.bin".to_string(), noise(200_000)),
            ("empty".to_string(), Vec::new()),
        ];
        let mut list = FilelistBuilder::new();
        list.dir("d", 5).unwrap();
        for (i, (name, data)) in files.iter().enumerate() {
            let (offset, summary) = w.write_entry(&data[..], name.ends_with(".html")).unwrap();
            assert!(offset > 0);
            let info = Info::file(100 + i as u64, summary.size, offset, Some(summary.checksum));
            list.file(name, &info).unwrap();
        }
        list.dir_end().unwrap();
        let bytes = w.finish(&keys, &list.finish().unwrap()).unwrap();
        Built { bytes, files }
    }

    fn open(bytes: &[u8]) -> ArcaResult<ArchiveReader<Cursor<Vec<u8>>>> {
        ArchiveReader::open(Cursor::new(bytes.to_vec()), &keys())
    }

    #[test]
    fn test_write_then_read() {
        for format in [ArchiveFormat::V10, ArchiveFormat::V11] {
            let built = build(format);
            let reader = open(&built.bytes).unwrap();
            let info = reader.info();
            assert_eq!(info.version, format.version());
            assert_eq!(info.slot_count, 2);
            assert_eq!(info.signer, "#self");

            let list = reader.filelist().unwrap();
            assert_eq!(list.len(), 1 + 1 + built.files.len());
            for (name, data) in &built.files {
                let entry = &list[&format!("d/{name}")];
                assert_eq!(reader.read_entry(entry).unwrap(), *data, "{name}");
                reader.verify_entry(entry).unwrap();
                assert!(reader.compare_entry(entry, &mut &data[..]).unwrap());
            }
            let tree = reader.filetree().unwrap();
            assert_eq!(tree["files"]["d"]["files"]["a.txt"]["length"], 50);
        }
    }

    #[test]
    fn test_wrong_checksum_is_format_error() {
        let built = build(ArchiveFormat::V11);
        let reader = open(&built.bytes).unwrap();
        let mut entry = reader.filelist().unwrap()["d/a.txt"].clone();
        entry.checksum = Some(vec![0; 32]);
        assert!(reader.read_entry(&entry).unwrap_err().is_format());
        entry.offset = 0;
        assert!(matches!(
            reader.read_entry(&entry),
            Err(ArcaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_trailer_tamper_detected() {
        let built = build(ArchiveFormat::V11);
        let reader = open(&built.bytes).unwrap();
        let offset = reader.info().filelist_offset;
        drop(reader);
        // Flip a byte in the raw region holding the tail of the content
        // stream; the trailer lives there.
        let len = built.bytes.len();
        let mut spoiled = 0;
        for back in [140usize, 200, 300] {
            let mut bad = built.bytes.clone();
            bad[len - back] ^= 0x10;
            if let Err(e) = open(&bad) {
                assert!(e.is_format());
                spoiled += 1;
            }
        }
        // Only trailing padding3 bytes (at most 127) may go unnoticed.
        assert_eq!(spoiled, 3, "trailer at {offset}");
    }

    #[test]
    fn test_content_tamper_detected_on_read() {
        let built = build(ArchiveFormat::V10);
        let reader = open(&built.bytes).unwrap();
        let entry = reader.filelist().unwrap()["d/c.bin"].clone();
        drop(reader);
        // The middle of the file is inside c.bin, away from the last block.
        let mut bad = built.bytes.clone();
        let target = bad.len() / 2;
        bad[target] ^= 0x01;
        let reader = open(&bad).unwrap();
        assert!(reader.read_entry(&entry).unwrap_err().is_format());
        assert!(reader.verify_entry(&entry).unwrap_err().is_format());
        let a = reader.filelist().unwrap()["d/a.txt"].clone();
        assert_eq!(reader.read_entry(&a).unwrap(), b"alpha".repeat(10));
    }
}
