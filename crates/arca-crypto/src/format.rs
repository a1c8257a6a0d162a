//! Content cipher suites
//!
//! Each block of the content stream is encrypted independently under the
//! content key with its own IV. On disk every block is preceded by its IV:
//!
//! ```text
//! V10: [16 IV][AES-CBC/PKCS#7( 16 random | data | SHA-256(random | data) )]
//! V11: [12 IV][AES-GCM( 8 random | data ) | 16 tag]
//! ```
//!
//! V11 authenticates the block index (u64 BE) as associated data, so a block
//! moved to another position fails its tag.
//!
//! A full block of `BLOCK_SIZE` data bytes therefore occupies exactly
//! `BLOCK_SIZE + overhead()` bytes, which is what makes block positions
//! computable without an index.
//!
//! Cipher parameters are serialized as:
//! ```text
//! [Tag::Cipher][u8-bytes keyid placeholder = [0]][V11 only: u8 tag bits][u8-bytes marshalled IV]
//! ```

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

use arca_core::{ArcaError, ArcaResult, OrFormat, Tag, WireRead, WireWrite};

use crate::keys::ContentKey;
use crate::salt::marshal_salt;
use crate::SHA256_SIZE;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Plaintext bytes per content block.
pub const BLOCK_SIZE: usize = 16 * BLOCK_UNIT;

/// Block sizes are stored as a one-byte multiple of this unit.
const BLOCK_UNIT: usize = 4096;

const GCM_TAG_BITS: u8 = 128;

/// A content cipher suite, selected by a one-byte version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// AES-256-CBC with an explicit SHA-256 block sum
    V10,
    /// AES-256-GCM
    V11,
}

impl FileFormat {
    pub fn from_version(version: u8) -> ArcaResult<Self> {
        match version {
            10 => Ok(FileFormat::V10),
            11 => Ok(FileFormat::V11),
            _ => Err(ArcaError::Format),
        }
    }

    pub fn version(self) -> u8 {
        match self {
            FileFormat::V10 => 10,
            FileFormat::V11 => 11,
        }
    }

    pub fn iv_len(self) -> usize {
        match self {
            FileFormat::V10 => 16,
            FileFormat::V11 => 12,
        }
    }

    /// Random plaintext filler at the start of each block.
    pub fn prefix_len(self) -> usize {
        match self {
            FileFormat::V10 => 16,
            FileFormat::V11 => 8,
        }
    }

    /// SHA-256 sum (V10) or GCM tag (V11).
    pub fn sum_len(self) -> usize {
        match self {
            FileFormat::V10 => SHA256_SIZE,
            FileFormat::V11 => (GCM_TAG_BITS / 8) as usize,
        }
    }

    /// Worst-case PKCS#7 expansion.
    pub fn pad_len(self) -> usize {
        match self {
            FileFormat::V10 => 16,
            FileFormat::V11 => 0,
        }
    }

    /// On-disk bytes of a full block beyond its data.
    pub fn overhead(self) -> usize {
        self.iv_len() + self.prefix_len() + self.sum_len() + self.pad_len()
    }

    pub fn block_size(self) -> usize {
        BLOCK_SIZE
    }

    pub fn encode_blocksize(block_size: usize) -> ArcaResult<u8> {
        if block_size == 0 || block_size % BLOCK_UNIT != 0 || block_size / BLOCK_UNIT > 255 {
            return Err(ArcaError::InvalidArgument(format!(
                "block size {block_size} is not encodable"
            )));
        }
        Ok((block_size / BLOCK_UNIT) as u8)
    }

    pub fn decode_blocksize(code: u8) -> ArcaResult<usize> {
        if code == 0 {
            return Err(ArcaError::Format);
        }
        Ok(code as usize * BLOCK_UNIT)
    }

    /// A cipher under `key` with a fresh random IV.
    pub fn create_cipher(self, key: &ContentKey) -> Cipher {
        Cipher {
            format: self,
            key: key.clone(),
            iv: random_iv(self.iv_len()),
        }
    }

    /// A cipher under `key` with a known IV.
    pub fn cipher_with_iv(self, key: &ContentKey, iv: &[u8]) -> ArcaResult<Cipher> {
        if iv.len() != self.iv_len() {
            return Err(ArcaError::Format);
        }
        Ok(Cipher {
            format: self,
            key: key.clone(),
            iv: iv.to_vec(),
        })
    }

    pub fn write_cipher_params<W: Write + ?Sized>(self, out: &mut W, cipher: &Cipher) -> ArcaResult<()> {
        out.write_tag(Tag::Cipher)?;
        out.write_u8_bytes(&[0])?;
        if self == FileFormat::V11 {
            out.write_u8(GCM_TAG_BITS)?;
        }
        out.write_u8_bytes(&marshal_salt(&cipher.iv))
    }

    pub fn read_cipher_params<R: Read + ?Sized>(self, input: &mut R, key: &ContentKey) -> ArcaResult<Cipher> {
        input.expect_tag(Tag::Cipher)?;
        let _keyid = input.read_u8_bytes()?;
        if self == FileFormat::V11 && input.read_u8()? != GCM_TAG_BITS {
            return Err(ArcaError::Format);
        }
        let iv = marshal_salt(&input.read_u8_bytes()?);
        self.cipher_with_iv(key, &iv)
    }

    /// Build and encrypt the plaintext of block `index`
    /// (`random prefix | data [| sum]`).
    pub fn seal_block(self, cipher: &Cipher, index: u64, data: &[u8]) -> ArcaResult<Vec<u8>> {
        let prefix = self.prefix_len();
        let mut plain = vec![0u8; prefix];
        rand::thread_rng().fill_bytes(&mut plain);
        plain.extend_from_slice(data);
        if self == FileFormat::V10 {
            let sum = Sha256::digest(&plain);
            plain.extend_from_slice(&sum);
        }
        cipher.encrypt_bound(&plain, &self.block_aad(index))
    }

    fn block_aad(self, index: u64) -> Vec<u8> {
        match self {
            FileFormat::V10 => Vec::new(),
            FileFormat::V11 => index.to_be_bytes().to_vec(),
        }
    }

    /// Check a decrypted block and return the number of data bytes, which
    /// start at `prefix_len()` in `buffer`.
    pub fn verify_block(self, buffer: &[u8]) -> ArcaResult<usize> {
        let prefix = self.prefix_len();
        match self {
            FileFormat::V10 => {
                let body = buffer
                    .len()
                    .checked_sub(SHA256_SIZE)
                    .filter(|n| *n >= prefix)
                    .or_format()?;
                if Sha256::digest(&buffer[..body]).as_slice() != &buffer[body..] {
                    return Err(ArcaError::Format);
                }
                Ok(body - prefix)
            }
            FileFormat::V11 => buffer.len().checked_sub(prefix).or_format(),
        }
    }

    /// Decrypt and verify block `index`. Returns the data bytes.
    pub fn open_block(self, cipher: &Cipher, index: u64, ciphertext: &[u8]) -> ArcaResult<Vec<u8>> {
        let mut plain = cipher.decrypt_bound(ciphertext, &self.block_aad(index))?;
        let n = self.verify_block(&plain)?;
        let prefix = self.prefix_len();
        plain.truncate(prefix + n);
        plain.drain(..prefix);
        Ok(plain)
    }
}

/// Key and IV of one cipher instance.
#[derive(Clone)]
pub struct Cipher {
    format: FileFormat,
    key: ContentKey,
    iv: Vec<u8>,
}

impl Cipher {
    pub fn format(&self) -> FileFormat {
        self.format
    }

    pub fn key(&self) -> &ContentKey {
        &self.key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Switch to a fresh random IV under the same key.
    pub fn rekey(&mut self) -> ArcaResult<()> {
        let iv = random_iv(self.format.iv_len());
        if iv == self.iv {
            return Err(ArcaError::Other(anyhow::anyhow!("IV repeated on rekey")));
        }
        self.iv = iv;
        Ok(())
    }

    /// Reuse this key with an IV read from the stream.
    pub fn set_iv(&mut self, iv: &[u8]) -> ArcaResult<()> {
        if iv.len() != self.format.iv_len() {
            return Err(ArcaError::Format);
        }
        self.iv.clear();
        self.iv.extend_from_slice(iv);
        Ok(())
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> ArcaResult<Vec<u8>> {
        self.encrypt_bound(plaintext, &[])
    }

    /// Any failure (bad padding, bad tag, wrong length) is a format error.
    pub fn decrypt(&self, ciphertext: &[u8]) -> ArcaResult<Vec<u8>> {
        self.decrypt_bound(ciphertext, &[])
    }

    /// GCM authenticates `aad` with the ciphertext; CBC has no associated data.
    fn encrypt_bound(&self, plaintext: &[u8], aad: &[u8]) -> ArcaResult<Vec<u8>> {
        match self.format {
            FileFormat::V10 => {
                let enc = Aes256CbcEnc::new_from_slices(self.key.as_bytes(), &self.iv)
                    .map_err(|e| anyhow::anyhow!("AES-CBC init failed: {e}"))?;
                Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
            }
            FileFormat::V11 => {
                let gcm = Aes256Gcm::new(self.key.as_bytes().into());
                let ct = gcm
                    .encrypt(Nonce::from_slice(&self.iv), Payload { msg: plaintext, aad })
                    .map_err(|e| anyhow::anyhow!("AES-GCM encryption failed: {e}"))?;
                Ok(ct)
            }
        }
    }

    fn decrypt_bound(&self, ciphertext: &[u8], aad: &[u8]) -> ArcaResult<Vec<u8>> {
        match self.format {
            FileFormat::V10 => {
                let dec = Aes256CbcDec::new_from_slices(self.key.as_bytes(), &self.iv).or_format()?;
                dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext).or_format()
            }
            FileFormat::V11 => {
                let gcm = Aes256Gcm::new(self.key.as_bytes().into());
                gcm.decrypt(Nonce::from_slice(&self.iv), Payload { msg: ciphertext, aad })
                    .or_format()
            }
        }
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher")
            .field("format", &self.format)
            .field("key", &"[REDACTED]")
            .field("iv_len", &self.iv.len())
            .finish()
    }
}

fn random_iv(len: usize) -> Vec<u8> {
    let mut iv = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_content_key;

    const FORMATS: [FileFormat; 2] = [FileFormat::V10, FileFormat::V11];

    #[test]
    fn test_overhead_constants() {
        assert_eq!(FileFormat::V10.overhead(), 16 + 16 + 32 + 16);
        assert_eq!(FileFormat::V11.overhead(), 12 + 8 + 16);
    }

    #[test]
    fn test_full_block_has_fixed_size() {
        let key = generate_content_key();
        for format in FORMATS {
            let cipher = format.create_cipher(&key);
            let data = vec![0x5Au8; BLOCK_SIZE];
            let sealed = format.seal_block(&cipher, 0, &data).unwrap();
            assert_eq!(
                sealed.len() + format.iv_len(),
                BLOCK_SIZE + format.overhead(),
                "{format:?}"
            );
        }
    }

    #[test]
    fn test_empty_block_fits_overhead() {
        let key = generate_content_key();
        for format in FORMATS {
            let cipher = format.create_cipher(&key);
            let sealed = format.seal_block(&cipher, 0, &[]).unwrap();
            assert!(sealed.len() + format.iv_len() <= format.overhead());
            assert!(format.open_block(&cipher, 0, &sealed).unwrap().is_empty());
        }
    }

    #[test]
    fn test_block_roundtrip() {
        let key = generate_content_key();
        for format in FORMATS {
            let cipher = format.create_cipher(&key);
            let data = b"the quick brown fox".repeat(100);
            let sealed = format.seal_block(&cipher, 0, &data).unwrap();
            assert_eq!(format.open_block(&cipher, 0, &sealed).unwrap(), data);
        }
    }

    #[test]
    fn test_block_tamper_detected() {
        let key = generate_content_key();
        for format in FORMATS {
            let cipher = format.create_cipher(&key);
            let mut sealed = format.seal_block(&cipher, 0, &[7u8; 1000]).unwrap();
            sealed[40] ^= 0x80;
            let err = format.open_block(&cipher, 0, &sealed).unwrap_err();
            assert!(err.is_format(), "{format:?}");
        }
    }

    #[test]
    fn test_v11_block_bound_to_index() {
        let key = generate_content_key();
        let cipher = FileFormat::V11.create_cipher(&key);
        let sealed = FileFormat::V11.seal_block(&cipher, 3, b"third block").unwrap();
        assert_eq!(FileFormat::V11.open_block(&cipher, 3, &sealed).unwrap(), b"third block");
        let err = FileFormat::V11.open_block(&cipher, 4, &sealed).unwrap_err();
        assert!(err.is_format());
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = generate_content_key();
        let other = generate_content_key();
        for format in FORMATS {
            let cipher = format.create_cipher(&key);
            let sealed = format.seal_block(&cipher, 0, b"secret").unwrap();
            let wrong = format.cipher_with_iv(&other, cipher.iv()).unwrap();
            assert!(format.open_block(&wrong, 0, &sealed).is_err());
        }
    }

    #[test]
    fn test_cipher_params_roundtrip() {
        let key = generate_content_key();
        for format in FORMATS {
            let cipher = format.create_cipher(&key);
            let mut out = Vec::new();
            format.write_cipher_params(&mut out, &cipher).unwrap();
            let expected_len = 1 + 2 + usize::from(format == FileFormat::V11) + 1 + format.iv_len();
            assert_eq!(out.len(), expected_len);

            let read = format.read_cipher_params(&mut &out[..], &key).unwrap();
            assert_eq!(read.iv(), cipher.iv());
        }
    }

    #[test]
    fn test_cipher_params_iv_is_marshalled() {
        let key = generate_content_key();
        let cipher = FileFormat::V10.create_cipher(&key);
        let mut out = Vec::new();
        FileFormat::V10.write_cipher_params(&mut out, &cipher).unwrap();
        assert_eq!(&out[4..], marshal_salt(cipher.iv()).as_slice());
    }

    #[test]
    fn test_cipher_params_bad_tag_length() {
        let key = generate_content_key();
        let cipher = FileFormat::V11.create_cipher(&key);
        let mut out = Vec::new();
        FileFormat::V11.write_cipher_params(&mut out, &cipher).unwrap();
        out[3] = 96;
        let err = FileFormat::V11.read_cipher_params(&mut &out[..], &key).unwrap_err();
        assert!(err.is_format());
    }

    #[test]
    fn test_rekey_changes_iv() {
        let key = generate_content_key();
        let mut cipher = FileFormat::V11.create_cipher(&key);
        let before = cipher.iv().to_vec();
        cipher.rekey().unwrap();
        assert_ne!(cipher.iv(), before.as_slice());
    }

    #[test]
    fn test_blocksize_codec() {
        assert_eq!(FileFormat::encode_blocksize(BLOCK_SIZE).unwrap(), 16);
        assert_eq!(FileFormat::decode_blocksize(16).unwrap(), BLOCK_SIZE);
        assert!(FileFormat::encode_blocksize(1000).is_err());
        assert!(FileFormat::encode_blocksize(256 * BLOCK_UNIT).is_err());
        assert!(FileFormat::decode_blocksize(0).unwrap_err().is_format());
    }

    #[test]
    fn test_unknown_version_rejected() {
        assert!(FileFormat::from_version(9).unwrap_err().is_format());
        assert!(FileFormat::from_version(12).unwrap_err().is_format());
        assert_eq!(FileFormat::from_version(11).unwrap(), FileFormat::V11);
    }
}
