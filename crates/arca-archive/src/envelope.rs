//! Recipient envelope
//!
//! ```text
//! [slot 0] .. [slot n-1]      512 bytes each: RSA(header) followed by random fill
//! [padding1]                  random bytes
//! [eeprefix]                  AES(key1){ padding | u32-bytes signed | padding }
//! [padding2]                  random bytes
//! [blockIV]                   marshalled IV of content block 0
//!
//! header  = padding | MAGIC | u8 version | u8 slot count | u32 eeprefix len
//!           | padding sizes | u8-bytes keysig | u8-bytes key1 | cipher1 params
//!           | SHA-256(all of the above)
//! signed  = u32-bytes prefix | u32-bytes RSA-SHA256(prefix) by #self
//! prefix  = padding | u8 blocksize code | u8-bytes content key | content cipher params
//! ```
//!
//! `keysig` is the SHA-256 of the signer's SPKI public key, which lets a
//! reader pick the verification key without trying all of them.
//!
//! A reader does not know which slot is addressed to it, so it tries each of
//! the first [`MAX_RECIPIENT_SLOTS`] slots with its private key. Every
//! failure past that point is reported as the same format error.

use std::io::{Read, Seek, SeekFrom};

use rand::RngCore;
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use tracing::debug;

use arca_core::{ArcaError, ArcaResult, OrFormat, WireRead, WireWrite};
use arca_crypto::keystore::key_digest;
use arca_crypto::{
    marshal_salt, read_padding, write_padding, Cipher, ContentKey, FileFormat, KeyStore, SELF_ALIAS,
};

use crate::format::{ArchiveFormat, PaddingSizes, MAGIC, MAX_RECIPIENT_SLOTS, SIG_SIZE, SLOT_SIZE};

const DIGEST_SIZE: usize = 32;

/// Bound on the encrypted prefix length a reader accepts.
const MAX_EEPREFIX_LEN: usize = 16 * 1024;

/// Bound on the signed prefix itself.
const MAX_PREFIX_LEN: usize = 4 * 1024;

/// Pad the recipient list to at least `min_slots` by repeating its first
/// alias; an empty list addresses the archive to `#self` only.
pub fn ensure_slots(recipients: &[String], min_slots: usize) -> ArcaResult<Vec<String>> {
    let mut slots: Vec<String> = if recipients.is_empty() {
        vec![SELF_ALIAS.to_string()]
    } else {
        recipients.to_vec()
    };
    while slots.len() < min_slots.min(MAX_RECIPIENT_SLOTS) {
        let first = slots[0].clone();
        slots.push(first);
    }
    if slots.len() > MAX_RECIPIENT_SLOTS {
        return Err(ArcaError::InvalidArgument(format!(
            "{} recipients, at most {MAX_RECIPIENT_SLOTS} supported",
            slots.len()
        )));
    }
    Ok(slots)
}

/// Output of [`seal_envelope`].
pub struct SealedEnvelope {
    /// Everything up to and including the marshalled block IV.
    pub bytes: Vec<u8>,
    /// The recipient slots, covered by the trailer signature.
    pub headers: Vec<u8>,
    /// Content cipher, holding the IV of block 0.
    pub content_cipher: Cipher,
    pub paddings: PaddingSizes,
}

struct Header {
    format: ArchiveFormat,
    slot_count: usize,
    eeprefix_len: usize,
    paddings: PaddingSizes,
    keysig: Vec<u8>,
    cipher1: Cipher,
}

fn encode_header(header: &Header) -> ArcaResult<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.write_u8(header.format.version())?;
    out.write_u8(header.slot_count as u8)?;
    out.write_u32_be(header.eeprefix_len as u32)?;
    header.format.write_paddings(&mut out, header.paddings)?;
    out.write_u8_bytes(&header.keysig)?;
    out.write_u8_bytes(header.cipher1.key().as_bytes())?;
    header
        .format
        .file_format()
        .write_cipher_params(&mut out, &header.cipher1)?;
    Ok(out)
}

fn decode_header(plain: &[u8]) -> ArcaResult<Header> {
    let body_len = plain.len().checked_sub(DIGEST_SIZE).or_format()?;
    let (body, digest) = plain.split_at(body_len);
    if Sha256::digest(body).as_slice() != digest {
        return Err(ArcaError::Format);
    }
    let mut r = body;
    read_padding(&mut r)?;
    if r.read_bytes(MAGIC.len())? != MAGIC {
        return Err(ArcaError::Format);
    }
    let format = ArchiveFormat::from_version(r.read_u8()?)?;
    let slot_count = r.read_u8()? as usize;
    if slot_count == 0 || slot_count > MAX_RECIPIENT_SLOTS {
        return Err(ArcaError::Format);
    }
    let eeprefix_len = r.read_u32_be()? as usize;
    if eeprefix_len > MAX_EEPREFIX_LEN {
        return Err(ArcaError::Format);
    }
    let paddings = format.read_paddings(&mut r)?;
    let keysig = r.read_u8_bytes()?;
    let key1 = ContentKey::from_slice(&r.read_u8_bytes()?)?;
    let cipher1 = format.file_format().read_cipher_params(&mut r, &key1)?;
    if !r.is_empty() {
        return Err(ArcaError::Format);
    }
    Ok(Header {
        format,
        slot_count,
        eeprefix_len,
        paddings,
        keysig,
        cipher1,
    })
}

/// RSA-encrypt `header` for `alias` into a random-filled slot.
fn seal_slot<K: KeyStore + ?Sized>(keys: &K, alias: &str, header: &[u8]) -> ArcaResult<Vec<u8>> {
    let mut plain = Vec::with_capacity(header.len() + 96);
    write_padding(&mut plain)?;
    plain.extend_from_slice(header);
    let digest = Sha256::digest(&plain);
    plain.extend_from_slice(&digest);
    let sealed = keys.encrypt_for(alias, &plain)?;
    if sealed.len() > SLOT_SIZE {
        return Err(ArcaError::KeyStore(format!("key of {alias} does not fit a slot")));
    }
    let mut slot = vec![0u8; SLOT_SIZE];
    rand::thread_rng().fill_bytes(&mut slot);
    slot[..sealed.len()].copy_from_slice(&sealed);
    Ok(slot)
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Build the envelope of a new archive addressed to `slots`
/// (see [`ensure_slots`]), signed by `#self`.
pub fn seal_envelope<K: KeyStore + ?Sized>(
    keys: &K,
    format: ArchiveFormat,
    slots: &[String],
    block_size: usize,
) -> ArcaResult<SealedEnvelope> {
    let content_key = keys.generate_aes_key();
    let content_cipher = format.file_format().create_cipher(&content_key);
    seal_envelope_with(keys, format, slots, block_size, content_cipher)
}

/// Like [`seal_envelope`] but for an existing content stream: `content_cipher`
/// holds its key and the IV of block 0.
pub fn seal_envelope_with<K: KeyStore + ?Sized>(
    keys: &K,
    format: ArchiveFormat,
    slots: &[String],
    block_size: usize,
    content_cipher: Cipher,
) -> ArcaResult<SealedEnvelope> {
    if slots.is_empty() || slots.len() > MAX_RECIPIENT_SLOTS {
        return Err(ArcaError::InvalidArgument(format!(
            "slot count {} outside [1, {MAX_RECIPIENT_SLOTS}]",
            slots.len()
        )));
    }
    let file_format = format.file_format();
    if content_cipher.format() != file_format {
        return Err(ArcaError::InvalidArgument(format!(
            "content cipher does not match archive version {}",
            format.version()
        )));
    }
    let key1 = keys.generate_aes_key();
    let cipher1 = file_format.create_cipher(&key1);

    let mut prefix = Vec::new();
    write_padding(&mut prefix)?;
    prefix.write_u8(FileFormat::encode_blocksize(block_size)?)?;
    prefix.write_u8_bytes(content_cipher.key().as_bytes())?;
    file_format.write_cipher_params(&mut prefix, &content_cipher)?;
    let signature = keys.sign(&prefix)?;

    let mut signed = Vec::new();
    signed.write_u32_bytes(&prefix)?;
    signed.write_u32_bytes(&signature)?;

    let mut inner = Vec::new();
    write_padding(&mut inner)?;
    inner.write_u32_bytes(&signed)?;
    write_padding(&mut inner)?;
    let eeprefix = cipher1.encrypt(&inner)?;

    let paddings = PaddingSizes::random();
    let keysig = key_digest(&keys.public_key(SELF_ALIAS)?)?;
    let header = encode_header(&Header {
        format,
        slot_count: slots.len(),
        eeprefix_len: eeprefix.len(),
        paddings,
        keysig: keysig.to_vec(),
        cipher1,
    })?;

    let mut headers = Vec::with_capacity(slots.len() * SLOT_SIZE);
    for alias in slots {
        headers.extend_from_slice(&seal_slot(keys, alias, &header)?);
    }

    let mut bytes = headers.clone();
    bytes.extend_from_slice(&random_bytes(paddings.padding1));
    bytes.extend_from_slice(&eeprefix);
    bytes.extend_from_slice(&random_bytes(paddings.padding2));
    bytes.extend_from_slice(&marshal_salt(content_cipher.iv()));
    debug!(
        version = format.version(),
        slots = slots.len(),
        header_len = bytes.len(),
        "sealed envelope"
    );
    Ok(SealedEnvelope {
        bytes,
        headers,
        content_cipher,
        paddings,
    })
}

/// A decoded envelope: everything needed to decrypt the content stream.
pub struct Envelope {
    pub format: ArchiveFormat,
    pub slot_count: usize,
    /// Slot that opened with the local key.
    pub slot_index: usize,
    /// Alias under which the signer's public key is known locally.
    pub signer: String,
    pub signer_key: RsaPublicKey,
    /// The recipient slots, covered by the trailer signature.
    pub headers: Vec<u8>,
    pub content_cipher: Cipher,
    pub block_size: usize,
    /// First ciphertext byte of content block 0.
    pub content_start: u64,
    /// End of the content stream in the raw file.
    pub raw_limit: u64,
}

fn find_signer<K: KeyStore + ?Sized>(keys: &K, keysig: &[u8]) -> ArcaResult<(String, RsaPublicKey)> {
    keys.public_keys()
        .into_iter()
        .find(|(_, key)| key_digest(key).is_ok_and(|d| d.as_slice() == keysig))
        .or_format()
}

fn read_at<R: Read + Seek + ?Sized>(input: &mut R, position: u64, len: usize) -> ArcaResult<Vec<u8>> {
    input.seek(SeekFrom::Start(position)).or_format()?;
    input.read_bytes(len)
}

/// Decode the envelope of an archive with the local key pair.
pub fn open_envelope<R, K>(input: &mut R, keys: &K) -> ArcaResult<Envelope>
where
    R: Read + Seek + ?Sized,
    K: KeyStore + ?Sized,
{
    let key_size = keys.private_key_size()?;
    let file_size = input.seek(SeekFrom::End(0)).or_format()?;
    let head_len = file_size.min((MAX_RECIPIENT_SLOTS * SLOT_SIZE) as u64) as usize;
    let head = read_at(input, 0, head_len)?;

    let (slot_index, header) = (0..MAX_RECIPIENT_SLOTS)
        .map(|i| {
            let slot = head.get(i * SLOT_SIZE..i * SLOT_SIZE + key_size).or_format()?;
            let plain = keys.decrypt(slot)?;
            decode_header(&plain).map(|header| (i, header))
        })
        .find_map(Result::ok)
        .or_format()?;
    if slot_index >= header.slot_count {
        return Err(ArcaError::Format);
    }
    let (signer, signer_key) = find_signer(keys, &header.keysig)?;

    let headers_len = (header.slot_count * SLOT_SIZE) as u64;
    let headers = read_at(input, 0, headers_len as usize)?;
    let eeprefix_pos = headers_len + header.paddings.padding1 as u64;
    let eeprefix = read_at(input, eeprefix_pos, header.eeprefix_len)?;
    let inner = header.cipher1.decrypt(&eeprefix)?;

    let mut r = inner.as_slice();
    read_padding(&mut r)?;
    let signed = r.read_u32_bytes(MAX_EEPREFIX_LEN)?;
    read_padding(&mut r)?;
    if !r.is_empty() {
        return Err(ArcaError::Format);
    }
    let mut r = signed.as_slice();
    let prefix = r.read_u32_bytes(MAX_PREFIX_LEN)?;
    let signature = r.read_u32_bytes(SIG_SIZE)?;
    if !r.is_empty() || !keys.verify(&signer_key, &prefix, &signature) {
        return Err(ArcaError::Format);
    }

    let file_format = header.format.file_format();
    let mut r = prefix.as_slice();
    read_padding(&mut r)?;
    let block_size = FileFormat::decode_blocksize(r.read_u8()?)?;
    let content_key = ContentKey::from_slice(&r.read_u8_bytes()?)?;
    let content_cipher = file_format.read_cipher_params(&mut r, &content_key)?;
    if !r.is_empty() {
        return Err(ArcaError::Format);
    }

    let iv_pos = eeprefix_pos + header.eeprefix_len as u64 + header.paddings.padding2 as u64;
    let iv_len = file_format.iv_len();
    let block_iv = marshal_salt(&read_at(input, iv_pos, iv_len)?);
    if block_iv != content_cipher.iv() {
        return Err(ArcaError::Format);
    }
    let content_start = iv_pos + iv_len as u64;
    let raw_limit = file_size
        .checked_sub(header.paddings.padding3 as u64)
        .filter(|limit| *limit >= content_start)
        .or_format()?;

    debug!(
        version = header.format.version(),
        slot = slot_index,
        signer = %signer,
        "opened envelope"
    );
    Ok(Envelope {
        format: header.format,
        slot_count: header.slot_count,
        slot_index,
        signer,
        signer_key,
        headers,
        content_cipher,
        block_size,
        content_start,
        raw_limit,
    })
}
