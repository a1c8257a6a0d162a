//! Symmetric key material: per-archive content keys and key1

use rand::RngCore;
use zeroize::Zeroize;

use arca_core::{ArcaError, ArcaResult};

use crate::KEY_SIZE;

/// A 256-bit AES key. Zeroized on drop.
#[derive(Clone)]
pub struct ContentKey {
    bytes: [u8; KEY_SIZE],
}

impl ContentKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Accepts exactly 32 bytes that are not all identical.
    pub fn from_slice(bytes: &[u8]) -> ArcaResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| ArcaError::Format)?;
        if !is_valid_key(&bytes) {
            return Err(ArcaError::Format);
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for ContentKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit AES key.
pub fn generate_content_key() -> ContentKey {
    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; KEY_SIZE];
    loop {
        rng.fill_bytes(&mut bytes);
        if is_valid_key(&bytes) {
            return ContentKey::from_bytes(bytes);
        }
    }
}

/// A key made of one repeated byte is never produced by a healthy RNG.
fn is_valid_key(bytes: &[u8]) -> bool {
    match bytes.first() {
        Some(first) => bytes.iter().any(|b| b != first),
        None => false,
    }
}
