//! arca-crypto: symmetric and asymmetric primitives for arca archives
//!
//! Content encryption is per block with a fresh IV for every block:
//! ```text
//! FileFormat::V10   AES-256-CBC/PKCS#7, 16-byte random prefix, SHA-256 sum inside the ciphertext
//! FileFormat::V11   AES-256-GCM, 8-byte random prefix, 128-bit tag
//! ```
//!
//! Key hierarchy of one archive:
//! ```text
//! RSA key pair per alias (key store, long-lived)
//!   └── key1 (AES-256, per archive, inside each recipient's RSA block)
//!       └── signed prefix (AES under key1)
//!           └── content key (AES-256, per archive)
//! ```

pub mod format;
pub mod keys;
pub mod keystore;
pub mod padding;
pub mod salt;

pub use format::{Cipher, FileFormat, BLOCK_SIZE};
pub use keys::{generate_content_key, ContentKey};
pub use keystore::{KeyStore, PemKeyStore, SELF_ALIAS};
pub use padding::{read_padding, write_padding, write_padding_len};
pub use salt::marshal_salt;

/// Size of an AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of a SHA-256 digest
pub const SHA256_SIZE: usize = 32;
