//! RSA key store: the local key pair (`#self`) plus the public keys of every
//! alias an archive can be addressed to.
//!
//! On-disk layout of a [`PemKeyStore`] directory:
//! ```text
//! <dir>/self.pem             PKCS#8 private key of #self (mode 0600)
//! <dir>/<alias>.pub.pem      SPKI public key of a recipient
//! ```

use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use arca_core::{ArcaError, ArcaResult};

use crate::keys::{generate_content_key, ContentKey};

/// Alias of the local key pair.
pub const SELF_ALIAS: &str = "#self";

/// Smallest accepted RSA modulus
pub const MIN_RSA_BITS: usize = 2048;

/// Largest RSA modulus that still fits a 512-byte recipient slot
pub const MAX_RSA_BITS: usize = 4096;

const PRIVATE_KEY_FILE: &str = "self.pem";
const PUBLIC_KEY_SUFFIX: &str = ".pub.pem";

/// Key operations the archive engine needs. Private key material never
/// leaves the store.
pub trait KeyStore {
    /// Public key registered under `alias`.
    fn public_key(&self, alias: &str) -> ArcaResult<RsaPublicKey>;

    /// Every known public key, `#self` included, ordered by alias.
    fn public_keys(&self) -> Vec<(String, RsaPublicKey)>;

    /// Modulus size of the local key pair in bytes.
    fn private_key_size(&self) -> ArcaResult<usize>;

    /// RSA-decrypt with the local private key.
    fn decrypt(&self, ciphertext: &[u8]) -> ArcaResult<Vec<u8>>;

    /// RSA PKCS#1 v1.5 SHA-256 signature by the local private key.
    fn sign(&self, data: &[u8]) -> ArcaResult<Vec<u8>>;

    /// RSA-encrypt for the recipient `alias`.
    fn encrypt_for(&self, alias: &str, plaintext: &[u8]) -> ArcaResult<Vec<u8>> {
        let key = self.public_key(alias)?;
        key.encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, plaintext)
            .map_err(|e| ArcaError::KeyStore(format!("RSA encryption for {alias} failed: {e}")))
    }

    fn verify(&self, key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        VerifyingKey::<Sha256>::new(key.clone())
            .verify(data, &signature)
            .is_ok()
    }

    fn generate_aes_key(&self) -> ContentKey {
        generate_content_key()
    }
}

/// SHA-256 of the SPKI DER encoding of `key`.
pub fn key_digest(key: &RsaPublicKey) -> ArcaResult<[u8; 32]> {
    let der = key
        .to_public_key_der()
        .map_err(|e| ArcaError::KeyStore(format!("encoding public key: {e}")))?;
    Ok(Sha256::digest(der.as_bytes()).into())
}

/// Public key in SPKI PEM form.
pub fn public_key_pem(key: &RsaPublicKey) -> ArcaResult<String> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| ArcaError::KeyStore(format!("encoding public key: {e}")))
}

pub fn parse_public_key_pem(pem: &str) -> ArcaResult<RsaPublicKey> {
    let key = RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| ArcaError::KeyStore(format!("parsing public key: {e}")))?;
    check_key_size(key.size() * 8)?;
    Ok(key)
}

fn check_key_size(bits: usize) -> ArcaResult<()> {
    if !(MIN_RSA_BITS..=MAX_RSA_BITS).contains(&bits) {
        return Err(ArcaError::KeyStore(format!(
            "RSA key size {bits} outside [{MIN_RSA_BITS}, {MAX_RSA_BITS}]"
        )));
    }
    Ok(())
}

/// Aliases name files in the key directory, so they stay filename-safe.
fn check_alias(alias: &str) -> ArcaResult<()> {
    let valid = !alias.is_empty()
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@'))
        && !alias.starts_with('.');
    if !valid {
        return Err(ArcaError::InvalidArgument(format!("invalid key alias: {alias:?}")));
    }
    Ok(())
}

/// Key store backed by PEM files, or purely in memory.
pub struct PemKeyStore {
    dir: Option<PathBuf>,
    private: Option<RsaPrivateKey>,
    public: BTreeMap<String, RsaPublicKey>,
}

impl PemKeyStore {
    /// In-memory store around an existing key pair.
    pub fn in_memory(private: RsaPrivateKey) -> Self {
        let mut public = BTreeMap::new();
        public.insert(SELF_ALIAS.to_string(), RsaPublicKey::from(&private));
        Self {
            dir: None,
            private: Some(private),
            public,
        }
    }

    /// Load every key found in `dir`. A missing directory is an empty store.
    pub fn open(dir: &Path) -> ArcaResult<Self> {
        let mut store = Self {
            dir: Some(dir.to_path_buf()),
            private: None,
            public: BTreeMap::new(),
        };
        if !dir.exists() {
            debug!(dir = %dir.display(), "key directory does not exist yet");
            return Ok(store);
        }

        let private_path = dir.join(PRIVATE_KEY_FILE);
        if private_path.exists() {
            let pem = std::fs::read_to_string(&private_path)?;
            let private = RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| {
                ArcaError::KeyStore(format!("parsing {}: {e}", private_path.display()))
            })?;
            store
                .public
                .insert(SELF_ALIAS.to_string(), RsaPublicKey::from(&private));
            store.private = Some(private);
        }

        let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(alias) = name.strip_suffix(PUBLIC_KEY_SUFFIX) else {
                continue;
            };
            if check_alias(alias).is_err() {
                continue;
            }
            let pem = std::fs::read_to_string(entry.path())?;
            let key = parse_public_key_pem(&pem)?;
            store.public.insert(alias.to_string(), key);
        }

        debug!(
            dir = %dir.display(),
            keys = store.public.len(),
            has_private = store.private.is_some(),
            "opened key store"
        );
        Ok(store)
    }

    /// Generate the `#self` key pair and persist it if the store is
    /// directory-backed. Refuses to replace an existing key pair.
    pub fn generate_self_key(&mut self, bits: usize) -> ArcaResult<()> {
        check_key_size(bits)?;
        if self.private.is_some() {
            return Err(ArcaError::KeyStore("a #self key pair already exists".into()));
        }
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| ArcaError::KeyStore(format!("RSA key generation failed: {e}")))?;

        if let Some(dir) = &self.dir {
            std::fs::create_dir_all(dir)?;
            let pem = private
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| ArcaError::KeyStore(format!("encoding private key: {e}")))?;
            let path = dir.join(PRIVATE_KEY_FILE);
            std::fs::write(&path, pem.as_bytes())?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
            }
            info!(path = %path.display(), bits, "generated #self key pair");
        }

        self.public
            .insert(SELF_ALIAS.to_string(), RsaPublicKey::from(&private));
        self.private = Some(private);
        Ok(())
    }

    /// Register a recipient public key (SPKI PEM) under `alias`.
    pub fn import_public_key(&mut self, alias: &str, pem: &str) -> ArcaResult<()> {
        check_alias(alias)?;
        let key = parse_public_key_pem(pem)?;
        if let Some(dir) = &self.dir {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(format!("{alias}{PUBLIC_KEY_SUFFIX}"));
            std::fs::write(&path, public_key_pem(&key)?)?;
            info!(alias, path = %path.display(), "imported public key");
        }
        self.public.insert(alias.to_string(), key);
        Ok(())
    }

    /// Register a recipient public key without touching the disk.
    pub fn add_public_key(&mut self, alias: &str, key: RsaPublicKey) -> ArcaResult<()> {
        check_alias(alias)?;
        self.public.insert(alias.to_string(), key);
        Ok(())
    }

    pub fn has_private_key(&self) -> bool {
        self.private.is_some()
    }

    fn private(&self) -> ArcaResult<&RsaPrivateKey> {
        self.private
            .as_ref()
            .ok_or_else(|| ArcaError::KeyStore("no #self key pair; run keygen first".into()))
    }
}

impl KeyStore for PemKeyStore {
    fn public_key(&self, alias: &str) -> ArcaResult<RsaPublicKey> {
        self.public
            .get(alias)
            .cloned()
            .ok_or_else(|| ArcaError::NotFound(format!("key alias {alias}")))
    }

    fn public_keys(&self) -> Vec<(String, RsaPublicKey)> {
        self.public
            .iter()
            .map(|(alias, key)| (alias.clone(), key.clone()))
            .collect()
    }

    fn private_key_size(&self) -> ArcaResult<usize> {
        Ok(self.private()?.size())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> ArcaResult<Vec<u8>> {
        self.private()?
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|_| ArcaError::Format)
    }

    fn sign(&self, data: &[u8]) -> ArcaResult<Vec<u8>> {
        let signing_key = SigningKey::<Sha256>::new(self.private()?.clone());
        let signature = signing_key
            .try_sign(data)
            .map_err(|e| ArcaError::KeyStore(format!("RSA signing failed: {e}")))?;
        Ok(signature.to_vec())
    }
}

impl std::fmt::Debug for PemKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PemKeyStore")
            .field("dir", &self.dir)
            .field("private", &self.private.as_ref().map(|_| "[REDACTED]"))
            .field("aliases", &self.public.keys().collect::<Vec<_>>())
            .finish()
    }
}
