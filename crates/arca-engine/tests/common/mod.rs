//! Shared fixtures for engine integration tests. Each test binary compiles
//! this module on its own, so helpers only some binaries use carry
//! `allow(dead_code)`.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, UNIX_EPOCH};

use arca_core::config::BackupConfig;
use arca_crypto::PemKeyStore;
use arca_engine::Engine;
use rsa::{RsaPrivateKey, RsaPublicKey};

fn generate() -> RsaPrivateKey {
    RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("generate RSA key")
}

fn alice_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(generate)
}

fn bob_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(generate)
}

/// Key store of "alice", who knows bob's public key.
pub fn alice() -> PemKeyStore {
    let mut keys = PemKeyStore::in_memory(alice_key().clone());
    keys.add_public_key("bob", RsaPublicKey::from(bob_key()))
        .expect("register bob");
    keys
}

#[allow(dead_code)]
/// Key store of "bob", who knows alice's public key.
pub fn bob() -> PemKeyStore {
    let mut keys = PemKeyStore::in_memory(bob_key().clone());
    keys.add_public_key("alice", RsaPublicKey::from(alice_key()))
        .expect("register alice");
    keys
}

#[allow(dead_code)]
/// Key store with a fresh key pair that nobody addresses archives to.
pub fn stranger() -> PemKeyStore {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    PemKeyStore::in_memory(KEY.get_or_init(generate).clone())
}

pub fn engine(keys: PemKeyStore) -> Engine<PemKeyStore> {
    engine_with(keys, BackupConfig::default())
}

pub fn engine_with(keys: PemKeyStore, config: BackupConfig) -> Engine<PemKeyStore> {
    Engine::new(keys, &config).expect("engine from config")
}

/// Write `content` at `rpath` below `root` and stamp it with `ms`.
pub fn write_file(root: &Path, rpath: &str, content: &[u8], ms: u64) -> PathBuf {
    let path = root.join(rpath);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dirs");
    }
    fs::write(&path, content).expect("write test file");
    set_mtime(&path, ms);
    path
}

pub fn set_mtime(path: &Path, ms: u64) {
    File::open(path)
        .expect("open for timestamp")
        .set_modified(UNIX_EPOCH + Duration::from_millis(ms))
        .expect("set mtime");
}

#[allow(dead_code)]
pub fn mtime_ms(path: &Path) -> u64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .expect("read mtime")
        .duration_since(UNIX_EPOCH)
        .expect("mtime after epoch")
        .as_millis() as u64
}

#[allow(dead_code)]
/// Every regular file below `root`: relative path to (content, mtime ms).
pub fn snapshot(root: &Path) -> BTreeMap<String, (Vec<u8>, u64)> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, (Vec<u8>, u64)>) {
        for entry in fs::read_dir(dir).expect("read dir") {
            let path = entry.expect("dir entry").path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rpath = path
                    .strip_prefix(root)
                    .expect("below root")
                    .to_string_lossy()
                    .replace('\\', "/");
                let content = fs::read(&path).expect("read file");
                out.insert(rpath, (content, mtime_ms(&path)));
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

/// Content that gzip cannot shrink.
pub fn noise(len: usize, seed: u32) -> Vec<u8> {
    (0..len as u32)
        .map(|i| ((i ^ seed).wrapping_mul(2_654_435_761) >> 13) as u8)
        .collect()
}

/// A small source tree with nested directories, an empty file, a
/// compressible file and one spanning several content blocks.
pub fn populate(root: &Path) {
    write_file(root, "readme.txt", b"hello arca", 1_600_000_000_000);
    write_file(root, "empty", b"", 1_600_000_001_000);
    write_file(
        root,
        "site/index.html",
        &b"<p>compressible</p>".repeat(5_000),
        1_600_000_002_000,
    );
    write_file(root, "site/img/blob.bin", &noise(300_000, 1), 1_600_000_003_000);
    write_file(root, "notes/2024/jan.md", b"- one\n- two\n", 1_600_000_004_000);
}
