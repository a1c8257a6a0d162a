//! End-to-end backup and restore of local directory trees.

mod common;

use std::fs;
use std::path::PathBuf;

use arca_core::config::BackupConfig;
use arca_core::ArcaError;
use arca_crypto::keystore::parse_public_key_pem;
use arca_crypto::{KeyStore, SELF_ALIAS};
use arca_engine::Action;
use common::*;
use tempfile::TempDir;

const SITE_MS: u64 = 1_600_000_100_000;

struct Fixture {
    src: TempDir,
    out: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let src = TempDir::new().unwrap();
        populate(src.path());
        set_mtime(&src.path().join("site"), SITE_MS);
        Self {
            src,
            out: TempDir::new().unwrap(),
        }
    }

    fn roots(&self) -> Vec<PathBuf> {
        vec![self.src.path().to_path_buf()]
    }

    fn archive(&self, name: &str) -> PathBuf {
        self.out.path().join(name)
    }
}

fn roundtrip(version: u8) {
    let fx = Fixture::new();
    let archive = fx.archive("full.backup");
    let config = BackupConfig {
        format_version: version,
        ..Default::default()
    };
    let engine = engine_with(alice(), config);

    let report = engine
        .backup_data(&archive, &[], &fx.roots())
        .expect("backup should succeed");
    assert_eq!(report.oks.len(), 5);
    assert!(report.fails.is_empty());
    assert!(report.ignores.is_empty());

    let info = engine.read_backup_info(&archive).expect("read info");
    assert_eq!(info.version, version);
    assert_eq!(info.slot_count, 2);
    assert_eq!(info.signer, SELF_ALIAS);

    let dest = TempDir::new().unwrap();
    let report = engine
        .restore_data(dest.path(), &archive, "", false)
        .expect("restore should succeed");
    assert_eq!(report.oks.len(), 5);
    assert!(report.fails.is_empty());
    assert_eq!(snapshot(dest.path()), snapshot(fx.src.path()));
    assert_eq!(mtime_ms(&dest.path().join("site")), SITE_MS);
}

#[test]
fn roundtrip_v10() {
    roundtrip(10);
}

#[test]
fn roundtrip_v11() {
    roundtrip(11);
}

#[test]
fn restore_again_ignores_identical_files() {
    let fx = Fixture::new();
    let archive = fx.archive("full.backup");
    let engine = engine(alice());
    engine.backup_data(&archive, &[], &fx.roots()).unwrap();

    let dest = TempDir::new().unwrap();
    engine.restore_data(dest.path(), &archive, "", false).unwrap();
    let report = engine
        .restore_data(dest.path(), &archive, "", false)
        .expect("second restore should succeed");
    assert!(report.oks.is_empty());
    assert_eq!(report.ignores.len(), 5);

    // Same bytes but a wrong timestamp: compared, then only re-stamped.
    let readme = dest.path().join("readme.txt");
    set_mtime(&readme, 42);
    let report = engine.restore_data(dest.path(), &archive, "", false).unwrap();
    assert!(report.ignores.contains("readme.txt"));
    assert_eq!(mtime_ms(&readme), 1_600_000_000_000);
}

#[test]
fn restore_subtree_and_single_file() {
    let fx = Fixture::new();
    let archive = fx.archive("full.backup");
    let engine = engine(alice());
    engine.backup_data(&archive, &[], &fx.roots()).unwrap();

    let dest = TempDir::new().unwrap();
    let report = engine
        .restore_data(dest.path(), &archive, "site", false)
        .expect("restore subtree");
    assert_eq!(report.oks.len(), 2);
    let restored = snapshot(dest.path());
    let names: Vec<_> = restored.keys().map(String::as_str).collect();
    assert_eq!(names, ["img/blob.bin", "index.html"]);
    assert_eq!(restored["img/blob.bin"].0, noise(300_000, 1));

    let dest = TempDir::new().unwrap();
    engine
        .restore_data(dest.path(), &archive, "/notes/2024/jan.md", false)
        .expect("restore single file");
    assert_eq!(fs::read(dest.path().join("jan.md")).unwrap(), b"- one\n- two\n");

    let err = engine
        .restore_data(dest.path(), &archive, "nope", false)
        .unwrap_err();
    assert_eq!(err.action(), Action::Restore);
    assert!(matches!(err.into_inner(), ArcaError::NotFound(_)));
}

#[test]
fn second_recipient_can_restore() {
    let fx = Fixture::new();
    let archive = fx.archive("shared.backup");
    let recipients = vec![SELF_ALIAS.to_string(), "bob".to_string()];
    engine(alice())
        .backup_data(&archive, &recipients, &fx.roots())
        .expect("backup for two recipients");

    let bob = engine(bob());
    let info = bob.read_backup_info(&archive).expect("bob opens archive");
    assert_eq!(info.slot_index, 1);
    assert_eq!(info.signer, "alice");

    let dest = TempDir::new().unwrap();
    let report = bob
        .restore_data(dest.path(), &archive, "", false)
        .expect("bob restores");
    assert_eq!(report.oks.len(), 5);
    assert_eq!(snapshot(dest.path()), snapshot(fx.src.path()));

    let err = engine(stranger())
        .restore_data(dest.path(), &archive, "", false)
        .unwrap_err();
    assert!(err.is_format());
}

#[test]
fn filetree_verify_and_read_file() {
    let fx = Fixture::new();
    let archive = fx.archive("full.backup");
    let engine = engine(alice());
    engine.backup_data(&archive, &[], &fx.roots()).unwrap();

    let tree = engine.read_backup_filetree(&archive).expect("filetree");
    let index = &tree["files"]["site"]["files"]["index.html"];
    assert_eq!(index["length"], 19 * 5_000);
    assert_eq!(index["isfile"], true);
    assert_eq!(tree["files"]["site"]["lastModified"], SITE_MS);

    let report = engine.verify_backup(&archive).expect("verify");
    assert_eq!(report.oks.len(), 5);
    assert!(report.fails.is_empty());

    let bytes = engine
        .read_file_at(&archive, "site/index.html")
        .expect("read one file");
    assert_eq!(bytes, b"<p>compressible</p>".repeat(5_000));
    let err = engine.read_file_at(&archive, "site").unwrap_err();
    assert!(matches!(err.into_inner(), ArcaError::InvalidArgument(_)));
    let err = engine.read_file_at(&archive, "missing").unwrap_err();
    assert_eq!(err.action(), Action::Read);
}

#[test]
fn excluded_paths_are_left_out() {
    let fx = Fixture::new();
    let archive = fx.archive("full.backup");
    let config = BackupConfig {
        exclude_patterns: vec!["*.bin".into(), "notes/*".into()],
        ..Default::default()
    };
    let engine = engine_with(alice(), config);
    let report = engine.backup_data(&archive, &[], &fx.roots()).unwrap();
    assert_eq!(report.oks.len(), 3);

    let dest = TempDir::new().unwrap();
    engine.restore_data(dest.path(), &archive, "", false).unwrap();
    let names: Vec<_> = snapshot(dest.path()).into_keys().collect();
    assert_eq!(names, ["empty", "readme.txt", "site/index.html"]);
    assert!(dest.path().join("notes").is_dir());
}

#[test]
fn sync_never_overwrites_newer_files() {
    let fx = Fixture::new();
    let archive = fx.archive("full.backup");
    let engine = engine(alice());
    engine.backup_data(&archive, &[], &fx.roots()).unwrap();
    let dest = TempDir::new().unwrap();
    engine.restore_data(dest.path(), &archive, "", false).unwrap();

    let newer = write_file(dest.path(), "readme.txt", b"edited later", 1_700_000_000_000);
    let older = write_file(dest.path(), "notes/2024/jan.md", b"stale", 1_500_000_000_000);

    let report = engine
        .restore_data(dest.path(), &archive, "", true)
        .expect("sync restore");
    assert!(report.ignores.contains("readme.txt"));
    assert!(report.oks.contains("notes/2024/jan.md"));
    assert_eq!(fs::read(&newer).unwrap(), b"edited later");
    assert_eq!(mtime_ms(&newer), 1_700_000_000_000);
    assert_eq!(fs::read(&older).unwrap(), b"- one\n- two\n");

    let report = engine
        .restore_data(dest.path(), &archive, "", false)
        .expect("plain restore");
    assert!(report.oks.contains("readme.txt"));
    assert_eq!(fs::read(&newer).unwrap(), b"hello arca");
}

#[test]
fn restore_replaces_mismatched_entry_kinds() {
    let fx = Fixture::new();
    let archive = fx.archive("full.backup");
    let engine = engine(alice());
    engine.backup_data(&archive, &[], &fx.roots()).unwrap();

    let dest = TempDir::new().unwrap();
    fs::create_dir_all(dest.path().join("readme.txt/inner")).unwrap();
    fs::write(dest.path().join("site"), b"not a dir").unwrap();

    let report = engine
        .restore_data(dest.path(), &archive, "", false)
        .expect("restore over mismatched kinds");
    assert!(report.fails.is_empty());
    assert_eq!(snapshot(dest.path()), snapshot(fx.src.path()));
}

#[test]
fn backup_refuses_archive_inside_source() {
    let fx = Fixture::new();
    let archive = fx.src.path().join("self.backup");
    let err = engine(alice())
        .backup_data(&archive, &[], &fx.roots())
        .unwrap_err();
    assert_eq!(err.action(), Action::Backup);
    assert!(matches!(err.into_inner(), ArcaError::InvalidArgument(_)));
    assert!(!archive.exists());
}

#[test]
fn failed_backup_removes_partial_archive() {
    let fx = Fixture::new();
    let archive = fx.archive("full.backup");
    let err = engine(alice())
        .backup_data(&archive, &["carol".to_string()], &fx.roots())
        .unwrap_err();
    assert!(matches!(err.into_inner(), ArcaError::NotFound(_)));
    assert!(!archive.exists());
}

#[test]
fn exported_key_matches_self_key() {
    let out = TempDir::new().unwrap();
    let path = out.path().join("alice.pub.pem");
    let engine = engine(alice());
    engine.backup_key(&path).expect("export key");

    let exported = parse_public_key_pem(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(exported, engine.keys().public_key(SELF_ALIAS).unwrap());

    let err = engine
        .backup_key(&out.path().join("missing/dir/key.pem"))
        .unwrap_err();
    assert_eq!(err.action(), Action::ExportKey);
}

#[test]
fn clashing_names_across_roots_fail_instead_of_merging() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_file(a.path(), "notes.txt", b"from a", 1_600_000_000_000);
    write_file(a.path(), "docs/a.md", b"a", 1_600_000_000_000);
    write_file(b.path(), "notes.txt", b"from b", 1_600_000_000_000);
    write_file(b.path(), "docs/b.md", b"b", 1_600_000_000_000);
    write_file(b.path(), "extra.txt", b"only in b", 1_600_000_000_000);

    let out = TempDir::new().unwrap();
    let archive = out.path().join("two.backup");
    let engine = engine(alice());
    let roots = vec![a.path().to_path_buf(), b.path().to_path_buf()];
    let report = engine.backup_data(&archive, &[], &roots).unwrap();
    let fails: Vec<_> = report.fails.iter().map(String::as_str).collect();
    assert_eq!(fails, ["docs", "notes.txt"]);
    let oks: Vec<_> = report.oks.iter().map(String::as_str).collect();
    assert_eq!(oks, ["docs/a.md", "extra.txt", "notes.txt"]);

    let dest = TempDir::new().unwrap();
    engine.restore_data(dest.path(), &archive, "", false).unwrap();
    let names: Vec<_> = snapshot(dest.path()).into_keys().collect();
    assert_eq!(names, ["docs/a.md", "extra.txt", "notes.txt"]);
    assert_eq!(fs::read(dest.path().join("notes.txt")).unwrap(), b"from a");
}

#[cfg(unix)]
#[test]
fn symlinks_are_neither_followed_nor_written_through() {
    use std::os::unix::fs::symlink;

    let outside = TempDir::new().unwrap();
    write_file(outside.path(), "secret.txt", b"not yours", 1_600_000_000_000);
    let src = TempDir::new().unwrap();
    write_file(src.path(), "site/index.html", b"<p>", 1_600_000_000_000);
    symlink(outside.path(), src.path().join("escape")).unwrap();
    symlink(src.path(), src.path().join("site/loop")).unwrap();

    let out = TempDir::new().unwrap();
    let archive = out.path().join("links.backup");
    let engine = engine(alice());
    let report = engine
        .backup_data(&archive, &[], &[src.path().to_path_buf()])
        .expect("backup with links");
    let oks: Vec<_> = report.oks.iter().map(String::as_str).collect();
    assert_eq!(oks, ["site/index.html"]);
    let warns: Vec<_> = report.warns.iter().map(String::as_str).collect();
    assert_eq!(warns, ["escape", "site/loop"]);
    assert!(report.fails.is_empty());
    let tree = engine.read_backup_filetree(&archive).unwrap();
    assert!(tree["files"].get("escape").is_none());

    // A link in the destination where the archive has a directory is
    // replaced, not written through.
    let target = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    symlink(target.path(), dest.path().join("site")).unwrap();
    let report = engine
        .restore_data(dest.path(), &archive, "", false)
        .expect("restore over link");
    assert!(report.fails.is_empty());
    assert!(fs::symlink_metadata(dest.path().join("site")).unwrap().is_dir());
    assert_eq!(fs::read(dest.path().join("site/index.html")).unwrap(), b"<p>");
    assert_eq!(fs::read_dir(target.path()).unwrap().count(), 0);
}
