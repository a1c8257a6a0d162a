//! Engine: the backup, restore and verify entry points.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use arca_archive::{ensure_slots, forward_archive, ArchiveInfo, ArchiveReader, ArchiveWriter, Filelist};
use arca_core::config::BackupConfig;
use arca_core::{ArcaError, ArcaResult, RunReport};
use arca_crypto::keystore::public_key_pem;
use arca_crypto::{KeyStore, SELF_ALIAS};
use arca_storage::{FileTree, LocalTree};

use crate::backup::BackupRun;
use crate::chain::{chain_for, is_incremental, previous_member, take_held};
use crate::error::{Action, ForAction, SecureError};
use crate::options::BackupOptions;
use crate::restore::{RestoreRun, Selection};

/// Backup and restore against local directories, using one key store.
pub struct Engine<K> {
    keys: K,
    options: BackupOptions,
}

/// Remove a file left behind by a failed write.
fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed partial output"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "cannot remove partial output"),
    }
}

fn verify_held(reader: &ArchiveReader<File>, filelist: &Filelist, pending: &mut Filelist, report: &mut RunReport) {
    for (rpath, info) in take_held(pending, filelist) {
        match reader.verify_entry(&info) {
            Ok(()) => report.ok(rpath),
            Err(e) => {
                warn!(path = %rpath, error = %e, "verification failed");
                report.fail(rpath);
            }
        }
    }
}

fn split_chain(chain: &[PathBuf]) -> ArcaResult<(&PathBuf, &[PathBuf])> {
    chain
        .split_first()
        .ok_or_else(|| ArcaError::InvalidArgument("empty archive chain".into()))
}

impl<K: KeyStore> Engine<K> {
    pub fn new(keys: K, config: &BackupConfig) -> ArcaResult<Self> {
        Ok(Self::with_options(keys, BackupOptions::from_config(config)?))
    }

    pub fn with_options(keys: K, options: BackupOptions) -> Self {
        Self { keys, options }
    }

    pub fn keys(&self) -> &K {
        &self.keys
    }

    pub fn options(&self) -> &BackupOptions {
        &self.options
    }

    fn open(&self, archive: &Path) -> ArcaResult<ArchiveReader<File>> {
        let file = File::open(archive)?;
        ArchiveReader::open(file, &self.keys)
    }

    fn open_listed(&self, archive: &Path) -> ArcaResult<(ArchiveReader<File>, Filelist)> {
        let reader = self.open(archive)?;
        let filelist = reader.filelist()?;
        Ok((reader, filelist))
    }

    /// An older chain member that cannot be read only fails the files
    /// resolving to it.
    fn open_older(&self, member: &Path) -> Option<(ArchiveReader<File>, Filelist)> {
        match self.open_listed(member) {
            Ok(opened) => Some(opened),
            Err(e) => {
                warn!(archive = %member.display(), error = %e, "skipping unreadable chain member");
                None
            }
        }
    }

    /// Back up the content of `roots` into `archive`, readable by the
    /// `recipients` key aliases and by the local key pair.
    ///
    /// An archive named `*.ibackup` is incremental: files unchanged since the
    /// previous chain member are listed without content. On failure no
    /// partial archive is left behind.
    pub fn backup_data(
        &self,
        archive: &Path,
        recipients: &[String],
        roots: &[PathBuf],
    ) -> Result<RunReport, SecureError> {
        let slots = ensure_slots(recipients, self.options.min_slots).for_action(Action::Backup)?;
        self.check_sources(archive, roots).for_action(Action::Backup)?;
        let incremental = is_incremental(archive);
        let previous = self.previous_filelist(archive).for_action(Action::Backup)?;

        let file = File::create(archive)
            .map_err(ArcaError::from)
            .for_action(Action::Backup)?;
        info!(
            archive = %archive.display(),
            recipients = slots.len(),
            incremental,
            version = self.options.format.version(),
            "starting backup"
        );
        self.write_backup(file, &slots, roots, incremental, previous)
            .map_err(|e| {
                remove_partial(archive);
                SecureError::new(Action::Backup, e)
            })
    }

    fn check_sources(&self, archive: &Path, roots: &[PathBuf]) -> ArcaResult<()> {
        if roots.is_empty() {
            return Err(ArcaError::InvalidArgument("no source directory given".into()));
        }
        let archive_dir = match archive.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.canonicalize()?,
            _ => std::env::current_dir()?.canonicalize()?,
        };
        for root in roots {
            if !root.is_dir() {
                return Err(ArcaError::NotFound(format!(
                    "source directory {}",
                    root.display()
                )));
            }
            if archive_dir.starts_with(root.canonicalize()?) {
                return Err(ArcaError::InvalidArgument(format!(
                    "archive must not be inside source directory {}",
                    root.display()
                )));
            }
        }
        Ok(())
    }

    fn previous_filelist(&self, archive: &Path) -> ArcaResult<Filelist> {
        match previous_member(archive)? {
            Some(previous) => {
                debug!(previous = %previous.display(), "chaining to previous backup");
                self.open(&previous)?.filelist()
            }
            None => Ok(Filelist::new()),
        }
    }

    fn write_backup(
        &self,
        file: File,
        slots: &[String],
        roots: &[PathBuf],
        incremental: bool,
        previous: Filelist,
    ) -> ArcaResult<RunReport> {
        let writer = ArchiveWriter::create(BufWriter::new(file), &self.keys, self.options.format, slots)?;
        let mut run = BackupRun::new(&self.keys, &self.options, writer, incremental, previous);
        for root in roots {
            debug!(root = %root.display(), "adding source root");
            run.add_root(&LocalTree::new(root))?;
        }
        let (out, report) = run.finish()?;
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(report)
    }

    /// Restore `from` (a path inside the archive, `""` for everything) into
    /// `dest`, resolving unchanged files through the older members of an
    /// incremental chain.
    ///
    /// With `sync`, a destination file is only replaced by an archive copy
    /// that is newer.
    pub fn restore_data(
        &self,
        dest: &Path,
        archive: &Path,
        from: &str,
        sync: bool,
    ) -> Result<RunReport, SecureError> {
        self.restore(dest, archive, from, sync)
            .for_action(Action::Restore)
    }

    fn restore(&self, dest: &Path, archive: &Path, from: &str, sync: bool) -> ArcaResult<RunReport> {
        let chain = chain_for(archive)?;
        let (newest, older) = split_chain(&chain)?;
        let latest = self.open(newest)?;
        let latest_list = latest.filelist()?;
        let selection = Selection::new(&latest_list, from)?;
        info!(
            archive = %archive.display(),
            dest = %dest.display(),
            chain = chain.len(),
            targets = selection.targets.len(),
            sync,
            "starting restore"
        );

        fs::create_dir_all(dest)?;
        let tree = LocalTree::new(dest);
        let report = tree.transaction(|t| {
            let mut run = RestoreRun::new(t, sync);
            let mut pending = run.prepare(&selection);
            run.restore_from(&latest, &latest_list, &selection, &mut pending);

            let mut held = BTreeSet::new();
            for member in older {
                let Some((reader, filelist)) = self.open_older(member) else {
                    continue;
                };
                held.extend(
                    filelist
                        .keys()
                        .filter(|rpath| selection.contains(rpath))
                        .cloned(),
                );
                if !pending.is_empty() {
                    run.restore_from(&reader, &filelist, &selection, &mut pending);
                }
            }
            for rpath in pending.into_keys() {
                warn!(path = %rpath, "content not found in backup chain");
                run.report.fail(rpath);
            }
            run.remove_stale(&selection, &held);
            run.stamp_dirs(&selection);
            Ok(run.report)
        })?;
        info!(
            ok = report.oks.len(),
            unchanged = report.ignores.len(),
            failed = report.fails.len(),
            "restore finished"
        );
        Ok(report)
    }

    /// Decrypt every file of the archive, or of its chain, and check sizes
    /// and checksums without writing anything.
    pub fn verify_backup(&self, archive: &Path) -> Result<RunReport, SecureError> {
        self.verify(archive).for_action(Action::Verify)
    }

    fn verify(&self, archive: &Path) -> ArcaResult<RunReport> {
        let chain = chain_for(archive)?;
        let (newest, older) = split_chain(&chain)?;
        let mut report = RunReport::default();
        let (latest, latest_list) = self.open_listed(newest)?;
        let mut pending: Filelist = latest_list
            .iter()
            .filter(|(_, info)| info.is_file())
            .map(|(rpath, info)| (rpath.clone(), info.clone()))
            .collect();
        let total = pending.len();

        verify_held(&latest, &latest_list, &mut pending, &mut report);
        for member in older {
            if pending.is_empty() {
                break;
            }
            if let Some((reader, filelist)) = self.open_older(member) {
                verify_held(&reader, &filelist, &mut pending, &mut report);
            }
        }
        for rpath in pending.into_keys() {
            warn!(path = %rpath, "content not found in backup chain");
            report.fail(rpath);
        }
        info!(files = total, failed = report.fails.len(), "verify finished");
        Ok(report)
    }

    /// Re-address an existing archive to `recipients` (and the local key
    /// pair), in place. Entry content is not re-encrypted and the archive
    /// keeps its modification time.
    pub fn forward_backup(&self, archive: &Path, recipients: &[String]) -> Result<(), SecureError> {
        self.forward(archive, recipients)
            .for_action(Action::Forward)
    }

    fn forward(&self, archive: &Path, recipients: &[String]) -> ArcaResult<()> {
        let slots = ensure_slots(recipients, self.options.min_slots)?;
        let name = archive
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ArcaError::InvalidArgument(format!("archive path {}", archive.display())))?;
        let dir = match archive.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let tree = LocalTree::new(dir);
        let modified_ms = tree
            .stat(name)?
            .filter(|stat| stat.is_file())
            .ok_or_else(|| ArcaError::NotFound(format!("archive {}", archive.display())))?
            .modified_ms;
        info!(archive = %archive.display(), recipients = slots.len(), "forwarding backup");

        tree.transaction(|t| {
            let input = t.open_read(name)?;
            let (temp, out) = t.create_temp(name)?;
            let out = forward_archive(input, out, &self.keys, &slots)?;
            let file = out.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            drop(file);
            t.commit(&temp, name, modified_ms)
        })?;
        info!(archive = %archive.display(), "forward finished");
        Ok(())
    }

    /// The archive's filelist as a nested JSON tree.
    pub fn read_backup_filetree(&self, archive: &Path) -> Result<serde_json::Value, SecureError> {
        self.open(archive)
            .and_then(|reader| reader.filetree())
            .for_action(Action::Read)
    }

    pub fn read_backup_info(&self, archive: &Path) -> Result<ArchiveInfo, SecureError> {
        self.open(archive)
            .map(|reader| reader.info())
            .for_action(Action::Read)
    }

    /// Decrypt one file of the archive, following the chain if its content
    /// lives in an older member.
    pub fn read_file_at(&self, archive: &Path, rpath: &str) -> Result<Vec<u8>, SecureError> {
        self.read_file(archive, rpath.trim_matches('/'))
            .for_action(Action::Read)
    }

    fn read_file(&self, archive: &Path, rpath: &str) -> ArcaResult<Vec<u8>> {
        let chain = chain_for(archive)?;
        let mut pending = Filelist::new();
        for (index, member) in chain.iter().enumerate() {
            let reader = self.open(member)?;
            let filelist = reader.filelist()?;
            if index == 0 {
                let info = filelist
                    .get(rpath)
                    .ok_or_else(|| ArcaError::NotFound(format!("{rpath:?} in archive")))?;
                if info.is_dir() {
                    return Err(ArcaError::InvalidArgument(format!("{rpath:?} is a directory")));
                }
                pending.insert(rpath.to_string(), info.clone());
            }
            if let Some((_, info)) = take_held(&mut pending, &filelist).pop() {
                return reader.read_entry(&info);
            }
        }
        Err(ArcaError::NotFound(format!("content of {rpath:?} in backup chain")))
    }

    /// Write the local public key (SPKI PEM) to `out`, for use as a
    /// recipient key elsewhere.
    pub fn backup_key(&self, out: &Path) -> Result<(), SecureError> {
        let pem = self
            .keys
            .public_key(SELF_ALIAS)
            .and_then(|key| public_key_pem(&key))
            .for_action(Action::ExportKey)?;
        fs::write(out, pem).map_err(|e| {
            remove_partial(out);
            SecureError::new(Action::ExportKey, e.into())
        })?;
        info!(path = %out.display(), "exported public key");
        Ok(())
    }
}
