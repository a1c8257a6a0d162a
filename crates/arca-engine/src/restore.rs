//! Restore: copy archived files into a destination tree.

use std::collections::BTreeSet;
use std::io::{Read, Seek, Write};

use tracing::{debug, warn};

use arca_archive::{ArchiveReader, Filelist};
use arca_core::{ArcaError, ArcaResult, Info, RunReport};
use arca_storage::tree::parent_rpath;
use arca_storage::{FileStat, FileTree};

use crate::chain::take_held;

/// Paths of the newest filelist chosen by a `from` path, and where they land.
#[derive(Debug)]
pub(crate) struct Selection {
    from: String,
    /// Prefix stripped from archive paths to get destination paths, with a
    /// trailing `/` unless empty
    base: String,
    single: bool,
    pub(crate) targets: Filelist,
}

impl Selection {
    /// A file selects itself, relocated to the destination root. A directory
    /// selects everything below it.
    pub(crate) fn new(filelist: &Filelist, from: &str) -> ArcaResult<Self> {
        let from = from.trim_matches('/').to_string();
        let info = filelist
            .get(&from)
            .ok_or_else(|| ArcaError::NotFound(format!("{from:?} in archive")))?;
        let single = info.is_file();
        let base = if single {
            match parent_rpath(&from) {
                "" => String::new(),
                dir => format!("{dir}/"),
            }
        } else if from.is_empty() {
            String::new()
        } else {
            format!("{from}/")
        };
        let mut selection = Self {
            from,
            base,
            single,
            targets: Filelist::new(),
        };
        selection.targets = filelist
            .iter()
            .filter(|(rpath, _)| selection.contains(rpath))
            .map(|(rpath, info)| (rpath.clone(), info.clone()))
            .collect();
        Ok(selection)
    }

    pub(crate) fn contains(&self, rpath: &str) -> bool {
        if self.single {
            return rpath == self.from;
        }
        !rpath.is_empty() && rpath != self.from && rpath.starts_with(&self.base)
    }

    pub(crate) fn dest_path<'p>(&self, rpath: &'p str) -> &'p str {
        &rpath[self.base.len()..]
    }
}

/// Whether the archive copy should replace an existing destination file.
fn should_restore(sync: bool, stat: &FileStat, info: &Info) -> bool {
    if sync {
        return info.timestamp > stat.modified_ms;
    }
    stat.modified_ms != info.timestamp || stat.size as i64 != info.size
}

/// State of one restore run against a destination tree.
pub(crate) struct RestoreRun<'a, T> {
    tree: &'a T,
    sync: bool,
    pub(crate) report: RunReport,
}

impl<'a, T: FileTree> RestoreRun<'a, T> {
    pub(crate) fn new(tree: &'a T, sync: bool) -> Self {
        Self {
            tree,
            sync,
            report: RunReport::default(),
        }
    }

    /// Make `dir` a directory, replacing any file on the way.
    fn ensure_dir(&self, dir: &str) -> ArcaResult<()> {
        if dir.is_empty() {
            return Ok(());
        }
        match self.tree.stat(dir)? {
            Some(stat) if stat.is_dir => return Ok(()),
            Some(_) => self.tree.delete(dir)?,
            None => {}
        }
        self.ensure_dir(parent_rpath(dir))?;
        self.tree.mkdirs(dir)
    }

    fn prepare_file(&self, dst: &str) -> ArcaResult<()> {
        self.ensure_dir(parent_rpath(dst))?;
        if let Some(stat) = self.tree.stat(dst)? {
            if stat.is_dir {
                self.tree.delete(dst)?;
            }
        }
        Ok(())
    }

    /// Create the directory skeleton. Returns the files still to restore.
    pub(crate) fn prepare(&mut self, selection: &Selection) -> Filelist {
        let mut pending = Filelist::new();
        for (rpath, info) in &selection.targets {
            let dst = selection.dest_path(rpath);
            let prepared = if info.is_dir() {
                self.ensure_dir(dst)
            } else {
                self.prepare_file(dst)
            };
            match prepared {
                Ok(()) if info.is_file() => {
                    pending.insert(rpath.clone(), info.clone());
                }
                Ok(()) => {}
                Err(e) => {
                    warn!(path = %rpath, error = %e, "cannot prepare destination");
                    self.report.fail(rpath.as_str());
                }
            }
        }
        pending
    }

    /// Restore every pending file whose content `reader` holds.
    pub(crate) fn restore_from<R: Read + Seek>(
        &mut self,
        reader: &ArchiveReader<R>,
        filelist: &Filelist,
        selection: &Selection,
        pending: &mut Filelist,
    ) {
        for (rpath, info) in take_held(pending, filelist) {
            let dst = selection.dest_path(&rpath);
            match self.restore_file(reader, dst, &info) {
                Ok(true) => {
                    debug!(path = %rpath, bytes = info.size, "restored");
                    self.report.ok(rpath);
                }
                Ok(false) => self.report.ignore(rpath),
                Err(e) => {
                    warn!(path = %rpath, error = %e, "restore failed");
                    self.report.fail(rpath);
                }
            }
        }
    }

    /// Returns false when the destination already matches.
    fn restore_file<R: Read + Seek>(
        &self,
        reader: &ArchiveReader<R>,
        dst: &str,
        info: &Info,
    ) -> ArcaResult<bool> {
        if let Some(stat) = self.tree.stat(dst)?.filter(FileStat::is_file) {
            if !should_restore(self.sync, &stat, info) {
                return Ok(false);
            }
            if self.same_content(reader, dst, &stat, info)? {
                if stat.modified_ms != info.timestamp {
                    self.tree.set_modified(dst, info.timestamp)?;
                }
                return Ok(false);
            }
        }
        let (temp, mut out) = self.tree.create_temp(dst)?;
        reader.copy_entry(info, &mut out)?;
        out.flush()?;
        drop(out);
        self.tree.commit(&temp, dst, info.timestamp)?;
        Ok(true)
    }

    fn same_content<R: Read + Seek>(
        &self,
        reader: &ArchiveReader<R>,
        dst: &str,
        stat: &FileStat,
        info: &Info,
    ) -> ArcaResult<bool> {
        if stat.size as i64 != info.size {
            return Ok(false);
        }
        if let (Some(have), Some(want)) = (&stat.checksum, &info.checksum) {
            if have.len() == want.len() && have != want {
                return Ok(false);
            }
        }
        let mut existing = self.tree.open_read(dst)?;
        reader.compare_entry(info, &mut existing)
    }

    /// Delete destination paths that only older chain members listed.
    pub(crate) fn remove_stale(&mut self, selection: &Selection, held: &BTreeSet<String>) {
        for rpath in held.iter().rev() {
            if selection.targets.contains_key(rpath) {
                continue;
            }
            let dst = selection.dest_path(rpath);
            match self.tree.delete(dst) {
                Ok(()) => debug!(path = %rpath, "removed path no longer in backup"),
                Err(e) => {
                    warn!(path = %rpath, error = %e, "cannot remove stale path");
                    self.report.warn(rpath.as_str());
                }
            }
        }
    }

    /// Directory timestamps go last, after their content was written.
    pub(crate) fn stamp_dirs(&mut self, selection: &Selection) {
        for (rpath, info) in selection.targets.iter().rev() {
            if !info.is_dir() {
                continue;
            }
            if let Err(e) = self.tree.set_modified(selection.dest_path(rpath), info.timestamp) {
                warn!(path = %rpath, error = %e, "cannot set directory timestamp");
                self.report.warn(rpath.as_str());
            }
        }
    }
}
