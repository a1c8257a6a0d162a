//! Backup: walk source trees in name order, streaming changed files into a
//! new archive and listing every file in the trailer filelist.

use std::collections::BTreeSet;
use std::io::Write;

use tracing::{debug, info, warn};

use arca_archive::filelist::check_name;
use arca_archive::{join_rpath, ArchiveWriter, EntryError, Filelist, FilelistBuilder};
use arca_core::{ArcaResult, Info, RunReport};
use arca_crypto::KeyStore;
use arca_storage::{FileStat, FileTree};

use crate::options::BackupOptions;

/// State of one backup run.
pub(crate) struct BackupRun<'a, K: ?Sized, W: Write> {
    keys: &'a K,
    options: &'a BackupOptions,
    writer: ArchiveWriter<W>,
    list: FilelistBuilder,
    /// Filelist of the previous chain member, drained as paths are visited
    previous: Filelist,
    incremental: bool,
    /// Archive-root names taken so far; source roots share the archive root
    top_level: BTreeSet<String>,
    report: RunReport,
}

/// An incremental backup reuses the previous content when timestamp and
/// size match, and the checksum too if the tree keeps one.
fn unchanged(incremental: bool, old: Option<&Info>, stat: &FileStat) -> bool {
    let Some(old) = old.filter(|old| incremental && old.is_file()) else {
        return false;
    };
    old.timestamp == stat.modified_ms
        && old.size == stat.size as i64
        && stat
            .checksum
            .as_ref()
            .is_none_or(|sum| old.checksum.as_ref() == Some(sum))
}

impl<'a, K: KeyStore + ?Sized, W: Write> BackupRun<'a, K, W> {
    pub(crate) fn new(
        keys: &'a K,
        options: &'a BackupOptions,
        writer: ArchiveWriter<W>,
        incremental: bool,
        previous: Filelist,
    ) -> Self {
        Self {
            keys,
            options,
            writer,
            list: FilelistBuilder::new(),
            incremental,
            previous,
            top_level: BTreeSet::new(),
            report: RunReport::default(),
        }
    }

    fn has_marker<T: FileTree>(&self, tree: &T, dir: &str) -> bool {
        let marker = join_rpath(dir, &self.options.nobackup_marker);
        matches!(tree.stat(&marker), Ok(Some(_)))
    }

    /// Add the children of `tree`'s root at the archive root.
    pub(crate) fn add_root<T: FileTree>(&mut self, tree: &T) -> ArcaResult<()> {
        if self.incremental && self.has_marker(tree, "") {
            debug!("source root carries the nobackup marker");
            return Ok(());
        }
        let names = tree.list("")?;
        self.walk_dir(tree, "", names)
    }

    fn walk_dir<T: FileTree>(&mut self, tree: &T, dir: &str, names: Vec<String>) -> ArcaResult<()> {
        for name in names {
            let rpath = join_rpath(dir, &name);
            if self.options.excluded(&name, &rpath) {
                debug!(path = %rpath, "excluded");
                continue;
            }
            if let Err(e) = check_name(&name) {
                warn!(path = %rpath, error = %e, "name cannot be archived");
                self.report.fail(rpath);
                continue;
            }
            let stat = match tree.stat(&rpath) {
                Ok(Some(stat)) => stat,
                Ok(None) => continue,
                Err(e) => {
                    warn!(path = %rpath, error = %e, "stat failed");
                    self.report.fail(rpath);
                    continue;
                }
            };
            if stat.is_symlink {
                warn!(path = %rpath, "not following symbolic link");
                self.report.warn(rpath);
                continue;
            }
            if dir.is_empty() && !self.top_level.insert(name.clone()) {
                warn!(path = %rpath, "name already taken by an earlier source root");
                self.report.fail(rpath);
                continue;
            }
            if stat.is_dir {
                if self.incremental && self.has_marker(tree, &rpath) {
                    debug!(path = %rpath, "skipping directory with nobackup marker");
                    continue;
                }
                let children = match tree.list(&rpath) {
                    Ok(children) => children,
                    Err(e) => {
                        warn!(path = %rpath, error = %e, "listing failed");
                        self.report.fail(rpath);
                        continue;
                    }
                };
                self.list.dir(&name, stat.modified_ms)?;
                self.walk_dir(tree, &rpath, children)?;
                self.list.dir_end()?;
            } else {
                self.add_file(tree, &name, rpath, &stat)?;
            }
        }
        Ok(())
    }

    fn add_file<T: FileTree>(
        &mut self,
        tree: &T,
        name: &str,
        rpath: String,
        stat: &FileStat,
    ) -> ArcaResult<()> {
        let old = self.previous.remove(&rpath);
        if unchanged(self.incremental, old.as_ref(), stat) {
            let checksum = old.and_then(|old| old.checksum);
            self.list
                .file(name, &Info::file(stat.modified_ms, stat.size, 0, checksum))?;
            self.report.ignore(rpath);
            return Ok(());
        }

        let source = match tree.open_read(&rpath) {
            Ok(source) => source,
            Err(e) => {
                warn!(path = %rpath, error = %e, "cannot open source file");
                self.report.fail(rpath);
                return Ok(());
            }
        };
        match self.writer.write_entry(source, self.options.compress(name)) {
            Ok((offset, summary)) => {
                let info = Info::file(stat.modified_ms, summary.size, offset, Some(summary.checksum));
                self.list.file(name, &info)?;
                debug!(path = %rpath, bytes = summary.size, offset, "backed up");
                self.report.ok(rpath);
                Ok(())
            }
            Err(EntryError::Source(e)) => {
                warn!(path = %rpath, error = %e, "reading source file failed");
                self.report.fail(rpath);
                Ok(())
            }
            Err(EntryError::Archive(e)) => Err(e),
        }
    }

    /// Write the filelist trailer and close the archive.
    pub(crate) fn finish(self) -> ArcaResult<(W, RunReport)> {
        let filelist = self.list.finish()?;
        let out = self.writer.finish(self.keys, &filelist)?;
        info!(
            ok = self.report.oks.len(),
            unchanged = self.report.ignores.len(),
            failed = self.report.fails.len(),
            "backup written"
        );
        Ok((out, self.report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(ms: u64, size: u64, checksum: Option<Vec<u8>>) -> FileStat {
        FileStat {
            is_dir: false,
            is_symlink: false,
            size,
            modified_ms: ms,
            checksum,
        }
    }

    #[test]
    fn test_unchanged_rules() {
        let old = Info::file(10, 3, 99, Some(vec![1; 32]));
        assert!(unchanged(true, Some(&old), &stat(10, 3, None)));
        assert!(unchanged(true, Some(&old), &stat(10, 3, Some(vec![1; 32]))));
        assert!(!unchanged(true, Some(&old), &stat(10, 3, Some(vec![2; 32]))));
        assert!(!unchanged(true, Some(&old), &stat(11, 3, None)));
        assert!(!unchanged(true, Some(&old), &stat(10, 4, None)));
        assert!(!unchanged(false, Some(&old), &stat(10, 3, None)));
        assert!(!unchanged(true, None, &stat(10, 3, None)));
        assert!(!unchanged(true, Some(&Info::dir(10)), &stat(10, 0, None)));
    }
}
