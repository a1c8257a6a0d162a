//! File-tree interface consumed by the backup and restore engines.

use std::io::{Read, Write};

use arca_core::ArcaResult;

/// Metadata of one tree entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub is_dir: bool,
    /// A symbolic link, reported as itself and never followed
    pub is_symlink: bool,
    /// Length in bytes; 0 for directories
    pub size: u64,
    /// Last modified, milliseconds since the Unix epoch
    pub modified_ms: u64,
    /// SHA-256 of the content when the tree keeps one
    pub checksum: Option<Vec<u8>>,
}

impl FileStat {
    pub fn is_file(&self) -> bool {
        !self.is_dir && !self.is_symlink
    }
}

pub trait FileTree {
    type Reader: Read;
    type Writer: Write;

    /// Child names of the directory at `rpath`, sorted.
    fn list(&self, rpath: &str) -> ArcaResult<Vec<String>>;

    /// `None` when nothing exists at `rpath`.
    fn stat(&self, rpath: &str) -> ArcaResult<Option<FileStat>>;

    fn open_read(&self, rpath: &str) -> ArcaResult<Self::Reader>;

    /// Create a scratch file next to `rpath`. Returns its path and a writer.
    /// Scratch files not committed by the end of a [`FileTree::transaction`]
    /// are removed.
    fn create_temp(&self, rpath: &str) -> ArcaResult<(String, Self::Writer)>;

    /// Atomically move the scratch file `temp` to `rpath`, replacing what is
    /// there, and stamp it with `modified_ms`.
    fn commit(&self, temp: &str, rpath: &str, modified_ms: u64) -> ArcaResult<()>;

    /// Create the directory `rpath` and any missing parents.
    fn mkdirs(&self, rpath: &str) -> ArcaResult<()>;

    /// Remove a file, or a directory with everything below it.
    fn delete(&self, rpath: &str) -> ArcaResult<()>;

    fn set_modified(&self, rpath: &str, modified_ms: u64) -> ArcaResult<()>;

    /// Run `f` as one batch of changes against this tree.
    fn transaction<T, F>(&self, f: F) -> ArcaResult<T>
    where
        Self: Sized,
        F: FnOnce(&Self) -> ArcaResult<T>,
    {
        f(self)
    }
}

/// Parent directory of `rpath`, `""` for top-level entries.
pub fn parent_rpath(rpath: &str) -> &str {
    rpath.rsplit_once('/').map_or("", |(parent, _)| parent)
}
