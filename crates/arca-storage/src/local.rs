//! Local filesystem tree rooted at a directory.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};
use uuid::Uuid;

use arca_core::{ArcaError, ArcaResult};

use crate::tree::{parent_rpath, FileStat, FileTree};

pub struct LocalTree {
    root: PathBuf,
    temps: Mutex<BTreeSet<PathBuf>>,
}

fn to_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn from_ms(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

/// Nothing at the path, including when an ancestor is a regular file.
fn is_missing(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory)
}

impl LocalTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            temps: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of `rpath`. Rejects components that could leave the root.
    pub fn resolve(&self, rpath: &str) -> ArcaResult<PathBuf> {
        let mut path = self.root.clone();
        if rpath.is_empty() {
            return Ok(path);
        }
        for part in rpath.split('/') {
            if part.is_empty() || part == "." || part == ".." || part.contains(['\\', '\0']) {
                return Err(ArcaError::InvalidArgument(format!("bad relative path {rpath:?}")));
            }
            path.push(part);
        }
        Ok(path)
    }

    fn track(&self, temp: PathBuf, tracked: bool) {
        if let Ok(mut temps) = self.temps.lock() {
            if tracked {
                temps.insert(temp);
            } else {
                temps.remove(&temp);
            }
        }
    }

    fn discard_temps(&self) {
        let leftovers = match self.temps.lock() {
            Ok(mut temps) => std::mem::take(&mut *temps),
            Err(_) => return,
        };
        for temp in leftovers {
            match fs::remove_file(&temp) {
                Ok(()) => debug!(path = %temp.display(), "removed scratch file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %temp.display(), error = %e, "removing scratch file"),
            }
        }
    }
}

impl FileTree for LocalTree {
    type Reader = File;
    type Writer = BufWriter<File>;

    fn list(&self, rpath: &str) -> ArcaResult<Vec<String>> {
        let dir = self.resolve(rpath)?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(name) => warn!(dir = %dir.display(), name = ?name, "skipping non UTF-8 name"),
            }
        }
        names.sort();
        Ok(names)
    }

    fn stat(&self, rpath: &str) -> ArcaResult<Option<FileStat>> {
        let meta = match fs::symlink_metadata(self.resolve(rpath)?) {
            Ok(meta) => meta,
            Err(e) if is_missing(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let is_symlink = meta.file_type().is_symlink();
        if !is_symlink && !meta.is_dir() && !meta.is_file() {
            return Ok(None);
        }
        Ok(Some(FileStat {
            is_dir: meta.is_dir(),
            is_symlink,
            size: if meta.is_file() { meta.len() } else { 0 },
            modified_ms: meta.modified().map(to_ms).unwrap_or(0),
            checksum: None,
        }))
    }

    fn open_read(&self, rpath: &str) -> ArcaResult<File> {
        Ok(File::open(self.resolve(rpath)?)?)
    }

    fn create_temp(&self, rpath: &str) -> ArcaResult<(String, BufWriter<File>)> {
        let parent = parent_rpath(rpath);
        let name = format!(".arca-{}.tmp", Uuid::new_v4().simple());
        let temp = if parent.is_empty() {
            name
        } else {
            format!("{parent}/{name}")
        };
        let path = self.resolve(&temp)?;
        let file = File::create(&path)?;
        self.track(path, true);
        Ok((temp, BufWriter::new(file)))
    }

    fn commit(&self, temp: &str, rpath: &str, modified_ms: u64) -> ArcaResult<()> {
        let from = self.resolve(temp)?;
        let to = self.resolve(rpath)?;
        fs::rename(&from, &to)?;
        self.track(from, false);
        self.set_modified(rpath, modified_ms)
    }

    fn mkdirs(&self, rpath: &str) -> ArcaResult<()> {
        Ok(fs::create_dir_all(self.resolve(rpath)?)?)
    }

    fn delete(&self, rpath: &str) -> ArcaResult<()> {
        if rpath.is_empty() {
            return Err(ArcaError::InvalidArgument("refusing to delete the tree root".into()));
        }
        let path = self.resolve(rpath)?;
        let result = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn set_modified(&self, rpath: &str, modified_ms: u64) -> ArcaResult<()> {
        let file = File::open(self.resolve(rpath)?)?;
        file.set_modified(from_ms(modified_ms))?;
        Ok(())
    }

    fn transaction<T, F>(&self, f: F) -> ArcaResult<T>
    where
        F: FnOnce(&Self) -> ArcaResult<T>,
    {
        let result = f(self);
        self.discard_temps();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn tree() -> (tempfile::TempDir, LocalTree) {
        let dir = tempfile::tempdir().unwrap();
        let tree = LocalTree::new(dir.path());
        (dir, tree)
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let (_dir, tree) = tree();
        for bad in ["..", "a/../b", "./a", "a//b", "a/", "a\\b"] {
            assert!(tree.resolve(bad).is_err(), "{bad}");
        }
        assert_eq!(tree.resolve("").unwrap(), tree.root());
        assert_eq!(tree.resolve("a/b").unwrap(), tree.root().join("a").join("b"));
    }

    #[test]
    fn test_list_sorted_and_stat() {
        let (dir, tree) = tree();
        fs::write(dir.path().join("b.txt"), b"bb").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::create_dir(dir.path().join("c")).unwrap();
        assert_eq!(tree.list("").unwrap(), vec!["a.txt", "b.txt", "c"]);

        let stat = tree.stat("b.txt").unwrap().unwrap();
        assert!(stat.is_file());
        assert_eq!(stat.size, 2);
        assert!(tree.stat("c").unwrap().unwrap().is_dir);
        assert!(tree.stat("missing").unwrap().is_none());
        assert!(tree.stat("a.txt/below").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_stat_does_not_follow_symlinks() {
        use std::os::unix::fs::symlink;

        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), b"s").unwrap();
        let (dir, tree) = tree();
        symlink(outside.path(), dir.path().join("link")).unwrap();
        symlink(dir.path(), dir.path().join("loop")).unwrap();
        symlink(dir.path().join("gone"), dir.path().join("dangling")).unwrap();

        for name in ["link", "loop", "dangling"] {
            let stat = tree.stat(name).unwrap().unwrap();
            assert!(stat.is_symlink, "{name}");
            assert!(!stat.is_dir && !stat.is_file(), "{name}");
        }

        tree.delete("link").unwrap();
        assert!(tree.stat("link").unwrap().is_none());
        assert!(outside.path().join("secret.txt").exists());
    }

    #[test]
    fn test_commit_replaces_and_stamps() {
        let (dir, tree) = tree();
        tree.mkdirs("x/y").unwrap();
        fs::write(dir.path().join("x/y/f"), b"old").unwrap();
        tree.transaction(|t| {
            let (temp, mut w) = t.create_temp("x/y/f")?;
            assert!(temp.starts_with("x/y/.arca-"));
            w.write_all(b"new content")?;
            w.flush()?;
            drop(w);
            t.commit(&temp, "x/y/f", 1_600_000_000_123)
        })
        .unwrap();

        let mut content = String::new();
        tree.open_read("x/y/f")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "new content");
        assert_eq!(tree.stat("x/y/f").unwrap().unwrap().modified_ms, 1_600_000_000_123);
        assert_eq!(tree.list("x/y").unwrap(), vec!["f"]);
    }

    #[test]
    fn test_transaction_discards_uncommitted_temps() {
        let (_dir, tree) = tree();
        let result: ArcaResult<()> = tree.transaction(|t| {
            let (_temp, mut w) = t.create_temp("f")?;
            w.write_all(b"partial")?;
            Err(ArcaError::Format)
        });
        assert!(result.unwrap_err().is_format());
        assert!(tree.list("").unwrap().is_empty());
    }

    #[test]
    fn test_delete_and_dir_timestamps() {
        let (dir, tree) = tree();
        tree.mkdirs("d/e").unwrap();
        fs::write(dir.path().join("d/e/f"), b"x").unwrap();
        tree.set_modified("d", 1_000_000).unwrap();
        assert_eq!(tree.stat("d").unwrap().unwrap().modified_ms, 1_000_000);

        tree.delete("d").unwrap();
        assert!(tree.stat("d").unwrap().is_none());
        tree.delete("d").unwrap();
        assert!(tree.delete("").is_err());
    }
}
