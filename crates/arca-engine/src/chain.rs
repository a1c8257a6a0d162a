//! Incremental archive chains.
//!
//! Archives whose names end in `.ibackup` form a chain with every other
//! `.ibackup` file in the same directory, ordered by file name. A member
//! only lists files that changed since the member before it; the rest are
//! recorded with offset 0 and resolved through older members.

use std::fs;
use std::path::{Path, PathBuf};

use arca_archive::Filelist;
use arca_core::{ArcaError, ArcaResult, Info};

pub const IBACKUP_SUFFIX: &str = ".ibackup";

fn file_name(archive: &Path) -> ArcaResult<&str> {
    archive
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ArcaError::InvalidArgument(format!("bad archive path {}", archive.display())))
}

pub fn is_incremental(archive: &Path) -> bool {
    file_name(archive).is_ok_and(|name| name.ends_with(IBACKUP_SUFFIX))
}

/// `.ibackup` files sorting before `archive` in its directory, newest first.
fn older_members(archive: &Path) -> ArcaResult<Vec<PathBuf>> {
    let name = file_name(archive)?;
    let dir = match archive.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Ok(other) = entry.file_name().into_string() {
            if other.ends_with(IBACKUP_SUFFIX) && other.as_str() < name {
                names.push(other);
            }
        }
    }
    names.sort_unstable_by(|a, b| b.cmp(a));
    Ok(names.into_iter().map(|n| dir.join(n)).collect())
}

/// The chain member a new incremental archive is written against.
pub fn previous_member(archive: &Path) -> ArcaResult<Option<PathBuf>> {
    if !is_incremental(archive) {
        return Ok(None);
    }
    Ok(older_members(archive)?.into_iter().next())
}

/// `archive` followed by the older members of its chain, newest first.
/// A full archive is a chain of one.
pub fn chain_for(archive: &Path) -> ArcaResult<Vec<PathBuf>> {
    let mut chain = vec![archive.to_path_buf()];
    if is_incremental(archive) {
        chain.extend(older_members(archive)?);
    }
    Ok(chain)
}

/// Whether `have` carries the content of the file described by `want`.
fn holds(want: &Info, have: &Info) -> bool {
    have.is_file()
        && !have.is_reused()
        && have.size == want.size
        && match (&want.checksum, &have.checksum) {
            (Some(want), Some(have)) => want == have,
            _ => true,
        }
}

/// Take from `pending` the files one chain member has content for, each
/// paired with the entry to read. The newest timestamp is kept.
pub(crate) fn take_held(pending: &mut Filelist, filelist: &Filelist) -> Vec<(String, Info)> {
    let held: Vec<(String, Info)> = pending
        .iter()
        .filter_map(|(rpath, want)| {
            let have = filelist.get(rpath).filter(|have| holds(want, have))?;
            let info = Info {
                timestamp: want.timestamp,
                ..have.clone()
            };
            Some((rpath.clone(), info))
        })
        .collect();
    for (rpath, _) in &held {
        pending.remove(rpath);
    }
    held
}
