use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{ArcaError, ArcaResult};

/// Metadata for one filelist entry.
///
/// `size < 0` marks a directory. A file with `offset == 0` has no content in
/// this archive: it was unchanged since the previous member of an incremental
/// chain and its bytes live there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    /// Last modified, milliseconds since the Unix epoch
    pub timestamp: u64,
    pub size: i64,
    /// Logical offset of the entry's content in the decrypted stream
    pub offset: u64,
    /// SHA-256 of the file content
    pub checksum: Option<Vec<u8>>,
}

impl Info {
    pub fn dir(timestamp: u64) -> Self {
        Self {
            timestamp,
            size: -1,
            offset: 0,
            checksum: None,
        }
    }

    pub fn file(timestamp: u64, size: u64, offset: u64, checksum: Option<Vec<u8>>) -> Self {
        Self {
            timestamp,
            size: size as i64,
            offset,
            checksum,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.size < 0
    }

    pub fn is_file(&self) -> bool {
        self.size >= 0
    }

    /// Content is elided and must be resolved from an older chain member.
    pub fn is_reused(&self) -> bool {
        self.is_file() && self.offset == 0
    }
}

/// One-byte discriminant of the content and filelist wire protocol.
///
/// New tags are only ever appended; readers reject anything unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Cipher = 1,
    Blocks = 4,
    Block = 5,
    BlockGz = 6,
    BlocksEnd = 7,
    FilelistGz = 9,
    FilelistEnd = 10,
    Dir = 11,
    DirEnd = 12,
    Data = 15,
    File2 = 16,
}

impl Tag {
    pub fn byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Tag {
    type Error = ArcaError;

    fn try_from(value: u8) -> ArcaResult<Self> {
        Ok(match value {
            1 => Tag::Cipher,
            4 => Tag::Blocks,
            5 => Tag::Block,
            6 => Tag::BlockGz,
            7 => Tag::BlocksEnd,
            9 => Tag::FilelistGz,
            10 => Tag::FilelistEnd,
            11 => Tag::Dir,
            12 => Tag::DirEnd,
            15 => Tag::Data,
            16 => Tag::File2,
            _ => return Err(ArcaError::Format),
        })
    }
}

/// Outcome of a backup, restore or verify run, as sorted path sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub oks: BTreeSet<String>,
    pub fails: BTreeSet<String>,
    pub warns: BTreeSet<String>,
    pub ignores: BTreeSet<String>,
}

impl RunReport {
    pub fn ok(&mut self, rpath: impl Into<String>) {
        self.oks.insert(rpath.into());
    }

    pub fn fail(&mut self, rpath: impl Into<String>) {
        self.fails.insert(rpath.into());
    }

    pub fn warn(&mut self, rpath: impl Into<String>) {
        self.warns.insert(rpath.into());
    }

    pub fn ignore(&mut self, rpath: impl Into<String>) {
        self.ignores.insert(rpath.into());
    }

    pub fn merge(&mut self, other: RunReport) {
        self.oks.extend(other.oks);
        self.fails.extend(other.fails);
        self.warns.extend(other.warns);
        self.ignores.extend(other.ignores);
    }

    pub fn is_clean(&self) -> bool {
        self.fails.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_kinds() {
        let dir = Info::dir(1000);
        assert!(dir.is_dir());
        assert!(!dir.is_file());
        assert!(!dir.is_reused());

        let empty = Info::file(1000, 0, 64, None);
        assert!(empty.is_file());
        assert!(!empty.is_reused());

        let reused = Info::file(1000, 12, 0, Some(vec![1; 32]));
        assert!(reused.is_reused());
    }

    #[test]
    fn test_tag_byte_roundtrip() {
        for tag in [
            Tag::Cipher,
            Tag::Blocks,
            Tag::Block,
            Tag::BlockGz,
            Tag::BlocksEnd,
            Tag::FilelistGz,
            Tag::FilelistEnd,
            Tag::Dir,
            Tag::DirEnd,
            Tag::Data,
            Tag::File2,
        ] {
            assert_eq!(Tag::try_from(tag.byte()).unwrap(), tag);
        }
    }

    #[test]
    fn test_unknown_tags_rejected() {
        for b in [0u8, 2, 3, 8, 13, 14, 17, 255] {
            assert!(Tag::try_from(b).unwrap_err().is_format(), "tag {b}");
        }
    }

    #[test]
    fn test_report_merge() {
        let mut a = RunReport::default();
        a.ok("x");
        a.ignore("y");
        let mut b = RunReport::default();
        b.ok("z");
        b.fail("w");
        a.merge(b);
        assert_eq!(a.oks.iter().collect::<Vec<_>>(), vec!["x", "z"]);
        assert!(!a.is_clean());
        assert!(a.ignores.contains("y"));
    }
}
