//! arca-storage: the file trees that backups read from and restores write to
//!
//! Paths inside a tree are relative, `/`-separated and never contain `.` or
//! `..` components; the root is `""`.

pub mod local;
pub mod tree;

pub use local::LocalTree;
pub use tree::{FileStat, FileTree};
