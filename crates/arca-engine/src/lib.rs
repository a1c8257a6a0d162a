//! arca-engine: backup, restore and verify orchestration
//!
//! [`Engine`] drives the archive codecs in `arca-archive` against local
//! directories through the `arca-storage` file-tree interface. Per-path
//! problems are collected in a [`RunReport`](arca_core::RunReport); anything
//! that stops the whole operation surfaces as a [`SecureError`].

mod backup;
pub mod chain;
pub mod engine;
pub mod error;
pub mod options;
mod restore;

pub use chain::{chain_for, is_incremental, IBACKUP_SUFFIX};
pub use engine::Engine;
pub use error::{Action, SecureError};
pub use options::BackupOptions;
