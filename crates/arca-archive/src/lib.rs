//! arca-archive: on-disk format of arca backup archives
//!
//! ```text
//! [recipient slots][padding1][eeprefix][padding2][blockIV]     envelope
//! [block 0][IV 1][block 1] ... [IV n][block n]                  content stream
//! [padding3]
//! ```
//!
//! The decrypted content stream holds, in order:
//! ```text
//! padding | entry* | FilelistGz trailer | u64 BE offset of the trailer
//! ```
//!
//! [`ArchiveWriter`] produces this layout; [`ArchiveReader`] opens it with
//! the local key pair, verifies the envelope and trailer signatures, and
//! gives random access to entries through a small pool of block cursors.
//! [`forward_archive`] re-addresses a finished archive to new recipients.

pub mod block;
pub mod content;
pub mod envelope;
pub mod filelist;
pub mod format;
pub mod forward;
pub mod pool;
pub mod reader;
pub mod writer;

pub use content::{EntryError, EntrySummary};
pub use envelope::ensure_slots;
pub use filelist::{join_rpath, Filelist, FilelistBuilder};
pub use format::{ArchiveFormat, MAX_RECIPIENT_SLOTS};
pub use forward::forward_archive;
pub use pool::EncryptedReader;
pub use reader::{ArchiveInfo, ArchiveReader};
pub use writer::ArchiveWriter;
