//! arca-core: error taxonomy, configuration schema and wire primitives shared
//! by every arca crate.

pub mod config;
pub mod error;
pub mod types;
pub mod wire;

pub use error::{ArcaError, ArcaResult, OrFormat};
pub use types::{Info, RunReport, Tag};
pub use wire::{WireRead, WireWrite};
