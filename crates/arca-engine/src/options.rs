//! Backup options resolved from `[backup]` configuration.

use std::collections::BTreeSet;

use tracing::warn;

use arca_archive::ArchiveFormat;
use arca_core::config::BackupConfig;
use arca_core::{ArcaError, ArcaResult};

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub format: ArchiveFormat,
    /// Lower-case suffixes, without the dot
    pub compress_suffixes: BTreeSet<String>,
    pub nobackup_marker: String,
    pub excludes: Vec<glob::Pattern>,
    pub min_slots: usize,
}

impl BackupOptions {
    pub fn from_config(config: &BackupConfig) -> ArcaResult<Self> {
        let format = ArchiveFormat::from_version(config.format_version).map_err(|_| {
            ArcaError::Config(format!(
                "unsupported archive format version {}",
                config.format_version
            ))
        })?;
        let excludes = config
            .exclude_patterns
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "ignoring invalid exclude pattern");
                    None
                }
            })
            .collect();
        Ok(Self {
            format,
            compress_suffixes: suffix_set(&config.compress_suffixes),
            nobackup_marker: config.nobackup_marker.clone(),
            excludes,
            min_slots: config.min_slots,
        })
    }

    /// Whether the content chunks of `name` are gzip-compressed.
    pub fn compress(&self, name: &str) -> bool {
        name.rsplit_once('.')
            .is_some_and(|(_, suffix)| self.compress_suffixes.contains(&suffix.to_ascii_lowercase()))
    }

    /// Patterns match either the entry name or its path below the root.
    pub fn excluded(&self, name: &str, rpath: &str) -> bool {
        self.excludes
            .iter()
            .any(|p| p.matches(name) || p.matches(rpath))
    }
}

impl Default for BackupOptions {
    fn default() -> Self {
        let config = BackupConfig::default();
        Self {
            format: ArchiveFormat::latest(),
            compress_suffixes: suffix_set(&config.compress_suffixes),
            nobackup_marker: config.nobackup_marker,
            excludes: Vec::new(),
            min_slots: config.min_slots,
        }
    }
}

fn suffix_set(suffixes: &[String]) -> BTreeSet<String> {
    suffixes
        .iter()
        .map(|s| s.trim_start_matches('.').to_ascii_lowercase())
        .collect()
}
