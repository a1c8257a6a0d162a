use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration (loaded from arca.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArcaConfig {
    pub backup: BackupConfig,
    pub restore: RestoreConfig,
    pub keys: KeysConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Archive format version written by new backups (10 or 11)
    pub format_version: u8,
    /// File suffixes whose content chunks are gzip-compressed before encryption
    pub compress_suffixes: Vec<String>,
    /// A directory containing this file is left out of incremental backups
    pub nobackup_marker: String,
    /// Glob patterns to exclude, matched against the entry name or its
    /// root-relative path
    pub exclude_patterns: Vec<String>,
    /// Minimum number of recipient slots written to the header
    pub min_slots: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Only overwrite destination files that are older than the archive copy
    pub sync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Directory holding `self.pem` and `<alias>.pub.pem` files
    pub dir: PathBuf,
    /// Modulus size for newly generated key pairs
    pub rsa_bits: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            format_version: 11,
            compress_suffixes: [
                "html",
                "css",
                "js",
                "svg",
                "pdf",
                "xml",
                "cf",
                "json",
                "properties",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            nobackup_marker: ".nobackup".into(),
            exclude_patterns: Vec::new(),
            min_slots: 2,
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("~/.config/arca/keys"),
            rsa_bits: 2048,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}
