//! arca: encrypted incremental backups
//!
//! Commands:
//!   keygen                          - create the local (#self) key pair
//!   export-key <out>                - write the local public key as PEM
//!   import-key <alias> <pem>        - register a recipient public key
//!   backup <archive> <src>...       - back up directories (`*.ibackup` is incremental)
//!   restore <archive> <dest>        - restore all or part of an archive
//!   ls | verify | info <archive>    - inspect an archive
//!   cat <archive> <path>            - print one archived file
//!   config show                     - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use arca_core::config::ArcaConfig;
use arca_core::RunReport;
use arca_crypto::{PemKeyStore, SELF_ALIAS};
use arca_engine::Engine;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "arca",
    version,
    about = "Encrypted, incremental, multi-recipient backups",
    long_about = "arca: back up directory trees into RSA/AES encrypted archives and restore them"
)]
struct Cli {
    /// Path to arca.toml configuration file
    #[arg(long, short = 'c', env = "ARCA_CONFIG", default_value = "~/.config/arca/arca.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [log] level
    #[arg(long, env = "ARCA_LOG")]
    log: Option<String>,

    /// Log format; overrides [log] format
    #[arg(long, env = "ARCA_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate the local key pair in the key directory
    Keygen {
        /// RSA modulus size (default: [keys] rsa_bits)
        #[arg(long)]
        bits: Option<usize>,
    },

    /// Export the local public key so others can address archives to you
    ExportKey {
        /// Output PEM file
        out: PathBuf,
    },

    /// Register someone's public key under an alias
    ImportKey {
        alias: String,
        /// SPKI PEM file
        pem: PathBuf,
    },

    /// Back up one or more directories into an archive
    ///
    /// An archive named `*.ibackup` is incremental: it only stores files that
    /// changed since the previous `.ibackup` in the same directory.
    Backup {
        archive: PathBuf,
        #[arg(required = true)]
        sources: Vec<PathBuf>,
        /// Additional recipient alias (repeatable); the local key is always included
        #[arg(long = "to")]
        recipients: Vec<String>,
    },

    /// Re-address an existing archive to a new set of recipients, in place
    Forward {
        archive: PathBuf,
        /// Recipient alias (repeatable); the local key is always included
        #[arg(long = "to", required = true)]
        recipients: Vec<String>,
    },

    /// Restore an archive, or a path inside it, into a directory
    Restore {
        archive: PathBuf,
        dest: PathBuf,
        /// Path inside the archive (default: everything)
        #[arg(long, default_value = "")]
        from: String,
        /// Only replace destination files older than the archived copy
        #[arg(long)]
        sync: bool,
    },

    /// Print the archive's file tree as JSON
    Ls { archive: PathBuf },

    /// Decrypt and check every file without writing anything
    Verify { archive: PathBuf },

    /// Show archive format, recipients and signer
    Info { archive: PathBuf },

    /// Write one archived file to stdout
    Cat { archive: PathBuf, path: String },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = load_config(&config_path)?;

    let level = cli.log.as_deref().unwrap_or(&config.log.level);
    let format = cli.log_format.clone().unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(level, &format);
    debug!(config = %config_path.display(), "arca starting");

    match cli.command {
        Commands::Keygen { bits } => cmd_keygen(&config, bits),
        Commands::ExportKey { out } => cmd_export_key(&config, &out),
        Commands::ImportKey { alias, pem } => cmd_import_key(&config, &alias, &pem),
        Commands::Backup {
            archive,
            sources,
            recipients,
        } => cmd_backup(&config, &archive, &sources, &recipients),
        Commands::Forward {
            archive,
            recipients,
        } => cmd_forward(&config, &archive, &recipients),
        Commands::Restore {
            archive,
            dest,
            from,
            sync,
        } => cmd_restore(&config, &archive, &dest, &from, sync),
        Commands::Ls { archive } => cmd_ls(&config, &archive),
        Commands::Verify { archive } => cmd_verify(&config, &archive),
        Commands::Info { archive } => cmd_info(&config, &archive),
        Commands::Cat { archive, path } => cmd_cat(&config, &archive, &path),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
    }
}

fn load_config(path: &Path) -> Result<ArcaConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(ArcaConfig::default())
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Expand a leading `~/` to `$HOME/`.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(format!("{home}/{rest}"))
    } else {
        path.to_path_buf()
    }
}

fn key_dir(config: &ArcaConfig) -> PathBuf {
    expand_tilde(&config.keys.dir)
}

fn open_keys(config: &ArcaConfig) -> Result<PemKeyStore> {
    let dir = key_dir(config);
    PemKeyStore::open(&dir).with_context(|| format!("opening key store: {}", dir.display()))
}

fn open_engine(config: &ArcaConfig) -> Result<Engine<PemKeyStore>> {
    let keys = open_keys(config)?;
    if !keys.has_private_key() {
        anyhow::bail!(
            "no local key pair in {}\nRun `arca keygen` first.",
            key_dir(config).display()
        );
    }
    Engine::new(keys, &config.backup).context("invalid [backup] configuration")
}

/// Print a run summary and fail if any path failed.
fn finish_report(verb: &str, report: &RunReport) -> Result<()> {
    println!(
        "{verb}: {} ok, {} unchanged, {} warnings, {} failed",
        report.oks.len(),
        report.ignores.len(),
        report.warns.len(),
        report.fails.len()
    );
    for path in &report.warns {
        println!("  warn: {path}");
    }
    for path in &report.fails {
        println!("  FAIL: {path}");
    }
    if !report.fails.is_empty() {
        anyhow::bail!("{verb}: {} path(s) failed", report.fails.len());
    }
    Ok(())
}

// ── `arca keygen` / `export-key` / `import-key` ───────────────────────────────

fn cmd_keygen(config: &ArcaConfig, bits: Option<usize>) -> Result<()> {
    let mut keys = open_keys(config)?;
    let bits = bits.unwrap_or(config.keys.rsa_bits);
    keys.generate_self_key(bits).context("generating key pair")?;
    println!(
        "Generated {bits}-bit key pair in {}",
        key_dir(config).display()
    );
    Ok(())
}

fn cmd_export_key(config: &ArcaConfig, out: &Path) -> Result<()> {
    open_engine(config)?.backup_key(out)?;
    println!("Public key written to {}", out.display());
    Ok(())
}

fn cmd_import_key(config: &ArcaConfig, alias: &str, pem: &Path) -> Result<()> {
    let content = std::fs::read_to_string(pem)
        .with_context(|| format!("reading public key: {}", pem.display()))?;
    let mut keys = open_keys(config)?;
    keys.import_public_key(alias, &content)
        .with_context(|| format!("importing key for {alias}"))?;
    println!("Imported public key as {alias}");
    Ok(())
}

// ── `arca backup` / `arca restore` ────────────────────────────────────────────

/// `#self` first, then the other aliases.
fn with_self(extra: &[String]) -> Vec<String> {
    let mut recipients = vec![SELF_ALIAS.to_string()];
    recipients.extend(extra.iter().filter(|a| a.as_str() != SELF_ALIAS).cloned());
    recipients
}

fn cmd_backup(
    config: &ArcaConfig,
    archive: &Path,
    sources: &[PathBuf],
    extra: &[String],
) -> Result<()> {
    let engine = open_engine(config)?;
    let recipients = with_self(extra);
    println!(
        "Backing up {} source(s) → {} ({} recipient(s))",
        sources.len(),
        archive.display(),
        recipients.len()
    );
    let report = engine.backup_data(archive, &recipients, sources)?;
    info!(archive = %archive.display(), "backup complete");
    finish_report("backup", &report)
}

fn cmd_forward(config: &ArcaConfig, archive: &Path, extra: &[String]) -> Result<()> {
    let engine = open_engine(config)?;
    let recipients = with_self(extra);
    engine.forward_backup(archive, &recipients)?;
    println!(
        "Forwarded {} to {} recipient(s)",
        archive.display(),
        recipients.len()
    );
    Ok(())
}

fn cmd_restore(
    config: &ArcaConfig,
    archive: &Path,
    dest: &Path,
    from: &str,
    sync: bool,
) -> Result<()> {
    let engine = open_engine(config)?;
    let sync = sync || config.restore.sync;
    println!(
        "Restoring {}{} → {}{}",
        archive.display(),
        if from.is_empty() { String::new() } else { format!(":{from}") },
        dest.display(),
        if sync { " (sync)" } else { "" }
    );
    let report = engine.restore_data(dest, archive, from, sync)?;
    finish_report("restore", &report)
}

// ── `arca ls` / `verify` / `info` / `cat` ─────────────────────────────────────

fn cmd_ls(config: &ArcaConfig, archive: &Path) -> Result<()> {
    let tree = open_engine(config)?.read_backup_filetree(archive)?;
    println!("{}", serde_json::to_string_pretty(&tree)?);
    Ok(())
}

fn cmd_verify(config: &ArcaConfig, archive: &Path) -> Result<()> {
    let report = open_engine(config)?.verify_backup(archive)?;
    finish_report("verify", &report)
}

fn cmd_info(config: &ArcaConfig, archive: &Path) -> Result<()> {
    let info = open_engine(config)?.read_backup_info(archive)?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn cmd_cat(config: &ArcaConfig, archive: &Path, path: &str) -> Result<()> {
    let bytes = open_engine(config)?.read_file_at(archive, path)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&bytes).context("writing to stdout")?;
    stdout.flush()?;
    Ok(())
}

// ── `arca config show` ────────────────────────────────────────────────────────

fn cmd_config_show(config: &ArcaConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(
            expand_tilde(Path::new("~/keys")),
            PathBuf::from(format!("{home}/keys"))
        );
        assert_eq!(expand_tilde(Path::new("/etc/arca")), PathBuf::from("/etc/arca"));
    }

    #[test]
    fn test_load_config_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.backup.format_version, 11);
    }

    #[test]
    fn test_load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arca.toml");
        std::fs::write(&path, "[restore]\nsync = true\n[log]\nformat = \"json\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert!(config.restore.sync);
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_cli_parses_backup() {
        let cli = Cli::parse_from([
            "arca", "backup", "out/b1.ibackup", "docs", "photos", "--to", "bob",
        ]);
        match cli.command {
            Commands::Backup {
                sources,
                recipients,
                ..
            } => {
                assert_eq!(sources.len(), 2);
                assert_eq!(recipients, vec!["bob"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_forward() {
        let cli = Cli::parse_from(["arca", "forward", "b0.backup", "--to", "bob", "--to", "#self"]);
        match cli.command {
            Commands::Forward { recipients, .. } => {
                assert_eq!(with_self(&recipients), vec!["#self", "bob"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["arca", "forward", "b0.backup"]).is_err());
    }
}
